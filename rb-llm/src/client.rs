use crate::anthropic::AnthropicClient;
use crate::error::{LlmError, Result};
use crate::openai::OpenAiClient;
use crate::types::{ChatMessage, ChatResponse, CompletionOptions};

/// OpenAI-compatible endpoint used when no base URL is configured.
pub const DEFAULT_BASE_URL: &str = "https://api.deepseek.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Anthropic,
}

#[derive(Clone)]
pub struct LlmClient {
    provider: Provider,
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(api_key: &str, model: &str, base_url: Option<&str>) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(LlmError::InvalidInput("api key is empty".to_string()));
        }
        if model.trim().is_empty() {
            return Err(LlmError::InvalidInput("model is empty".to_string()));
        }
        let provider = detect_provider(model);
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Ok(Self {
            provider,
            api_key: api_key.trim().to_string(),
            model: model.trim().to_string(),
            base_url: normalize_base_url(base_url.unwrap_or(DEFAULT_BASE_URL)),
            client,
        })
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model))]
    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<ChatResponse> {
        if messages.is_empty() {
            return Err(LlmError::InvalidInput(
                "completion requires at least one message".to_string(),
            ));
        }
        match self.provider {
            Provider::OpenAI => {
                let c = OpenAiClient::new(
                    self.client.clone(),
                    &self.base_url,
                    &self.api_key,
                    &self.model,
                );
                c.complete(messages, options).await
            }
            Provider::Anthropic => {
                let c = AnthropicClient::new(self.client.clone(), &self.api_key, &self.model);
                c.complete(messages, options).await
            }
        }
    }
}

fn detect_provider(model: &str) -> Provider {
    let m = model.trim().to_ascii_lowercase();
    if m.starts_with("claude-") {
        return Provider::Anthropic;
    }
    Provider::OpenAI
}

fn normalize_base_url(raw: &str) -> String {
    // Operators paste URLs with stray whitespace inside them ("https://api. deepseek.com").
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let trimmed = compact.trim_end_matches('/');
    if trimmed.is_empty() {
        DEFAULT_BASE_URL.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_is_detected_from_model_prefix() {
        assert_eq!(detect_provider("claude-3-5-haiku-latest"), Provider::Anthropic);
        assert_eq!(detect_provider("  Claude-sonnet"), Provider::Anthropic);
        assert_eq!(detect_provider("deepseek-chat"), Provider::OpenAI);
        assert_eq!(detect_provider("gpt-4o-mini"), Provider::OpenAI);
    }

    #[test]
    fn base_url_is_compacted_and_defaulted() {
        assert_eq!(
            normalize_base_url("https://api. deepseek.com/"),
            "https://api.deepseek.com"
        );
        assert_eq!(normalize_base_url("   "), DEFAULT_BASE_URL);
        assert_eq!(
            normalize_base_url("http://localhost:11434/v1"),
            "http://localhost:11434/v1"
        );
    }

    #[test]
    fn new_rejects_blank_credentials() {
        let err = LlmClient::new("  ", "deepseek-chat", None)
            .err()
            .expect("blank key should fail");
        assert!(matches!(err, LlmError::InvalidInput(_)));

        let err = LlmClient::new("sk-test", "", None)
            .err()
            .expect("blank model should fail");
        assert!(matches!(err, LlmError::InvalidInput(_)));
    }

    #[test]
    fn new_uses_default_base_url() {
        let client = LlmClient::new("sk-test", "deepseek-chat", None).expect("client");
        assert_eq!(client.base_url(), DEFAULT_BASE_URL);
        assert_eq!(client.provider(), Provider::OpenAI);
        assert_eq!(client.model(), "deepseek-chat");
    }
}
