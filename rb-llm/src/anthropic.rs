use crate::error::{LlmError, Result};
use crate::types::{ChatMessage, ChatResponse, CompletionOptions, Role, Usage};
use serde::{Deserialize, Serialize};

const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl AnthropicClient {
    pub fn new(http: reqwest::Client, api_key: &str, model: &str) -> Self {
        Self {
            http,
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<ChatResponse> {
        let req = AnthropicRequest::new(&self.model, messages, options)?;

        let response = self
            .http
            .post(ANTHROPIC_MESSAGES_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Http(format!(
                "anthropic chat status={status} body={body}"
            )));
        }

        let parsed: AnthropicResponse = serde_json::from_str(&body)?;
        Ok(parsed.into())
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "String::is_empty")]
    system: String,
    messages: Vec<AnthropicMessage>,
}

impl AnthropicRequest {
    fn new(model: &str, messages: &[ChatMessage], options: &CompletionOptions) -> Result<Self> {
        let mut system = String::new();
        let mut out_messages = Vec::new();

        for m in messages {
            match m.role {
                Role::System => {
                    if !system.is_empty() {
                        system.push('\n');
                    }
                    system.push_str(m.content.trim());
                }
                Role::User | Role::Assistant => out_messages.push(AnthropicMessage {
                    role: m.role.as_str(),
                    content: m.content.clone(),
                }),
            }
        }
        if out_messages.is_empty() {
            return Err(LlmError::InvalidInput(
                "anthropic requires at least one user message".to_string(),
            ));
        }

        Ok(Self {
            model: model.to_string(),
            max_tokens: options.max_tokens,
            // Anthropic caps temperature at 1.0.
            temperature: options.temperature.clamp(0.0, 1.0),
            system,
            messages: out_messages,
        })
    }
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicContentBlock>,
    #[serde(default)]
    stop_reason: String,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl From<AnthropicResponse> for ChatResponse {
    fn from(v: AnthropicResponse) -> Self {
        let content = v
            .content
            .into_iter()
            .filter_map(|block| match block {
                AnthropicContentBlock::Text { text } => Some(text),
                AnthropicContentBlock::Other => None,
            })
            .collect::<String>();

        ChatResponse {
            message: ChatMessage {
                role: Role::Assistant,
                content,
            },
            usage: Usage {
                prompt_tokens: v.usage.input_tokens as u32,
                completion_tokens: v.usage.output_tokens as u32,
            },
            finish_reason: v.stop_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_messages_are_hoisted_out_of_the_message_list() {
        let req = AnthropicRequest::new(
            "claude-3-5-haiku-latest",
            &[ChatMessage::system("be brief"), ChatMessage::user("hey")],
            &CompletionOptions {
                max_tokens: 100,
                temperature: 1.4,
            },
        )
        .expect("build request");
        assert_eq!(req.system, "be brief");
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].role, "user");
        assert_eq!(req.temperature, 1.0);
    }

    #[test]
    fn system_only_request_is_rejected() {
        let err = AnthropicRequest::new(
            "claude-3-5-haiku-latest",
            &[ChatMessage::system("persona")],
            &CompletionOptions::default(),
        )
        .expect_err("no user message");
        assert!(matches!(err, LlmError::InvalidInput(_)));
    }

    #[test]
    fn response_text_blocks_are_concatenated() {
        let parsed: AnthropicResponse = serde_json::from_str(
            r#"{
                "content":[{"type":"text","text":"lol "},{"type":"thinking","thinking":"x"},{"type":"text","text":"same"}],
                "stop_reason":"end_turn",
                "usage":{"input_tokens":9,"output_tokens":2}
            }"#,
        )
        .expect("parse response");
        let resp = ChatResponse::from(parsed);
        assert_eq!(resp.message.content, "lol same");
        assert_eq!(resp.usage.completion_tokens, 2);
        assert_eq!(resp.finish_reason, "end_turn");
    }
}
