//! relaybot configuration loader.
//!
//! The file on disk is the source of truth for routes and reply policy; a few
//! secrets and endpoints can be overridden from the environment at load time.

use rb_channels::{ChatId, UserId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_LLM_BASE_URL: &str = "https://api.deepseek.com";
pub const DEFAULT_LLM_MODEL: &str = "deepseek-chat";
pub const DEFAULT_STATUS_BIND: &str = "127.0.0.1:8787";

pub const DEFAULT_PERSONA: &str = "You are a lively, easygoing young person who likes internet slang and \
keeps things short and funny, with the occasional emoji. Chat the way a real person would: \
casual, a little playful, never formal. Usually one or two sentences, never more than about \
50 characters. Never reveal that you are an AI.";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub routes: Vec<RouteMapping>,
    #[serde(default)]
    pub reply: ReplyPolicy,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Account allowed to drive the bot through private `/` commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_id: Option<UserId>,
}

/// One configured forwarding route. Both sides are kept as the operator typed
/// them and resolved on every route table rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteMapping {
    pub source_chat: String,
    pub target: String,
}

impl RouteMapping {
    pub fn new(source_chat: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source_chat: source_chat.into(),
            target: target.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub chats: Vec<ChatId>,
    /// Percent chance (0..=100) of replying on the default path.
    #[serde(default = "default_probability")]
    pub probability: u8,
    #[serde(default = "default_min_length")]
    pub min_length: usize,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    #[serde(default = "default_persona")]
    pub persona: String,
    #[serde(default = "default_true")]
    pub typing_simulation: bool,
    #[serde(default = "default_true")]
    pub decoration: bool,
    /// Mentions and replies to the account skip the length and cooldown gates.
    #[serde(default = "default_true")]
    pub addressed_bypasses_gates: bool,
}

fn default_probability() -> u8 {
    30
}

fn default_min_length() -> usize {
    3
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_context_window() -> usize {
    20
}

fn default_persona() -> String {
    DEFAULT_PERSONA.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ReplyPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            chats: Vec::new(),
            probability: default_probability(),
            min_length: default_min_length(),
            cooldown_secs: default_cooldown_secs(),
            context_window: default_context_window(),
            persona: default_persona(),
            typing_simulation: true,
            decoration: true,
            addressed_bypasses_gates: true,
        }
    }
}

impl ReplyPolicy {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// True when replies are globally on and `chat` is in the enabled list.
    pub fn is_chat_enabled(&self, chat: ChatId) -> bool {
        self.enabled && self.chats.contains(&chat)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.probability > 100 {
            return Err(ConfigError::Invalid(format!(
                "reply.probability must be within 0..=100, got {}",
                self.probability
            )));
        }
        if self.context_window == 0 {
            return Err(ConfigError::Invalid(
                "reply.context_window must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
}

fn default_llm_base_url() -> String {
    DEFAULT_LLM_BASE_URL.to_string()
}

fn default_llm_model() -> String {
    DEFAULT_LLM_MODEL.to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_llm_base_url(),
            model: default_llm_model(),
        }
    }
}

impl LlmConfig {
    pub fn api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_status_bind")]
    pub bind: String,
}

fn default_status_bind() -> String {
    DEFAULT_STATUS_BIND.to_string()
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_status_bind(),
        }
    }
}

impl RelayConfig {
    /// Read and validate the file, then apply environment overrides.
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(default_config_path);
        let mut cfg = Self::load_file(&path).await?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// The file as written, without environment overrides.
    pub async fn load_file(path: &Path) -> anyhow::Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
        let cfg: RelayConfig = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;
        Ok(cfg)
    }

    pub fn with_env_overrides(mut self) -> Self {
        self.apply_env_overrides();
        self
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = non_empty_env("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = v;
        }
        if let Some(v) = non_empty_env("RELAYBOT_OPERATOR_ID") {
            match v.parse::<UserId>() {
                Ok(id) => self.telegram.operator_id = Some(id),
                Err(error) => {
                    tracing::warn!(%error, value = %v, "ignoring non-numeric RELAYBOT_OPERATOR_ID");
                }
            }
        }
        if let Some(v) = non_empty_env("RELAYBOT_LLM_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = non_empty_env("RELAYBOT_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = non_empty_env("RELAYBOT_MODEL") {
            self.llm.model = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.reply.validate()?;
        if self.llm.model.trim().is_empty() {
            return Err(ConfigError::Invalid("llm.model is required".to_string()));
        }
        if self.llm.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("llm.base_url is required".to_string()));
        }
        for route in &self.routes {
            if route.source_chat.trim().is_empty() || route.target.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "route {:?} -> {:?} has an empty side",
                    route.source_chat, route.target
                )));
            }
        }
        if self.status.enabled && self.status.bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "status.bind {:?} is not a socket address",
                self.status.bind
            )));
        }
        Ok(())
    }

    /// Extra checks for `serve`: a bot token must be present.
    pub fn validate_for_serve(&self) -> Result<(), ConfigError> {
        self.validate()?;
        if self.telegram.bot_token.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "telegram.bot_token is required (or set TELEGRAM_BOT_TOKEN)".to_string(),
            ));
        }
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub fn relaybot_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".relaybot")
}

pub fn default_config_path() -> PathBuf {
    relaybot_home().join("config.toml")
}
