//! BYO-key completion client for relaybot.
//!
//! Pure HTTP client: one request in, one completion out. No streaming, no tools.

mod anthropic;
mod client;
mod error;
mod openai;
mod types;

pub use client::{DEFAULT_BASE_URL, LlmClient, Provider};
pub use error::{LlmError, Result};
pub use types::{ChatMessage, ChatResponse, CompletionOptions, Role, Usage};
