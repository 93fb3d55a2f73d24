//! Per-chat rolling conversation context.
//!
//! Lives for the process lifetime only; nothing here is persisted.

use chrono::{DateTime, Local};
use dashmap::DashMap;
use rb_channels::ChatId;
use std::collections::VecDeque;
use tokio::time::Instant;

/// Speaker label used for lines the account itself sent.
pub const SELF_LABEL: &str = "me";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextEntry {
    pub speaker: String,
    pub text: String,
    pub at: DateTime<Local>,
}

impl ContextEntry {
    pub fn new(speaker: impl Into<String>, text: impl Into<String>, at: DateTime<Local>) -> Self {
        Self {
            speaker: speaker.into(),
            text: text.into(),
            at,
        }
    }

    pub fn from_self(text: impl Into<String>) -> Self {
        Self::new(SELF_LABEL, text, Local::now())
    }

    /// `[HH:MM] speaker: text`
    pub fn render(&self) -> String {
        format!("[{}] {}: {}", self.at.format("%H:%M"), self.speaker, self.text)
    }
}

#[derive(Debug, Default)]
pub struct ChatContext {
    pub history: VecDeque<ContextEntry>,
    pub last_reply_at: Option<Instant>,
    pub reply_in_flight: bool,
}

impl ChatContext {
    fn push(&mut self, entry: ContextEntry, window: usize) {
        self.history.push_back(entry);
        let window = window.max(1);
        while self.history.len() > window {
            self.history.pop_front();
        }
    }

    fn tail(&self, n: usize) -> Vec<ContextEntry> {
        let skip = self.history.len().saturating_sub(n);
        self.history.iter().skip(skip).cloned().collect()
    }
}

#[derive(Default)]
pub struct ContextStore {
    chats: DashMap<ChatId, ChatContext>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to `chat`'s history, evicting the oldest entries beyond `window`.
    pub fn append(&self, chat: ChatId, entry: ContextEntry, window: usize) {
        self.chats.entry(chat).or_default().push(entry, window);
    }

    /// The newest `n` entries of `chat`, oldest first.
    pub fn recent(&self, chat: ChatId, n: usize) -> Vec<ContextEntry> {
        self.chats
            .get(&chat)
            .map(|ctx| ctx.tail(n))
            .unwrap_or_default()
    }

    /// Run `f` with exclusive access to `chat`'s context, creating it if needed.
    pub fn with_chat<R>(&self, chat: ChatId, f: impl FnOnce(&mut ChatContext) -> R) -> R {
        let mut ctx = self.chats.entry(chat).or_default();
        f(&mut ctx)
    }

    /// Close out a reply attempt. When a reply was emitted it is recorded under
    /// the self label and starts the cooldown; the in-flight mark is always cleared.
    pub fn finish_reply(&self, chat: ChatId, emitted: Option<(String, Instant)>, window: usize) {
        self.with_chat(chat, |ctx| {
            ctx.reply_in_flight = false;
            if let Some((text, at)) = emitted {
                ctx.last_reply_at = Some(at);
                ctx.push(ContextEntry::from_self(text), window);
            }
        });
    }

    pub fn chat_count(&self) -> usize {
        self.chats.len()
    }
}
