//! The asynchronous half of a reply: synthesis, typing, emission.

use crate::config::ReplyPolicy;
use crate::context::{ContextEntry, ContextStore};
use crate::decision::Trigger;
use crate::synthesis::{self, TextGenerator};
use crate::typing::TypingIndicator;
use rand::Rng;
use rand::rngs::StdRng;
use rb_channels::{ChatId, ChatTransport, MessageId, MessageRef};
use std::sync::Arc;
use tokio::time::Instant;

/// Chance that a reply to a mention quotes the mentioning message.
const MENTION_QUOTE_PROBABILITY: f64 = 0.7;

pub struct ReplyJob {
    pub transport: Arc<dyn ChatTransport>,
    pub generator: Option<Arc<Box<dyn TextGenerator>>>,
    pub contexts: Arc<ContextStore>,
    pub policy: Arc<ReplyPolicy>,
    pub chat: ChatId,
    pub trigger_message: MessageId,
    pub trigger: Trigger,
    pub sender: String,
    pub text: String,
    pub context: Vec<ContextEntry>,
    pub rng: StdRng,
}

impl ReplyJob {
    pub fn spawn(self) -> tokio::task::JoinHandle<Option<MessageRef>> {
        tokio::spawn(self.run())
    }

    /// Always releases the chat's in-flight mark before returning.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(chat_id = %self.chat, message_id = %self.trigger_message, trigger = ?self.trigger)
    )]
    pub async fn run(mut self) -> Option<MessageRef> {
        let window = self.policy.context_window;
        let sent = self.attempt().await;
        let emitted = sent.as_ref().map(|(_, text)| (text.clone(), Instant::now()));
        self.contexts.finish_reply(self.chat, emitted, window);
        sent.map(|(message, _)| message)
    }

    async fn attempt(&mut self) -> Option<(MessageRef, String)> {
        let Some(generator) = self.generator.clone() else {
            tracing::debug!("no text generator configured; reply skipped");
            return None;
        };

        let reply = match synthesis::generate_reply(
            &**generator,
            &self.policy.persona,
            &self.context,
            &self.sender,
            &self.text,
            self.policy.decoration,
            &mut self.rng,
        )
        .await
        {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                tracing::debug!("generator declined");
                return None;
            }
            Err(error) => {
                tracing::warn!(%error, "reply generation failed");
                return None;
            }
        };

        if self.policy.typing_simulation {
            let delay = synthesis::typing_delay(&reply, &mut self.rng);
            let _typing = TypingIndicator::start(Arc::clone(&self.transport), self.chat);
            tokio::time::sleep(delay).await;
        }

        let quote = match self.trigger {
            Trigger::ReplyToSelf => true,
            Trigger::Mentioned => self.rng.gen_bool(MENTION_QUOTE_PROBABILITY),
            Trigger::Ambient => false,
        };
        let reply_to = quote.then_some(self.trigger_message);

        match self.transport.send_text(self.chat, &reply, reply_to).await {
            Ok(message) => {
                tracing::info!(quoted = quote, chars = reply.chars().count(), "reply sent");
                Some((message, reply))
            }
            Err(error) => {
                tracing::warn!(%error, "reply send failed");
                None
            }
        }
    }
}
