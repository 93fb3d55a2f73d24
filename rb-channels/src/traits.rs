use crate::error::{Result, TransportError};
use crate::types::{ChatId, InboundEvent, MessageId, MessageRef, Peer, SelfIdentity};
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Short transport identifier used in logs: "telegram".
    fn transport_id(&self) -> &str;

    /// Start receiving events. Push to tx for each inbound message.
    async fn start(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()>;

    /// Identity of the monitored account.
    async fn me(&self) -> Result<SelfIdentity>;

    /// Resolve a numeric id, `@username` or public link to a peer.
    /// Fails with `TransportError::NotFound` when nothing matches.
    async fn resolve_peer(&self, spec: &str) -> Result<Peer>;

    /// Send a text message, optionally as a reply to `reply_to`.
    async fn send_text(
        &self,
        chat: ChatId,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageRef>;

    /// Forward `message_ids` (in the given order) from `from` to `to`.
    async fn forward(&self, to: &Peer, from: ChatId, message_ids: &[MessageId]) -> Result<()>;

    /// Show the typing indicator once. Platforms expire it after a few seconds.
    async fn send_typing(&self, _chat: ChatId) -> Result<()> {
        Err(TransportError::Unsupported(
            "send_typing is not supported by this transport".to_string(),
        ))
    }

    async fn leave_chat(&self, _chat: &Peer) -> Result<()> {
        Err(TransportError::Unsupported(
            "leave_chat is not supported by this transport".to_string(),
        ))
    }
}
