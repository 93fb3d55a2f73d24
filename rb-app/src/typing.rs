//! Scoped "typing" chat action, refreshed until the indicator is dropped.

use rb_channels::{ChatId, ChatTransport};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Telegram clears the typing status after roughly five seconds.
const TYPING_REFRESH_INTERVAL: Duration = Duration::from_secs(4);

/// Shows "typing…" in a chat for as long as the guard is alive.
pub struct TypingIndicator {
    cancel: CancellationToken,
}

impl TypingIndicator {
    pub fn start(transport: Arc<dyn ChatTransport>, chat: ChatId) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            loop {
                if let Err(error) = transport.send_typing(chat).await {
                    tracing::debug!(chat_id = %chat, %error, "typing indicator unavailable");
                    return;
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(TYPING_REFRESH_INTERVAL) => {}
                }
            }
        });
        Self { cancel }
    }
}

impl Drop for TypingIndicator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingTransport;

    #[tokio::test(start_paused = true)]
    async fn refreshes_until_dropped() {
        let transport = RecordingTransport::new();
        let guard = TypingIndicator::start(
            Arc::clone(&transport) as Arc<dyn ChatTransport>,
            ChatId::new(-5),
        );
        tokio::time::sleep(Duration::from_secs(9)).await;
        drop(guard);
        tokio::time::sleep(Duration::from_secs(20)).await;

        let calls = transport.typing_calls();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|(chat, _)| *chat == ChatId::new(-5)));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_stops_quietly() {
        let transport = RecordingTransport::new();
        transport.fail_typing(true);
        let _guard = TypingIndicator::start(
            Arc::clone(&transport) as Arc<dyn ChatTransport>,
            ChatId::new(-5),
        );
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(transport.typing_calls().is_empty());
    }
}
