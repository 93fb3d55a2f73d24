//! Media-group coalescing.
//!
//! Telegram delivers an album as one message per item, all carrying the same
//! `media_group_id`. Items are buffered per group and forwarded with a single
//! call once the group has been quiet for `quiet_period`.

use rb_channels::{ChatId, ChatTransport, GroupId, MessageId, Peer};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub const MEDIA_GROUP_QUIET_PERIOD: Duration = Duration::from_millis(1500);

struct MediaGroupBatch {
    destination: Peer,
    source_chat: ChatId,
    message_ids: Vec<MessageId>,
    generation: u64,
    flush: JoinHandle<()>,
}

struct BatchMap {
    batches: HashMap<GroupId, MediaGroupBatch>,
    next_generation: u64,
}

struct Inner {
    transport: Arc<dyn ChatTransport>,
    quiet_period: Duration,
    state: Mutex<BatchMap>,
}

#[derive(Clone)]
pub struct MediaGroupDebouncer {
    inner: Arc<Inner>,
}

impl MediaGroupDebouncer {
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        Self::with_quiet_period(transport, MEDIA_GROUP_QUIET_PERIOD)
    }

    pub fn with_quiet_period(transport: Arc<dyn ChatTransport>, quiet_period: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                quiet_period,
                state: Mutex::new(BatchMap {
                    batches: HashMap::new(),
                    next_generation: 0,
                }),
            }),
        }
    }

    /// Append `message_id` to the batch for `group` and push its flush back by
    /// one quiet period. The destination is fixed by the first message.
    #[tracing::instrument(level = "debug", skip_all, fields(group = %group, message_id = %message_id))]
    pub async fn enqueue(
        &self,
        group: GroupId,
        message_id: MessageId,
        source_chat: ChatId,
        destination: Peer,
    ) {
        let mut state = self.inner.state.lock().await;
        state.next_generation += 1;
        let generation = state.next_generation;

        match state.batches.get_mut(&group) {
            Some(batch) => {
                batch.flush.abort();
                batch.message_ids.push(message_id);
                batch.generation = generation;
                batch.flush = self.schedule_flush(group.clone(), generation);
                tracing::debug!(
                    buffered = batch.message_ids.len(),
                    "media group extended"
                );
            }
            None => {
                let flush = self.schedule_flush(group.clone(), generation);
                state.batches.insert(
                    group,
                    MediaGroupBatch {
                        destination,
                        source_chat,
                        message_ids: vec![message_id],
                        generation,
                        flush,
                    },
                );
                tracing::debug!("media group opened");
            }
        }
    }

    /// Forward one ungrouped message right away.
    pub async fn forward_now(&self, source_chat: ChatId, message_id: MessageId, destination: &Peer) {
        match self
            .inner
            .transport
            .forward(destination, source_chat, &[message_id])
            .await
        {
            Ok(()) => tracing::info!(
                source_chat = %source_chat,
                destination = %destination.id,
                message_id = %message_id,
                "message forwarded"
            ),
            Err(error) => tracing::warn!(
                source_chat = %source_chat,
                destination = %destination.id,
                message_id = %message_id,
                %error,
                "forward failed; message dropped"
            ),
        }
    }

    pub async fn pending_groups(&self) -> usize {
        self.inner.state.lock().await.batches.len()
    }

    /// Abort every pending flush. Buffered ids are dropped.
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        let dropped = state.batches.len();
        for (_, batch) in state.batches.drain() {
            batch.flush.abort();
        }
        if dropped > 0 {
            tracing::info!(dropped, "pending media groups discarded on shutdown");
        }
    }

    fn schedule_flush(&self, group: GroupId, generation: u64) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(inner.quiet_period).await;
            inner.flush(group, generation).await;
        })
    }
}

impl Inner {
    async fn flush(&self, group: GroupId, generation: u64) {
        let batch = {
            let mut state = self.state.lock().await;
            let current = state
                .batches
                .get(&group)
                .is_some_and(|batch| batch.generation == generation);
            if current {
                state.batches.remove(&group)
            } else {
                None
            }
        };
        let Some(batch) = batch else {
            return;
        };

        let count = batch.message_ids.len();
        match self
            .transport
            .forward(&batch.destination, batch.source_chat, &batch.message_ids)
            .await
        {
            Ok(()) => tracing::info!(
                group = %group,
                source_chat = %batch.source_chat,
                destination = %batch.destination.id,
                count,
                "media group forwarded"
            ),
            Err(error) => tracing::warn!(
                group = %group,
                source_chat = %batch.source_chat,
                destination = %batch.destination.id,
                count,
                %error,
                "media group forward failed; batch dropped"
            ),
        }
    }
}
