//! Source chat → destination peer table used for album forwarding.

use crate::config::RouteMapping;
use arc_swap::ArcSwap;
use rb_channels::{ChatId, ChatTransport, Peer, TransportError};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct RebuildReport {
    pub resolved: usize,
    pub failed: Vec<(RouteMapping, TransportError)>,
}

/// Readers load a snapshot; `rebuild` builds the next map off to the side and
/// publishes it with a single store, so a lookup sees either the whole old
/// table or the whole new one.
pub struct RouteTable {
    table: ArcSwap<HashMap<ChatId, Peer>>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn lookup(&self, chat: ChatId) -> Option<Peer> {
        self.table.load().get(&chat).cloned()
    }

    pub fn len(&self) -> usize {
        self.table.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[tracing::instrument(level = "info", skip_all, fields(mappings = mappings.len()))]
    pub async fn rebuild(
        &self,
        transport: &dyn ChatTransport,
        mappings: &[RouteMapping],
    ) -> RebuildReport {
        let mut next = HashMap::with_capacity(mappings.len());
        let mut report = RebuildReport::default();

        for mapping in mappings {
            match resolve_mapping(transport, mapping).await {
                Ok((source, destination)) => {
                    tracing::debug!(
                        source_chat = %source,
                        destination = %destination.display_name(),
                        "route resolved"
                    );
                    if next.insert(source, destination).is_some() {
                        tracing::warn!(source_chat = %source, "duplicate route source; last mapping wins");
                    }
                    report.resolved += 1;
                }
                Err(error) => {
                    tracing::warn!(
                        source_chat = %mapping.source_chat,
                        target = %mapping.target,
                        %error,
                        "route skipped"
                    );
                    report.failed.push((mapping.clone(), error));
                }
            }
        }

        self.table.store(Arc::new(next));
        tracing::info!(
            resolved = report.resolved,
            failed = report.failed.len(),
            "route table rebuilt"
        );
        report
    }
}

/// Numeric sources are taken as ids directly; anything else goes through the
/// transport. Targets are always resolved so the peer is known to be reachable.
async fn resolve_mapping(
    transport: &dyn ChatTransport,
    mapping: &RouteMapping,
) -> rb_channels::Result<(ChatId, Peer)> {
    let source = match mapping.source_chat.parse::<ChatId>() {
        Ok(id) => id,
        Err(_) => transport.resolve_peer(&mapping.source_chat).await?.id,
    };
    let destination = transport.resolve_peer(mapping.target.trim()).await?;
    Ok((source, destination))
}
