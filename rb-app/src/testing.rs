//! In-memory fakes shared by the unit tests.

use async_trait::async_trait;
use rb_channels::{
    ChatId, ChatKind, ChatRef, ChatTransport, GroupId, InboundEvent, MessageId, MessageRef, Peer,
    ReplyRef, SelfIdentity, Sender, TransportError, UserId,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;

pub const SELF_ID: i64 = 777;
pub const SELF_USERNAME: &str = "relay_me";

#[derive(Debug, Clone)]
pub struct ForwardCall {
    pub to: ChatId,
    pub from: ChatId,
    pub ids: Vec<MessageId>,
    pub at: Instant,
}

#[derive(Debug, Clone)]
pub struct SentText {
    pub chat: ChatId,
    pub text: String,
    pub reply_to: Option<MessageId>,
    pub at: Instant,
}

/// Pauses `resolve_peer` for one spec until released.
pub struct ResolveGate {
    spec: String,
    pub entered: Notify,
    pub release: Notify,
}

pub struct RecordingTransport {
    peers: Mutex<HashMap<String, Peer>>,
    forwards: Mutex<Vec<ForwardCall>>,
    sent: Mutex<Vec<SentText>>,
    typing: Mutex<Vec<(ChatId, Instant)>>,
    left: Mutex<Vec<ChatId>>,
    gate: Mutex<Option<Arc<ResolveGate>>>,
    fail_forward: AtomicBool,
    fail_typing: AtomicBool,
    next_message_id: AtomicI64,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            forwards: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            typing: Mutex::new(Vec::new()),
            left: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
            fail_forward: AtomicBool::new(false),
            fail_typing: AtomicBool::new(false),
            next_message_id: AtomicI64::new(10_000),
        }
    }
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_peer(self: &Arc<Self>, spec: &str, id: i64) -> Arc<Self> {
        let kind = if id < 0 {
            ChatKind::Supergroup
        } else {
            ChatKind::Private
        };
        self.peers.lock().expect("peers lock").insert(
            spec.to_string(),
            Peer {
                id: ChatId::new(id),
                kind,
                username: spec.strip_prefix('@').map(str::to_string),
                title: None,
            },
        );
        Arc::clone(self)
    }

    pub fn gate_resolution(&self, spec: &str) -> Arc<ResolveGate> {
        let gate = Arc::new(ResolveGate {
            spec: spec.to_string(),
            entered: Notify::new(),
            release: Notify::new(),
        });
        *self.gate.lock().expect("gate lock") = Some(Arc::clone(&gate));
        gate
    }

    pub fn fail_forwards(&self, fail: bool) {
        self.fail_forward.store(fail, Ordering::SeqCst);
    }

    pub fn fail_typing(&self, fail: bool) {
        self.fail_typing.store(fail, Ordering::SeqCst);
    }

    pub fn forwards(&self) -> Vec<ForwardCall> {
        self.forwards.lock().expect("forwards lock").clone()
    }

    pub fn sent(&self) -> Vec<SentText> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub fn typing_calls(&self) -> Vec<(ChatId, Instant)> {
        self.typing.lock().expect("typing lock").clone()
    }

    pub fn left(&self) -> Vec<ChatId> {
        self.left.lock().expect("left lock").clone()
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    fn transport_id(&self) -> &str {
        "recording"
    }

    async fn start(&self, _tx: mpsc::Sender<InboundEvent>) -> rb_channels::Result<()> {
        Ok(())
    }

    async fn me(&self) -> rb_channels::Result<SelfIdentity> {
        Ok(self_identity())
    }

    async fn resolve_peer(&self, spec: &str) -> rb_channels::Result<Peer> {
        let gate = self
            .gate
            .lock()
            .expect("gate lock")
            .as_ref()
            .filter(|gate| gate.spec == spec)
            .cloned();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        self.peers
            .lock()
            .expect("peers lock")
            .get(spec)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(spec.to_string()))
    }

    async fn send_text(
        &self,
        chat: ChatId,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> rb_channels::Result<MessageRef> {
        self.sent.lock().expect("sent lock").push(SentText {
            chat,
            text: text.to_string(),
            reply_to,
            at: Instant::now(),
        });
        Ok(MessageRef {
            chat_id: chat,
            message_id: MessageId::new(self.next_message_id.fetch_add(1, Ordering::SeqCst)),
        })
    }

    async fn forward(
        &self,
        to: &Peer,
        from: ChatId,
        message_ids: &[MessageId],
    ) -> rb_channels::Result<()> {
        if self.fail_forward.load(Ordering::SeqCst) {
            return Err(TransportError::Api {
                method: "forwardMessages".to_string(),
                code: 400,
                description: "Bad Request: message to forward not found".to_string(),
            });
        }
        self.forwards.lock().expect("forwards lock").push(ForwardCall {
            to: to.id,
            from,
            ids: message_ids.to_vec(),
            at: Instant::now(),
        });
        Ok(())
    }

    async fn send_typing(&self, chat: ChatId) -> rb_channels::Result<()> {
        if self.fail_typing.load(Ordering::SeqCst) {
            return Err(TransportError::Unsupported("typing".to_string()));
        }
        self.typing
            .lock()
            .expect("typing lock")
            .push((chat, Instant::now()));
        Ok(())
    }

    async fn leave_chat(&self, chat: &Peer) -> rb_channels::Result<()> {
        self.left.lock().expect("left lock").push(chat.id);
        Ok(())
    }
}

pub fn self_identity() -> SelfIdentity {
    SelfIdentity {
        id: UserId::new(SELF_ID),
        username: Some(SELF_USERNAME.to_string()),
        first_name: "Relay".to_string(),
    }
}

pub fn peer(id: i64) -> Peer {
    Peer {
        id: ChatId::new(id),
        kind: ChatKind::Private,
        username: None,
        title: None,
    }
}

/// A group-chat text message from user `sender`.
pub fn group_text(chat: i64, message_id: i64, sender: i64, text: &str) -> InboundEvent {
    InboundEvent {
        message_id: MessageId::new(message_id),
        chat: ChatRef {
            id: ChatId::new(chat),
            kind: ChatKind::Supergroup,
        },
        sender: Some(Sender {
            id: UserId::new(sender),
            first_name: format!("user{sender}"),
            last_name: None,
            username: None,
        }),
        text: text.to_string(),
        media_group_id: None,
        reply_to: None,
        forward_origin: None,
        received_at: chrono::Utc::now(),
    }
}

pub fn album_part(chat: i64, message_id: i64, group: &str) -> InboundEvent {
    InboundEvent {
        media_group_id: Some(GroupId::from(group)),
        ..group_text(chat, message_id, 1, "")
    }
}

pub fn private_text(sender: i64, message_id: i64, text: &str) -> InboundEvent {
    let mut event = group_text(sender, message_id, sender, text);
    event.chat.kind = ChatKind::Private;
    event
}

pub fn replying_to_self(mut event: InboundEvent) -> InboundEvent {
    event.reply_to = Some(ReplyRef {
        message_id: MessageId::new(1),
        sender_id: Some(UserId::new(SELF_ID)),
        forward_origin: None,
    });
    event
}
