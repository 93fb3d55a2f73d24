//! Chat transport for relaybot.
//!
//! Transports are pure I/O: they turn platform updates into `InboundEvent`s and
//! expose the handful of primitives the engine needs (resolve, send, forward,
//! typing). Routing and reply policy live in the app crate.

mod error;
mod telegram;
mod traits;
mod types;

pub use error::{Result, TransportError};
pub use telegram::TelegramTransport;
pub use traits::ChatTransport;
pub use types::{
    ChatId, ChatKind, ChatRef, ForwardOrigin, GroupId, InboundEvent, MessageId, MessageRef, Peer,
    ReplyRef, SelfIdentity, Sender, UserId,
};
