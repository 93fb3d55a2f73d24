//! Whether an inbound message in an AI-enabled chat gets a reply attempt.

use crate::config::ReplyPolicy;
use crate::context::ChatContext;
use rand::Rng;
use rb_channels::{InboundEvent, SelfIdentity};
use tokio::time::Instant;

/// Acceptance percentage for messages addressed to the account.
pub const ADDRESSED_ACCEPT_PERCENT: u32 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Reply to a message the account sent.
    ReplyToSelf,
    /// Text contains the account's `@handle`.
    Mentioned,
    Ambient,
}

impl Trigger {
    pub fn classify(event: &InboundEvent, me: &SelfIdentity) -> Self {
        let replies_to_self = event
            .reply_to
            .as_ref()
            .and_then(|reply| reply.sender_id)
            .is_some_and(|sender| sender == me.id);
        if replies_to_self {
            return Self::ReplyToSelf;
        }
        let mentioned = me.handle().is_some_and(|handle| {
            event
                .text
                .to_lowercase()
                .contains(&handle.to_lowercase())
        });
        if mentioned {
            return Self::Mentioned;
        }
        Self::Ambient
    }

    pub fn is_addressed(self) -> bool {
        !matches!(self, Self::Ambient)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclineReason {
    TooShort,
    Cooldown,
    InFlight,
    Draw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Reply(Trigger),
    Decline(DeclineReason),
}

pub struct ReplyDecider<R> {
    rng: R,
}

impl<R: Rng> ReplyDecider<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }

    pub fn rng(&mut self) -> &mut R {
        &mut self.rng
    }

    /// Evaluate the gates for one message. An accepted reply marks the chat as
    /// in flight; the caller clears it through `ContextStore::finish_reply`.
    pub fn decide(
        &mut self,
        ctx: &mut ChatContext,
        text: &str,
        trigger: Trigger,
        policy: &ReplyPolicy,
        now: Instant,
    ) -> Decision {
        let addressed = trigger.is_addressed();

        if !addressed || !policy.addressed_bypasses_gates {
            if text.trim().chars().count() < policy.min_length {
                return Decision::Decline(DeclineReason::TooShort);
            }
            let cooling = ctx
                .last_reply_at
                .is_some_and(|last| now.saturating_duration_since(last) < policy.cooldown());
            if cooling {
                return Decision::Decline(DeclineReason::Cooldown);
            }
        }

        let accepted = if addressed {
            self.percent_draw(ADDRESSED_ACCEPT_PERCENT)
        } else {
            if ctx.reply_in_flight {
                return Decision::Decline(DeclineReason::InFlight);
            }
            self.percent_draw(u32::from(policy.probability))
        };
        if !accepted {
            return Decision::Decline(DeclineReason::Draw);
        }

        ctx.reply_in_flight = true;
        Decision::Reply(trigger)
    }

    fn percent_draw(&mut self, percent: u32) -> bool {
        self.rng.gen_range(1..=100) <= percent
    }
}
