//! Single entry point for inbound events.
//!
//! Every event is routed independently to album forwarding (when its chat is a
//! route source) and to the reply pipeline (when its chat is AI-enabled).
//! Operator commands are peeled off first and never reach either.

use crate::commands::CommandHandler;
use crate::config::{ConfigError, ReplyPolicy, RouteMapping};
use crate::context::{ContextEntry, ContextStore};
use crate::debounce::MediaGroupDebouncer;
use crate::decision::{Decision, ReplyDecider, Trigger};
use crate::responder::ReplyJob;
use crate::routes::{RebuildReport, RouteTable};
use crate::synthesis::{PROMPT_CONTEXT_LINES, TextGenerator};
use arc_swap::{ArcSwap, ArcSwapOption};
use chrono::Local;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rb_channels::{ChatTransport, InboundEvent, MessageRef, SelfIdentity, UserId};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Operator commands waiting behind a slow one (an `/ai test` round trip).
const COMMAND_QUEUE_CAPACITY: usize = 16;

/// Label used when a sender has no usable display name.
const UNKNOWN_SENDER_LABEL: &str = "someone";

/// Pause flag and reply policy, read once per event.
pub struct DispatchState {
    paused: AtomicBool,
    policy: ArcSwap<ReplyPolicy>,
}

impl DispatchState {
    pub fn new(policy: ReplyPolicy) -> Self {
        Self {
            paused: AtomicBool::new(false),
            policy: ArcSwap::from_pointee(policy),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Returns false when the state was already `paused`.
    pub fn set_paused(&self, paused: bool) -> bool {
        self.paused.swap(paused, Ordering::SeqCst) != paused
    }

    pub fn policy(&self) -> Arc<ReplyPolicy> {
        self.policy.load_full()
    }

    pub fn set_policy(&self, policy: ReplyPolicy) {
        self.policy.store(Arc::new(policy));
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicySummary {
    pub enabled: bool,
    pub chats: usize,
    pub probability: u8,
    pub min_length: usize,
    pub cooldown_secs: u64,
    pub context_window: usize,
    pub typing_simulation: bool,
    pub decoration: bool,
    pub addressed_bypasses_gates: bool,
}

impl From<&ReplyPolicy> for PolicySummary {
    fn from(policy: &ReplyPolicy) -> Self {
        Self {
            enabled: policy.enabled,
            chats: policy.chats.len(),
            probability: policy.probability,
            min_length: policy.min_length,
            cooldown_secs: policy.cooldown_secs,
            context_window: policy.context_window,
            typing_simulation: policy.typing_simulation,
            decoration: policy.decoration,
            addressed_bypasses_gates: policy.addressed_bypasses_gates,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub account: Option<String>,
    pub paused: bool,
    pub route_count: usize,
    pub pending_media_groups: usize,
    pub tracked_chats: usize,
    pub reply: PolicySummary,
    pub generator_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generator: Option<String>,
    pub uptime_secs: u64,
}

impl StatusSnapshot {
    pub fn render(&self) -> String {
        let onoff = |on: bool| if on { "on" } else { "off" };
        format!(
            "account={}\nstate={}\nroutes={}\npending_media_groups={}\n\
             ai={} chats={} probability={}% min_length={} cooldown={}s context={}\n\
             typing={} emoji={} addressed_bypass={}\ngenerator={}\nuptime_seconds={}",
            self.account.as_deref().unwrap_or("unknown"),
            if self.paused { "paused" } else { "running" },
            self.route_count,
            self.pending_media_groups,
            onoff(self.reply.enabled),
            self.reply.chats,
            self.reply.probability,
            self.reply.min_length,
            self.reply.cooldown_secs,
            self.reply.context_window,
            onoff(self.reply.typing_simulation),
            onoff(self.reply.decoration),
            onoff(self.reply.addressed_bypasses_gates),
            self.generator.as_deref().unwrap_or("not configured"),
            self.uptime_secs,
        )
    }
}

/// What happened to one event; mostly useful to tests and debug logs.
#[derive(Debug, Default)]
pub struct EventOutcome {
    pub routed: bool,
    pub decision: Option<Decision>,
    pub reply: Option<JoinHandle<Option<MessageRef>>>,
}

pub struct Dispatcher {
    transport: Arc<dyn ChatTransport>,
    me: SelfIdentity,
    operator: Option<UserId>,
    state: DispatchState,
    routes: RouteTable,
    debouncer: MediaGroupDebouncer,
    contexts: Arc<ContextStore>,
    generator: ArcSwapOption<Box<dyn TextGenerator>>,
    decider: Mutex<ReplyDecider<StdRng>>,
    started_at: Instant,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        me: SelfIdentity,
        operator: Option<UserId>,
        policy: ReplyPolicy,
        rng: StdRng,
    ) -> Self {
        Self {
            debouncer: MediaGroupDebouncer::new(Arc::clone(&transport)),
            transport,
            me,
            operator,
            state: DispatchState::new(policy),
            routes: RouteTable::new(),
            contexts: Arc::new(ContextStore::new()),
            generator: ArcSwapOption::empty(),
            decider: Mutex::new(ReplyDecider::new(rng)),
            started_at: Instant::now(),
        }
    }

    pub fn transport(&self) -> &Arc<dyn ChatTransport> {
        &self.transport
    }

    pub fn state(&self) -> &DispatchState {
        &self.state
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn contexts(&self) -> &Arc<ContextStore> {
        &self.contexts
    }

    pub fn generator(&self) -> Option<Arc<Box<dyn TextGenerator>>> {
        self.generator.load_full()
    }

    pub fn set_generator(&self, generator: Option<Box<dyn TextGenerator>>) {
        self.generator.store(generator.map(Arc::new));
    }

    pub async fn rebuild_routes(&self, mappings: &[RouteMapping]) -> RebuildReport {
        self.routes.rebuild(self.transport.as_ref(), mappings).await
    }

    /// Validate and publish a new reply policy; the next event sees it.
    pub fn update_policy(&self, policy: ReplyPolicy) -> Result<(), ConfigError> {
        policy.validate()?;
        self.state.set_policy(policy);
        Ok(())
    }

    /// Returns false when already paused.
    pub fn pause(&self) -> bool {
        let changed = self.state.set_paused(true);
        if changed {
            tracing::info!("dispatching paused");
        }
        changed
    }

    /// Returns false when already running.
    pub fn resume(&self) -> bool {
        let changed = self.state.set_paused(false);
        if changed {
            tracing::info!("dispatching resumed");
        }
        changed
    }

    pub async fn status(&self) -> StatusSnapshot {
        let policy = self.state.policy();
        let generator = self.generator();
        StatusSnapshot {
            account: self.me.handle(),
            paused: self.state.is_paused(),
            route_count: self.routes.len(),
            pending_media_groups: self.debouncer.pending_groups().await,
            tracked_chats: self.contexts.chat_count(),
            reply: PolicySummary::from(policy.as_ref()),
            generator_available: generator.is_some(),
            generator: generator.map(|g| g.describe()),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    /// Private `/...` text from the operator account.
    pub fn is_operator_command(&self, event: &InboundEvent) -> bool {
        event.is_private()
            && self.operator.is_some()
            && event.sender_id() == self.operator
            && event.text.trim_start().starts_with('/')
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(chat_id = %event.chat_id(), message_id = %event.message_id)
    )]
    pub async fn handle_event(&self, event: InboundEvent) -> EventOutcome {
        let mut outcome = EventOutcome::default();
        if self.state.is_paused() {
            tracing::trace!("paused; event ignored");
            return outcome;
        }
        let policy = self.state.policy();
        let chat = event.chat_id();

        if let Some(destination) = self.routes.lookup(chat) {
            match &event.media_group_id {
                Some(group) => {
                    self.debouncer
                        .enqueue(group.clone(), event.message_id, chat, destination)
                        .await;
                }
                None => {
                    self.debouncer
                        .forward_now(chat, event.message_id, &destination)
                        .await;
                }
            }
            outcome.routed = true;
        }

        if self.wants_reply_pipeline(&event, &policy) {
            let (decision, reply) = self.consider_reply(&event, policy).await;
            outcome.decision = Some(decision);
            outcome.reply = reply;
        }
        outcome
    }

    fn wants_reply_pipeline(&self, event: &InboundEvent, policy: &ReplyPolicy) -> bool {
        let text = event.text.trim();
        policy.is_chat_enabled(event.chat_id())
            && !text.is_empty()
            && !text.starts_with('/')
            && event.sender_id().is_some_and(|sender| sender != self.me.id)
    }

    async fn consider_reply(
        &self,
        event: &InboundEvent,
        policy: Arc<ReplyPolicy>,
    ) -> (Decision, Option<JoinHandle<Option<MessageRef>>>) {
        let chat = event.chat_id();
        let sender = event
            .sender
            .as_ref()
            .and_then(|s| s.display_name())
            .unwrap_or_else(|| UNKNOWN_SENDER_LABEL.to_string());
        let trigger = Trigger::classify(event, &self.me);

        self.contexts.append(
            chat,
            ContextEntry::new(
                sender.clone(),
                event.text.clone(),
                event.received_at.with_timezone(&Local),
            ),
            policy.context_window,
        );

        let now = Instant::now();
        let (decision, job_rng) = {
            let mut decider = self.decider.lock().await;
            let decision = self
                .contexts
                .with_chat(chat, |ctx| decider.decide(ctx, &event.text, trigger, &policy, now));
            let seed: u64 = decider.rng().r#gen();
            (decision, StdRng::seed_from_u64(seed))
        };

        let Decision::Reply(trigger) = decision else {
            tracing::debug!(?decision, "no reply");
            return (decision, None);
        };

        tracing::debug!(?trigger, "reply accepted");
        let context = self
            .contexts
            .recent(chat, PROMPT_CONTEXT_LINES.min(policy.context_window));
        let job = ReplyJob {
            transport: Arc::clone(&self.transport),
            generator: self.generator(),
            contexts: Arc::clone(&self.contexts),
            policy,
            chat,
            trigger_message: event.message_id,
            trigger,
            sender,
            text: event.text.clone(),
            context,
            rng: job_rng,
        };
        (decision, Some(job.spawn()))
    }

    pub async fn shutdown(&self) {
        self.debouncer.shutdown().await;
    }

    /// Consume inbound events in order until the queue closes or `cancel` fires.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<InboundEvent>,
        commands: CommandHandler,
        cancel: CancellationToken,
    ) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let command_worker = tokio::spawn(run_commands(commands, command_rx));
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => event,
            };
            let Some(event) = event else {
                tracing::info!("inbound queue closed");
                break;
            };

            if self.is_operator_command(&event) {
                if let Err(error) = command_tx.try_send(event) {
                    tracing::warn!(%error, "operator command queue full; command dropped");
                }
                continue;
            }
            self.handle_event(event).await;
        }
        command_worker.abort();
        self.shutdown().await;
    }
}

/// Commands run one at a time, in arrival order, off the event loop.
async fn run_commands(commands: CommandHandler, mut rx: mpsc::Receiver<InboundEvent>) {
    while let Some(event) = rx.recv().await {
        commands.handle(&event).await;
    }
}
