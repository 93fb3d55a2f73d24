//! Operator commands, accepted from the operator account in a private chat.
//!
//! Every handler returns the text sent back as a reply to the command. Changes
//! to routes or policy are persisted first and only then applied to the
//! running dispatcher, so a rejected change leaves both untouched.

use crate::config::{LlmConfig, ReplyPolicy, RouteMapping};
use crate::config_control::ConfigControl;
use crate::dispatcher::{Dispatcher, PolicySummary};
use crate::synthesis;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rb_channels::{ChatId, ForwardOrigin, InboundEvent};
use std::sync::Arc;

const HELP: &str = "\
Commands:
/status - engine status
/pause, /resume - stop or restart forwarding and replies
/myid - your user id
/chatid - this chat's id, or the origin of a forwarded message you reply to
/send <@peer> <text> - send a message as the bot
/leave <chat> - leave a group or channel
/add_listen <source> <target> - forward albums from source to target
  (target: @channel, @group or chat id the bot can post in)
/remove_listen <source> - drop a route
/list_listen - list routes
/ai on|off|add <chat>|remove <chat>|list|status
/ai prob <0-100>|cooldown <s>|minlen <n>|context <n>|personality <text>
/ai typing on|off|emoji on|off|bypass on|off
/ai test <text>|apikey <key>|baseurl <url>|model <name>";

/// Bot API limits on where forwards can go.
const TARGET_CONSTRAINT: &str = "Targets must be a channel or group the bot is a member of \
     (with permission to post), or a user who has started the bot; other bots cannot \
     receive forwards.";

#[derive(Clone)]
pub struct CommandHandler {
    dispatcher: Arc<Dispatcher>,
    config: ConfigControl,
}

impl CommandHandler {
    pub fn new(dispatcher: Arc<Dispatcher>, config: ConfigControl) -> Self {
        Self { dispatcher, config }
    }

    /// Execute the command in `event` and reply to it in the same chat.
    #[tracing::instrument(level = "info", skip_all, fields(message_id = %event.message_id))]
    pub async fn handle(&self, event: &InboundEvent) {
        let reply = self.execute(event).await;
        if let Err(error) = self
            .dispatcher
            .transport()
            .send_text(event.chat_id(), &reply, Some(event.message_id))
            .await
        {
            tracing::warn!(%error, "command reply failed");
        }
    }

    pub async fn execute(&self, event: &InboundEvent) -> String {
        let (command, args) = split_command(&event.text);
        tracing::info!(command = %command, "operator command");
        match command.as_str() {
            "/help" => HELP.to_string(),
            "/status" => self.dispatcher.status().await.render(),
            "/pause" => {
                if self.dispatcher.pause() {
                    "Paused. Forwarding and replies are stopped.".to_string()
                } else {
                    "Already paused.".to_string()
                }
            }
            "/resume" => {
                if self.dispatcher.resume() {
                    "Resumed.".to_string()
                } else {
                    "Already running.".to_string()
                }
            }
            "/myid" => match event.sender_id() {
                Some(id) => format!("Your user id: {id}"),
                None => "No sender on this message.".to_string(),
            },
            "/chatid" => chat_id_report(event),
            "/send" => self.send(args).await,
            "/leave" => self.leave(args).await,
            "/add_listen" => self.add_listen(args).await,
            "/remove_listen" => self.remove_listen(args).await,
            "/list_listen" => self.list_listen().await,
            "/ai" => self.ai(args).await,
            other => format!("Unknown command {other}. Send /help for the list."),
        }
    }

    async fn send(&self, args: &str) -> String {
        let Some((peer_spec, text)) = split_first(args) else {
            return "Usage: /send <@peer> <text>".to_string();
        };
        if text.is_empty() {
            return "Usage: /send <@peer> <text>".to_string();
        }
        let transport = self.dispatcher.transport();
        let peer = match transport.resolve_peer(peer_spec).await {
            Ok(peer) => peer,
            Err(error) => return format!("Cannot resolve {peer_spec}: {error}"),
        };
        match transport.send_text(peer.id, text, None).await {
            Ok(_) => format!("Sent to {}.", peer.display_name()),
            Err(error) => format!("Send to {} failed: {error}", peer.display_name()),
        }
    }

    async fn leave(&self, args: &str) -> String {
        let spec = args.trim();
        if spec.is_empty() {
            return "Usage: /leave <chat id | @username | link>".to_string();
        }
        let transport = self.dispatcher.transport();
        let peer = match transport.resolve_peer(spec).await {
            Ok(peer) => peer,
            Err(error) => return format!("Cannot resolve {spec}: {error}"),
        };
        match transport.leave_chat(&peer).await {
            Ok(()) => format!("Left {}.", peer.display_name()),
            Err(error) => format!("Leaving {} failed: {error}", peer.display_name()),
        }
    }

    async fn add_listen(&self, args: &str) -> String {
        let parts: Vec<&str> = args.split_whitespace().collect();
        let [source, target] = parts.as_slice() else {
            return "Usage: /add_listen <source chat> <target chat>".to_string();
        };
        if !target.starts_with('@') && target.parse::<ChatId>().is_err() {
            return format!("Target must be an @username or a numeric chat id, got {target}.");
        }
        let transport = self.dispatcher.transport();
        if let Err(error) = transport.resolve_peer(target).await {
            return format!(
                "Cannot resolve target {target}: {error}. {}",
                TARGET_CONSTRAINT
            );
        }
        if source.parse::<ChatId>().is_err() {
            if let Err(error) = transport.resolve_peer(source).await {
                return format!("Cannot resolve source {source}: {error}");
            }
        }

        let (source, target) = (source.to_string(), target.to_string());
        let mut replaced = false;
        let snapshot = match self
            .config
            .update(|cfg| {
                let before = cfg.routes.len();
                cfg.routes.retain(|route| route.source_chat.trim() != source);
                replaced = cfg.routes.len() != before;
                cfg.routes.push(RouteMapping::new(source.clone(), target.clone()));
            })
            .await
        {
            Ok(snapshot) => snapshot,
            Err(error) => return format!("Route not saved: {error}"),
        };
        let report = self.dispatcher.rebuild_routes(&snapshot.config.routes).await;
        let verb = if replaced { "Replaced" } else { "Added" };
        format!(
            "{verb} route {source} -> {target}. Active routes: {} ({} failed to resolve).",
            report.resolved,
            report.failed.len()
        )
    }

    async fn remove_listen(&self, args: &str) -> String {
        let source = args.trim().to_string();
        if source.is_empty() {
            return "Usage: /remove_listen <source chat>".to_string();
        }
        let mut removed = 0;
        let snapshot = match self
            .config
            .update(|cfg| {
                let before = cfg.routes.len();
                cfg.routes.retain(|route| route.source_chat.trim() != source);
                removed = before - cfg.routes.len();
            })
            .await
        {
            Ok(snapshot) => snapshot,
            Err(error) => return format!("Route not removed: {error}"),
        };
        if removed == 0 {
            return format!("No route from {source}.");
        }
        let report = self.dispatcher.rebuild_routes(&snapshot.config.routes).await;
        format!("Removed route from {source}. Active routes: {}.", report.resolved)
    }

    async fn list_listen(&self) -> String {
        let snapshot = self.config.snapshot().await;
        if snapshot.config.routes.is_empty() {
            return "No routes configured.".to_string();
        }
        let mut lines = vec![format!(
            "Routes ({} configured, {} active):",
            snapshot.config.routes.len(),
            self.dispatcher.routes().len()
        )];
        for route in &snapshot.config.routes {
            let state = match route.source_chat.parse::<ChatId>() {
                Ok(id) if self.dispatcher.routes().lookup(id).is_none() => " (inactive)",
                _ => "",
            };
            lines.push(format!("{} -> {}{state}", route.source_chat, route.target));
        }
        lines.join("\n")
    }

    async fn ai(&self, args: &str) -> String {
        let (sub, rest) = split_first(args).unwrap_or(("status", ""));
        match sub.to_ascii_lowercase().as_str() {
            "on" => self.update_policy("AI replies on.", |p| p.enabled = true).await,
            "off" => self.update_policy("AI replies off.", |p| p.enabled = false).await,
            "add" => match self.chat_arg(rest).await {
                Ok(chat) => {
                    self.update_policy(&format!("Chat {chat} enabled for AI replies."), |p| {
                        if !p.chats.contains(&chat) {
                            p.chats.push(chat);
                        }
                    })
                    .await
                }
                Err(message) => message,
            },
            "remove" => match self.chat_arg(rest).await {
                Ok(chat) => {
                    if !self.dispatcher.state().policy().chats.contains(&chat) {
                        return format!("Chat {chat} is not in the AI list.");
                    }
                    self.update_policy(&format!("Chat {chat} removed from AI replies."), |p| {
                        p.chats.retain(|c| *c != chat)
                    })
                    .await
                }
                Err(message) => message,
            },
            "list" => {
                let policy = self.dispatcher.state().policy();
                if policy.chats.is_empty() {
                    "No AI-enabled chats.".to_string()
                } else {
                    let ids: Vec<String> = policy.chats.iter().map(ChatId::to_string).collect();
                    format!("AI-enabled chats:\n{}", ids.join("\n"))
                }
            }
            "prob" => match parse_arg::<u8>(rest, "/ai prob <0-100>") {
                Ok(v) => {
                    self.update_policy(&format!("Reply probability set to {v}%."), |p| {
                        p.probability = v
                    })
                    .await
                }
                Err(message) => message,
            },
            "cooldown" => match parse_arg::<u64>(rest, "/ai cooldown <seconds>") {
                Ok(v) => {
                    self.update_policy(&format!("Cooldown set to {v}s."), |p| p.cooldown_secs = v)
                        .await
                }
                Err(message) => message,
            },
            "minlen" => match parse_arg::<usize>(rest, "/ai minlen <chars>") {
                Ok(v) => {
                    self.update_policy(&format!("Minimum length set to {v}."), |p| {
                        p.min_length = v
                    })
                    .await
                }
                Err(message) => message,
            },
            "context" => match parse_arg::<usize>(rest, "/ai context <messages>") {
                Ok(v) => {
                    self.update_policy(&format!("Context window set to {v}."), |p| {
                        p.context_window = v
                    })
                    .await
                }
                Err(message) => message,
            },
            "personality" => {
                let persona = rest.trim();
                if persona.is_empty() {
                    let current = self.dispatcher.state().policy().persona.clone();
                    return format!("Current persona:\n{current}\n\nUsage: /ai personality <text>");
                }
                let persona = persona.to_string();
                self.update_policy("Persona updated.", |p| p.persona = persona)
                    .await
            }
            "typing" => match parse_switch(rest) {
                Some(on) => {
                    self.update_policy(&format!("Typing simulation {}.", on_off(on)), |p| {
                        p.typing_simulation = on
                    })
                    .await
                }
                None => "Usage: /ai typing on|off".to_string(),
            },
            "emoji" => match parse_switch(rest) {
                Some(on) => {
                    self.update_policy(&format!("Emoji decoration {}.", on_off(on)), |p| {
                        p.decoration = on
                    })
                    .await
                }
                None => "Usage: /ai emoji on|off".to_string(),
            },
            "bypass" => match parse_switch(rest) {
                Some(on) => {
                    self.update_policy(&format!("Addressed bypass {}.", on_off(on)), |p| {
                        p.addressed_bypasses_gates = on
                    })
                    .await
                }
                None => "Usage: /ai bypass on|off".to_string(),
            },
            "status" => self.ai_status().await,
            "test" => self.ai_test(rest).await,
            "apikey" => {
                let key = rest.trim().to_string();
                if key.is_empty() {
                    return "Usage: /ai apikey <key>".to_string();
                }
                self.update_llm(|llm| llm.api_key = Some(key)).await
            }
            "baseurl" => {
                let url = rest.trim().to_string();
                if url.is_empty() {
                    return "Usage: /ai baseurl <url>".to_string();
                }
                self.update_llm(|llm| llm.base_url = url).await
            }
            "model" => {
                let model = rest.trim().to_string();
                if model.is_empty() {
                    return "Usage: /ai model <name>".to_string();
                }
                self.update_llm(|llm| llm.model = model).await
            }
            other => format!("Unknown /ai subcommand {other}. Send /help for the list."),
        }
    }

    /// Persist a policy change and publish it to the dispatcher.
    async fn update_policy<F>(&self, done: &str, mutate: F) -> String
    where
        F: FnOnce(&mut ReplyPolicy),
    {
        match self.config.update(|cfg| mutate(&mut cfg.reply)).await {
            Ok(snapshot) => match self.dispatcher.update_policy(snapshot.config.reply) {
                Ok(()) => done.to_string(),
                Err(error) => format!("Rejected: {error}"),
            },
            Err(error) => format!("Rejected: {error}"),
        }
    }

    /// Build the new generator before persisting, so a bad value changes nothing.
    async fn update_llm<F>(&self, mutate: F) -> String
    where
        F: FnOnce(&mut LlmConfig) + Clone,
    {
        let mut candidate = self.config.snapshot().await.config.llm;
        mutate.clone()(&mut candidate);
        let generator = match synthesis::generator_from_config(&candidate) {
            Ok(generator) => generator,
            Err(error) => return format!("Rejected: {error}"),
        };
        let snapshot = match self.config.update(|cfg| mutate(&mut cfg.llm)).await {
            Ok(snapshot) => snapshot,
            Err(error) => return format!("Rejected: {error}"),
        };
        let available = generator.is_some();
        self.dispatcher.set_generator(generator);
        let llm = &snapshot.config.llm;
        format!(
            "Generator updated: model={} base_url={} api_key={}{}",
            llm.model,
            llm.base_url,
            mask_secret(llm.api_key()),
            if available { "" } else { " (replies disabled until a key is set)" }
        )
    }

    async fn ai_status(&self) -> String {
        let policy = self.dispatcher.state().policy();
        let summary = PolicySummary::from(policy.as_ref());
        let llm = self.config.snapshot().await.config.llm;
        let persona: String = policy.persona.chars().take(100).collect();
        format!(
            "AI replies: {}\nchats: {}\nprobability: {}%\ncooldown: {}s\nmin length: {}\n\
             context: {}\ntyping: {}\nemoji: {}\naddressed bypass: {}\n\
             model: {}\nbase_url: {}\napi_key: {}\npersona: {persona}",
            on_off(summary.enabled),
            summary.chats,
            summary.probability,
            summary.cooldown_secs,
            summary.min_length,
            summary.context_window,
            on_off(summary.typing_simulation),
            on_off(summary.decoration),
            on_off(summary.addressed_bypasses_gates),
            llm.model,
            llm.base_url,
            mask_secret(llm.api_key()),
        )
    }

    async fn ai_test(&self, trigger: &str) -> String {
        let trigger = trigger.trim();
        if trigger.is_empty() {
            return "Usage: /ai test <message>".to_string();
        }
        let Some(generator) = self.dispatcher.generator() else {
            return "No generator configured. Set one with /ai apikey <key>.".to_string();
        };
        let policy = self.dispatcher.state().policy();
        let mut rng = StdRng::from_entropy();
        match synthesis::scratch_test(
            &**generator,
            &policy.persona,
            trigger,
            policy.decoration,
            &mut rng,
        )
        .await
        {
            Ok(Some(reply)) => format!("Test reply:\n{reply}"),
            Ok(None) => "The generator chose to skip this one.".to_string(),
            Err(error) => format!("Generation failed: {error}"),
        }
    }

    /// A chat given as an id, or resolved through the transport.
    async fn chat_arg(&self, raw: &str) -> Result<ChatId, String> {
        let spec = raw.trim();
        if spec.is_empty() {
            return Err("Usage: /ai add|remove <chat id | @username>".to_string());
        }
        if let Ok(id) = spec.parse::<ChatId>() {
            return Ok(id);
        }
        self.dispatcher
            .transport()
            .resolve_peer(spec)
            .await
            .map(|peer| peer.id)
            .map_err(|error| format!("Cannot resolve {spec}: {error}"))
    }
}

/// `/cmd@botname rest` → ("/cmd", "rest")
fn split_command(text: &str) -> (String, &str) {
    let trimmed = text.trim();
    let (head, rest) = split_first(trimmed).unwrap_or((trimmed, ""));
    let command = head.split('@').next().unwrap_or(head).to_ascii_lowercase();
    (command, rest)
}

fn split_first(text: &str) -> Option<(&str, &str)> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    match text.split_once(char::is_whitespace) {
        Some((head, rest)) => Some((head, rest.trim())),
        None => Some((text, "")),
    }
}

fn parse_arg<T: std::str::FromStr>(raw: &str, usage: &str) -> Result<T, String> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| format!("Usage: {usage}"))
}

fn parse_switch(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "1" | "yes" => Some(true),
        "off" | "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn on_off(on: bool) -> &'static str {
    if on { "on" } else { "off" }
}

fn mask_secret(secret: Option<&str>) -> String {
    match secret {
        None => "not set".to_string(),
        Some(s) if s.chars().count() <= 8 => "****".to_string(),
        Some(s) => {
            let head: String = s.chars().take(4).collect();
            let tail: String = s.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
            format!("{head}…{tail}")
        }
    }
}

fn chat_id_report(event: &InboundEvent) -> String {
    let origin = event
        .reply_to
        .as_ref()
        .and_then(|reply| reply.forward_origin.as_ref());
    match origin {
        Some(ForwardOrigin::Channel {
            chat_id,
            message_id,
        }) => format!("Forwarded from channel {chat_id} (message {message_id})."),
        Some(ForwardOrigin::Chat { chat_id }) => format!("Forwarded from chat {chat_id}."),
        Some(ForwardOrigin::User { sender_id }) => format!("Forwarded from user {sender_id}."),
        Some(ForwardOrigin::HiddenUser { sender_name }) => {
            format!("Forwarded from {sender_name}, who hides their account id.")
        }
        None => format!("This chat id: {}", event.chat_id()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::synthesis::fakes::ScriptedGenerator;
    use crate::testing::{RecordingTransport, private_text, self_identity};
    use rb_channels::{ChatTransport, MessageId, ReplyRef, UserId};
    use std::path::PathBuf;
    use uuid::Uuid;

    const OPERATOR: i64 = 4242;

    struct Harness {
        transport: Arc<RecordingTransport>,
        dispatcher: Arc<Dispatcher>,
        commands: CommandHandler,
        path: PathBuf,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    fn harness() -> Harness {
        let transport = RecordingTransport::new()
            .with_peer("@target_channel", 900)
            .with_peer("@other_channel", 901)
            .with_peer("@somegroup", -100333);
        let path = std::env::temp_dir().join(format!("relaybot-cmd-{}.toml", Uuid::new_v4()));
        let config = ConfigControl::new(path.clone(), RelayConfig::default()).expect("control");
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&transport) as Arc<dyn ChatTransport>,
            self_identity(),
            Some(UserId::new(OPERATOR)),
            ReplyPolicy::default(),
            StdRng::seed_from_u64(1),
        ));
        let commands = CommandHandler::new(Arc::clone(&dispatcher), config);
        Harness {
            transport,
            dispatcher,
            commands,
            path,
        }
    }

    impl Harness {
        async fn run(&self, text: &str) -> String {
            self.commands
                .execute(&private_text(OPERATOR, 1, text))
                .await
        }
    }

    #[test]
    fn command_parsing_strips_bot_suffix() {
        assert_eq!(split_command("/status@relaybot"), ("/status".to_string(), ""));
        assert_eq!(
            split_command("  /send @bob hello there "),
            ("/send".to_string(), "@bob hello there")
        );
        assert_eq!(split_first("prob   40"), Some(("prob", "40")));
        assert_eq!(split_first("  "), None);
    }

    #[test]
    fn secrets_are_masked() {
        assert_eq!(mask_secret(None), "not set");
        assert_eq!(mask_secret(Some("short")), "****");
        assert_eq!(mask_secret(Some("sk-1234567890abcd")), "sk-1…abcd");
    }

    #[tokio::test]
    async fn pause_and_resume_report_state() {
        let h = harness();
        assert!(h.run("/pause").await.starts_with("Paused"));
        assert_eq!(h.run("/pause").await, "Already paused.");
        assert!(h.dispatcher.state().is_paused());
        assert!(h.run("/status").await.contains("state=paused"));
        assert_eq!(h.run("/resume").await, "Resumed.");
        assert_eq!(h.run("/resume").await, "Already running.");
    }

    #[tokio::test]
    async fn add_listen_persists_and_rebuilds() {
        let h = harness();
        let reply = h.run("/add_listen -100111 @target_channel").await;
        assert!(reply.starts_with("Added route"), "{reply}");
        assert_eq!(
            h.dispatcher.routes().lookup(ChatId::new(-100111)).map(|p| p.id),
            Some(ChatId::new(900))
        );

        let reply = h.run("/add_listen -100111 @other_channel").await;
        assert!(reply.starts_with("Replaced route"), "{reply}");
        assert_eq!(
            h.dispatcher.routes().lookup(ChatId::new(-100111)).map(|p| p.id),
            Some(ChatId::new(901))
        );

        let on_disk = RelayConfig::load_file(&h.path).await.expect("config on disk");
        assert_eq!(on_disk.routes, vec![RouteMapping::new("-100111", "@other_channel")]);

        let list = h.run("/list_listen").await;
        assert!(list.contains("-100111 -> @other_channel"));

        assert!(h.run("/remove_listen -100111").await.starts_with("Removed"));
        assert!(h.dispatcher.routes().is_empty());
        assert_eq!(h.run("/remove_listen -100111").await, "No route from -100111.");
    }

    #[tokio::test]
    async fn add_listen_validates_target() {
        let h = harness();
        assert!(h.run("/add_listen -1 target_channel").await.contains("must be an @username"));
        let numeric = h.run("/add_listen -1 -1009876").await;
        assert!(numeric.starts_with("Cannot resolve target -1009876"), "{numeric}");
        let unresolved = h.run("/add_listen -1 @nobody").await;
        assert!(unresolved.starts_with("Cannot resolve target"));
        assert!(unresolved.contains("other bots cannot receive forwards"));
        assert!(h.run("/add_listen @ghost @target_channel").await.starts_with("Cannot resolve source"));
        assert!(h.run("/add_listen -1").await.starts_with("Usage"));
        assert!(!h.path.exists());
    }

    #[tokio::test]
    async fn ai_policy_commands_update_dispatcher_and_file() {
        let h = harness();
        assert_eq!(h.run("/ai on").await, "AI replies on.");
        assert!(h.run("/ai add -100222").await.contains("enabled"));
        assert!(h.run("/ai add @somegroup").await.contains("-100333"));
        assert_eq!(h.run("/ai prob 75").await, "Reply probability set to 75%.");
        assert_eq!(h.run("/ai typing off").await, "Typing simulation off.");
        assert_eq!(h.run("/ai bypass off").await, "Addressed bypass off.");

        let policy = h.dispatcher.state().policy();
        assert!(policy.enabled);
        assert!(policy.is_chat_enabled(ChatId::new(-100222)));
        assert!(policy.is_chat_enabled(ChatId::new(-100333)));
        assert_eq!(policy.probability, 75);
        assert!(!policy.typing_simulation);
        assert!(!policy.addressed_bypasses_gates);

        let on_disk = RelayConfig::load_file(&h.path).await.expect("config on disk");
        assert_eq!(on_disk.reply, *policy);

        assert!(h.run("/ai remove -100222").await.contains("removed"));
        assert!(h.run("/ai remove -100222").await.contains("not in the AI list"));
        assert!(h.run("/ai list").await.contains("-100333"));
    }

    #[tokio::test]
    async fn invalid_policy_values_are_rejected_and_prior_policy_kept() {
        let h = harness();
        h.run("/ai prob 40").await;
        let reply = h.run("/ai prob 101").await;
        assert!(reply.starts_with("Rejected"), "{reply}");
        assert_eq!(h.dispatcher.state().policy().probability, 40);

        assert!(h.run("/ai context 0").await.starts_with("Rejected"));
        assert_eq!(h.dispatcher.state().policy().context_window, 20);

        assert_eq!(h.run("/ai prob lots").await, "Usage: /ai prob <0-100>");
        assert_eq!(h.run("/ai emoji maybe").await, "Usage: /ai emoji on|off");
    }

    #[tokio::test]
    async fn generator_settings_rebuild_the_generator() {
        let h = harness();
        assert!(h.dispatcher.generator().is_none());
        assert!(h.run("/ai test hello").await.starts_with("No generator"));

        let reply = h.run("/ai apikey sk-test-000000000").await;
        assert!(reply.contains("model=deepseek-chat"), "{reply}");
        assert!(!reply.contains("sk-test-000000000"));
        assert!(h.dispatcher.generator().is_some());

        h.run("/ai model gpt-4o-mini").await;
        let described = h.dispatcher.generator().expect("generator").describe();
        assert!(described.starts_with("gpt-4o-mini"));

        assert!(h.run("/ai baseurl   ").await.starts_with("Usage"));
    }

    #[tokio::test]
    async fn ai_test_uses_scratch_context() {
        let h = harness();
        h.run("/ai emoji off").await;
        h.dispatcher
            .set_generator(Some(Box::new(ScriptedGenerator::always("lol same"))));
        let reply = h.run("/ai test so tired today").await;
        assert_eq!(reply, "Test reply:\nlol same");
        assert_eq!(h.dispatcher.contexts().chat_count(), 0);
    }

    #[tokio::test]
    async fn chatid_reports_forward_origin_of_replied_message() {
        let h = harness();
        assert_eq!(h.run("/chatid").await, format!("This chat id: {OPERATOR}"));

        let mut event = private_text(OPERATOR, 2, "/chatid");
        event.reply_to = Some(ReplyRef {
            message_id: MessageId::new(1),
            sender_id: Some(UserId::new(OPERATOR)),
            forward_origin: Some(ForwardOrigin::Channel {
                chat_id: ChatId::new(-100999),
                message_id: MessageId::new(12),
            }),
        });
        let reply = h.commands.execute(&event).await;
        assert!(reply.contains("-100999"));
    }

    #[tokio::test]
    async fn send_leave_and_handle_use_the_transport() {
        let h = harness();
        assert_eq!(h.run("/send @target_channel ping there").await, "Sent to @target_channel.");
        assert!(h.run("/leave @somegroup").await.starts_with("Left"));
        assert_eq!(h.transport.left(), vec![ChatId::new(-100333)]);
        assert!(h.run("/send @target_channel").await.starts_with("Usage"));

        h.commands.handle(&private_text(OPERATOR, 9, "/myid")).await;
        let sent = h.transport.sent();
        let last = sent.last().expect("command reply");
        assert_eq!(last.text, format!("Your user id: {OPERATOR}"));
        assert_eq!(last.reply_to, Some(MessageId::new(9)));
        assert_eq!(sent[0].chat, ChatId::new(900));
        assert_eq!(sent[0].text, "ping there");
    }

    #[tokio::test]
    async fn unknown_commands_point_to_help() {
        let h = harness();
        assert!(h.run("/frobnicate").await.contains("/help"));
        assert!(h.run("/ai frobnicate").await.contains("/help"));
        assert!(h.run("/help").await.contains("/add_listen"));
    }
}
