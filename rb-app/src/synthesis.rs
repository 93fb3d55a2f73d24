//! Reply synthesis: prompt construction, generation and post-processing.

use crate::config::LlmConfig;
use crate::context::ContextEntry;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Local};
use rand::Rng;
use rand::seq::SliceRandom;
use rb_llm::{ChatMessage, CompletionOptions, LlmClient};
use std::time::Duration;

pub const SKIP_SENTINEL: &str = "[SKIP]";
pub const REPLY_MAX_TOKENS: u32 = 100;
pub const REPLY_TEMPERATURE: f32 = 0.9;
/// Context lines shown to the generator, further capped by the policy window.
pub const PROMPT_CONTEXT_LINES: usize = 15;

const DECORATION_PROBABILITY: f64 = 0.4;
const TYPING_DELAY_CAP: Duration = Duration::from_secs(5);

pub const DECORATION_EMOJI: &[&str] = &[
    "😂", "🤣", "😊", "😄", "👍", "🔥", "💪", "😎", "🤔", "😏", "🙃", "😜", "🤭", "😁", "👀",
    "💯", "✨", "🎉", "😋", "🥰", "😤", "🤷", "😅", "🙈", "💀", "😭", "🤡", "👏", "🤝", "😌",
];

const REPLY_RULES: &str = "\
Reply to that message the way a real person in the group would. Rules:
1. Keep it natural and colloquial, like real chat.
2. Keep it short: usually one or two sentences, at most about 50 characters.
3. Internet slang is fine.
4. You don't have to answer directly; drifting to a related topic is fine.
5. Light teasing is fine now and then, but don't overdo it.
6. Never reveal that you are an AI.
7. If the topic is dull or not worth answering, reply with exactly [SKIP].

Output only the reply text, with no prefix or explanation.";

/// The generation capability the reply pipeline needs.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> rb_llm::Result<String>;

    fn describe(&self) -> String;
}

#[async_trait]
impl TextGenerator for LlmClient {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> rb_llm::Result<String> {
        let messages = [ChatMessage::system(system), ChatMessage::user(user)];
        let options = CompletionOptions {
            max_tokens,
            temperature,
        };
        let response = LlmClient::complete(self, &messages, &options).await?;
        Ok(response.message.content)
    }

    fn describe(&self) -> String {
        format!("{} via {}", self.model(), self.base_url())
    }
}

/// `Ok(None)` when no API key is configured; replies are then skipped.
pub fn generator_from_config(llm: &LlmConfig) -> rb_llm::Result<Option<Box<dyn TextGenerator>>> {
    let Some(api_key) = llm.api_key() else {
        return Ok(None);
    };
    let client = LlmClient::new(api_key, &llm.model, Some(&llm.base_url))?;
    tracing::info!(
        model = %client.model(),
        base_url = %client.base_url(),
        provider = ?client.provider(),
        "text generator ready"
    );
    Ok(Some(Box::new(client)))
}

pub fn build_system_prompt(
    persona: &str,
    context: &[ContextEntry],
    sender: &str,
    trigger: &str,
) -> String {
    let transcript = context
        .iter()
        .map(ContextEntry::render)
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "{persona}\n\nYou are in a group chat. Here is the recent conversation:\n{transcript}\n\n\
         {sender} just said: \"{trigger}\"\n\n{REPLY_RULES}"
    )
}

/// `None` means the generator declined: empty output or the skip sentinel.
pub fn post_process<R: Rng + ?Sized>(raw: &str, decorate: bool, rng: &mut R) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.contains(SKIP_SENTINEL) {
        return None;
    }
    let text = trimmed.replace(SKIP_SENTINEL, "").trim().to_string();
    if text.is_empty() {
        return None;
    }
    if decorate && rng.gen_bool(DECORATION_PROBABILITY) {
        if let Some(emoji) = DECORATION_EMOJI.choose(rng) {
            return Some(if rng.gen_bool(0.5) {
                format!("{text}{emoji}")
            } else {
                format!("{emoji}{text}")
            });
        }
    }
    Some(text)
}

/// Human-ish typing time for `text`: 0.1–0.2 s per character plus 0.5–2 s,
/// never more than five seconds.
pub fn typing_delay<R: Rng + ?Sized>(text: &str, rng: &mut R) -> Duration {
    let chars = text.chars().count() as f64;
    let seconds = chars * rng.gen_range(0.1..=0.2) + rng.gen_range(0.5..=2.0);
    Duration::from_secs_f64(seconds).min(TYPING_DELAY_CAP)
}

/// Run one synthesis round. `Ok(None)` is a decline; errors come from the generator.
pub async fn generate_reply<R: Rng + Send>(
    generator: &dyn TextGenerator,
    persona: &str,
    context: &[ContextEntry],
    sender: &str,
    trigger: &str,
    decorate: bool,
    rng: &mut R,
) -> rb_llm::Result<Option<String>> {
    let system = build_system_prompt(persona, context, sender, trigger);
    let raw = generator
        .complete(&system, trigger, REPLY_MAX_TOKENS, REPLY_TEMPERATURE)
        .await?;
    Ok(post_process(&raw, decorate, rng))
}

/// Synthesis against a scratch two-line conversation, for `/ai test`.
pub async fn scratch_test<R: Rng + Send>(
    generator: &dyn TextGenerator,
    persona: &str,
    trigger: &str,
    decorate: bool,
    rng: &mut R,
) -> rb_llm::Result<Option<String>> {
    let now = Local::now();
    let context = [
        ContextEntry::new(
            "Alice",
            "what is everyone up to tonight",
            now - ChronoDuration::minutes(2),
        ),
        ContextEntry::new("Bob", "just got off work, totally wiped", now - ChronoDuration::minutes(1)),
    ];
    generate_reply(generator, persona, &context, "tester", trigger, decorate, rng).await
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Returns scripted outputs in order, then the fallback forever.
    pub struct ScriptedGenerator {
        script: Mutex<VecDeque<rb_llm::Result<String>>>,
        fallback: String,
        pub prompts: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedGenerator {
        pub fn always(text: &str) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                fallback: text.to_string(),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn then(self, next: rb_llm::Result<String>) -> Self {
            self.script.lock().expect("script lock").push_back(next);
            self
        }

        pub fn calls(&self) -> usize {
            self.prompts.lock().expect("prompts lock").len()
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn complete(
            &self,
            system: &str,
            user: &str,
            _max_tokens: u32,
            _temperature: f32,
        ) -> rb_llm::Result<String> {
            self.prompts
                .lock()
                .expect("prompts lock")
                .push((system.to_string(), user.to_string()));
            let next = self.script.lock().expect("script lock").pop_front();
            next.unwrap_or_else(|| Ok(self.fallback.clone()))
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::ScriptedGenerator;
    use super::*;
    use chrono::TimeZone;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn at(h: u32, m: u32) -> chrono::DateTime<Local> {
        Local
            .with_ymd_and_hms(2024, 3, 3, h, m, 0)
            .single()
            .expect("valid time")
    }

    #[test]
    fn prompt_contains_persona_transcript_trigger_and_rules() {
        let context = vec![
            ContextEntry::new("Ann", "anyone up?", at(23, 1)),
            ContextEntry::new("me", "always", at(23, 2)),
        ];
        let prompt = build_system_prompt("PERSONA", &context, "Bob", "same lol");
        assert!(prompt.starts_with("PERSONA\n"));
        assert!(prompt.contains("[23:01] Ann: anyone up?\n[23:02] me: always"));
        assert!(prompt.contains("Bob just said: \"same lol\""));
        assert!(prompt.contains(SKIP_SENTINEL));
        assert!(prompt.ends_with("no prefix or explanation."));
    }

    #[test]
    fn skip_and_empty_outputs_decline() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(post_process("", true, &mut rng), None);
        assert_eq!(post_process("   \n", true, &mut rng), None);
        assert_eq!(post_process("[SKIP]", true, &mut rng), None);
        assert_eq!(post_process("meh [SKIP] whatever", true, &mut rng), None);
    }

    #[test]
    fn undecorated_output_is_trimmed_verbatim() {
        let mut rng = StdRng::seed_from_u64(2);
        for _ in 0..50 {
            assert_eq!(
                post_process("  ha same  ", false, &mut rng).as_deref(),
                Some("ha same")
            );
        }
    }

    #[test]
    fn decoration_adds_one_emoji_at_either_end_sometimes() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut plain = 0;
        let mut prefixed = 0;
        let mut suffixed = 0;
        for _ in 0..2000 {
            let out = post_process("nice", true, &mut rng).expect("reply");
            if out == "nice" {
                plain += 1;
            } else if let Some(emoji) = out.strip_suffix("nice") {
                assert!(DECORATION_EMOJI.contains(&emoji));
                prefixed += 1;
            } else if let Some(emoji) = out.strip_prefix("nice") {
                assert!(DECORATION_EMOJI.contains(&emoji));
                suffixed += 1;
            } else {
                panic!("unexpected decoration {out:?}");
            }
        }
        assert!((1050..=1350).contains(&plain), "plain={plain}");
        assert!(prefixed > 300 && suffixed > 300);
    }

    #[test]
    fn typing_delay_is_bounded() {
        let mut rng = StdRng::seed_from_u64(4);
        for _ in 0..200 {
            let short = typing_delay("hi", &mut rng);
            assert!(short >= Duration::from_millis(700) && short <= Duration::from_millis(2400));
            let long = typing_delay(&"x".repeat(200), &mut rng);
            assert_eq!(long, TYPING_DELAY_CAP);
        }
    }

    #[tokio::test]
    async fn generate_reply_sends_system_and_trigger() {
        let generator = ScriptedGenerator::always("sure thing");
        let mut rng = StdRng::seed_from_u64(5);
        let reply = generate_reply(&generator, "P", &[], "Ann", "you coming?", false, &mut rng)
            .await
            .expect("generation");
        assert_eq!(reply.as_deref(), Some("sure thing"));
        let prompts = generator.prompts.lock().expect("prompts lock").clone();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].0.contains("Ann just said"));
        assert_eq!(prompts[0].1, "you coming?");
    }

    #[tokio::test]
    async fn generation_errors_propagate() {
        let generator = ScriptedGenerator::always("unused")
            .then(Err(rb_llm::LlmError::Http("503 upstream".to_string())));
        let mut rng = StdRng::seed_from_u64(6);
        let result = scratch_test(&generator, "P", "hello", false, &mut rng).await;
        assert!(result.is_err());
        let prompts = generator.prompts.lock().expect("prompts lock").clone();
        assert!(prompts[0].0.contains("Alice: what is everyone up to tonight"));
    }
}
