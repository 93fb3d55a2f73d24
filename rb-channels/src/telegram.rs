use crate::error::{Result, TransportError};
use crate::traits::ChatTransport;
use crate::types::{
    ChatId, ChatKind, ChatRef, ForwardOrigin, GroupId, InboundEvent, MessageId, MessageRef, Peer,
    ReplyRef, SelfIdentity, Sender, UserId,
};
use chrono::Utc;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::sync::mpsc;

const TELEGRAM_TRANSPORT_ID: &str = "telegram";
const TELEGRAM_LONG_POLL_TIMEOUT_SECS: &str = "30";
const TELEGRAM_ALLOWED_UPDATES: &str = r#"["message","channel_post"]"#;
const TELEGRAM_NON_TRANSIENT_DELAY: Duration = Duration::from_secs(10);
const TELEGRAM_RETRY_BASE_MS: u64 = 250;
const TELEGRAM_RETRY_MAX_MS: u64 = 30_000;
const TELEGRAM_FORWARD_BATCH_MAX: usize = 100;
const TELEGRAM_LINK_PREFIXES: &[&str] = &["https://t.me/", "http://t.me/", "t.me/"];

#[derive(Clone)]
pub struct TelegramTransport {
    http: reqwest::Client,
    bot_token: String,
}

impl TelegramTransport {
    pub fn new(bot_token: &str) -> Result<Self> {
        if bot_token.trim().is_empty() {
            return Err(TransportError::Unsupported(
                "telegram bot token is empty".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            bot_token: bot_token.trim().to_string(),
        })
    }

    fn api_url(&self, method: &str) -> Result<Url> {
        Url::parse(&format!(
            "https://api.telegram.org/bot{}/{}",
            self.bot_token, method
        ))
        .map_err(|e| TransportError::Http(format!("invalid telegram url: {e}")))
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: serde_json::Value) -> Result<T> {
        let url = self.api_url(method)?;
        let response = self.http.post(url).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;
        decode_api_response(method, status, &text)
    }
}

#[async_trait::async_trait]
impl ChatTransport for TelegramTransport {
    fn transport_id(&self) -> &str {
        TELEGRAM_TRANSPORT_ID
    }

    async fn start(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        let transport = self.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.run_poll_loop(tx).await {
                tracing::error!(%e, "telegram poll loop exited");
            }
        });
        Ok(())
    }

    async fn me(&self) -> Result<SelfIdentity> {
        let user: TelegramUser = self.call("getMe", serde_json::json!({})).await?;
        Ok(SelfIdentity {
            id: UserId::new(user.id),
            username: user.username,
            first_name: user.first_name,
        })
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn resolve_peer(&self, spec: &str) -> Result<Peer> {
        let chat_id = normalize_peer_spec(spec)
            .ok_or_else(|| TransportError::NotFound(format!("empty peer spec {spec:?}")))?;
        let chat: TelegramChat = self
            .call("getChat", serde_json::json!({ "chat_id": chat_id }))
            .await?;
        Ok(chat.into_peer())
    }

    async fn send_text(
        &self,
        chat: ChatId,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageRef> {
        let mut body = serde_json::json!({
            "chat_id": chat.get(),
            "text": text,
        });
        if let Some(reply_to) = reply_to {
            body["reply_parameters"] = serde_json::json!({
                "message_id": reply_to.get(),
                "allow_sending_without_reply": true,
            });
        }
        let sent: TelegramMessage = self.call("sendMessage", body).await?;
        Ok(MessageRef {
            chat_id: sent.chat.map(|c| ChatId::new(c.id)).unwrap_or(chat),
            message_id: MessageId::new(sent.message_id.unwrap_or_default()),
        })
    }

    async fn forward(&self, to: &Peer, from: ChatId, message_ids: &[MessageId]) -> Result<()> {
        match message_ids {
            [] => Ok(()),
            [single] => {
                let _: TelegramMessage = self
                    .call(
                        "forwardMessage",
                        serde_json::json!({
                            "chat_id": to.id.get(),
                            "from_chat_id": from.get(),
                            "message_id": single.get(),
                        }),
                    )
                    .await?;
                Ok(())
            }
            many => {
                for chunk in many.chunks(TELEGRAM_FORWARD_BATCH_MAX) {
                    let ids: Vec<i64> = chunk.iter().map(|id| id.get()).collect();
                    let _: serde_json::Value = self
                        .call(
                            "forwardMessages",
                            serde_json::json!({
                                "chat_id": to.id.get(),
                                "from_chat_id": from.get(),
                                "message_ids": ids,
                            }),
                        )
                        .await?;
                }
                Ok(())
            }
        }
    }

    async fn send_typing(&self, chat: ChatId) -> Result<()> {
        let _: bool = self
            .call(
                "sendChatAction",
                serde_json::json!({ "chat_id": chat.get(), "action": "typing" }),
            )
            .await?;
        Ok(())
    }

    async fn leave_chat(&self, chat: &Peer) -> Result<()> {
        let _: bool = self
            .call("leaveChat", serde_json::json!({ "chat_id": chat.id.get() }))
            .await?;
        Ok(())
    }
}

impl TelegramTransport {
    #[tracing::instrument(level = "info", skip_all)]
    async fn run_poll_loop(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        let mut offset: i64 = 0;
        let mut consecutive_failures: u32 = 0;

        loop {
            let url = self.api_url("getUpdates")?;
            let offset_param = offset.to_string();
            let response = match self
                .http
                .get(url)
                .query(&[
                    ("timeout", TELEGRAM_LONG_POLL_TIMEOUT_SECS),
                    ("offset", offset_param.as_str()),
                    ("allowed_updates", TELEGRAM_ALLOWED_UPDATES),
                ])
                .send()
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates request failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_else(|error| {
                    format!("<failed to read telegram error body: {error}>")
                });
                if is_transient_status(status) {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %status,
                        %body,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates transient failure; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    consecutive_failures = 0;
                    tracing::error!(
                        %status,
                        %body,
                        delay = ?TELEGRAM_NON_TRANSIENT_DELAY,
                        "telegram getUpdates non-transient failure; keeping poll loop alive"
                    );
                    tokio::time::sleep(TELEGRAM_NON_TRANSIENT_DELAY).await;
                }
                continue;
            }

            let parsed = match response
                .json::<TelegramApiResponse<Vec<TelegramUpdate>>>()
                .await
            {
                Ok(parsed) => parsed,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates payload parse failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            consecutive_failures = 0;

            let mut updates = parsed.result.unwrap_or_default();
            updates.sort_by_key(|update| update.update_id);
            for update in updates {
                // Advance offset before conversion to avoid poison-update replay loops.
                if update.update_id < offset {
                    continue;
                }
                offset = update.update_id.saturating_add(1);

                let Some(event) = update.content().and_then(build_inbound_event) else {
                    continue;
                };
                tx.send(event).await.map_err(|_| TransportError::Closed)?;
            }
        }
    }
}

fn transient_retry_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis((TELEGRAM_RETRY_BASE_MS * multiplier).min(TELEGRAM_RETRY_MAX_MS))
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

/// Turn an operator-supplied peer spec into a `chat_id` argument for `getChat`.
fn normalize_peer_spec(spec: &str) -> Option<serde_json::Value> {
    let trimmed = spec.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(id) = trimmed.parse::<i64>() {
        return Some(serde_json::Value::from(id));
    }
    let mut name = trimmed;
    for prefix in TELEGRAM_LINK_PREFIXES {
        if let Some(rest) = name.strip_prefix(prefix) {
            name = rest;
            break;
        }
    }
    let name = name.trim_start_matches('@').trim_end_matches('/');
    if name.is_empty() {
        return None;
    }
    Some(serde_json::Value::from(format!("@{name}")))
}

fn decode_api_response<T: DeserializeOwned>(
    method: &str,
    status: StatusCode,
    body: &str,
) -> Result<T> {
    let parsed: TelegramApiResponse<T> = serde_json::from_str(body).map_err(|e| {
        TransportError::Http(format!(
            "telegram {method} status={status} undecodable body: {e}"
        ))
    })?;
    if parsed.ok {
        return parsed.result.ok_or_else(|| {
            TransportError::Http(format!("telegram {method} returned ok without result"))
        });
    }

    let code = parsed.error_code.unwrap_or(i64::from(status.as_u16()));
    let description = parsed
        .description
        .unwrap_or_else(|| "no description".to_string());
    if is_not_found_description(code, &description) {
        return Err(TransportError::NotFound(description));
    }
    Err(TransportError::Api {
        method: method.to_string(),
        code,
        description,
    })
}

fn is_not_found_description(code: i64, description: &str) -> bool {
    let lower = description.to_ascii_lowercase();
    (code == 400 || code == 404)
        && (lower.contains("not found")
            || lower.contains("username_invalid")
            || lower.contains("username_not_occupied"))
}

fn build_inbound_event(message: &TelegramMessage) -> Option<InboundEvent> {
    let chat = message.chat.as_ref()?;
    let message_id = message.message_id?;

    Some(InboundEvent {
        message_id: MessageId::new(message_id),
        chat: ChatRef {
            id: ChatId::new(chat.id),
            kind: chat.kind,
        },
        sender: message.from.as_ref().map(TelegramUser::to_sender),
        text: extract_message_text(message),
        media_group_id: message
            .media_group_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(GroupId::from),
        reply_to: message.reply_to_message.as_deref().and_then(build_reply_ref),
        forward_origin: message
            .forward_origin
            .as_ref()
            .and_then(TelegramMessageOrigin::to_forward_origin),
        received_at: Utc::now(),
    })
}

fn build_reply_ref(replied: &TelegramMessage) -> Option<ReplyRef> {
    Some(ReplyRef {
        message_id: MessageId::new(replied.message_id?),
        sender_id: replied.from.as_ref().map(|user| UserId::new(user.id)),
        forward_origin: replied
            .forward_origin
            .as_ref()
            .and_then(TelegramMessageOrigin::to_forward_origin),
    })
}

fn extract_message_text(message: &TelegramMessage) -> String {
    if let Some(text) = message.text.as_deref().map(str::trim) {
        if !text.is_empty() {
            return text.to_string();
        }
    }
    message
        .caption
        .as_deref()
        .map(str::trim)
        .unwrap_or_default()
        .to_string()
}

#[derive(Debug, Deserialize)]
struct TelegramApiResponse<T> {
    #[serde(default)]
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
    /// Channels deliver posts here instead of `message`.
    #[serde(default)]
    channel_post: Option<TelegramMessage>,
}

impl TelegramUpdate {
    fn content(&self) -> Option<&TelegramMessage> {
        self.message.as_ref().or(self.channel_post.as_ref())
    }
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    #[serde(default)]
    message_id: Option<i64>,
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    chat: Option<TelegramChat>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    media_group_id: Option<String>,
    #[serde(default)]
    reply_to_message: Option<Box<TelegramMessage>>,
    #[serde(default)]
    forward_origin: Option<TelegramMessageOrigin>,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

impl TelegramUser {
    fn to_sender(&self) -> Sender {
        Sender {
            id: UserId::new(self.id),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            username: self.username.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
    #[serde(rename = "type")]
    kind: ChatKind,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
}

impl TelegramChat {
    fn into_peer(self) -> Peer {
        Peer {
            id: ChatId::new(self.id),
            kind: self.kind,
            username: self.username,
            title: self.title.or(self.first_name),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TelegramMessageOrigin {
    User {
        sender_user: TelegramUser,
    },
    HiddenUser {
        sender_user_name: String,
    },
    Chat {
        sender_chat: TelegramChat,
    },
    Channel {
        chat: TelegramChat,
        message_id: i64,
    },
    #[serde(other)]
    Unknown,
}

impl TelegramMessageOrigin {
    fn to_forward_origin(&self) -> Option<ForwardOrigin> {
        match self {
            Self::User { sender_user } => Some(ForwardOrigin::User {
                sender_id: UserId::new(sender_user.id),
            }),
            Self::HiddenUser { sender_user_name } => Some(ForwardOrigin::HiddenUser {
                sender_name: sender_user_name.clone(),
            }),
            Self::Chat { sender_chat } => Some(ForwardOrigin::Chat {
                chat_id: ChatId::new(sender_chat.id),
            }),
            Self::Channel { chat, message_id } => Some(ForwardOrigin::Channel {
                chat_id: ChatId::new(chat.id),
                message_id: MessageId::new(*message_id),
            }),
            Self::Unknown => None,
        }
    }
}
