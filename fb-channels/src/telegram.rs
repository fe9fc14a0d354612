use crate::error::{ChannelError, Result};
use crate::traits::RemoteChannel;
use crate::types::{
    BotIdentity, ChatId, MessageId, OutboundText, RemoteUpdate, SentMessage, UpdateBatch,
};
use crate::validation::validate_bot_token;
use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

const TELEGRAM_CHANNEL_ID: &str = "telegram";
const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const TELEGRAM_ALLOWED_UPDATES: &str = r#"["message"]"#;
const TELEGRAM_NON_TEXT_PLACEHOLDER: &str = "[telegram non-text message]";
const TELEGRAM_DEFAULT_RETRY_AFTER_SECS: u64 = 1;
/// Added on top of the long-poll timeout so the HTTP client never cuts a poll short.
const TELEGRAM_HTTP_TIMEOUT_SLACK: Duration = Duration::from_secs(15);
const MARKDOWN_V2_SPECIAL: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
];

#[derive(Clone)]
pub struct TelegramChannel {
    http: reqwest::Client,
    bot_token: String,
    api_base: String,
}

impl TelegramChannel {
    pub fn new(bot_token: &str) -> Result<Self> {
        let bot_token = bot_token.trim();
        if !validate_bot_token(bot_token) {
            return Err(ChannelError::InvalidInput(
                "telegram bot token must look like <bot_id>:<secret>".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            bot_token: bot_token.to_string(),
            api_base: TELEGRAM_API_BASE.to_string(),
        })
    }

    /// Point the client at a different Bot API server (self-hosted or a test double).
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> Result<Url> {
        Url::parse(&format!("{}/bot{}/{}", self.api_base, self.bot_token, method))
            .map_err(|e| ChannelError::InvalidInput(format!("telegram api url for {method}: {e}")))
    }

    /// Register `url` as the push endpoint. Telegram stops serving `getUpdates`
    /// while a webhook is set.
    pub async fn set_webhook(&self, url: &str, secret_token: Option<&str>) -> Result<()> {
        let mut body = serde_json::json!({
            "url": url,
            "allowed_updates": ["message"],
        });
        if let Some(secret) = secret_token.filter(|s| !s.is_empty()) {
            body["secret_token"] = serde_json::Value::String(secret.to_string());
        }
        let response = self
            .http
            .post(self.api_url("setWebhook")?)
            .json(&body)
            .send()
            .await?;
        let _: bool = decode_response("setWebhook", response).await?;
        tracing::info!("telegram webhook registered");
        Ok(())
    }

    pub async fn delete_webhook(&self) -> Result<()> {
        let response = self
            .http
            .post(self.api_url("deleteWebhook")?)
            .json(&serde_json::json!({ "drop_pending_updates": false }))
            .send()
            .await?;
        let _: bool = decode_response("deleteWebhook", response).await?;
        tracing::info!("telegram webhook removed");
        Ok(())
    }
}

#[async_trait::async_trait]
impl RemoteChannel for TelegramChannel {
    fn channel_id(&self) -> &str {
        TELEGRAM_CHANNEL_ID
    }

    async fn send_text(&self, chat_id: &ChatId, message: OutboundText) -> Result<SentMessage> {
        if message.text.trim().is_empty() {
            return Err(ChannelError::InvalidInput(
                "message text is empty".to_string(),
            ));
        }
        let mut body = serde_json::json!({
            "chat_id": chat_id.as_str(),
            "text": message.text,
            "disable_web_page_preview": true,
        });
        if let Some(reply_to) = message.reply_to_message_id.as_ref() {
            body["reply_to_message_id"] = serde_json::Value::String(reply_to.to_string());
        }
        if let Some(parse_mode) = message.parse_mode {
            body["parse_mode"] = serde_json::Value::String(parse_mode.as_str().to_string());
        }

        let response = self
            .http
            .post(self.api_url("sendMessage")?)
            .json(&body)
            .send()
            .await?;
        let sent: TelegramMessage = decode_response("sendMessage", response).await?;
        let message_id = sent.message_id.ok_or_else(|| {
            ChannelError::ResponseFormat("sendMessage result missing message_id".to_string())
        })?;
        tracing::debug!(%chat_id, message_id, "telegram message sent");
        Ok(SentMessage {
            message_id: message_id.into(),
            chat_id: chat_id.clone(),
            sent_at: message_timestamp(&sent),
        })
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn poll_updates(&self, cursor: i64, timeout: Duration) -> Result<UpdateBatch> {
        let mut query = vec![
            ("timeout", timeout.as_secs().to_string()),
            ("allowed_updates", TELEGRAM_ALLOWED_UPDATES.to_string()),
        ];
        if cursor > 0 {
            query.push(("offset", cursor.to_string()));
        }
        let response = self
            .http
            .get(self.api_url("getUpdates")?)
            .timeout(timeout + TELEGRAM_HTTP_TIMEOUT_SLACK)
            .query(&query)
            .send()
            .await?;
        let updates: Vec<TelegramUpdate> = decode_response("getUpdates", response).await?;
        Ok(build_update_batch(cursor, updates))
    }

    async fn identity(&self) -> Result<BotIdentity> {
        let response = self.http.get(self.api_url("getMe")?).send().await?;
        let me: TelegramUser = decode_response("getMe", response).await?;
        Ok(BotIdentity {
            id: me.id,
            username: me.username,
        })
    }
}

/// Parse one webhook push body. `Ok(None)` means a well-formed update the bridge
/// has no use for (e.g. an edited message or a service message without text).
pub fn parse_webhook_update(body: &[u8]) -> Result<Option<RemoteUpdate>> {
    let update: TelegramUpdate = serde_json::from_slice(body)?;
    Ok(build_remote_update(&update))
}

/// Escape text for `parse_mode = MarkdownV2`.
pub fn escape_markdown_v2(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if MARKDOWN_V2_SPECIAL.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

async fn decode_response<T: DeserializeOwned>(
    method: &str,
    response: reqwest::Response,
) -> Result<T> {
    let status = response.status();
    let body = response.text().await?;
    let envelope = match serde_json::from_str::<TelegramEnvelope<T>>(&body) {
        Ok(envelope) => envelope,
        Err(error) if status.is_success() => {
            return Err(ChannelError::ResponseFormat(format!(
                "telegram {method} payload parse failed: {error}"
            )));
        }
        Err(_) => return Err(classify_failure(method, status, Some(body), None)),
    };

    if status.is_success() && envelope.ok {
        return envelope.result.ok_or_else(|| {
            ChannelError::ResponseFormat(format!("telegram {method} response missing result"))
        });
    }
    Err(classify_failure(
        method,
        status,
        envelope.description,
        envelope.parameters.and_then(|p| p.retry_after),
    ))
}

fn classify_failure(
    method: &str,
    status: StatusCode,
    description: Option<String>,
    retry_after_secs: Option<u64>,
) -> ChannelError {
    let description = description.unwrap_or_else(|| "no description".to_string());
    if status == StatusCode::TOO_MANY_REQUESTS || retry_after_secs.is_some() {
        let secs = retry_after_secs.unwrap_or(TELEGRAM_DEFAULT_RETRY_AFTER_SECS);
        return ChannelError::RateLimited {
            retry_after: Duration::from_secs(secs),
        };
    }
    if is_transient_status(status) {
        return ChannelError::Transport(format!(
            "telegram {method} failed: status={status} description={description}"
        ));
    }
    ChannelError::Rejected(format!(
        "telegram {method} failed: status={status} description={description}"
    ))
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn build_update_batch(cursor: i64, mut updates: Vec<TelegramUpdate>) -> UpdateBatch {
    updates.sort_by_key(|update| update.update_id);
    let mut next_cursor = cursor;
    let mut out = Vec::with_capacity(updates.len());
    for update in updates {
        // Advance past every update, even the ones we skip, so a poison update
        // is never fetched twice.
        if update.update_id < cursor {
            continue;
        }
        next_cursor = next_cursor.max(update.update_id.saturating_add(1));
        if let Some(remote) = build_remote_update(&update) {
            out.push(remote);
        }
    }
    UpdateBatch {
        updates: out,
        next_cursor,
    }
}

fn build_remote_update(update: &TelegramUpdate) -> Option<RemoteUpdate> {
    let message = update.message.as_ref()?;
    let chat = message.chat.as_ref()?;
    let text = extract_message_content(message)?;
    let sender_id = message
        .from
        .as_ref()
        .map(|user| user.id.to_string())
        .unwrap_or_else(|| format!("chat:{}", chat.id));
    let message_id = message
        .message_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| format!("update:{}:message", update.update_id));

    Some(RemoteUpdate {
        update_id: update.update_id,
        message_id: MessageId::new(message_id),
        chat_id: chat.id.into(),
        sender_id: sender_id.into(),
        reply_to_message_id: message
            .reply_to_message
            .as_ref()
            .and_then(|reply| reply.message_id)
            .map(MessageId::from),
        text,
        timestamp: message_timestamp(message),
    })
}

fn message_timestamp(message: &TelegramMessage) -> DateTime<Utc> {
    message
        .date
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now)
}

fn extract_message_content(message: &TelegramMessage) -> Option<String> {
    if let Some(text) = message.text.as_deref().map(str::trim) {
        if !text.is_empty() {
            return Some(text.to_string());
        }
    }
    if let Some(caption) = message.caption.as_deref().map(str::trim) {
        if !caption.is_empty() {
            return Some(caption.to_string());
        }
    }
    if message.has_non_text_payload() {
        return Some(TELEGRAM_NON_TEXT_PLACEHOLDER.to_string());
    }
    None
}

#[derive(Debug, Deserialize)]
struct TelegramEnvelope<T> {
    #[serde(default)]
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<TelegramResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct TelegramResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    #[serde(default)]
    message_id: Option<i64>,
    #[serde(default)]
    date: Option<i64>,
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    chat: Option<TelegramChat>,
    #[serde(default)]
    reply_to_message: Option<Box<TelegramMessage>>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    photo: Vec<serde_json::Value>,
    #[serde(default)]
    sticker: Option<serde_json::Value>,
    #[serde(default)]
    document: Option<serde_json::Value>,
    #[serde(default)]
    voice: Option<serde_json::Value>,
    #[serde(default)]
    video: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
}

impl TelegramMessage {
    fn has_non_text_payload(&self) -> bool {
        !self.photo.is_empty()
            || self.sticker.is_some()
            || self.document.is_some()
            || self.voice.is_some()
            || self.video.is_some()
    }
}
