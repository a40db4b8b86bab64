//! Telegram channel: long-poll getUpdates (or webhook mode) and send via the Bot API.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channels::adapter::{resolve_target, ChannelAdapter};
use crate::channels::inbound::{ContentPart, InboundItem, Meta, NativePayload, SessionKey};
use crate::channels::manager::EnqueueHandle;
use crate::channels::{ChannelError, Result};
use crate::routing;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const LONG_POLL_TIMEOUT: u64 = 30;
const POLL_RETRY_DELAY: Duration = Duration::from_secs(2);
pub const TELEGRAM_CHANNEL_ID: &str = "telegram";

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

/// Telegram update payload (getUpdates result item or webhook POST body).
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub chat: TelegramChat,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    /// Sizes of one photo, smallest first.
    #[serde(default)]
    pub photo: Vec<TelegramFile>,
    #[serde(default)]
    pub document: Option<TelegramFile>,
    #[serde(default)]
    pub voice: Option<TelegramFile>,
    #[serde(default)]
    pub video: Option<TelegramFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramFile {
    pub file_id: String,
    #[serde(default)]
    pub file_name: Option<String>,
}

/// Session key for a chat: `telegram:<chat id>`.
pub fn chat_key(chat_id: &str) -> SessionKey {
    routing::sender_key(TELEGRAM_CHANNEL_ID, chat_id)
}

/// Chat id from a session key or a bare chat id.
fn chat_id(handle: &str) -> &str {
    handle
        .strip_prefix(TELEGRAM_CHANNEL_ID)
        .and_then(|rest| rest.strip_prefix(':'))
        .unwrap_or(handle)
}

impl TelegramMessage {
    /// Convert to a native payload. Text (or caption) first, then media; file ids stand in for
    /// URLs since the Bot API accepts them when sending media back. None when nothing usable.
    pub fn to_payload(&self) -> Option<NativePayload> {
        let chat = self.chat.id.to_string();
        let sender = self
            .from
            .as_ref()
            .map(|u| u.id.to_string())
            .unwrap_or_else(|| chat.clone());
        let mut payload = NativePayload::new(TELEGRAM_CHANNEL_ID, sender).with_conversation(chat);
        if let Some(text) = self.text.as_ref().or(self.caption.as_ref()) {
            if !text.trim().is_empty() {
                payload = payload.with_text(text.clone());
            }
        }
        if let Some(largest) = self.photo.last() {
            payload = payload.with_part(ContentPart::image(largest.file_id.clone()));
        }
        if let Some(ref doc) = self.document {
            payload = payload.with_part(ContentPart::File {
                url: doc.file_id.clone(),
                name: doc.file_name.clone(),
            });
        }
        if let Some(ref voice) = self.voice {
            payload = payload.with_part(ContentPart::Audio {
                url: voice.file_id.clone(),
            });
        }
        if let Some(ref video) = self.video {
            payload = payload.with_part(ContentPart::Video {
                url: video.file_id.clone(),
            });
        }
        if payload.parts.is_empty() {
            return None;
        }
        payload
            .meta
            .insert("reply_to_message_id".into(), json!(self.message_id));
        payload.reply_handle = Some(self.message_id.to_string());
        Some(payload)
    }
}

struct PollTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Bot API client shared with the poll task.
struct BotApi {
    token: Option<String>,
    base: String,
    client: reqwest::Client,
}

impl BotApi {
    fn method_url(&self, method: &str) -> Result<String> {
        let token = self
            .token
            .as_ref()
            .ok_or_else(|| ChannelError::fatal_auth(TELEGRAM_CHANNEL_ID, "bot token not configured"))?;
        Ok(format!("{}/bot{}/{}", self.base, token, method))
    }

    async fn call<T: serde::de::DeserializeOwned>(&self, method: &str, body: &Value) -> Result<Option<T>> {
        let url = self.method_url(method)?;
        let res = self.client.post(&url).json(body).send().await?;
        let status = res.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::NOT_FOUND {
            return Err(ChannelError::fatal_auth(
                TELEGRAM_CHANNEL_ID,
                format!("{} returned {}", method, status),
            ));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(ChannelError::delivery(
                TELEGRAM_CHANNEL_ID,
                format!("{} failed: {} {}", method, status, body),
            ));
        }
        let data: ApiResponse<T> = res.json().await?;
        if !data.ok {
            return Err(ChannelError::protocol(
                TELEGRAM_CHANNEL_ID,
                format!(
                    "{} returned ok: false ({})",
                    method,
                    data.description.unwrap_or_default()
                ),
            ));
        }
        Ok(data.result)
    }

    /// Call Telegram getUpdates (long poll). Returns (updates, next_offset).
    async fn get_updates(&self, offset: Option<i64>) -> Result<(Vec<TelegramUpdate>, Option<i64>)> {
        let mut body = json!({ "timeout": LONG_POLL_TIMEOUT });
        if let Some(off) = offset {
            body["offset"] = json!(off);
        }
        let updates: Vec<TelegramUpdate> = self.call("getUpdates", &body).await?.unwrap_or_default();
        let next_offset = updates.iter().map(|u| u.update_id).max().map(|id| id + 1);
        Ok((updates, next_offset))
    }
}

/// Telegram channel connector: long-polls for updates (or accepts webhook updates) and sends
/// replies via sendMessage / sendPhoto / sendDocument.
pub struct TelegramChannel {
    api: Arc<BotApi>,
    webhook: Option<(String, Option<String>)>,
    sink: Mutex<Option<EnqueueHandle>>,
    poll: tokio::sync::Mutex<Option<PollTask>>,
}

impl TelegramChannel {
    pub fn new(token: Option<String>) -> Self {
        Self {
            api: Arc::new(BotApi {
                token,
                base: TELEGRAM_API_BASE.to_string(),
                client: reqwest::Client::new(),
            }),
            webhook: None,
            sink: Mutex::new(None),
            poll: tokio::sync::Mutex::new(None),
        }
    }

    /// Use webhook mode: Telegram POSTs updates to `url` and the gateway hands them to
    /// [`TelegramChannel::accept_update`].
    pub fn with_webhook(mut self, url: impl Into<String>, secret: Option<String>) -> Self {
        self.webhook = Some((url.into(), secret));
        self
    }

    /// Override the Bot API base URL (tests, self-hosted Bot API servers).
    pub fn with_api_base(self, base: impl Into<String>) -> Self {
        let api = BotApi {
            token: self.api.token.clone(),
            base: base.into().trim_end_matches('/').to_string(),
            client: self.api.client.clone(),
        };
        Self {
            api: Arc::new(api),
            ..self
        }
    }

    pub fn is_webhook_mode(&self) -> bool {
        self.webhook.is_some()
    }

    pub fn webhook_secret(&self) -> Option<&str> {
        self.webhook.as_ref().and_then(|(_, s)| s.as_deref())
    }

    /// Set webhook URL (and optional secret). When set, Telegram POSTs updates to the URL instead of getUpdates.
    pub async fn set_webhook(&self, url: &str, secret: Option<&str>) -> Result<()> {
        let mut body = json!({ "url": url });
        if let Some(s) = secret {
            body["secret_token"] = Value::String(s.to_string());
        }
        self.api.call::<Value>("setWebhook", &body).await.map(|_| ())
    }

    /// Remove webhook so the bot can use getUpdates again.
    pub async fn delete_webhook(&self) -> Result<()> {
        self.api.call::<Value>("deleteWebhook", &json!({})).await.map(|_| ())
    }

    /// Enqueue one update received over the webhook. Returns false when the channel is not
    /// started.
    pub fn accept_update(&self, update: &TelegramUpdate) -> bool {
        let sink = match self.sink.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let Some(sink) = sink else {
            return false;
        };
        if let Some(payload) = update.message.as_ref().and_then(TelegramMessage::to_payload) {
            sink.enqueue(payload);
        }
        true
    }

    fn set_sink(&self, sink: Option<EnqueueHandle>) {
        match self.sink.lock() {
            Ok(mut g) => *g = sink,
            Err(poisoned) => *poisoned.into_inner() = sink,
        }
    }
}

async fn run_get_updates_loop(api: Arc<BotApi>, sink: EnqueueHandle, cancel: CancellationToken) {
    let mut offset: Option<i64> = None;
    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            r = api.get_updates(offset) => r,
        };
        match polled {
            Ok((updates, next)) => {
                if next.is_some() {
                    offset = next;
                }
                for u in updates {
                    if let Some(payload) = u.message.as_ref().and_then(TelegramMessage::to_payload) {
                        log::debug!("telegram: update {} from chat {:?}", u.update_id, payload.conversation_id);
                        sink.enqueue(payload);
                    }
                }
            }
            Err(e) if e.is_fatal() => {
                sink.report_fatal(&e);
                break;
            }
            Err(e) => {
                log::debug!("telegram getUpdates error: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(POLL_RETRY_DELAY) => {}
                }
            }
        }
    }
    log::info!("telegram channel: getUpdates loop stopped");
}

#[async_trait]
impl ChannelAdapter for TelegramChannel {
    fn id(&self) -> &str {
        TELEGRAM_CHANNEL_ID
    }

    async fn start(&self, sink: EnqueueHandle) -> Result<()> {
        if self.api.token.is_none() {
            return Err(ChannelError::StartFailed {
                channel: TELEGRAM_CHANNEL_ID.to_string(),
                reason: "bot token not configured".to_string(),
            });
        }
        self.set_sink(Some(sink.clone()));
        if let Some((ref url, ref secret)) = self.webhook {
            self.set_webhook(url, secret.as_deref()).await?;
            log::info!("telegram channel registered (webhook mode): {}", url);
            return Ok(());
        }
        let mut poll = self.poll.lock().await;
        if let Some(ref current) = *poll {
            if !current.handle.is_finished() {
                return Ok(());
            }
            log::info!("telegram channel: previous getUpdates loop has ended, starting over");
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_get_updates_loop(Arc::clone(&self.api), sink, cancel.clone()));
        *poll = Some(PollTask { cancel, handle });
        log::info!("telegram channel: getUpdates long-poll loop started");
        Ok(())
    }

    async fn stop(&self) {
        self.set_sink(None);
        let task = self.poll.lock().await.take();
        if let Some(task) = task {
            task.cancel.cancel();
            let _ = task.handle.await;
        }
        if self.webhook.is_some() && self.api.token.is_some() {
            if let Err(e) = self.delete_webhook().await {
                log::debug!("telegram delete_webhook on shutdown: {}", e);
            }
        }
    }

    fn debounce_key(&self, item: &InboundItem) -> SessionKey {
        match item {
            InboundItem::Native(p) => chat_key(p.conversation_id.as_deref().unwrap_or(&p.sender_id)),
            InboundItem::Request(r) => r.session_id.clone(),
        }
    }

    async fn send(&self, handle: &str, text: &str, meta: &Meta) -> Result<()> {
        let chat = chat_id(resolve_target(handle, meta));
        self.api
            .call::<Value>("sendMessage", &json!({ "chat_id": chat, "text": text }))
            .await
            .map(|_| ())
    }

    async fn send_media(&self, handle: &str, part: &ContentPart, meta: &Meta) -> Result<()> {
        let chat = chat_id(resolve_target(handle, meta));
        let (method, body) = match part {
            ContentPart::Image { url } => ("sendPhoto", json!({ "chat_id": chat, "photo": url })),
            ContentPart::Video { url } | ContentPart::Audio { url } | ContentPart::File { url, .. } => {
                ("sendDocument", json!({ "chat_id": chat, "document": url }))
            }
            ContentPart::Text { text } => return self.send(handle, text, meta).await,
        };
        self.api.call::<Value>(method, &body).await.map(|_| ())
    }
}
