//! Webhook channel: messages arrive as JSON POSTs carrying a per-conversation callback URL;
//! replies (including proactive ones) are POSTed back to the callback stored for the session.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

use crate::channels::adapter::{resolve_target, ChannelAdapter};
use crate::channels::debounce::CARRY_FORWARD_KEYS;
use crate::channels::handle_store::{HandleEntry, SessionHandleStore};
use crate::channels::inbound::{ContentPart, InboundItem, Meta, NativePayload, SessionKey};
use crate::channels::manager::EnqueueHandle;
use crate::channels::{ChannelError, Result};
use crate::routing::{self, DEFAULT_SUFFIX_LEN};

pub const WEBHOOK_CHANNEL_ID: &str = "webhook";
/// Meta key carrying the callback URL of the triggering message.
pub const SESSION_WEBHOOK_META_KEY: &str = "session_webhook";

/// Inbound webhook body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookMessage {
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub parts: Vec<ContentPart>,
    /// Where replies for this conversation are POSTed.
    #[serde(default)]
    pub callback_url: Option<String>,
    /// Callback expiry (unix ms).
    #[serde(default)]
    pub callback_expires_at: Option<i64>,
    #[serde(default)]
    pub meta: Meta,
}

/// Acknowledgement returned to the webhook caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Accepted {
    pub message_id: String,
    pub session_key: SessionKey,
}

pub struct WebhookChannel {
    store: Arc<SessionHandleStore>,
    client: reqwest::Client,
    sink: Mutex<Option<EnqueueHandle>>,
}

impl WebhookChannel {
    pub fn new(store: Arc<SessionHandleStore>) -> Self {
        Self {
            store,
            client: reqwest::Client::new(),
            sink: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &SessionHandleStore {
        &self.store
    }

    fn current_sink(&self) -> Option<EnqueueHandle> {
        match self.sink.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_sink(&self, sink: Option<EnqueueHandle>) {
        match self.sink.lock() {
            Ok(mut g) => *g = sink,
            Err(poisoned) => *poisoned.into_inner() = sink,
        }
    }

    /// Normalize an inbound message, remember its callback for the session and enqueue it.
    pub async fn accept(&self, msg: WebhookMessage) -> Result<Accepted> {
        let sink = self
            .current_sink()
            .ok_or_else(|| ChannelError::transient(WEBHOOK_CHANNEL_ID, "channel not started"))?;
        let message_id = msg
            .message_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut payload = NativePayload::new(WEBHOOK_CHANNEL_ID, msg.sender_id)
            .with_conversation(msg.conversation_id);
        if let Some(text) = msg.text.filter(|t| !t.trim().is_empty()) {
            payload = payload.with_text(text);
        }
        payload.parts.extend(msg.parts);
        if payload.parts.is_empty() {
            return Err(ChannelError::protocol(WEBHOOK_CHANNEL_ID, "message has no content"));
        }
        payload.meta = msg.meta;
        payload
            .meta
            .insert("reply_to_message_id".into(), Value::String(message_id.clone()));
        payload.reply_handle = Some(message_id.clone());

        let item = InboundItem::Native(payload);
        let key = self.debounce_key(&item);
        if let Some(url) = msg.callback_url.filter(|u| !u.is_empty()) {
            let mut entry = HandleEntry::new(url.clone());
            if let Some(at) = msg.callback_expires_at {
                entry = entry.with_expiry(at);
            }
            self.store.save(&key, entry).await?;
            sink.enqueue(with_session_webhook(item, url));
        } else {
            sink.enqueue(item);
        }
        log::debug!("webhook: accepted {} for {}", message_id, key);
        Ok(Accepted {
            message_id,
            session_key: key,
        })
    }

    async fn post(&self, key: &str, body: Value) -> Result<()> {
        let entry = self.store.load_handle(key).await.ok_or_else(|| {
            ChannelError::delivery(WEBHOOK_CHANNEL_ID, format!("no callback known for {}", key))
        })?;
        if entry.is_expired(chrono::Utc::now().timestamp_millis()) {
            if let Err(e) = self.store.remove(key).await {
                log::warn!("webhook: removing expired callback for {}: {}", key, e);
            }
            return Err(ChannelError::delivery(
                WEBHOOK_CHANNEL_ID,
                format!("callback for {} expired", key),
            ));
        }
        let res = self
            .client
            .post(&entry.handle)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::transient(WEBHOOK_CHANNEL_ID, e))?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(ChannelError::delivery(
                WEBHOOK_CHANNEL_ID,
                format!("callback returned {} {}", status, text),
            ));
        }
        Ok(())
    }
}

/// Record the callback under the carry-forward `session_webhook` meta key.
fn with_session_webhook(item: InboundItem, url: String) -> InboundItem {
    match item {
        InboundItem::Native(mut p) => {
            p.meta
                .entry(SESSION_WEBHOOK_META_KEY)
                .or_insert_with(|| Value::String(url));
            InboundItem::Native(p)
        }
        other => other,
    }
}

/// Pass-through meta for the callback body; routing keys stay internal.
fn outbound_meta(meta: &Meta) -> Meta {
    meta.iter()
        .filter(|(k, _)| !CARRY_FORWARD_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[async_trait]
impl ChannelAdapter for WebhookChannel {
    fn id(&self) -> &str {
        WEBHOOK_CHANNEL_ID
    }

    async fn start(&self, sink: EnqueueHandle) -> Result<()> {
        self.set_sink(Some(sink));
        log::info!(
            "webhook channel ready ({} known callback(s) in {})",
            self.store.len().await,
            self.store.path().display()
        );
        Ok(())
    }

    async fn stop(&self) {
        self.set_sink(None);
    }

    fn debounce_key(&self, item: &InboundItem) -> SessionKey {
        routing::conversation_key(item, DEFAULT_SUFFIX_LEN)
    }

    async fn send(&self, handle: &str, text: &str, meta: &Meta) -> Result<()> {
        let key = resolve_target(handle, meta);
        self.post(key, json!({ "text": text, "meta": outbound_meta(meta) }))
            .await
    }

    async fn send_media(&self, handle: &str, part: &ContentPart, meta: &Meta) -> Result<()> {
        let key = resolve_target(handle, meta);
        self.post(key, json!({ "part": part, "meta": outbound_meta(meta) }))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};

    type Received = Arc<Mutex<Vec<Value>>>;

    async fn callback_server(status: StatusCode) -> (String, Received) {
        async fn handler(
            State((received, status)): State<(Received, StatusCode)>,
            Json(body): Json<Value>,
        ) -> StatusCode {
            received.lock().unwrap().push(body);
            status
        }
        let received: Received = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/cb", post(handler))
            .with_state((Arc::clone(&received), status));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{}/cb", addr), received)
    }

    async fn channel(dir: &tempfile::TempDir) -> WebhookChannel {
        let store = SessionHandleStore::load(dir.path().join("handles.json")).await;
        WebhookChannel::new(Arc::new(store))
    }

    fn message(conversation: &str, text: &str, callback: Option<&str>) -> WebhookMessage {
        serde_json::from_value(json!({
            "conversationId": conversation,
            "senderId": "user-1",
            "text": text,
            "callbackUrl": callback,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn accept_stores_callback_and_enqueues() {
        let dir = tempfile::tempdir().unwrap();
        let ch = channel(&dir).await;
        let (sink, mut rx) = EnqueueHandle::detached(WEBHOOK_CHANNEL_ID);
        ch.start(sink).await.unwrap();

        let accepted = ch
            .accept(message("cid-0000abcdefgh", "hello", Some("http://cb.example/1")))
            .await
            .unwrap();
        assert_eq!(accepted.session_key, "webhook:abcdefgh");
        assert!(!accepted.message_id.is_empty());

        let entry = ch.store().load_handle("webhook:abcdefgh").await.unwrap();
        assert_eq!(entry.handle, "http://cb.example/1");

        let posted = rx.recv().await.unwrap();
        match posted.item {
            InboundItem::Native(p) => {
                assert_eq!(p.parts, vec![ContentPart::text("hello")]);
                assert_eq!(p.meta[SESSION_WEBHOOK_META_KEY], json!("http://cb.example/1"));
                assert_eq!(p.reply_handle.as_deref(), Some(accepted.message_id.as_str()));
            }
            other => panic!("unexpected item {:?}", other),
        }
    }

    #[tokio::test]
    async fn accept_requires_start_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let ch = channel(&dir).await;
        assert!(ch.accept(message("c", "x", None)).await.is_err());
        let (sink, _rx) = EnqueueHandle::detached(WEBHOOK_CHANNEL_ID);
        ch.start(sink).await.unwrap();
        let err = ch.accept(message("c", "  ", None)).await.unwrap_err();
        assert!(matches!(err, ChannelError::Protocol { .. }));
    }

    #[tokio::test]
    async fn send_posts_to_stored_callback() {
        let dir = tempfile::tempdir().unwrap();
        let ch = channel(&dir).await;
        let (url, received) = callback_server(StatusCode::OK).await;
        ch.store().save("webhook:abc", HandleEntry::new(url)).await.unwrap();

        let mut meta = Meta::new();
        meta.insert("mood".into(), json!("ok"));
        meta.insert(SESSION_WEBHOOK_META_KEY.into(), json!("internal"));
        ch.send("webhook:abc", "hi there", &meta).await.unwrap();
        ch.send_media("webhook:abc", &ContentPart::image("x.png"), &Meta::new())
            .await
            .unwrap();

        let received = received.lock().unwrap().clone();
        assert_eq!(received[0], json!({ "text": "hi there", "meta": { "mood": "ok" } }));
        assert_eq!(received[1]["part"], json!({ "type": "image", "url": "x.png" }));
    }

    #[tokio::test]
    async fn expired_callback_is_removed_and_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ch = channel(&dir).await;
        ch.store()
            .save("webhook:old", HandleEntry::new("http://127.0.0.1:9/cb").with_expiry(1))
            .await
            .unwrap();
        let err = ch.send("webhook:old", "late", &Meta::new()).await.unwrap_err();
        assert!(matches!(err, ChannelError::Delivery { .. }));
        assert!(ch.store().load_handle("webhook:old").await.is_none());
    }

    #[tokio::test]
    async fn unknown_session_and_callback_errors() {
        let dir = tempfile::tempdir().unwrap();
        let ch = channel(&dir).await;
        assert!(ch.send("webhook:none", "x", &Meta::new()).await.is_err());

        let (url, _) = callback_server(StatusCode::INTERNAL_SERVER_ERROR).await;
        ch.store().save("webhook:bad", HandleEntry::new(url)).await.unwrap();
        let err = ch.send("webhook:bad", "x", &Meta::new()).await.unwrap_err();
        assert!(matches!(err, ChannelError::Delivery { .. }));
    }
}
