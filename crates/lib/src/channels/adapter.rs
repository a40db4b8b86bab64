//! Channel adapter contract: what every chat platform integration implements.

use async_trait::async_trait;

use crate::channels::debounce;
use crate::channels::inbound::{ContentPart, InboundItem, Meta, NativePayload, Request, SessionKey};
use crate::channels::manager::EnqueueHandle;
use crate::channels::Result;
use crate::routing;

/// Meta key overriding the delivery target for a request or a send.
pub const TO_HANDLE_META_KEY: &str = "to_handle";
/// Meta key holding a prefix (bot identity marker) prepended to outgoing text.
pub const TEXT_PREFIX_META_KEY: &str = "text_prefix";

/// One chat platform integration: receive and normalize inbound items, send output back.
///
/// The manager depends only on this trait; concrete adapters can be hot-swapped at runtime.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Channel id (e.g. "telegram").
    fn id(&self) -> &str;

    /// Whether inbound items go through the manager's queue and worker pool.
    fn uses_queue(&self) -> bool {
        true
    }

    /// Acquire whatever the adapter needs (poll task, socket, webhook registration) and start
    /// pushing items into `sink`.
    async fn start(&self, sink: EnqueueHandle) -> Result<()>;

    /// Release everything `start` acquired. Safe to call when `start` failed or never ran.
    async fn stop(&self);

    /// Session key for an item. Pure and deterministic.
    fn debounce_key(&self, item: &InboundItem) -> SessionKey {
        routing::default_key(item)
    }

    fn is_native_payload(&self, item: &InboundItem) -> bool {
        matches!(item, InboundItem::Native(_))
    }

    fn merge_native_items(&self, items: Vec<NativePayload>) -> Option<NativePayload> {
        debounce::merge_native_items(items)
    }

    fn merge_requests(&self, items: Vec<Request>) -> Option<Request> {
        debounce::merge_requests(items)
    }

    /// Convert a native payload into a pipeline request. Must not perform network I/O.
    fn build_request(&self, payload: &NativePayload) -> Result<Request> {
        let item = InboundItem::Native(payload.clone());
        let mut request = Request::new(
            payload.channel_id.clone(),
            self.debounce_key(&item),
            payload.sender_id.clone(),
        );
        request.parts = payload.parts.clone();
        request.meta = payload.meta.clone();
        if let Some(ref handle) = payload.reply_handle {
            request
                .meta
                .entry("reply_handle")
                .or_insert_with(|| serde_json::Value::String(handle.clone()));
        }
        Ok(request)
    }

    /// Where output for `request` goes: the `to_handle` meta override, else the session id.
    fn delivery_handle(&self, request: &Request) -> String {
        request
            .meta
            .get(TO_HANDLE_META_KEY)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| request.session_id.clone())
    }

    /// Whether the consume step holds text-less items until text arrives for the session.
    fn buffers_textless(&self) -> bool {
        true
    }

    /// Deliver one rendered message. May run long after the triggering item was processed.
    async fn send(&self, handle: &str, text: &str, meta: &Meta) -> Result<()>;

    /// Deliver one media part. Default: send its URL as text.
    async fn send_media(&self, handle: &str, part: &ContentPart, meta: &Meta) -> Result<()> {
        match part.media_url() {
            Some(url) => self.send(handle, url, meta).await,
            None => match part.as_text() {
                Some(text) => self.send(handle, text, meta).await,
                None => Ok(()),
            },
        }
    }
}

/// Apply the `text_prefix` meta key, if any, to outgoing text.
pub fn apply_text_prefix(text: &str, meta: &Meta) -> String {
    match meta.get(TEXT_PREFIX_META_KEY).and_then(|v| v.as_str()) {
        Some(prefix) if !prefix.is_empty() => format!("{}{}", prefix, text),
        _ => text.to_string(),
    }
}

/// Resolve the delivery target for a send: `to_handle` in `meta` overrides `handle`.
pub fn resolve_target<'a>(handle: &'a str, meta: &'a Meta) -> &'a str {
    meta.get(TO_HANDLE_META_KEY)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prefix_is_prepended_when_present() {
        let mut meta = Meta::new();
        assert_eq!(apply_text_prefix("hi", &meta), "hi");
        meta.insert(TEXT_PREFIX_META_KEY.into(), json!("[bot] "));
        assert_eq!(apply_text_prefix("hi", &meta), "[bot] hi");
    }

    #[test]
    fn target_override() {
        let mut meta = Meta::new();
        assert_eq!(resolve_target("chat-1", &meta), "chat-1");
        meta.insert(TO_HANDLE_META_KEY.into(), json!("chat-2"));
        assert_eq!(resolve_target("chat-1", &meta), "chat-2");
        meta.insert(TO_HANDLE_META_KEY.into(), json!(""));
        assert_eq!(resolve_target("chat-1", &meta), "chat-1");
    }
}
