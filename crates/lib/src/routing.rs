//! Session key resolution: map an inbound item to the identity of its conversation.
//!
//! Keys serialize processing (one worker per key at a time) and must be recomputable
//! from the item's identifying fields alone, so a scheduler can derive the same key
//! later for proactive delivery.

use crate::channels::{InboundItem, SessionKey};

/// Number of trailing characters kept by [`conversation_suffix_key`] by default.
pub const DEFAULT_SUFFIX_LEN: usize = 8;

/// Default key: `channel:sender`.
pub fn sender_key(channel_id: &str, sender_id: &str) -> SessionKey {
    format!("{}:{}", channel_id, sender_id)
}

/// Key from the last `len` characters of a platform conversation id, prefixed with the channel.
/// Platform ids are often long and share a common prefix; the suffix is what varies.
pub fn conversation_suffix_key(channel_id: &str, conversation_id: &str, len: usize) -> SessionKey {
    let count = conversation_id.chars().count();
    let suffix: String = conversation_id.chars().skip(count.saturating_sub(len)).collect();
    format!("{}:{}", channel_id, suffix)
}

/// Default key for any item: `channel:sender` for native payloads, `channel:user` for requests.
pub fn default_key(item: &InboundItem) -> SessionKey {
    match item {
        InboundItem::Native(p) => sender_key(&p.channel_id, &p.sender_id),
        InboundItem::Request(r) => sender_key(&r.channel_id, &r.user_id),
    }
}

/// Key from the platform conversation id when present, falling back to [`default_key`].
pub fn conversation_key(item: &InboundItem, len: usize) -> SessionKey {
    match item {
        InboundItem::Native(p) => match p.conversation_id.as_deref() {
            Some(conv) if !conv.is_empty() => conversation_suffix_key(&p.channel_id, conv, len),
            _ => default_key(item),
        },
        InboundItem::Request(r) => r.session_id.clone(),
    }
}
