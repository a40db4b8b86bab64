//! Burst merging and text-less item buffering.
//!
//! Channels often deliver one logical message as several events (text plus attachments,
//! an image before its caption). The helpers here fold those fragments back into one
//! unit while keeping arrival order.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::channels::adapter::ChannelAdapter;
use crate::channels::inbound::{ContentPart, InboundItem, Meta, NativePayload, Request};
use crate::channels::Result;

/// Meta keys that keep the first present value on merge instead of last-wins.
/// These reference the triggering item's reply context.
pub const CARRY_FORWARD_KEYS: &[&str] = &["reply_handle", "reply_to_message_id", "session_webhook"];

/// Meta key an item can set to `false` to skip text-less buffering.
pub const DEBOUNCE_META_KEY: &str = "debounce";

/// Merge `later` into `base`: later values overwrite, except carry-forward keys already present.
pub fn merge_meta(base: &mut Meta, later: Meta) {
    for (key, value) in later {
        if CARRY_FORWARD_KEYS.contains(&key.as_str()) && base.contains_key(&key) {
            continue;
        }
        base.insert(key, value);
    }
}

/// Merge native payloads in arrival order. The first item's identity fields win; parts are
/// concatenated; meta follows [`merge_meta`]. Returns None for an empty batch.
pub fn merge_native_items(items: Vec<NativePayload>) -> Option<NativePayload> {
    let mut iter = items.into_iter();
    let mut merged = iter.next()?;
    for item in iter {
        merged.parts.extend(item.parts);
        merge_meta(&mut merged.meta, item.meta);
        if merged.reply_handle.is_none() {
            merged.reply_handle = item.reply_handle;
        }
        if merged.conversation_id.is_none() {
            merged.conversation_id = item.conversation_id;
        }
    }
    Some(merged)
}

/// Merge normalized requests: first item's session/user/channel, parts concatenated.
pub fn merge_requests(items: Vec<Request>) -> Option<Request> {
    let mut iter = items.into_iter();
    let mut merged = iter.next()?;
    for item in iter {
        merged.parts.extend(item.parts);
        merge_meta(&mut merged.meta, item.meta);
    }
    Some(merged)
}

/// Merge a claimed batch into one item using the adapter's merge strategy.
///
/// A batch of one is returned unchanged. A mixed batch (native payloads and requests) is
/// normalized to requests first, in order.
pub fn merge_batch(adapter: &dyn ChannelAdapter, mut batch: Vec<InboundItem>) -> Result<Option<InboundItem>> {
    if batch.len() <= 1 {
        return Ok(batch.pop());
    }
    if batch.iter().all(|i| adapter.is_native_payload(i)) {
        let natives = batch
            .into_iter()
            .filter_map(|i| match i {
                InboundItem::Native(p) => Some(p),
                InboundItem::Request(_) => None,
            })
            .collect();
        return Ok(adapter.merge_native_items(natives).map(InboundItem::Native));
    }
    let mut requests = Vec::with_capacity(batch.len());
    for item in batch {
        match item {
            InboundItem::Native(p) => requests.push(adapter.build_request(&p)?),
            InboundItem::Request(r) => requests.push(r),
        }
    }
    Ok(adapter.merge_requests(requests).map(InboundItem::Request))
}

struct HeldContent {
    parts: Vec<ContentPart>,
    meta: Meta,
    since: Instant,
}

/// Holds parts of text-less requests per session until a request with text arrives.
pub struct TextlessBuffer {
    held: Mutex<HashMap<String, HeldContent>>,
    ttl: Duration,
}

impl TextlessBuffer {
    pub fn new(ttl: Duration) -> Self {
        Self {
            held: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Absorb a request. Returns None when it was held (no text yet); otherwise returns the
    /// request with any held parts for its session prepended. Held content older than the
    /// ttl is dropped for every session, not only this one.
    pub fn absorb(&self, mut request: Request) -> Option<Request> {
        let now = Instant::now();
        let mut held = match self.held.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let ttl = self.ttl;
        held.retain(|session, entry| {
            let fresh = now.duration_since(entry.since) <= ttl;
            if !fresh {
                log::warn!(
                    "debounce: dropping {} held part(s) for {} after {:?} without text",
                    entry.parts.len(),
                    session,
                    ttl
                );
            }
            fresh
        });

        let wants_debounce = request
            .meta
            .get(DEBOUNCE_META_KEY)
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        if wants_debounce && !request.has_text() {
            log::debug!(
                "debounce: holding {} part(s) for {} until text arrives",
                request.parts.len(),
                request.session_id
            );
            match held.get_mut(&request.session_id) {
                Some(entry) => {
                    entry.parts.append(&mut request.parts);
                    merge_meta(&mut entry.meta, request.meta);
                }
                None => {
                    held.insert(
                        request.session_id.clone(),
                        HeldContent {
                            parts: request.parts,
                            meta: request.meta,
                            since: now,
                        },
                    );
                }
            }
            return None;
        }

        if let Some(entry) = held.remove(&request.session_id) {
            let mut parts = entry.parts;
            parts.append(&mut request.parts);
            request.parts = parts;
            let mut meta = entry.meta;
            merge_meta(&mut meta, std::mem::take(&mut request.meta));
            request.meta = meta;
        }
        Some(request)
    }

    /// Number of sessions with held content.
    pub fn held_sessions(&self) -> usize {
        self.held.lock().map(|g| g.len()).unwrap_or(0)
    }

    /// Drop everything held, logging what was discarded.
    pub fn clear(&self) {
        let mut held = match self.held.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (session, entry) in held.drain() {
            log::warn!(
                "debounce: discarding {} held part(s) for {} on shutdown",
                entry.parts.len(),
                session
            );
        }
    }
}
