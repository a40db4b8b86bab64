//! Consume step: turn a claimed (possibly merged) item into a request, run it through the
//! pipeline and deliver the output to the originating channel.

use std::fmt;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;

use crate::channels::adapter::{apply_text_prefix, ChannelAdapter, TEXT_PREFIX_META_KEY};
use crate::channels::debounce::TextlessBuffer;
use crate::channels::inbound::{ContentPart, InboundItem, Meta, Request};
use crate::channels::manager::DispatchSettings;
use crate::channels::ChannelError;
use crate::pipeline::{Event, MessageStatus, Pipeline};

/// What happened to one consumed item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Held by the text-less buffer until text arrives for the session.
    Held,
    /// Pipeline ran; `messages` sends succeeded.
    Delivered { messages: usize },
    /// Processing failed; a fallback text was attempted.
    Failed,
    /// The item could not be turned into a request and was dropped.
    Dropped,
}

/// Why processing a request did not complete normally.
#[derive(Debug)]
pub enum Failure {
    Pipeline(String),
    Delivery(ChannelError),
    Timeout(Duration),
    /// Processing panicked; caught at the worker boundary.
    Panicked,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipeline(e) => write!(f, "pipeline error: {}", e),
            Self::Delivery(e) => write!(f, "{}", e),
            Self::Timeout(d) => write!(f, "timed out after {:?}", d),
            Self::Panicked => write!(f, "processing panicked"),
        }
    }
}

/// User-facing text for a failure. Internal details stay in the logs.
pub fn render_error(failure: &Failure) -> String {
    match failure {
        Failure::Pipeline(_) | Failure::Panicked => {
            "Sorry, something went wrong while handling your message.".to_string()
        }
        Failure::Delivery(_) => "Sorry, part of the reply could not be delivered.".to_string(),
        Failure::Timeout(_) => "Sorry, that took too long. Please try again.".to_string(),
    }
}

/// Build the request, buffer it if it has no text yet, run the pipeline under the processing
/// timeout and deliver. Never returns an error: failures are logged and answered with a
/// fallback text.
pub async fn consume(
    adapter: &dyn ChannelAdapter,
    pipeline: &dyn Pipeline,
    buffer: &TextlessBuffer,
    settings: &DispatchSettings,
    item: InboundItem,
) -> Outcome {
    let mut request = match item {
        InboundItem::Native(payload) => match adapter.build_request(&payload) {
            Ok(r) => r,
            Err(e) => {
                log::warn!(
                    "{}: dropping item from {}: cannot build request: {}",
                    adapter.id(),
                    payload.sender_id,
                    e
                );
                return Outcome::Dropped;
            }
        },
        InboundItem::Request(r) => r,
    };
    default_text_prefix(&mut request.meta, settings);
    if adapter.buffers_textless() {
        request = match buffer.absorb(request) {
            Some(r) => r,
            None => return Outcome::Held,
        };
    }

    let handle = adapter.delivery_handle(&request);
    let meta = request.meta.clone();
    let session = request.session_id.clone();
    log::debug!(
        "{}: processing {} part(s) for {}",
        adapter.id(),
        request.parts.len(),
        session
    );

    let failure = match tokio::time::timeout(
        settings.process_timeout,
        run_pipeline(adapter, pipeline, &handle, &meta, request),
    )
    .await
    {
        Ok(Ok(messages)) => return Outcome::Delivered { messages },
        Ok(Err(failure)) => failure,
        Err(_) => Failure::Timeout(settings.process_timeout),
    };
    log::warn!("{}: processing failed for {}: {}", adapter.id(), session, failure);
    send_fallback(adapter, &handle, &meta, &failure).await;
    Outcome::Failed
}

fn default_text_prefix(meta: &mut Meta, settings: &DispatchSettings) {
    if let Some(ref prefix) = settings.text_prefix {
        meta.entry(TEXT_PREFIX_META_KEY)
            .or_insert_with(|| Value::String(prefix.clone()));
    }
}

/// Delivery handle and meta that `consume` would use for `item`, resolved up front so a
/// worker can still answer when processing dies. Falls back to the session key.
pub fn reply_target(
    adapter: &dyn ChannelAdapter,
    settings: &DispatchSettings,
    key: &str,
    item: &InboundItem,
) -> (String, Meta) {
    let request = match item {
        InboundItem::Native(payload) => adapter.build_request(payload).ok(),
        InboundItem::Request(r) => Some(r.clone()),
    };
    let (handle, mut meta) = match request {
        Some(r) => (adapter.delivery_handle(&r), r.meta),
        None => (key.to_string(), Meta::new()),
    };
    default_text_prefix(&mut meta, settings);
    (handle, meta)
}

/// Send the user-facing text for `failure` once. Delivery errors are only logged.
pub async fn send_fallback(adapter: &dyn ChannelAdapter, handle: &str, meta: &Meta, failure: &Failure) {
    let fallback = apply_text_prefix(&render_error(failure), meta);
    if let Err(e) = adapter.send(handle, &fallback, meta).await {
        log::warn!(
            "{}: fallback delivery to {} failed: {}",
            adapter.id(),
            handle,
            e
        );
    }
}

async fn run_pipeline(
    adapter: &dyn ChannelAdapter,
    pipeline: &dyn Pipeline,
    handle: &str,
    meta: &Meta,
    request: Request,
) -> Result<usize, Failure> {
    let mut events = pipeline.process(request);
    let mut sent = 0;
    while let Some(event) = events.next().await {
        match event {
            Event::Message {
                status: MessageStatus::Completed,
                parts,
            } => {
                sent += deliver(adapter, handle, meta, parts).await?;
            }
            Event::Message {
                status: MessageStatus::Failed,
                ..
            } => return Err(Failure::Pipeline("message failed".to_string())),
            Event::Message {
                status: MessageStatus::InProgress,
                ..
            } => {}
            Event::Response { error: Some(e) } => return Err(Failure::Pipeline(e)),
            Event::Response { error: None } => break,
        }
    }
    Ok(sent)
}

/// Send a completed message: consecutive text parts go out as one message, media parts
/// one by one, in order.
async fn deliver(
    adapter: &dyn ChannelAdapter,
    handle: &str,
    meta: &Meta,
    parts: Vec<ContentPart>,
) -> Result<usize, Failure> {
    let mut sent = 0;
    let mut text: Vec<String> = Vec::new();
    for part in parts {
        match part {
            ContentPart::Text { text: t } => {
                if !t.trim().is_empty() {
                    text.push(t);
                }
            }
            media => {
                sent += flush_text(adapter, handle, meta, &mut text).await?;
                adapter
                    .send_media(handle, &media, meta)
                    .await
                    .map_err(Failure::Delivery)?;
                sent += 1;
            }
        }
    }
    sent += flush_text(adapter, handle, meta, &mut text).await?;
    Ok(sent)
}

async fn flush_text(
    adapter: &dyn ChannelAdapter,
    handle: &str,
    meta: &Meta,
    text: &mut Vec<String>,
) -> Result<usize, Failure> {
    if text.is_empty() {
        return Ok(0);
    }
    let body = apply_text_prefix(&text.join("\n"), meta);
    text.clear();
    adapter
        .send(handle, &body, meta)
        .await
        .map_err(Failure::Delivery)?;
    Ok(1)
}
