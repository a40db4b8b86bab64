//! Processing pipeline contract.
//!
//! The pipeline is an external collaborator: it takes one normalized [`Request`] and yields a
//! stream of [`Event`]s. The engine only looks at the event shape: a completed `message` is
//! rendered and sent, a `response` carrying an error is rendered as a fallback and sent.

mod http;

pub use http::HttpPipeline;

use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::channels::{ContentPart, Request};

/// Completion status of a `message` event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    InProgress,
    #[default]
    Completed,
    Failed,
}

/// One output event from the pipeline. Wire form: `{"object": "message", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "object", rename_all = "snake_case")]
pub enum Event {
    Message {
        #[serde(default)]
        status: MessageStatus,
        #[serde(default)]
        parts: Vec<ContentPart>,
    },
    Response {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Event {
    pub fn completed_text(text: impl Into<String>) -> Self {
        Self::Message {
            status: MessageStatus::Completed,
            parts: vec![ContentPart::text(text)],
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Response {
            error: Some(message.into()),
        }
    }

    pub fn done() -> Self {
        Self::Response { error: None }
    }
}

/// Turns one request into a stream of output events.
pub trait Pipeline: Send + Sync {
    fn process(&self, request: Request) -> BoxStream<'static, Event>;
}

/// Replies with the request's text. Used when no pipeline URL is configured.
#[derive(Debug, Clone, Default)]
pub struct EchoPipeline;

impl Pipeline for EchoPipeline {
    fn process(&self, request: Request) -> BoxStream<'static, Event> {
        let mut parts: Vec<ContentPart> = Vec::new();
        let text = request.text();
        if !text.is_empty() {
            parts.push(ContentPart::text(format!("echo: {}", text)));
        }
        parts.extend(
            request
                .parts
                .into_iter()
                .filter(|p| p.media_url().is_some()),
        );
        stream::iter(vec![
            Event::Message {
                status: MessageStatus::Completed,
                parts,
            },
            Event::done(),
        ])
        .boxed()
    }
}
