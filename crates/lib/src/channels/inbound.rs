//! Inbound items from a channel and the normalized request handed to the pipeline.

use serde::{Deserialize, Serialize};

/// Free-form, insertion-ordered metadata map carried by payloads and requests.
pub type Meta = serde_json::Map<String, serde_json::Value>;

/// Identity of "this conversation"; two items with the same key are never processed concurrently.
pub type SessionKey = String;

/// One content fragment of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        url: String,
    },
    Video {
        url: String,
    },
    Audio {
        url: String,
    },
    File {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        Self::Image { url: url.into() }
    }

    /// Non-empty text of a text part; None for media or blank text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } if !text.trim().is_empty() => Some(text),
            _ => None,
        }
    }

    /// URL of a media part.
    pub fn media_url(&self) -> Option<&str> {
        match self {
            Self::Text { .. } => None,
            Self::Image { url } | Self::Video { url } | Self::Audio { url } => Some(url),
            Self::File { url, .. } => Some(url),
        }
    }
}

/// Channel-specific payload as received, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativePayload {
    pub channel_id: String,
    pub sender_id: String,
    /// Platform conversation id (chat id, room id), when the platform has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub parts: Vec<ContentPart>,
    #[serde(default)]
    pub meta: Meta,
    /// Raw protocol handle for replying to this item (message id, callback reference).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_handle: Option<String>,
}

impl NativePayload {
    pub fn new(channel_id: impl Into<String>, sender_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            sender_id: sender_id.into(),
            conversation_id: None,
            parts: Vec::new(),
            meta: Meta::new(),
            reply_handle: None,
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_part(mut self, part: ContentPart) -> Self {
        self.parts.push(part);
        self
    }

    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.with_part(ContentPart::text(text))
    }
}

/// Normalized unit handed to the processing pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub session_id: String,
    pub user_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub parts: Vec<ContentPart>,
    #[serde(default)]
    pub meta: Meta,
}

impl Request {
    pub fn new(
        channel_id: impl Into<String>,
        session_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            channel_id: channel_id.into(),
            parts: Vec::new(),
            meta: Meta::new(),
        }
    }

    /// True when at least one part carries non-blank text.
    pub fn has_text(&self) -> bool {
        self.parts.iter().any(|p| p.as_text().is_some())
    }

    /// All text parts joined with newlines.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(ContentPart::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// An item handed to the manager: a raw platform payload or an already-normalized request.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundItem {
    Native(NativePayload),
    Request(Request),
}

impl InboundItem {
    pub fn parts(&self) -> &[ContentPart] {
        match self {
            Self::Native(p) => &p.parts,
            Self::Request(r) => &r.parts,
        }
    }

    /// Short one-line description for log lines (truncated text + part count).
    pub fn summary(&self) -> String {
        const MAX: usize = 60;
        let text: String = self
            .parts()
            .iter()
            .filter_map(ContentPart::as_text)
            .collect::<Vec<_>>()
            .join(" ");
        let mut short: String = text.chars().take(MAX).collect();
        if text.chars().count() > MAX {
            short.push('…');
        }
        format!("{} part(s): {:?}", self.parts().len(), short)
    }
}

impl From<NativePayload> for InboundItem {
    fn from(p: NativePayload) -> Self {
        Self::Native(p)
    }
}

impl From<Request> for InboundItem {
    fn from(r: Request) -> Self {
        Self::Request(r)
    }
}
