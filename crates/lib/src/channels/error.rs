//! Channel error taxonomy.

/// Errors raised by the manager, adapters and the reconnect driver.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Network hiccup; retry via backoff or a per-request retry.
    #[error("transient network error on {channel}: {reason}")]
    Transient { channel: String, reason: String },

    /// Malformed payload from the remote side. Logged and dropped, never retried.
    #[error("protocol error on {channel}: {reason}")]
    Protocol { channel: String, reason: String },

    /// Channel queue is full; the item was rejected.
    #[error("queue full on {channel} (key {key})")]
    Capacity { channel: String, key: String },

    /// Sending a rendered message failed.
    #[error("delivery failed on {channel}: {reason}")]
    Delivery { channel: String, reason: String },

    /// Credentials invalid beyond recovery; the adapter stops itself.
    #[error("authentication failed on {channel}: {reason}")]
    FatalAuth { channel: String, reason: String },

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("channel {channel} failed to start: {reason}")]
    StartFailed { channel: String, reason: String },

    #[error("channel {channel} gave up reconnecting after {attempts} attempts")]
    GaveUp { channel: String, attempts: u32 },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    pub fn transient(channel: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Transient {
            channel: channel.into(),
            reason: reason.to_string(),
        }
    }

    pub fn protocol(channel: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Protocol {
            channel: channel.into(),
            reason: reason.to_string(),
        }
    }

    pub fn delivery(channel: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Delivery {
            channel: channel.into(),
            reason: reason.to_string(),
        }
    }

    pub fn fatal_auth(channel: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::FatalAuth {
            channel: channel.into(),
            reason: reason.to_string(),
        }
    }

    /// True for failures worth another attempt (network noise, timeouts).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient { .. } | Self::Io(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalAuth { .. } | Self::GaveUp { .. })
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(ChannelError::transient("socket", "reset").is_retryable());
        assert!(!ChannelError::protocol("socket", "bad frame").is_retryable());
        assert!(!ChannelError::fatal_auth("socket", "revoked").is_retryable());
        assert!(ChannelError::fatal_auth("socket", "revoked").is_fatal());
    }

    #[test]
    fn capacity_message_names_channel_and_key() {
        let e = ChannelError::Capacity {
            channel: "telegram".into(),
            key: "telegram:42".into(),
        };
        assert_eq!(e.to_string(), "queue full on telegram (key telegram:42)");
    }
}
