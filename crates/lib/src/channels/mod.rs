//! Communication channels and the dispatch engine behind them.
//!
//! Adapters (Telegram, webhook, socket) normalize platform messages into inbound items and
//! push them through an [`EnqueueHandle`]. The [`ChannelManager`] queues items per channel,
//! batches them per session key and runs each batch through the pipeline, delivering the
//! output back through the adapter that received it.

pub mod adapter;
pub mod debounce;
mod error;
pub mod handle_store;
pub mod inbound;
pub mod manager;
pub mod process;
pub mod reconnect;
mod socket;
mod telegram;
mod webhook;

pub use adapter::ChannelAdapter;
pub use error::{ChannelError, Result};
pub use handle_store::{HandleEntry, SessionHandleStore};
pub use inbound::{ContentPart, InboundItem, Meta, NativePayload, Request, SessionKey};
pub use manager::{ChannelManager, ChannelSnapshot, DispatchSettings, EnqueueHandle, Enqueued};
pub use reconnect::{
    run_with_reconnect, CachedToken, Connection, ConnectionState, Connector, Decision,
    DisconnectReason, Heartbeat, ReconnectPolicy, ReconnectState, ResumeInfo,
};
pub use socket::{Frame, SocketChannel, SocketMessage, SOCKET_CHANNEL_ID};
pub use telegram::{TelegramChannel, TelegramUpdate, TELEGRAM_CHANNEL_ID};
pub use webhook::{Accepted, WebhookChannel, WebhookMessage, WEBHOOK_CHANNEL_ID};
