//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.relay/config.json`) and environment.
//! Every section has defaults, so an empty file (or none) runs the echo pipeline locally.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::channels::{DispatchSettings, ReconnectPolicy};

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Queue and worker settings.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Where requests are processed.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Channel settings.
    #[serde(default)]
    pub channels: ChannelsConfig,
}

/// Gateway bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP (default 15151).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
}

fn default_gateway_port() -> u16 {
    15151
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
        }
    }
}

/// Queue capacity, worker pool size and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_workers")]
    pub workers_per_channel: usize,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_process_timeout_secs")]
    pub process_timeout_secs: u64,
    /// How long media without text waits for a caption before being dropped.
    #[serde(default = "default_text_buffer_ttl_secs")]
    pub text_buffer_ttl_secs: u64,
    /// Marker prepended to every outgoing message (e.g. "[bot] ").
    #[serde(default)]
    pub text_prefix: Option<String>,
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_workers() -> usize {
    4
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

fn default_process_timeout_secs() -> u64 {
    300
}

fn default_text_buffer_ttl_secs() -> u64 {
    600
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            workers_per_channel: default_workers(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            process_timeout_secs: default_process_timeout_secs(),
            text_buffer_ttl_secs: default_text_buffer_ttl_secs(),
            text_prefix: None,
        }
    }
}

impl DispatchConfig {
    pub fn settings(&self) -> DispatchSettings {
        DispatchSettings {
            queue_capacity: self.queue_capacity.max(1),
            workers_per_channel: self.workers_per_channel.max(1),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            process_timeout: Duration::from_secs(self.process_timeout_secs),
            text_buffer_ttl: Duration::from_secs(self.text_buffer_ttl_secs),
            text_prefix: self.text_prefix.clone().filter(|s| !s.is_empty()),
        }
    }
}

/// Pipeline endpoint. Without a URL the gateway echoes messages back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    pub url: Option<String>,
}

/// Per-channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: TelegramChannelConfig,
    #[serde(default)]
    pub webhook: WebhookChannelConfig,
    #[serde(default)]
    pub socket: SocketChannelConfig,
}

/// Telegram channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramChannelConfig {
    /// Bot token from BotFather. Overridden by TELEGRAM_BOT_TOKEN env when set.
    pub bot_token: Option<String>,
    /// When set, use webhook mode: Telegram POSTs updates to this URL. If unset, long-poll getUpdates is used.
    pub webhook_url: Option<String>,
    /// Optional secret for webhook verification (X-Telegram-Bot-Api-Secret-Token). Used only when webhook_url is set.
    pub webhook_secret: Option<String>,
}

/// Generic webhook channel: inbound POSTs carrying a callback URL for replies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Callback store file (default `<config dir>/state/webhook_handles.json`).
    pub handle_store_path: Option<PathBuf>,
}

/// Persistent WebSocket channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketChannelConfig {
    /// ws:// or wss:// URL. The channel is disabled when unset.
    pub url: Option<String>,
    /// Identify token. Overridden by RELAY_SOCKET_TOKEN env when set.
    pub token: Option<String>,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Reconnect tuning; unset fields use the built-in policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectConfig {
    pub delays_ms: Option<Vec<u64>>,
    pub quick_disconnect_ms: Option<u64>,
    pub cooldown_ms: Option<u64>,
    pub max_attempts: Option<u32>,
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        let mut policy = ReconnectPolicy::default();
        if let Some(ref delays) = self.delays_ms {
            if !delays.is_empty() {
                policy.delays = delays.iter().copied().map(Duration::from_millis).collect();
            }
        }
        if let Some(ms) = self.quick_disconnect_ms {
            policy.quick_disconnect = Duration::from_millis(ms);
        }
        if let Some(ms) = self.cooldown_ms {
            policy.cooldown = Duration::from_millis(ms);
        }
        if let Some(n) = self.max_attempts {
            policy.max_attempts = n.max(1);
        }
        policy
    }
}

/// Non-empty trimmed env value, else non-empty trimmed config value.
fn env_or_config(env_value: Option<String>, configured: Option<&String>) -> Option<String> {
    env_value
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            configured
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve the Telegram bot token: env TELEGRAM_BOT_TOKEN overrides config.
pub fn resolve_telegram_token(config: &Config) -> Option<String> {
    env_or_config(
        std::env::var("TELEGRAM_BOT_TOKEN").ok(),
        config.channels.telegram.bot_token.as_ref(),
    )
}

/// Resolve the socket identify token: env RELAY_SOCKET_TOKEN overrides config.
pub fn resolve_socket_token(config: &Config) -> Option<String> {
    env_or_config(
        std::env::var("RELAY_SOCKET_TOKEN").ok(),
        config.channels.socket.token.as_ref(),
    )
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("RELAY_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".relay").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

fn config_parent(config_path: &Path) -> &Path {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// State directory for persisted adapter data: `state` next to the config file.
pub fn resolve_state_dir(config_path: &Path) -> PathBuf {
    config_parent(config_path).join("state")
}

/// Webhook callback store file: the configured path (relative paths resolved against the
/// config file's parent), else `state/webhook_handles.json`.
pub fn resolve_handle_store_path(config: &Config, config_path: &Path) -> PathBuf {
    match &config.channels.webhook.handle_store_path {
        Some(p) if !p.as_os_str().is_empty() => {
            if p.is_absolute() {
                p.clone()
            } else {
                config_parent(config_path).join(p)
            }
        }
        _ => resolve_state_dir(config_path).join("webhook_handles.json"),
    }
}

/// Load config from the given path, else the default path (or RELAY_CONFIG_PATH).
/// Missing file => default config. Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
