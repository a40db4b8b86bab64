//! Reconnect/backoff policy for adapters that hold a persistent connection.
//!
//! [`ReconnectState`] is a plain state machine: every transition takes the current instant,
//! so it can be driven step by step in tests. [`run_with_reconnect`] is the async loop that
//! applies it to a [`Connector`], running heartbeats on their own task per connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::channels::{ChannelError, Result};

/// Retry tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delays by attempt index; the last one repeats.
    pub delays: Vec<Duration>,
    /// A connection shorter than this counts as a quick disconnect.
    pub quick_disconnect: Duration,
    /// Consecutive quick disconnects that force a cooldown.
    pub quick_limit: u32,
    pub cooldown: Duration,
    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delays: [1, 2, 5, 10, 30, 60]
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
            quick_disconnect: Duration::from_secs(5),
            quick_limit: 3,
            cooldown: Duration::from_secs(60),
            max_attempts: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Backoff,
    GaveUp,
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    Clean,
    Error(String),
    /// The remote side asked for a reconnect; skip the backoff once.
    ReconnectRequested,
    /// The remote side rejected the session; without `resumable` the resume ids are cleared.
    InvalidSession { resumable: bool },
}

/// What to do after a failed connect or a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Retry(Duration),
    Cooldown(Duration),
    GiveUp,
}

impl Decision {
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Self::Retry(d) | Self::Cooldown(d) => Some(*d),
            Self::GiveUp => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedToken {
    pub value: String,
    pub expires_at: Option<Instant>,
}

impl CachedToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            expires_at: None,
        }
    }

    pub fn is_valid(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |t| now < t)
    }
}

/// Identifiers needed to resume a session instead of starting a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeInfo {
    pub session_id: String,
    pub sequence: Option<u64>,
}

/// Per-adapter connection bookkeeping.
#[derive(Debug)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    state: ConnectionState,
    connected_at: Option<Instant>,
    quick_disconnects: u32,
    attempts: u32,
    backoff_index: usize,
    token: Option<CachedToken>,
    resume: Option<ResumeInfo>,
}

impl ReconnectState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Connecting,
            connected_at: None,
            quick_disconnects: 0,
            attempts: 0,
            backoff_index: 0,
            token: None,
            resume: None,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn quick_disconnects(&self) -> u32 {
        self.quick_disconnects
    }

    pub fn backoff_index(&self) -> usize {
        self.backoff_index
    }

    pub fn token(&self, now: Instant) -> Option<&str> {
        self.token
            .as_ref()
            .filter(|t| t.is_valid(now))
            .map(|t| t.value.as_str())
    }

    pub fn set_token(&mut self, token: CachedToken) {
        self.token = Some(token);
    }

    pub fn invalidate_token(&mut self) {
        self.token = None;
    }

    pub fn resume(&self) -> Option<&ResumeInfo> {
        self.resume.as_ref()
    }

    pub fn set_resume(&mut self, info: ResumeInfo) {
        self.resume = Some(info);
    }

    pub fn clear_resume(&mut self) {
        self.resume = None;
    }

    pub fn on_connecting(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    pub fn on_connected(&mut self, now: Instant) {
        self.state = ConnectionState::Connected;
        self.connected_at = Some(now);
    }

    fn next_delay(&mut self) -> Duration {
        let last = self.policy.delays.len().saturating_sub(1);
        let delay = self
            .policy
            .delays
            .get(self.backoff_index.min(last))
            .copied()
            .unwrap_or(Duration::from_secs(1));
        self.backoff_index = self.backoff_index.saturating_add(1);
        delay
    }

    fn give_up_or(&mut self, decision: Decision) -> Decision {
        if self.attempts >= self.policy.max_attempts {
            self.state = ConnectionState::GaveUp;
            return Decision::GiveUp;
        }
        self.state = ConnectionState::Backoff;
        decision
    }

    /// A connect (or authentication) attempt failed before the connection was established.
    pub fn on_connect_failed(&mut self, _now: Instant) -> Decision {
        self.attempts += 1;
        self.connected_at = None;
        let delay = self.next_delay();
        self.give_up_or(Decision::Retry(delay))
    }

    /// An established connection ended.
    pub fn on_disconnected(&mut self, reason: &DisconnectReason, now: Instant) -> Decision {
        let lived = self
            .connected_at
            .take()
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or(Duration::ZERO);

        if let DisconnectReason::InvalidSession { resumable: false } = reason {
            self.resume = None;
        }

        if lived >= self.policy.quick_disconnect {
            self.quick_disconnects = 0;
            self.attempts = 0;
            self.backoff_index = 0;
        } else if *reason != DisconnectReason::ReconnectRequested {
            self.quick_disconnects += 1;
            self.attempts += 1;
            if self.quick_disconnects >= self.policy.quick_limit {
                self.quick_disconnects = 0;
                self.backoff_index = 0;
                self.token = None;
                return self.give_up_or(Decision::Cooldown(self.policy.cooldown));
            }
        }

        if *reason == DisconnectReason::ReconnectRequested {
            return self.give_up_or(Decision::Retry(Duration::ZERO));
        }
        let delay = self.next_delay();
        self.give_up_or(Decision::Retry(delay))
    }
}

/// Sends one heartbeat; returns false once the connection is gone.
pub type BeatFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// Heartbeat requirements of an established connection.
#[derive(Clone)]
pub struct Heartbeat {
    pub interval: Duration,
    pub beat: BeatFn,
}

/// Opens connections for [`run_with_reconnect`].
#[async_trait]
pub trait Connector: Send + Sync {
    type Conn: Connection;

    /// Name used in logs and errors (usually the channel id).
    fn name(&self) -> &str;

    /// Obtain a fresh credential. A `FatalAuth` error ends the reconnect loop.
    async fn authenticate(&self) -> Result<CachedToken>;

    /// Establish a connection, including any handshake.
    async fn connect(&self, token: &str, resume: Option<ResumeInfo>) -> Result<Self::Conn>;
}

/// One established connection.
#[async_trait]
pub trait Connection: Send {
    fn heartbeat(&self) -> Option<Heartbeat>;

    /// Process traffic until the connection ends.
    async fn run(&mut self) -> Result<DisconnectReason>;

    /// Resume ids learned on this connection, if any.
    fn resume_info(&self) -> Option<ResumeInfo> {
        None
    }

    /// Close on shutdown.
    async fn close(&mut self) {}
}

fn spawn_heartbeat(name: String, heartbeat: Heartbeat) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = Instant::now() + heartbeat.interval;
        let mut ticker = tokio::time::interval_at(start, heartbeat.interval);
        loop {
            ticker.tick().await;
            if !(heartbeat.beat)() {
                log::debug!("{}: heartbeat stopped, connection gone", name);
                break;
            }
        }
    })
}

/// Keep a connection up until `cancel` fires. Returns `Ok(())` on cancellation,
/// `FatalAuth` when credentials are rejected, `GaveUp` after too many failed attempts.
pub async fn run_with_reconnect<C: Connector>(
    connector: &C,
    policy: ReconnectPolicy,
    cancel: CancellationToken,
) -> Result<()> {
    let name = connector.name().to_string();
    let mut state = ReconnectState::new(policy);
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        state.on_connecting();

        let token = match state.token(Instant::now()) {
            Some(t) => Ok(t.to_string()),
            None => match connector.authenticate().await {
                Ok(token) => {
                    let value = token.value.clone();
                    state.set_token(token);
                    Ok(value)
                }
                Err(e) => Err(e),
            },
        };

        let connected = match token {
            Ok(token) => {
                let resume = state.resume().cloned();
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    r = connector.connect(&token, resume) => r,
                }
            }
            Err(e) => Err(e),
        };

        let decision = match connected {
            Err(e) if e.is_fatal() => {
                log::error!("{}: giving up: {}", name, e);
                return Err(e);
            }
            Err(e) => {
                log::warn!("{}: connect failed: {}", name, e);
                state.on_connect_failed(Instant::now())
            }
            Ok(mut conn) => {
                state.on_connected(Instant::now());
                log::info!("{}: connected", name);
                let heartbeat = conn.heartbeat().map(|hb| spawn_heartbeat(name.clone(), hb));
                let ended = tokio::select! {
                    _ = cancel.cancelled() => None,
                    r = conn.run() => Some(r),
                };
                if let Some(task) = heartbeat {
                    task.abort();
                }
                if let Some(info) = conn.resume_info() {
                    state.set_resume(info);
                }
                let reason = match ended {
                    None => {
                        conn.close().await;
                        return Ok(());
                    }
                    Some(Err(e)) if e.is_fatal() => {
                        log::error!("{}: giving up: {}", name, e);
                        return Err(e);
                    }
                    Some(Err(e)) => DisconnectReason::Error(e.to_string()),
                    Some(Ok(reason)) => reason,
                };
                log::info!("{}: disconnected: {:?}", name, reason);
                state.on_disconnected(&reason, Instant::now())
            }
        };

        match decision {
            Decision::GiveUp => {
                return Err(ChannelError::GaveUp {
                    channel: name,
                    attempts: state.attempts(),
                });
            }
            Decision::Cooldown(delay) => {
                log::warn!("{}: too many quick disconnects, cooling down for {:?}", name, delay);
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Decision::Retry(delay) => {
                log::debug!("{}: reconnecting in {:?}", name, delay);
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
