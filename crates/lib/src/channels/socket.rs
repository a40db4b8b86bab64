//! Socket channel: a persistent WebSocket speaking a small JSON frame protocol, kept alive by
//! the reconnect driver.
//!
//! Server frames: `hello {heartbeatMs}`, `ready {sessionId}`, `message {seq, data}`,
//! `reconnect`, `invalid_session {resumable}`, `heartbeat_ack`.
//! Client frames: `identify {token}`, `resume {token, sessionId, seq}`, `heartbeat {seq}`,
//! `send {conversationId, text | part}`.

use async_trait::async_trait;
use futures_util::stream::{SplitStream, StreamExt};
use futures_util::SinkExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::channels::adapter::{resolve_target, ChannelAdapter};
use crate::channels::inbound::{ContentPart, InboundItem, Meta, NativePayload, SessionKey};
use crate::channels::manager::EnqueueHandle;
use crate::channels::reconnect::{
    run_with_reconnect, CachedToken, Connection, Connector, DisconnectReason, Heartbeat,
    ReconnectPolicy, ResumeInfo,
};
use crate::channels::{ChannelError, Result};
use crate::routing;

pub const SOCKET_CHANNEL_ID: &str = "socket";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// One protocol frame, tagged by `op`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Frame {
    Hello {
        #[serde(rename = "heartbeatMs")]
        heartbeat_ms: u64,
    },
    Ready {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Message {
        #[serde(default)]
        seq: Option<u64>,
        data: SocketMessage,
    },
    Reconnect,
    InvalidSession {
        #[serde(default)]
        resumable: bool,
    },
    HeartbeatAck,
    Identify {
        token: String,
    },
    Resume {
        token: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(default)]
        seq: Option<u64>,
    },
    Heartbeat {
        #[serde(default)]
        seq: Option<u64>,
    },
    Send {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        part: Option<ContentPart>,
    },
}

impl Frame {
    fn to_message(&self) -> Result<Message> {
        Ok(Message::Text(serde_json::to_string(self)?))
    }
}

/// Inbound chat message carried by a `message` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketMessage {
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub parts: Vec<ContentPart>,
    #[serde(default)]
    pub meta: Meta,
}

impl SocketMessage {
    pub fn to_payload(&self) -> NativePayload {
        let mut payload = NativePayload::new(SOCKET_CHANNEL_ID, self.sender_id.clone())
            .with_conversation(self.conversation_id.clone());
        if let Some(text) = self.text.as_ref().filter(|t| !t.trim().is_empty()) {
            payload = payload.with_text(text.clone());
        }
        payload.parts.extend(self.parts.iter().cloned());
        payload.meta = self.meta.clone();
        if let Some(ref id) = self.message_id {
            payload
                .meta
                .insert("reply_to_message_id".into(), serde_json::Value::String(id.clone()));
            payload.reply_handle = Some(id.clone());
        }
        payload
    }
}

/// Session key for a conversation: `socket:<conversation id>`.
pub fn conversation_key(conversation_id: &str) -> SessionKey {
    routing::sender_key(SOCKET_CHANNEL_ID, conversation_id)
}

fn conversation_id(handle: &str) -> &str {
    handle
        .strip_prefix(SOCKET_CHANNEL_ID)
        .and_then(|rest| rest.strip_prefix(':'))
        .unwrap_or(handle)
}

type Outbound = Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>;

fn current_outbound(slot: &Outbound) -> Option<mpsc::UnboundedSender<Message>> {
    match slot.lock() {
        Ok(g) => g.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn set_outbound(slot: &Outbound, tx: Option<mpsc::UnboundedSender<Message>>) {
    match slot.lock() {
        Ok(mut g) => *g = tx,
        Err(poisoned) => *poisoned.into_inner() = tx,
    }
}

struct SocketConnector {
    url: String,
    token: String,
    sink: EnqueueHandle,
    outbound: Outbound,
}

type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

struct SocketConnection {
    reader: WsReader,
    out: mpsc::UnboundedSender<Message>,
    outbound: Outbound,
    heartbeat_interval: Duration,
    session_id: Option<String>,
    seq: Arc<AtomicU64>,
    sink: EnqueueHandle,
    ended: Option<DisconnectReason>,
}

async fn next_frame(reader: &mut WsReader) -> Result<Option<Frame>> {
    while let Some(msg) = reader.next().await {
        match msg.map_err(|e| ChannelError::transient(SOCKET_CHANNEL_ID, e))? {
            Message::Text(text) => match serde_json::from_str::<Frame>(&text) {
                Ok(frame) => return Ok(Some(frame)),
                Err(e) => log::debug!("socket: skipping malformed frame ({}): {}", e, text),
            },
            Message::Close(_) => return Ok(None),
            _ => {}
        }
    }
    Ok(None)
}

#[async_trait]
impl Connector for SocketConnector {
    type Conn = SocketConnection;

    fn name(&self) -> &str {
        SOCKET_CHANNEL_ID
    }

    async fn authenticate(&self) -> Result<CachedToken> {
        if self.token.trim().is_empty() {
            return Err(ChannelError::fatal_auth(SOCKET_CHANNEL_ID, "token not configured"));
        }
        Ok(CachedToken::new(self.token.clone()))
    }

    async fn connect(&self, token: &str, resume: Option<ResumeInfo>) -> Result<SocketConnection> {
        let (ws, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| ChannelError::transient(SOCKET_CHANNEL_ID, e))?;
        let (mut ws_sink, mut reader) = ws.split();

        let hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, next_frame(&mut reader))
            .await
            .map_err(|_| ChannelError::transient(SOCKET_CHANNEL_ID, "no hello from server"))??;
        let heartbeat_ms = match hello {
            Some(Frame::Hello { heartbeat_ms }) => heartbeat_ms,
            other => {
                return Err(ChannelError::protocol(
                    SOCKET_CHANNEL_ID,
                    format!("expected hello, got {:?}", other),
                ))
            }
        };

        let seq = Arc::new(AtomicU64::new(0));
        let opening = match resume {
            Some(info) => {
                seq.store(info.sequence.unwrap_or(0), Ordering::SeqCst);
                log::debug!("socket: resuming session {}", info.session_id);
                Frame::Resume {
                    token: token.to_string(),
                    session_id: info.session_id,
                    seq: info.sequence,
                }
            }
            None => Frame::Identify {
                token: token.to_string(),
            },
        };
        ws_sink
            .send(opening.to_message()?)
            .await
            .map_err(|e| ChannelError::transient(SOCKET_CHANNEL_ID, e))?;

        let mut session_id = None;
        let mut ended = None;
        let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, next_frame(&mut reader))
            .await
            .map_err(|_| ChannelError::transient(SOCKET_CHANNEL_ID, "no ready from server"))??;
        match reply {
            Some(Frame::Ready { session_id: id }) => session_id = Some(id),
            Some(Frame::InvalidSession { resumable }) => {
                ended = Some(DisconnectReason::InvalidSession { resumable })
            }
            Some(Frame::Reconnect) => ended = Some(DisconnectReason::ReconnectRequested),
            Some(other) => {
                return Err(ChannelError::protocol(
                    SOCKET_CHANNEL_ID,
                    format!("expected ready, got {:?}", other),
                ))
            }
            None => return Err(ChannelError::transient(SOCKET_CHANNEL_ID, "closed during handshake")),
        }

        let (out, mut out_rx) = mpsc::unbounded_channel::<Message>();
        // Ends once every sender (connection, heartbeat, outbound slot) is dropped.
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_sink.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });
        set_outbound(&self.outbound, Some(out.clone()));

        Ok(SocketConnection {
            reader,
            out,
            outbound: Arc::clone(&self.outbound),
            heartbeat_interval: Duration::from_millis(heartbeat_ms.max(1)),
            session_id,
            seq,
            sink: self.sink.clone(),
            ended,
        })
    }
}

#[async_trait]
impl Connection for SocketConnection {
    fn heartbeat(&self) -> Option<Heartbeat> {
        let out = self.out.clone();
        let seq = Arc::clone(&self.seq);
        Some(Heartbeat {
            interval: self.heartbeat_interval,
            beat: Arc::new(move || {
                let last = seq.load(Ordering::SeqCst);
                let frame = Frame::Heartbeat {
                    seq: (last > 0).then_some(last),
                };
                match frame.to_message() {
                    Ok(msg) => out.send(msg).is_ok(),
                    Err(_) => false,
                }
            }),
        })
    }

    async fn run(&mut self) -> Result<DisconnectReason> {
        if let Some(reason) = self.ended.take() {
            return Ok(reason);
        }
        loop {
            let frame = match next_frame(&mut self.reader).await? {
                Some(frame) => frame,
                None => return Ok(DisconnectReason::Clean),
            };
            match frame {
                Frame::Message { seq, data } => {
                    if let Some(n) = seq {
                        self.seq.store(n, Ordering::SeqCst);
                    }
                    self.sink.enqueue(data.to_payload());
                }
                Frame::Reconnect => return Ok(DisconnectReason::ReconnectRequested),
                Frame::InvalidSession { resumable } => {
                    return Ok(DisconnectReason::InvalidSession { resumable })
                }
                Frame::HeartbeatAck => {}
                other => log::debug!("socket: ignoring unexpected frame {:?}", other),
            }
        }
    }

    fn resume_info(&self) -> Option<ResumeInfo> {
        let last = self.seq.load(Ordering::SeqCst);
        self.session_id.as_ref().map(|id| ResumeInfo {
            session_id: id.clone(),
            sequence: (last > 0).then_some(last),
        })
    }

    async fn close(&mut self) {
        let _ = self.out.send(Message::Close(None));
    }
}

impl Drop for SocketConnection {
    fn drop(&mut self) {
        if let Some(current) = current_outbound(&self.outbound) {
            if current.same_channel(&self.out) {
                set_outbound(&self.outbound, None);
            }
        }
    }
}

struct ConnectionTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Persistent WebSocket channel.
pub struct SocketChannel {
    url: String,
    token: Option<String>,
    policy: ReconnectPolicy,
    outbound: Outbound,
    task: tokio::sync::Mutex<Option<ConnectionTask>>,
}

impl SocketChannel {
    pub fn new(url: impl Into<String>, token: Option<String>, policy: ReconnectPolicy) -> Self {
        Self {
            url: url.into(),
            token,
            policy,
            outbound: Arc::new(Mutex::new(None)),
            task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        current_outbound(&self.outbound).map_or(false, |tx| !tx.is_closed())
    }

    fn push(&self, frame: Frame) -> Result<()> {
        let tx = current_outbound(&self.outbound)
            .ok_or_else(|| ChannelError::transient(SOCKET_CHANNEL_ID, "not connected"))?;
        tx.send(frame.to_message()?)
            .map_err(|_| ChannelError::transient(SOCKET_CHANNEL_ID, "connection closed"))
    }
}

#[async_trait]
impl ChannelAdapter for SocketChannel {
    fn id(&self) -> &str {
        SOCKET_CHANNEL_ID
    }

    async fn start(&self, sink: EnqueueHandle) -> Result<()> {
        let token = self.token.clone().unwrap_or_default();
        if token.trim().is_empty() {
            return Err(ChannelError::StartFailed {
                channel: SOCKET_CHANNEL_ID.to_string(),
                reason: "token not configured".to_string(),
            });
        }
        let mut task = self.task.lock().await;
        if let Some(ref current) = *task {
            if !current.handle.is_finished() {
                return Ok(());
            }
            log::info!("socket channel: previous connection loop has ended, starting over");
        }
        let fault_sink = sink.clone();
        let connector = SocketConnector {
            url: self.url.clone(),
            token,
            sink,
            outbound: Arc::clone(&self.outbound),
        };
        let policy = self.policy.clone();
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            match run_with_reconnect(&connector, policy, loop_cancel).await {
                Ok(()) => log::info!("socket channel: connection loop stopped"),
                Err(e) => fault_sink.report_fatal(&e),
            }
        });
        *task = Some(ConnectionTask { cancel, handle });
        log::info!("socket channel: connecting to {}", self.url);
        Ok(())
    }

    async fn stop(&self) {
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            task.cancel.cancel();
            let _ = task.handle.await;
        }
        set_outbound(&self.outbound, None);
    }

    fn debounce_key(&self, item: &InboundItem) -> SessionKey {
        match item {
            InboundItem::Native(p) => {
                conversation_key(p.conversation_id.as_deref().unwrap_or(&p.sender_id))
            }
            InboundItem::Request(r) => r.session_id.clone(),
        }
    }

    async fn send(&self, handle: &str, text: &str, meta: &Meta) -> Result<()> {
        self.push(Frame::Send {
            conversation_id: conversation_id(resolve_target(handle, meta)).to_string(),
            text: Some(text.to_string()),
            part: None,
        })
    }

    async fn send_media(&self, handle: &str, part: &ContentPart, meta: &Meta) -> Result<()> {
        self.push(Frame::Send {
            conversation_id: conversation_id(resolve_target(handle, meta)).to_string(),
            text: None,
            part: Some(part.clone()),
        })
    }
}
