//! # WebSocket Transport
//!
//! `Transport` over a single WebSocket connection. Every channel is
//! multiplexed on the socket and identified by a ref id equal to its
//! handle id.
//!
//! ## Frames
//!
//! JSON text frames tagged by `type`.
//!
//! Client → server: `join`, `subscribe_changes`, `leave`, `broadcast`,
//! `track`, `untrack`, `heartbeat`.
//!
//! Server → client: `joined`, `event`, `error`, `heartbeat`.
//!
//! ## Tasks
//!
//! - Writer: serializes queued client frames and ticks heartbeats; exits
//!   when the transport is dropped.
//! - Reader: resolves pending joins and forwards events as `Inbound`;
//!   exits when the socket closes, which also closes the inbound receiver.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::channel::{ChangeFilter, ChannelKey};
use super::errors::{RealtimeError, RealtimeResult};
use super::event::RawEvent;
use super::presence::PresenceMeta;
use super::transport::{Inbound, OutboundMessage, Transport, TransportHandle};
use crate::observability::{log_event_with_fields, Event as LogEvent};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingJoins = Arc<Mutex<HashMap<u64, oneshot::Sender<RealtimeResult<()>>>>>;
type LiveHandles = Arc<Mutex<HashMap<u64, TransportHandle>>>;

/// WebSocket transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Server endpoint (`ws://` or `wss://`)
    pub url: String,

    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,

    /// Connect and join timeout in seconds
    pub open_timeout_secs: u64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:4000/realtime".to_string(),
            heartbeat_interval_secs: 30,
            open_timeout_secs: 10,
        }
    }
}

impl WebSocketConfig {
    pub fn validate(&self) -> RealtimeResult<()> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(RealtimeError::ConfigError(format!(
                "websocket.url must start with ws:// or wss://, got '{}'",
                self.url
            )));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(RealtimeError::ConfigError(
                "websocket.heartbeat_interval_secs must be positive".into(),
            ));
        }
        if self.open_timeout_secs == 0 {
            return Err(RealtimeError::ConfigError(
                "websocket.open_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Frame sent to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Join {
        ref_id: u64,
        channel: String,
    },
    SubscribeChanges {
        ref_id: u64,
        entity: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<String>,
    },
    Leave {
        ref_id: u64,
    },
    Broadcast {
        ref_id: u64,
        event: String,
        payload: Value,
    },
    Track {
        ref_id: u64,
        key: String,
        meta: PresenceMeta,
    },
    Untrack {
        ref_id: u64,
        key: String,
    },
    Heartbeat {
        sent_at: i64,
    },
}

/// Frame received from the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Join accepted
    Joined { ref_id: u64 },

    /// Event on a joined channel
    Event {
        ref_id: u64,
        #[serde(default)]
        channel: Option<String>,
        event: RawEvent,
    },

    /// Join rejected, or a channel-less failure
    Error {
        #[serde(default)]
        ref_id: Option<u64>,
        message: String,
    },

    /// Heartbeat reply
    Heartbeat {
        #[serde(default)]
        server_time: Option<i64>,
    },
}

fn frame_for(ref_id: u64, message: OutboundMessage) -> ClientFrame {
    match message {
        OutboundMessage::Broadcast { event, payload } => ClientFrame::Broadcast {
            ref_id,
            event,
            payload,
        },
        OutboundMessage::Track { key, meta } => ClientFrame::Track { ref_id, key, meta },
        OutboundMessage::Untrack { key } => ClientFrame::Untrack { ref_id, key },
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Transport over one WebSocket connection
pub struct WebSocketTransport {
    outbound: mpsc::UnboundedSender<ClientFrame>,
    pending: PendingJoins,
    handles: LiveHandles,
    next_ref: AtomicU64,
    open_timeout: Duration,
}

impl WebSocketTransport {
    /// Connect and start the writer and reader tasks
    ///
    /// The returned receiver yields every inbound event; feed it to
    /// `Realtime::run`.
    pub async fn connect(
        config: &WebSocketConfig,
    ) -> RealtimeResult<(Self, mpsc::UnboundedReceiver<Inbound>)> {
        config.validate()?;
        let open_timeout = Duration::from_secs(config.open_timeout_secs);

        let (socket, _) = tokio::time::timeout(open_timeout, connect_async(config.url.as_str()))
            .await
            .map_err(|_| RealtimeError::TransportUnavailable(format!("connect to {} timed out", config.url)))?
            .map_err(|e| RealtimeError::TransportUnavailable(format!("connect to {}: {}", config.url, e)))?;

        log_event_with_fields(LogEvent::TransportConnected, &[("url", config.url.as_str())]);

        let (sink, source) = socket.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let pending: PendingJoins = Arc::new(Mutex::new(HashMap::new()));
        let handles: LiveHandles = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(write_loop(
            sink,
            outbound_rx,
            Duration::from_secs(config.heartbeat_interval_secs),
        ));
        tokio::spawn(read_loop(
            source,
            Arc::clone(&pending),
            Arc::clone(&handles),
            inbound_tx,
            config.url.clone(),
        ));

        let transport = Self {
            outbound,
            pending,
            handles,
            next_ref: AtomicU64::new(1),
            open_timeout,
        };
        Ok((transport, inbound_rx))
    }

    fn forget(&self, ref_id: u64) {
        locked(&self.pending).remove(&ref_id);
        locked(&self.handles).remove(&ref_id);
    }

    fn enqueue(&self, frame: ClientFrame) -> RealtimeResult<()> {
        self.outbound
            .send(frame)
            .map_err(|_| RealtimeError::TransportUnavailable("connection closed".into()))
    }

    fn live(&self, handle: &TransportHandle) -> RealtimeResult<()> {
        if locked(&self.handles).contains_key(&handle.id) {
            Ok(())
        } else {
            Err(RealtimeError::ChannelClosed)
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, key: &ChannelKey) -> RealtimeResult<TransportHandle> {
        let ref_id = self.next_ref.fetch_add(1, Ordering::Relaxed);
        let handle = TransportHandle {
            id: ref_id,
            key: key.clone(),
        };

        let (joined_tx, joined_rx) = oneshot::channel();
        locked(&self.pending).insert(ref_id, joined_tx);
        // Registered before the join so early events are routed
        locked(&self.handles).insert(ref_id, handle.clone());

        if let Err(e) = self.enqueue(ClientFrame::Join {
            ref_id,
            channel: key.to_string(),
        }) {
            self.forget(ref_id);
            return Err(e);
        }

        let outcome = match tokio::time::timeout(self.open_timeout, joined_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RealtimeError::TransportUnavailable("connection closed".into())),
            Err(_) => Err(RealtimeError::TransportUnavailable(format!("join {} timed out", key))),
        };

        match outcome {
            Ok(()) => Ok(handle),
            Err(e) => {
                self.forget(ref_id);
                // The server may still accept a late join
                let _ = self.enqueue(ClientFrame::Leave { ref_id });
                Err(e)
            }
        }
    }

    async fn subscribe_changes(
        &self,
        handle: &TransportHandle,
        entity: &str,
        filter: Option<&ChangeFilter>,
    ) -> RealtimeResult<()> {
        self.live(handle)?;
        self.enqueue(ClientFrame::SubscribeChanges {
            ref_id: handle.id,
            entity: entity.to_string(),
            filter: filter.map(|f| f.to_string()),
        })
    }

    fn send(&self, handle: &TransportHandle, message: OutboundMessage) -> RealtimeResult<()> {
        self.live(handle)?;
        self.enqueue(frame_for(handle.id, message))
    }

    fn close(&self, handle: TransportHandle) {
        self.forget(handle.id);
        let _ = self.enqueue(ClientFrame::Leave { ref_id: handle.id });
    }
}

async fn write_loop(
    mut sink: SplitSink<Socket, Message>,
    mut frames: mpsc::UnboundedReceiver<ClientFrame>,
    heartbeat: Duration,
) {
    let mut ticker = tokio::time::interval(heartbeat);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        let frame = tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = ticker.tick() => ClientFrame::Heartbeat {
                sent_at: chrono::Utc::now().timestamp(),
            },
        };

        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                log_event_with_fields(LogEvent::SendFailed, &[("error", &e.to_string())]);
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text)).await {
            log_event_with_fields(LogEvent::SendFailed, &[("error", &e.to_string())]);
            break;
        }
    }

    let _ = sink.close().await;
}

async fn read_loop(
    mut source: SplitStream<Socket>,
    pending: PendingJoins,
    handles: LiveHandles,
    inbound: mpsc::UnboundedSender<Inbound>,
    url: String,
) {
    let reason = loop {
        let text = match source.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break "closed by server".to_string(),
            Some(Ok(_)) => continue,
            Some(Err(e)) => break e.to_string(),
        };

        let frame = match serde_json::from_str::<ServerFrame>(&text) {
            Ok(frame) => frame,
            Err(e) => {
                log_event_with_fields(LogEvent::InvalidEvent, &[("error", &e.to_string())]);
                continue;
            }
        };

        match frame {
            ServerFrame::Joined { ref_id } => {
                if let Some(joined) = locked(&pending).remove(&ref_id) {
                    let _ = joined.send(Ok(()));
                }
            }
            ServerFrame::Event { ref_id, event, .. } => {
                let handle = locked(&handles).get(&ref_id).cloned();
                // Events for a left channel are dropped here
                if let Some(handle) = handle {
                    if inbound.send(Inbound { handle, event }).is_err() {
                        break "inbound receiver dropped".to_string();
                    }
                }
            }
            ServerFrame::Error {
                ref_id: Some(ref_id),
                message,
            } => {
                let joined = locked(&pending).remove(&ref_id);
                match joined {
                    Some(joined) => {
                        locked(&handles).remove(&ref_id);
                        let _ = joined.send(Err(RealtimeError::TransportUnavailable(message)));
                    }
                    None => log_event_with_fields(
                        LogEvent::SendFailed,
                        &[("ref_id", &ref_id.to_string()), ("error", &message)],
                    ),
                }
            }
            ServerFrame::Error { ref_id: None, message } => {
                log_event_with_fields(LogEvent::SendFailed, &[("error", &message)]);
            }
            ServerFrame::Heartbeat { .. } => {}
        }
    };

    // Dropping the senders fails every open still waiting
    locked(&pending).clear();
    locked(&handles).clear();
    log_event_with_fields(
        LogEvent::TransportDisconnected,
        &[("url", url.as_str()), ("reason", &reason)],
    );
}
