//! Control channel over a WebSocket
//!
//! The channel is shared by the control plane (JSON text frames) and the
//! data plane (binary frames) for the whole lifetime of a tunnel session.
//! A single reader task tags inbound frames into two queues; writes are
//! serialized by a writer mutex so text and binary frames never interleave.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use portico_proto::{ControlMessage, MAX_FRAME_BYTES};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};

use crate::stream::VirtualStream;

/// Byte stream the channel runs over (TLS on the public port, plain TCP in dev mode)
pub trait RawIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawIo for T {}

/// Boxed stream handed to the channel after the HTTP upgrade
pub type TransportIo = Box<dyn RawIo>;

type Ws = WebSocketStream<TransportIo>;

/// Channel errors
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,

    #[error("write deadline exceeded")]
    WriteTimeout,

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("encode error: {0}")]
    Encode(String),
}

/// Timing and sizing knobs for a control channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Period between server keepalive pings
    pub ping_interval: Duration,
    /// Deadline for the next inbound frame; re-armed by every frame
    pub read_deadline: Duration,
    /// Per-frame write deadline
    pub write_deadline: Duration,
    /// Maximum inbound frame size; oversize frames close the channel
    pub max_frame_bytes: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        let read_deadline = Duration::from_secs(60);
        Self {
            // 0.9x the read deadline, so a live peer always beats it
            ping_interval: read_deadline * 9 / 10,
            read_deadline,
            write_deadline: Duration::from_secs(10),
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }
}

impl ChannelConfig {
    /// WebSocket protocol limits derived from this config
    pub fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_frame_bytes);
        config.max_frame_size = Some(self.max_frame_bytes);
        config
    }
}

/// A live control channel to one tunnel client
pub struct ControlChannel {
    connection_id: String,
    remote_addr: SocketAddr,
    config: ChannelConfig,
    /// Writer mutex; every outbound frame goes through here
    sink: Mutex<SplitSink<Ws, Message>>,
    /// FIFO of inbound binary frames, filled by the reader task
    binary_rx: Mutex<mpsc::Receiver<Bytes>>,
    /// Serializes proxied requests; one in-flight virtual stream per session
    stream_lock: Arc<Mutex<()>>,
    closed: AtomicBool,
    close_sent: AtomicBool,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("connection_id", &self.connection_id)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ControlChannel {
    /// Take ownership of an upgraded WebSocket and start the reader and
    /// keepalive tasks. Returns the channel plus the queue of parsed
    /// control messages for the session handler.
    pub fn start(
        ws: Ws,
        remote_addr: SocketAddr,
        config: ChannelConfig,
    ) -> (Arc<Self>, mpsc::Receiver<ControlMessage>) {
        let connection_id = format!("chan-{}", uuid::Uuid::new_v4());

        let (sink, source) = ws.split();
        let (control_tx, control_rx) = mpsc::channel(32);
        let (binary_tx, binary_rx) = mpsc::channel(256);

        let channel = Arc::new(Self {
            connection_id,
            remote_addr,
            config,
            sink: Mutex::new(sink),
            binary_rx: Mutex::new(binary_rx),
            stream_lock: Arc::new(Mutex::new(())),
            closed: AtomicBool::new(false),
            close_sent: AtomicBool::new(false),
        });

        tokio::spawn(Self::reader_task(
            source,
            control_tx,
            binary_tx,
            channel.clone(),
        ));
        tokio::spawn(Self::keepalive_task(channel.clone()));

        (channel, control_rx)
    }

    /// Single reader loop: tags frames into the control and binary queues.
    /// Every inbound frame re-arms the read deadline.
    async fn reader_task(
        mut source: SplitStream<Ws>,
        control_tx: mpsc::Sender<ControlMessage>,
        binary_tx: mpsc::Sender<Bytes>,
        channel: Arc<ControlChannel>,
    ) {
        let conn_id = channel.connection_id.clone();

        loop {
            let frame = match timeout(channel.config.read_deadline, source.next()).await {
                Err(_) => {
                    debug!("[{}] read deadline expired", conn_id);
                    break;
                }
                Ok(None) => {
                    debug!("[{}] connection closed by peer", conn_id);
                    break;
                }
                Ok(Some(Err(e))) => {
                    debug!("[{}] read error: {}", conn_id, e);
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            match frame {
                Message::Text(text) => match serde_json::from_str::<ControlMessage>(&text) {
                    Ok(msg) => {
                        if control_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("[{}] malformed control message: {}", conn_id, e);
                        break;
                    }
                },
                Message::Binary(data) => {
                    // Bounded queue: a client flooding data frames stalls
                    // this loop and backpressures through TCP.
                    if binary_tx.send(Bytes::from(data)).await.is_err() {
                        break;
                    }
                }
                Message::Ping(_) => {
                    // Pong reply is queued by tungstenite
                    trace!("[{}] ping received", conn_id);
                }
                Message::Pong(_) => {
                    trace!("[{}] pong received", conn_id);
                }
                Message::Close(_) => {
                    debug!("[{}] close frame received", conn_id);
                    break;
                }
                _ => {}
            }
        }

        channel.closed.store(true, Ordering::SeqCst);
        debug!("[{}] reader task ended", conn_id);
    }

    /// Periodic WebSocket-level ping so an idle but healthy client keeps
    /// beating the read deadline.
    async fn keepalive_task(channel: Arc<ControlChannel>) {
        let mut interval = tokio::time::interval(channel.config.ping_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;

        loop {
            interval.tick().await;

            if channel.is_closed() {
                break;
            }
            if channel.write_frame(Message::Ping(Vec::new())).await.is_err() {
                break;
            }
            trace!("[{}] keepalive ping sent", channel.connection_id);
        }

        debug!("[{}] keepalive task ended", channel.connection_id);
    }

    async fn write_frame(&self, frame: Message) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        let mut sink = self.sink.lock().await;
        match timeout(self.config.write_deadline, sink.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.closed.store(true, Ordering::SeqCst);
                Err(ChannelError::WebSocket(e.to_string()))
            }
            Err(_) => {
                self.closed.store(true, Ordering::SeqCst);
                Err(ChannelError::WriteTimeout)
            }
        }
    }

    /// Send one control message as a single text frame
    pub async fn send_control(&self, msg: &ControlMessage) -> Result<(), ChannelError> {
        let text = serde_json::to_string(msg).map_err(|e| ChannelError::Encode(e.to_string()))?;
        self.write_frame(Message::Text(text)).await
    }

    /// Send opaque data as exactly one binary frame
    pub async fn send_binary(&self, data: &[u8]) -> Result<(), ChannelError> {
        self.write_frame(Message::Binary(data.to_vec())).await
    }

    /// Pop the next inbound binary frame; `None` once the channel is closed
    /// and the queue is drained.
    pub(crate) async fn recv_binary(&self) -> Option<Bytes> {
        let mut rx = self.binary_rx.lock().await;
        rx.recv().await
    }

    /// Open the per-request byte-stream view over this channel.
    ///
    /// Blocks until no other request is in flight on this session: the
    /// wire carries raw HTTP bytes with no framing of its own, so two
    /// interleaved requests would corrupt both.
    pub async fn open_stream(self: Arc<Self>) -> Result<VirtualStream, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        let permit = self.stream_lock.clone().lock_owned().await;

        // Drop frames left over from a previous aborted request so the
        // next exchange starts clean.
        {
            let mut rx = self.binary_rx.lock().await;
            while rx.try_recv().is_ok() {}
        }

        Ok(VirtualStream::new(self, permit))
    }

    /// Close the channel. Idempotent: exactly one close frame is sent no
    /// matter how many times this is called.
    pub async fn close(&self) {
        if self.close_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed.store(true, Ordering::SeqCst);

        let mut sink = self.sink.lock().await;
        let _ = timeout(self.config.write_deadline, sink.send(Message::Close(None))).await;
        debug!("[{}] channel closed", self.connection_id);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}
