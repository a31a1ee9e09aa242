//! One upgraded socket and the tasks that drive it.
//!
//! # Responsibilities
//! - Track connection state (Connecting → Open → Closing → Closed)
//! - Read frames and dispatch them to the endpoint handler
//! - Drain the outbound queue onto the socket under a write deadline
//! - Ping the peer periodically and drop it when it goes quiet
//!
//! # Tasks
//! ```text
//!            ┌──────────┐  on_message   ┌─────────┐
//! socket ───▶│  reader  │──────────────▶│ handler │
//!            └────┬─────┘               └─────────┘
//!                 │ pong replies
//!                 ▼
//!            ┌──────────┐◀── outbound queue ◀── Hub broadcast / send_*
//! socket ◀───│  writer  │
//!            └──────────┘◀── control queue  ◀── ping timer
//! ```
//!
//! # Design Decisions
//! - The state lives in a watch channel: its internal lock is the single
//!   exclusion point for `close()`, and every task can await transitions
//! - The writer is the only task that touches the write half, so the close
//!   frame is written exactly once, after its loop ends
//! - The outbound sender sits behind a mutex the Hub can empty; taking it
//!   out is what closes the queue

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};

use crate::observability::metrics;
use crate::ws::frame::{self, FrameError, Opcode, ProtocolViolation, CLOSE_NORMAL};
use crate::ws::handler::Message;
use crate::ws::hub::HubHandle;

/// Slots reserved for ping and pong frames.
const CONTROL_CAPACITY: usize = 16;

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ws-{}", self.0)
    }
}

/// Lifecycle state. Ordered: later states compare greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Errors returned by the `send_*` family.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("connection is not open")]
    ConnectionClosed,

    #[error("outbound queue is full")]
    QueueFull,

    #[error("cannot serialise message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Receiving ends owned by the writer task.
pub(crate) struct Channels {
    pub(crate) outbound: mpsc::Receiver<Bytes>,
    pub(crate) control: mpsc::Receiver<Bytes>,
}

struct Shared {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    control: mpsc::Sender<Bytes>,
    hub: HubHandle,
}

/// Handle to a live connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("path", &self.path())
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Create a connection in the `Connecting` state, without any tasks.
    pub(crate) fn new(hub: HubHandle, peer: Option<SocketAddr>, capacity: usize) -> (Self, Channels) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Connecting);

        let conn = Self {
            inner: Arc::new(Shared {
                id: ConnectionId::next(),
                peer,
                state,
                outbound: Mutex::new(Some(outbound_tx)),
                control: control_tx,
                hub,
            }),
        };
        let channels = Channels {
            outbound: outbound_rx,
            control: control_rx,
        };
        (conn, channels)
    }

    /// Drive an upgraded socket: open it, register with the Hub and start
    /// the reader, writer and ping tasks.
    pub async fn start<S>(io: S, peer: Option<SocketAddr>, hub: HubHandle) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let settings = hub.endpoint().settings.clone();
        let (conn, channels) = Connection::new(hub, peer, settings.outbound_capacity);
        let (read_half, write_half) = tokio::io::split(io);

        tokio::spawn(write_loop(conn.clone(), write_half, channels, settings.write_timeout));

        if let Err(e) = conn.hub().register(conn.clone()).await {
            tracing::warn!(connection_id = %conn.id(), error = %e, "Hub registration failed");
            conn.close();
            return conn;
        }

        // The Hub opens the connection as it adds it to the set.
        let mut state = conn.inner.state.subscribe();
        reached(&mut state, ConnectionState::Open).await;
        metrics::connection_opened(conn.path());
        tracing::debug!(
            connection_id = %conn.id(),
            path = %conn.path(),
            peer = ?peer,
            "Connection open"
        );

        tokio::spawn(ping_loop(conn.clone(), settings.ping_interval));
        tokio::spawn(read_loop(
            conn.clone(),
            BufReader::new(read_half),
            settings.max_message_size,
            settings.read_deadline(),
        ));
        conn
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Endpoint path this connection was upgraded on.
    pub fn path(&self) -> &str {
        self.inner.hub.path()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// The Hub this connection belongs to.
    pub fn hub(&self) -> &HubHandle {
        &self.inner.hub
    }

    /// Queue a message for the writer without waiting.
    pub fn send(&self, message: Message) -> Result<(), SendError> {
        if self.state() != ConnectionState::Open {
            return Err(SendError::ConnectionClosed);
        }
        self.try_enqueue(message.encode()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::ConnectionClosed,
        })
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), SendError> {
        self.send(Message::Text(text.into()))
    }

    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<(), SendError> {
        self.send(Message::Binary(data.into()))
    }

    pub fn send_json<T: Serialize>(&self, value: &T) -> Result<(), SendError> {
        let text = serde_json::to_string(value)?;
        self.send(Message::Text(text))
    }

    /// Start a normal closure. Safe to call any number of times from any
    /// task; only the first call has an effect.
    pub fn close(&self) {
        if self.begin_close() {
            tracing::debug!(connection_id = %self.id(), path = %self.path(), "Connection closing");
            self.inner.hub.unregister(self.id());
        }
    }

    /// `Connecting → Open`, done by the Hub once the connection is in its
    /// set. A connection already closing stays closing.
    pub(crate) fn mark_open(&self) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Open;
                true
            } else {
                false
            }
        })
    }

    /// Move to `Closing`. Returns true for the single caller that made the
    /// transition.
    fn begin_close(&self) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state < ConnectionState::Closing {
                *state = ConnectionState::Closing;
                true
            } else {
                false
            }
        })
    }

    fn mark_closed(&self) {
        self.inner.state.send_replace(ConnectionState::Closed);
    }

    /// Non-blocking enqueue used by the Hub's broadcast pass.
    pub(crate) fn try_enqueue(&self, frame: Bytes) -> Result<(), mpsc::error::TrySendError<Bytes>> {
        let guard = self.inner.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) => tx.try_send(frame),
            None => Err(mpsc::error::TrySendError::Closed(frame)),
        }
    }

    /// Drop the outbound sender. Returns false if it was already gone.
    pub(crate) fn close_queue(&self) -> bool {
        self.inner
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    fn send_control(&self, frame: Bytes) {
        if let Err(e) = self.inner.control.try_send(frame) {
            tracing::debug!(connection_id = %self.id(), error = %e, "Control frame dropped");
        }
    }
}

/// Resolve once the state has reached `target` or the sender is gone.
async fn reached(state: &mut watch::Receiver<ConnectionState>, target: ConnectionState) {
    loop {
        if *state.borrow_and_update() >= target {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

async fn read_loop<R>(conn: Connection, mut reader: R, max_message_size: usize, deadline: Duration)
where
    R: AsyncRead + Unpin,
{
    let handler = Arc::clone(&conn.hub().endpoint().handler);
    let mut state = conn.inner.state.subscribe();

    let reason = loop {
        let next = tokio::select! {
            next = time::timeout(deadline, frame::decode(&mut reader, max_message_size)) => next,
            _ = reached(&mut state, ConnectionState::Closed) => break "closed",
        };

        let frame = match next {
            Ok(Ok(frame)) => frame,
            Err(_) => {
                tracing::info!(
                    connection_id = %conn.id(),
                    deadline = ?deadline,
                    "Read deadline expired"
                );
                break "keepalive timeout";
            }
            Ok(Err(FrameError::Io(e))) => {
                tracing::debug!(connection_id = %conn.id(), error = %e, "Read failed");
                break "read error";
            }
            Ok(Err(FrameError::TooLarge { len, max })) => {
                tracing::warn!(connection_id = %conn.id(), len, max, "Frame too large");
                metrics::protocol_error("too_large");
                break "frame too large";
            }
            Ok(Err(FrameError::Protocol(violation))) => {
                tracing::warn!(connection_id = %conn.id(), error = %violation, "Protocol violation");
                metrics::protocol_error(violation.kind());
                break "protocol violation";
            }
        };

        metrics::frame_received(frame.opcode);

        match frame.opcode {
            Opcode::Ping => conn.send_control(frame::encode(Opcode::Pong, true, &frame.payload)),
            Opcode::Pong => {
                tracing::trace!(connection_id = %conn.id(), "Pong received");
            }
            Opcode::Close => {
                tracing::debug!(
                    connection_id = %conn.id(),
                    code = ?frame::close_code(&frame.payload),
                    "Peer sent close"
                );
                break "peer closed";
            }
            Opcode::Text if frame.fin => match String::from_utf8(frame.payload.to_vec()) {
                Ok(text) => handler.on_message(&conn, Message::Text(text)),
                Err(_) => {
                    let violation = ProtocolViolation::InvalidUtf8;
                    tracing::warn!(connection_id = %conn.id(), error = %violation, "Protocol violation");
                    metrics::protocol_error(violation.kind());
                    break "protocol violation";
                }
            },
            Opcode::Binary if frame.fin => handler.on_message(&conn, Message::Binary(frame.payload)),
            opcode => {
                // Fragmented messages are not reassembled.
                tracing::warn!(
                    connection_id = %conn.id(),
                    opcode = opcode.as_str(),
                    fin = frame.fin,
                    "Fragment delivered unassembled"
                );
                handler.on_message(
                    &conn,
                    Message::Fragment {
                        opcode,
                        fin: frame.fin,
                        payload: frame.payload,
                    },
                );
            }
        }
    };

    tracing::debug!(connection_id = %conn.id(), reason, "Reader stopped");
    conn.close();
}

enum WriterExit {
    QueueClosed,
    Closing,
    Failed(std::io::Error),
}

async fn write_loop<W>(conn: Connection, mut writer: W, mut channels: Channels, write_timeout: Duration)
where
    W: AsyncWrite + Unpin,
{
    let mut state = conn.inner.state.subscribe();

    let exit = loop {
        let frame = tokio::select! {
            biased;
            Some(frame) = channels.control.recv() => frame,
            _ = reached(&mut state, ConnectionState::Closing) => break WriterExit::Closing,
            next = channels.outbound.recv() => match next {
                Some(frame) => frame,
                None => break WriterExit::QueueClosed,
            },
        };

        if let Err(e) = write_frame(&mut writer, &frame, write_timeout).await {
            break WriterExit::Failed(e);
        }
    };

    match exit {
        WriterExit::Failed(e) => {
            tracing::debug!(connection_id = %conn.id(), error = %e, "Write failed");
            if conn.begin_close() {
                conn.hub().unregister(conn.id());
            }
        }
        WriterExit::QueueClosed | WriterExit::Closing => {
            // The Hub only empties the queue after removing us, so no
            // unregister is needed on that path.
            conn.begin_close();
            let close = frame::encode_close(CLOSE_NORMAL, "");
            let flushed = match flush_pending(&mut writer, &mut channels, write_timeout).await {
                Ok(()) => write_frame(&mut writer, &close, write_timeout).await,
                Err(e) => Err(e),
            };
            if let Err(e) = flushed {
                tracing::debug!(connection_id = %conn.id(), error = %e, "Close frame not delivered");
            }
        }
    }

    let _ = time::timeout(write_timeout, writer.shutdown()).await;
    drop(writer);
    conn.mark_closed();
    metrics::connection_closed(conn.path());
    tracing::debug!(connection_id = %conn.id(), path = %conn.path(), "Connection closed");
}

/// Write what was queued when the close began, control frames first.
/// Frames a broadcast adds while this runs are left behind.
async fn flush_pending<W>(writer: &mut W, channels: &mut Channels, limit: Duration) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    for _ in 0..channels.control.len() {
        match channels.control.try_recv() {
            Ok(frame) => write_frame(writer, &frame, limit).await?,
            Err(_) => break,
        }
    }
    for _ in 0..channels.outbound.len() {
        match channels.outbound.try_recv() {
            Ok(frame) => write_frame(writer, &frame, limit).await?,
            Err(_) => break,
        }
    }
    Ok(())
}

async fn write_frame<W>(writer: &mut W, frame: &[u8], limit: Duration) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let write = async {
        writer.write_all(frame).await?;
        writer.flush().await
    };
    match time::timeout(limit, write).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "write deadline exceeded",
        )),
    }
}

async fn ping_loop(conn: Connection, interval: Duration) {
    let mut state = conn.inner.state.subscribe();
    let mut ticker = time::interval_at(Instant::now() + interval, interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                conn.send_control(frame::encode(Opcode::Ping, true, b""));
            }
            _ = reached(&mut state, ConnectionState::Closing) => break,
        }
    }
}
