//! Per-endpoint connection registry and broadcast fan-out.
//!
//! # Responsibilities
//! - Own the set of live connections for one endpoint
//! - Invoke connect/disconnect callbacks
//! - Fan broadcasts out to every connection's outbound queue
//!
//! # Data Flow
//! ```text
//! Connection::start ──register──┐
//! Connection::close ─unregister─┼──▶ Hub control loop ──try_send──▶ outbound queues
//! HubHandle::broadcast ─────────┘         │
//!                                         └──▶ live count (watch)
//! ```
//!
//! # Design Decisions
//! - The connection set is touched only by the control loop; message
//!   passing replaces a lock around it
//! - A connection whose queue is full during a broadcast is evicted in the
//!   same pass. Throughput for everyone beats waiting on one slow reader
//! - Unregister intake is unbounded so a close never has to wait and can
//!   never be lost

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use crate::observability::metrics;
use crate::ws::connection::{Connection, ConnectionId};
use crate::ws::handler::Message;
use crate::ws::registry::Endpoint;

const REGISTER_CAPACITY: usize = 64;
const BROADCAST_CAPACITY: usize = 1024;

/// Errors from the Hub intake.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    #[error("hub for {0} has stopped")]
    Stopped(String),

    #[error("broadcast intake for {0} is full")]
    Busy(String),
}

/// Outcome of one broadcast pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Connections whose queue accepted the frame.
    pub delivered: usize,
    /// Connections dropped because their queue was full or closed.
    pub evicted: usize,
}

struct BroadcastJob {
    frame: Bytes,
    done: Option<oneshot::Sender<Delivery>>,
}

/// Cloneable intake for a running Hub.
#[derive(Clone)]
pub struct HubHandle {
    endpoint: Arc<Endpoint>,
    register_tx: mpsc::Sender<Connection>,
    unregister_tx: mpsc::UnboundedSender<ConnectionId>,
    broadcast_tx: mpsc::Sender<BroadcastJob>,
    live: watch::Receiver<usize>,
}

impl std::fmt::Debug for HubHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubHandle")
            .field("path", &self.path())
            .field("live", &self.live_count())
            .finish()
    }
}

impl HubHandle {
    pub fn path(&self) -> &str {
        &self.endpoint.path
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Connection count as last published by the control loop.
    pub fn live_count(&self) -> usize {
        *self.live.borrow()
    }

    pub async fn register(&self, conn: Connection) -> Result<(), HubError> {
        self.register_tx
            .send(conn)
            .await
            .map_err(|_| HubError::Stopped(self.path().to_string()))
    }

    /// Ask the Hub to drop a connection. Unknown ids are ignored.
    pub fn unregister(&self, id: ConnectionId) {
        if self.unregister_tx.send(id).is_err() {
            tracing::debug!(connection_id = %id, path = %self.path(), "Hub gone, unregister skipped");
        }
    }

    /// Broadcast and wait for the fan-out pass to finish.
    pub async fn broadcast(&self, message: Message) -> Result<Delivery, HubError> {
        let (done_tx, done_rx) = oneshot::channel();
        let job = BroadcastJob {
            frame: message.encode(),
            done: Some(done_tx),
        };
        self.broadcast_tx
            .send(job)
            .await
            .map_err(|_| HubError::Stopped(self.path().to_string()))?;
        done_rx
            .await
            .map_err(|_| HubError::Stopped(self.path().to_string()))
    }

    /// Queue a broadcast without waiting. Usable from synchronous callbacks.
    pub fn try_broadcast(&self, message: Message) -> Result<(), HubError> {
        let job = BroadcastJob {
            frame: message.encode(),
            done: None,
        };
        self.broadcast_tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => HubError::Busy(self.path().to_string()),
            mpsc::error::TrySendError::Closed(_) => HubError::Stopped(self.path().to_string()),
        })
    }
}

/// The control loop state. Lives inside its own task.
pub struct Hub {
    endpoint: Arc<Endpoint>,
    connections: HashMap<ConnectionId, Connection>,
    register_rx: mpsc::Receiver<Connection>,
    unregister_rx: mpsc::UnboundedReceiver<ConnectionId>,
    broadcast_rx: mpsc::Receiver<BroadcastJob>,
    live: watch::Sender<usize>,
}

impl Hub {
    /// Start the control loop for `endpoint` and return its intake.
    pub fn spawn(endpoint: Arc<Endpoint>) -> HubHandle {
        let (register_tx, register_rx) = mpsc::channel(REGISTER_CAPACITY);
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_CAPACITY);
        let (live_tx, live_rx) = watch::channel(0);

        let hub = Hub {
            endpoint: Arc::clone(&endpoint),
            connections: HashMap::new(),
            register_rx,
            unregister_rx,
            broadcast_rx,
            live: live_tx,
        };
        tokio::spawn(hub.run());

        HubHandle {
            endpoint,
            register_tx,
            unregister_tx,
            broadcast_tx,
            live: live_rx,
        }
    }

    async fn run(mut self) {
        tracing::info!(path = %self.endpoint.path, "Hub started");

        loop {
            tokio::select! {
                // Membership changes queued before a broadcast apply first.
                biased;
                Some(conn) = self.register_rx.recv() => self.add(conn),
                Some(id) = self.unregister_rx.recv() => self.remove(id),
                Some(job) = self.broadcast_rx.recv() => {
                    let delivery = self.fan_out(&job.frame);
                    if let Some(done) = job.done {
                        let _ = done.send(delivery);
                    }
                }
                else => break,
            }
        }

        tracing::info!(path = %self.endpoint.path, "Hub stopped");
    }

    fn add(&mut self, conn: Connection) {
        conn.mark_open();
        self.connections.insert(conn.id(), conn.clone());
        let live = self.publish();
        tracing::debug!(connection_id = %conn.id(), path = %self.endpoint.path, live, "Registered");
        self.endpoint.handler.on_connect(&conn, live);
    }

    /// Remove, notify, then close the queue. Closing last means a broadcast
    /// can never target a queue that is already closed.
    fn remove(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.remove(&id) else {
            return;
        };
        let live = self.publish();
        tracing::debug!(connection_id = %id, path = %self.endpoint.path, live, "Unregistered");
        self.endpoint.handler.on_disconnect(&conn, live);
        conn.close_queue();
    }

    fn fan_out(&mut self, frame: &Bytes) -> Delivery {
        let mut delivery = Delivery::default();
        let mut stalled = Vec::new();

        for (id, conn) in &self.connections {
            match conn.try_enqueue(frame.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(_) => stalled.push(*id),
            }
        }

        for id in stalled {
            tracing::warn!(connection_id = %id, path = %self.endpoint.path, "Outbound queue full, evicting");
            metrics::connection_evicted(&self.endpoint.path);
            self.remove(id);
            delivery.evicted += 1;
        }

        metrics::broadcast_sent(&self.endpoint.path);
        delivery
    }

    fn publish(&self) -> usize {
        let live = self.connections.len();
        self.live.send_replace(live);
        metrics::set_live_connections(&self.endpoint.path, live);
        live
    }
}
