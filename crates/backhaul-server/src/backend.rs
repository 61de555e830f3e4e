//! One physical agent stream
//!
//! A `Backend` owns the writer task for its stream, the table of logical
//! connections multiplexed over it and the dials still waiting for an answer.
//! Every task spawned on behalf of the stream is tracked here and joined by
//! [`Backend::shutdown`].

use crate::connection::Inbound;
use crate::pending::PendingDials;
use backhaul_metrics::ServerMetrics;
use backhaul_proto::{ConnectId, Frame, Packet, QUEUE_FULL};
use backhaul_transport::BoxFrameSink;
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

pub type BackendId = u64;

static NEXT_BACKEND_ID: AtomicU64 = AtomicU64::new(1);

const SINK_CLOSE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);

/// Error returned when the backend's writer is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("backend stream closed")]
pub struct BackendClosed;

/// Registration details of a backend
#[derive(Debug, Clone)]
pub struct BackendInfo {
    pub agent_id: String,
    /// Destination hosts the agent advertised
    pub identifiers: Vec<String>,
    pub peer_addr: Option<SocketAddr>,
}

/// Slot in the connection-token table
#[derive(Debug)]
pub(crate) struct ConnectionSlot {
    /// Bounded; data never takes the last free place, so the close
    /// notification always fits
    pub inbound: mpsc::Sender<Inbound>,
    pub address: String,
}

impl ConnectionSlot {
    /// Tell the handle the connection ended
    pub(crate) fn close(self, error: Option<String>) {
        // The handle may already be gone; its drop released the slot
        let _ = self.inbound.try_send(Inbound::Closed(error));
    }
}

/// What became of bytes handed to a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Queued,
    /// No such connection token
    Unknown,
    /// The consumer fell too far behind; the connection was closed
    Overflow,
}

pub struct Backend {
    id: BackendId,
    info: BackendInfo,
    connected_at: chrono::DateTime<chrono::Utc>,
    /// Ordered frames (data, graceful close); bounded for backpressure
    outbound: mpsc::Sender<Frame>,
    /// Control frames that must never wait (dial, cancel, abortive close)
    control: mpsc::UnboundedSender<Frame>,
    connections: Mutex<HashMap<ConnectId, ConnectionSlot>>,
    pub(crate) pending: PendingDials,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    metrics: Arc<ServerMetrics>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("id", &self.id)
            .field("agent_id", &self.info.agent_id)
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}

impl Backend {
    /// Wrap the sending half of an agent stream and start its writer task.
    ///
    /// `parent` cancels the backend along with everything above it.
    pub fn new(
        info: BackendInfo,
        sink: BoxFrameSink,
        capacity: usize,
        parent: &CancellationToken,
        metrics: Arc<ServerMetrics>,
    ) -> Arc<Self> {
        let (outbound, outbound_rx) = mpsc::channel(capacity);
        let (control, control_rx) = mpsc::unbounded_channel();

        let backend = Arc::new(Self {
            id: NEXT_BACKEND_ID.fetch_add(1, Ordering::Relaxed),
            info,
            connected_at: chrono::Utc::now(),
            outbound,
            control,
            connections: Mutex::new(HashMap::new()),
            pending: PendingDials::new(metrics.clone()),
            tasks: TaskTracker::new(),
            shutdown: parent.child_token(),
            metrics,
        });

        backend.tasks.spawn(run_writer(
            backend.id,
            sink,
            outbound_rx,
            control_rx,
            backend.shutdown.clone(),
        ));

        backend
    }

    pub fn id(&self) -> BackendId {
        self.id
    }

    pub fn agent_id(&self) -> &str {
        &self.info.agent_id
    }

    pub fn info(&self) -> &BackendInfo {
        &self.info
    }

    pub fn connected_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.connected_at
    }

    /// Whether this backend advertised `host` as a destination it serves
    pub fn serves_host(&self, host: &str) -> bool {
        self.info
            .identifiers
            .iter()
            .any(|identifier| identifier.eq_ignore_ascii_case(host))
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once the backend is shutting down
    pub fn closed(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Queue a frame behind earlier ordered frames, waiting for capacity
    pub async fn send(&self, frame: Frame) -> Result<(), BackendClosed> {
        self.outbound.send(frame).await.map_err(|_| BackendClosed)
    }

    /// Queue a control frame without waiting
    pub fn send_control(&self, frame: Frame) -> Result<(), BackendClosed> {
        self.control.send(frame).map_err(|_| BackendClosed)
    }

    pub(crate) fn outbound(&self) -> mpsc::Sender<Frame> {
        self.outbound.clone()
    }

    /// Spawn a task owned by this backend
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    /// Tasks owned by this backend that have not finished
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn insert_connection(&self, connect_id: ConnectId, slot: ConnectionSlot) -> bool {
        let mut connections = self.connections.lock().unwrap();
        if connections.contains_key(&connect_id) {
            return false;
        }
        connections.insert(connect_id, slot);
        self.metrics.established_connections().inc();
        true
    }

    /// Queue inbound bytes for a connection without waiting.
    ///
    /// The backend reader serves every connection on the stream, so a
    /// consumer that stops reading loses its connection instead of stalling
    /// the others.
    pub(crate) fn deliver(&self, connect_id: ConnectId, data: Bytes) -> Delivery {
        {
            let connections = self.connections.lock().unwrap();
            let Some(slot) = connections.get(&connect_id) else {
                return Delivery::Unknown;
            };
            if slot.inbound.capacity() > 1 {
                let _ = slot.inbound.try_send(Inbound::Data(data));
                return Delivery::Queued;
            }
        }

        warn!(
            backend_id = self.id,
            connect_id,
            "Connection consumer fell behind, closing"
        );
        self.abort_connection(connect_id, Some(QUEUE_FULL.to_string()));
        Delivery::Overflow
    }

    /// Remove a connection-token slot; `None` if it was already released
    pub(crate) fn release(&self, connect_id: ConnectId) -> Option<ConnectionSlot> {
        let slot = self.connections.lock().unwrap().remove(&connect_id)?;
        self.metrics.established_connections().dec();
        debug!(
            backend_id = self.id,
            connect_id,
            address = %slot.address,
            "Released connection slot"
        );
        Some(slot)
    }

    /// Release a slot and tell the agent to close the connection
    pub(crate) fn abort_connection(&self, connect_id: ConnectId, error: Option<String>) {
        if let Some(slot) = self.release(connect_id) {
            slot.close(error.clone());
        }
        let _ = self.send_control(Frame::from(Packet::CloseRequest { connect_id, error }));
    }

    /// Live logical connections on this backend
    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn pending_dial_count(&self) -> usize {
        self.pending.count()
    }

    /// Tear the backend down: fail pending dials, close every logical
    /// connection and wait for all tasks spawned for this stream.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let failed_dials = self.pending.clear();

        let slots: Vec<(ConnectId, ConnectionSlot)> =
            self.connections.lock().unwrap().drain().collect();
        let closed_connections = slots.len();
        for (connect_id, slot) in slots {
            self.metrics.established_connections().dec();
            debug!(backend_id = self.id, connect_id, "Closing connection on backend teardown");
            slot.close(Some("backend closed".to_string()));
        }

        self.tasks.close();
        self.tasks.wait().await;

        info!(
            backend_id = self.id,
            agent_id = %self.info.agent_id,
            failed_dials,
            closed_connections,
            "Backend shut down"
        );
    }
}

async fn run_writer(
    backend_id: BackendId,
    mut sink: BoxFrameSink,
    mut outbound: mpsc::Receiver<Frame>,
    mut control: mpsc::UnboundedReceiver<Frame>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            Some(frame) = control.recv() => frame,
            Some(frame) = outbound.recv() => frame,
            else => break,
        };

        let result = tokio::select! {
            result = sink.send_frame(frame) => result,
            _ = shutdown.cancelled() => break,
        };
        if let Err(e) = result {
            warn!(backend_id, "Failed to write to agent stream: {}", e);
            shutdown.cancel();
            break;
        }
    }

    // A peer that stopped reading must not hold up teardown
    let _ = tokio::time::timeout(SINK_CLOSE_TIMEOUT, sink.close()).await;
    debug!(backend_id, "Backend writer stopped");
}
