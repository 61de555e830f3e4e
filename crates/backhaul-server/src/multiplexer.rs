//! Tunnel multiplexer
//!
//! Turns each agent stream into many logical connections. A dial is
//! correlated by a random ID until the agent answers with a connection token;
//! from then on the token is the only key. One reader per backend dispatches
//! incoming packets by token, so a slow connection never holds the table lock
//! while it waits.

use crate::backend::{Backend, ConnectionSlot, Delivery};
use crate::connection::ProxyConnection;
use crate::error::DialError;
use crate::pending::DialOutcome;
use crate::registry::BackendRegistry;
use crate::strategy::SelectionHint;
use backhaul_metrics::{ServerDialFailure, ServerMetrics};
use backhaul_proto::{ConnectId, DialId, Frame, Packet, RequestContext, CONNECTION_QUEUE_CAPACITY};
use backhaul_transport::BoxFrameSource;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Where and how to dial
#[derive(Debug, Clone)]
pub struct DialTarget {
    pub protocol: String,
    pub address: String,
    /// Bound on the wait for the agent's answer
    pub timeout: Option<Duration>,
    /// Only use streams of this agent identity
    pub agent_id: Option<String>,
}

impl DialTarget {
    pub fn new(protocol: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            address: address.into(),
            timeout: None,
            agent_id: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

pub struct Multiplexer {
    registry: Arc<BackendRegistry>,
    metrics: Arc<ServerMetrics>,
    chunk_size: usize,
}

impl Multiplexer {
    pub fn new(registry: Arc<BackendRegistry>, metrics: Arc<ServerMetrics>, chunk_size: usize) -> Self {
        Self {
            registry,
            metrics,
            chunk_size,
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    /// Dial `address` through an agent and wait for the connection
    pub async fn dial(
        &self,
        ctx: &RequestContext,
        protocol: &str,
        address: &str,
        timeout: Option<Duration>,
    ) -> Result<ProxyConnection, DialError> {
        let target = DialTarget::new(protocol, address).with_timeout(timeout);
        self.start_dial(ctx, target)?.wait().await
    }

    /// Pick a backend and send the `DialRequest` without waiting for the answer.
    ///
    /// Fails immediately with `NoBackendAvailable` when no agent can take it.
    pub fn start_dial(
        &self,
        ctx: &RequestContext,
        target: DialTarget,
    ) -> Result<PendingConnection, DialError> {
        let hint = SelectionHint {
            agent_id: target.agent_id.as_deref(),
            dest_host: Some(host_of(&target.address)),
        };
        let Some(backend) = self.registry.select(&hint) else {
            warn!(address = %target.address, "No backend available for dial");
            self.metrics
                .observe_dial_failure(ServerDialFailure::NoBackendAvailable);
            return Err(DialError::NoBackendAvailable);
        };

        let wait_ctx = match target.timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.child(),
        };
        let random: DialId = rand::random();
        let rx = backend.pending.register(random, &target.address);

        let pending = PendingConnection {
            backend: backend.clone(),
            random,
            address: target.address.clone(),
            rx,
            wait_ctx: wait_ctx.clone(),
            conn_ctx: ctx.clone(),
            metrics: self.metrics.clone(),
            chunk_size: self.chunk_size,
        };

        let request = Frame::from(Packet::DialRequest {
            random,
            protocol: target.protocol,
            address: target.address,
            timeout_hint_ms: wait_ctx.remaining().map(|d| d.as_millis() as u64),
        });
        // A backend torn down after selection must not strand the waiter
        if backend.send_control(request).is_err() || backend.is_closed() {
            backend.pending.cancel(random);
            self.metrics
                .observe_dial_failure(ServerDialFailure::BackendClose);
            return Err(DialError::BackendClosed);
        }

        debug!(
            random,
            agent_id = %backend.agent_id(),
            backend_id = backend.id(),
            address = %pending.address,
            "Sent DialRequest"
        );
        Ok(pending)
    }

    /// Read packets from an agent stream until it ends, then tear the backend down.
    ///
    /// The backend is registered for the duration of the call.
    pub async fn serve_backend(&self, backend: Arc<Backend>, mut source: BoxFrameSource) {
        self.registry.add_backend(backend.clone());

        loop {
            let frame = tokio::select! {
                _ = backend.closed() => break,
                frame = source.recv_frame() => frame,
            };

            match frame {
                Ok(Some(Frame::Packet(packet))) => self.dispatch(&backend, packet),
                Ok(Some(Frame::Ping { timestamp })) => {
                    let _ = backend.send_control(Frame::Pong { timestamp });
                }
                Ok(Some(Frame::Pong { .. })) => {}
                Ok(Some(other)) => {
                    warn!(
                        agent_id = %backend.agent_id(),
                        "Unexpected frame on agent stream: {:?}", other
                    );
                    break;
                }
                Ok(None) => {
                    info!(agent_id = %backend.agent_id(), backend_id = backend.id(), "Agent closed stream");
                    break;
                }
                Err(e) => {
                    warn!(agent_id = %backend.agent_id(), backend_id = backend.id(), "Agent stream error: {}", e);
                    break;
                }
            }
        }

        self.registry.remove_backend(&backend);
        backend.shutdown().await;
    }

    fn dispatch(&self, backend: &Arc<Backend>, packet: Packet) {
        match packet {
            Packet::DialResponse {
                random,
                connect_id,
                error,
            } => self.handle_dial_response(backend, random, connect_id, error),
            Packet::Data { connect_id, data } => {
                if backend.deliver(connect_id, Bytes::from(data)) == Delivery::Unknown {
                    debug!(connect_id, "Data for unknown connection dropped");
                }
            }
            Packet::CloseResponse { connect_id, error } => {
                self.handle_close(backend, connect_id, error);
            }
            Packet::CloseRequest { connect_id, error } => {
                self.handle_close(backend, connect_id, error);
                let _ = backend.send_control(Frame::from(Packet::CloseResponse {
                    connect_id,
                    error: None,
                }));
            }
            other => {
                warn!(
                    agent_id = %backend.agent_id(),
                    kind = other.kind(),
                    "Ignoring packet not expected from an agent"
                );
            }
        }
    }

    fn handle_dial_response(
        &self,
        backend: &Arc<Backend>,
        random: DialId,
        connect_id: ConnectId,
        error: Option<String>,
    ) {
        if error.is_some() {
            self.metrics
                .observe_dial_failure(ServerDialFailure::ErrorResponse);
        }

        let Some(dial) = backend.pending.take(random) else {
            debug!(random, connect_id, "DialResponse for an abandoned dial");
            if error.is_none() {
                let _ = backend.send_control(Frame::from(Packet::CloseRequest {
                    connect_id,
                    error: None,
                }));
            }
            return;
        };

        if let Some(error) = error {
            warn!(
                random,
                address = %dial.address,
                agent_id = %backend.agent_id(),
                "Agent failed to dial: {}", error
            );
            let _ = dial.tx.send(DialOutcome::Failed(error));
            return;
        }

        let (tx, rx) = mpsc::channel(CONNECTION_QUEUE_CAPACITY);
        let slot = ConnectionSlot {
            inbound: tx,
            address: dial.address.clone(),
        };
        if !backend.insert_connection(connect_id, slot) {
            warn!(connect_id, "Agent reused a live connection token");
            let _ = dial.tx.send(DialOutcome::Failed(format!(
                "duplicate connection token {}",
                connect_id
            )));
            return;
        }

        if dial
            .tx
            .send(DialOutcome::Established {
                connect_id,
                inbound: rx,
            })
            .is_err()
        {
            debug!(connect_id, "Dial waiter went away, closing new connection");
            backend.abort_connection(connect_id, None);
            return;
        }

        info!(
            random,
            connect_id,
            address = %dial.address,
            agent_id = %backend.agent_id(),
            elapsed_ms = dial.started.elapsed().as_millis() as u64,
            "Connection established"
        );
    }

    fn handle_close(&self, backend: &Arc<Backend>, connect_id: ConnectId, error: Option<String>) {
        match backend.release(connect_id) {
            Some(slot) => slot.close(error),
            None => debug!(connect_id, "Close for unknown connection"),
        }
    }

    /// Dials waiting for an agent answer across all backends
    pub fn pending_dial_count(&self) -> usize {
        self.registry
            .backends()
            .iter()
            .map(|backend| backend.pending_dial_count())
            .sum()
    }

    /// Established logical connections across all backends
    pub fn connection_count(&self) -> usize {
        self.registry
            .backends()
            .iter()
            .map(|backend| backend.connection_count())
            .sum()
    }
}

/// A dial whose request is on the wire
pub struct PendingConnection {
    backend: Arc<Backend>,
    random: DialId,
    address: String,
    rx: oneshot::Receiver<DialOutcome>,
    wait_ctx: RequestContext,
    conn_ctx: RequestContext,
    metrics: Arc<ServerMetrics>,
    chunk_size: usize,
}

impl PendingConnection {
    pub fn random(&self) -> DialId {
        self.random
    }

    pub fn agent_id(&self) -> &str {
        self.backend.agent_id()
    }

    /// Wait for the agent's answer or the end of the caller's context
    pub async fn wait(mut self) -> Result<ProxyConnection, DialError> {
        let outcome = tokio::select! {
            outcome = &mut self.rx => outcome,
            err = self.wait_ctx.done() => {
                if self.backend.pending.cancel(self.random) {
                    let _ = self
                        .backend
                        .send_control(Frame::from(Packet::DialClose { random: self.random }));
                    self.metrics
                        .observe_dial_failure(ServerDialFailure::FrontendClose);
                    info!(
                        random = self.random,
                        address = %self.address,
                        "Frontend gave up before the agent answered: {}", err
                    );
                } else if let Ok(DialOutcome::Established { connect_id, .. }) = (&mut self.rx).await {
                    // The answer raced the cancellation
                    self.backend.abort_connection(connect_id, Some(err.to_string()));
                }
                return Err(DialError::Context(err));
            }
        };

        match outcome {
            Ok(DialOutcome::Established {
                connect_id,
                inbound,
            }) => Ok(ProxyConnection::new(
                self.backend.clone(),
                connect_id,
                self.address.clone(),
                inbound,
                self.conn_ctx.clone(),
                self.chunk_size,
            )),
            Ok(DialOutcome::Failed(error)) => Err(DialError::Endpoint(error)),
            Err(_) => {
                self.metrics
                    .observe_dial_failure(ServerDialFailure::BackendClose);
                Err(DialError::BackendClosed)
            }
        }
    }
}

impl Drop for PendingConnection {
    fn drop(&mut self) {
        if self.backend.pending.cancel(self.random) {
            let _ = self
                .backend
                .send_control(Frame::from(Packet::DialClose { random: self.random }));
        }
    }
}

/// Host part of `host:port`, without IPv6 brackets
pub(crate) fn host_of(address: &str) -> &str {
    let host = match address.rsplit_once(':') {
        Some((host, port)) if !port.contains(']') => host,
        _ => address,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::{test_backend, ChannelSource, RecordingSink};
    use crate::strategy::DefaultStrategy;
    use backhaul_proto::{ContextError, QUEUE_FULL};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Harness {
        mux: Arc<Multiplexer>,
        backend: Arc<Backend>,
        sink: RecordingSink,
        agent: mpsc::UnboundedSender<Frame>,
        serve: tokio::task::JoinHandle<()>,
    }

    async fn harness() -> Harness {
        let metrics = ServerMetrics::new();
        let registry = Arc::new(BackendRegistry::new(
            vec![Arc::new(DefaultStrategy)],
            metrics.clone(),
        ));
        let mux = Arc::new(Multiplexer::new(registry.clone(), metrics, 1024));
        let (backend, sink) = test_backend("agent-1", &[]);
        let (agent, rx) = mpsc::unbounded_channel();

        let serve = tokio::spawn({
            let mux = mux.clone();
            let backend = backend.clone();
            async move { mux.serve_backend(backend, Box::new(ChannelSource(rx))).await }
        });
        while registry.backend_count() == 0 {
            tokio::task::yield_now().await;
        }

        Harness {
            mux,
            backend,
            sink,
            agent,
            serve,
        }
    }

    async fn next_dial_request(sink: &RecordingSink) -> DialId {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let random = sink.frames.lock().unwrap().iter().find_map(|frame| match frame {
                    Frame::Packet(Packet::DialRequest { random, .. }) => Some(*random),
                    _ => None,
                });
                if let Some(random) = random {
                    return random;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("no DialRequest written")
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("db.internal:5432"), "db.internal");
        assert_eq!(host_of("[::1]:80"), "::1");
        assert_eq!(host_of("localhost"), "localhost");
    }

    #[tokio::test]
    async fn test_no_backend_fails_fast() {
        let metrics = ServerMetrics::new();
        let registry = Arc::new(BackendRegistry::new(
            vec![Arc::new(DefaultStrategy)],
            metrics.clone(),
        ));
        let mux = Multiplexer::new(registry, metrics.clone(), 1024);

        let result = mux
            .dial(&RequestContext::background(), "tcp", "127.0.0.1:1", None)
            .await;
        assert_eq!(result.unwrap_err(), DialError::NoBackendAvailable);
        assert_eq!(
            metrics.dial_failures(ServerDialFailure::NoBackendAvailable),
            1
        );
    }

    #[tokio::test]
    async fn test_dial_relay_and_close() {
        let h = harness().await;
        let mux = h.mux.clone();
        let dial = tokio::spawn(async move {
            mux.dial(&RequestContext::background(), "tcp", "10.0.0.1:80", None)
                .await
        });

        let random = next_dial_request(&h.sink).await;
        h.agent
            .send(Frame::from(Packet::DialResponse {
                random,
                connect_id: 42,
                error: None,
            }))
            .unwrap();

        let mut conn = dial.await.unwrap().unwrap();
        assert_eq!(conn.connect_id(), 42);
        assert_eq!(h.mux.connection_count(), 1);
        assert_eq!(h.mux.pending_dial_count(), 0);

        conn.write_all(b"ping").await.unwrap();
        h.agent
            .send(Frame::from(Packet::Data {
                connect_id: 42,
                data: b"pong".to_vec(),
            }))
            .unwrap();
        h.agent
            .send(Frame::from(Packet::CloseResponse {
                connect_id: 42,
                error: None,
            }))
            .unwrap();

        let mut body = Vec::new();
        conn.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"pong");
        assert_eq!(h.mux.connection_count(), 0);
        assert!(h.sink.frames.lock().unwrap().contains(&Frame::from(Packet::Data {
            connect_id: 42,
            data: b"ping".to_vec(),
        })));
    }

    #[tokio::test]
    async fn test_dial_error_response() {
        let h = harness().await;
        let mux = h.mux.clone();
        let dial = tokio::spawn(async move {
            mux.dial(&RequestContext::background(), "tcp", "10.0.0.1:80", None)
                .await
        });

        let random = next_dial_request(&h.sink).await;
        h.agent
            .send(Frame::from(Packet::DialResponse {
                random,
                connect_id: 0,
                error: Some("dial tcp 10.0.0.1:80: connect: connection refused".into()),
            }))
            .unwrap();

        let err = dial.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            DialError::Endpoint("dial tcp 10.0.0.1:80: connect: connection refused".into())
        );
        assert_eq!(
            h.mux.metrics().dial_failures(ServerDialFailure::ErrorResponse),
            1
        );
        assert_eq!(h.mux.pending_dial_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_before_response_sends_dial_close() {
        let h = harness().await;
        let ctx = RequestContext::background();
        let mux = h.mux.clone();
        let dial_ctx = ctx.clone();
        let dial = tokio::spawn(async move {
            mux.dial(&dial_ctx, "tcp", "10.0.0.1:80", None).await
        });

        let random = next_dial_request(&h.sink).await;
        ctx.cancel();

        let err = dial.await.unwrap().unwrap_err();
        assert_eq!(err, DialError::Context(ContextError::Canceled));
        assert_eq!(
            h.mux.metrics().dial_failures(ServerDialFailure::FrontendClose),
            1
        );
        assert_eq!(
            h.mux.metrics().dial_failures(ServerDialFailure::ErrorResponse),
            0
        );

        // A late answer is closed right away
        h.agent
            .send(Frame::from(Packet::DialResponse {
                random,
                connect_id: 9,
                error: None,
            }))
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let frames = h.sink.frames.lock().unwrap().clone();
                let dial_close = frames.contains(&Frame::from(Packet::DialClose { random }));
                let close = frames.contains(&Frame::from(Packet::CloseRequest {
                    connect_id: 9,
                    error: None,
                }));
                if dial_close && close {
                    break;
                }
                drop(frames);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.mux.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_dial_timeout_is_context_error() {
        let h = harness().await;
        let err = h
            .mux
            .dial(
                &RequestContext::background(),
                "tcp",
                "10.0.0.1:80",
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert_eq!(err, DialError::Context(ContextError::DeadlineExceeded));
        assert_eq!(h.mux.pending_dial_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_end_closes_everything() {
        let h = harness().await;
        let mux = h.mux.clone();
        let established = tokio::spawn(async move {
            mux.dial(&RequestContext::background(), "tcp", "10.0.0.1:80", None)
                .await
        });
        let random = next_dial_request(&h.sink).await;
        h.agent
            .send(Frame::from(Packet::DialResponse {
                random,
                connect_id: 1,
                error: None,
            }))
            .unwrap();
        let mut conn = established.await.unwrap().unwrap();

        let mux = h.mux.clone();
        let pending = tokio::spawn(async move {
            mux.dial(&RequestContext::background(), "tcp", "10.0.0.2:80", None)
                .await
        });
        while h.mux.pending_dial_count() == 0 {
            tokio::task::yield_now().await;
        }

        // Agent disconnects
        drop(h.agent);
        h.serve.await.unwrap();

        assert_eq!(pending.await.unwrap().unwrap_err(), DialError::BackendClosed);
        let err = conn.read(&mut [0u8; 16]).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);

        assert_eq!(h.mux.registry().backend_count(), 0);
        assert_eq!(h.backend.connection_count(), 0);
        assert_eq!(h.backend.task_count(), 0);
    }

    #[tokio::test]
    async fn test_unread_connection_does_not_stall_stream() {
        let h = harness().await;
        let mux = h.mux.clone();
        let dial = tokio::spawn(async move {
            mux.dial(&RequestContext::background(), "tcp", "10.0.0.1:80", None)
                .await
        });
        let random = next_dial_request(&h.sink).await;
        h.agent
            .send(Frame::from(Packet::DialResponse {
                random,
                connect_id: 3,
                error: None,
            }))
            .unwrap();
        let mut conn = dial.await.unwrap().unwrap();

        // The destination keeps sending; nobody reads the connection
        for _ in 0..CONNECTION_QUEUE_CAPACITY * 2 {
            h.agent
                .send(Frame::from(Packet::Data {
                    connect_id: 3,
                    data: vec![1u8; 1024],
                }))
                .unwrap();
        }
        h.agent.send(Frame::Ping { timestamp: 11 }).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !h.sink.frames.lock().unwrap().contains(&Frame::Pong { timestamp: 11 }) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("stream reader stalled behind one connection");

        assert_eq!(h.mux.connection_count(), 0);
        assert!(h.sink.frames.lock().unwrap().contains(&Frame::from(Packet::CloseRequest {
            connect_id: 3,
            error: Some(QUEUE_FULL.to_string()),
        })));

        // What was queued is bounded and still readable, then the close reason
        let mut queued = 0;
        let err = loop {
            match conn.recv().await {
                Ok(Some(chunk)) => queued += chunk.len(),
                Ok(None) => panic!("connection ended without an error"),
                Err(e) => break e,
            }
        };
        assert!(queued < CONNECTION_QUEUE_CAPACITY * 1024);
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
        assert_eq!(err.to_string(), QUEUE_FULL);
    }
}
