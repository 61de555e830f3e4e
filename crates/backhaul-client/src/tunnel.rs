//! Tunnel session to a broker
//!
//! One task writes frames and one reads them. Ordered traffic (dials, data,
//! graceful closes) shares a bounded queue; cancellations and abortive closes
//! take an unbounded control queue so they are never lost to a full session.

use crate::conn::{ConnInbound, TunnelConn};
use crate::DialError;
use backhaul_metrics::ClientMetrics;
use backhaul_proto::metadata::PROTOCOL_VERSION as PROTOCOL_VERSION_KEY;
use backhaul_proto::{
    ConnectId, DialId, Frame, Metadata, Packet, RequestContext, CONNECTION_QUEUE_CAPACITY,
    DEFAULT_CHUNK_SIZE, PROTOCOL_VERSION, QUEUE_FULL,
};
use backhaul_transport::{connect_with_metadata, BoxFrameSink, BoxFrameSource, TransportError};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

const SESSION_CHANNEL_CAPACITY: usize = 256;

type DialResult = Result<(ConnectId, mpsc::Receiver<ConnInbound>), String>;

pub(crate) struct Inner {
    pub(crate) outbound: mpsc::Sender<Frame>,
    control: mpsc::UnboundedSender<Frame>,
    pending: DashMap<DialId, oneshot::Sender<DialResult>>,
    /// Bounded; data never takes the last free place, so the close
    /// notification always fits
    pub(crate) conns: DashMap<ConnectId, mpsc::Sender<ConnInbound>>,
    pub(crate) done: CancellationToken,
    pub(crate) single_use: bool,
    started: AtomicBool,
    metrics: Arc<ClientMetrics>,
    pub(crate) chunk_size: usize,
    tasks: TaskTracker,
}

impl Inner {
    /// End the session: fail pending dials and close every connection
    pub(crate) fn close(&self) {
        if self.done.is_cancelled() {
            return;
        }
        self.done.cancel();
        self.pending.clear();
        let conns: Vec<_> = self
            .conns
            .iter()
            .map(|entry| *entry.key())
            .collect();
        for connect_id in conns {
            if let Some((_, inbound)) = self.conns.remove(&connect_id) {
                let _ = inbound.try_send(ConnInbound::Closed(Some("tunnel closed".to_string())));
            }
        }
    }

    /// Queue a frame ahead of ordered traffic; dropped only once the session is over
    pub(crate) fn send_control(&self, packet: Packet) {
        let _ = self.control.send(Frame::from(packet));
    }

    fn observe(&self, err: DialError) -> DialError {
        if let Some(reason) = err.reason() {
            self.metrics.observe_dial_failure(reason);
        }
        err
    }
}

/// Keeps the session open while a [`Tunnel`] or [`TunnelConn`] refers to it
pub(crate) struct Session {
    pub(crate) inner: Arc<Inner>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner.close();
    }
}

/// A session with the broker's tunnel listener
#[derive(Clone)]
pub struct Tunnel {
    session: Arc<Session>,
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("single_use", &self.inner.single_use)
            .field("connections", &self.inner.conns.len())
            .field("closed", &self.inner.done.is_cancelled())
            .finish()
    }
}

impl Tunnel {
    /// Open a session that can carry any number of dials
    pub async fn connect(addr: &str, metrics: Arc<ClientMetrics>) -> Result<Self, TransportError> {
        Self::open(addr, metrics, false).await
    }

    /// Open a session for exactly one dial.
    ///
    /// The session ends when that dial fails or its connection closes.
    pub async fn single_use(addr: &str, metrics: Arc<ClientMetrics>) -> Result<Self, TransportError> {
        Self::open(addr, metrics, true).await
    }

    async fn open(addr: &str, metrics: Arc<ClientMetrics>, single_use: bool) -> Result<Self, TransportError> {
        let metadata = Metadata::new().with(PROTOCOL_VERSION_KEY, PROTOCOL_VERSION.to_string());
        let established = connect_with_metadata(addr, metadata).await?;
        info!(broker = %addr, single_use, "Tunnel session opened");

        let (outbound, outbound_rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        let (control, control_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            outbound,
            control,
            pending: DashMap::new(),
            conns: DashMap::new(),
            done: CancellationToken::new(),
            single_use,
            started: AtomicBool::new(false),
            metrics,
            chunk_size: DEFAULT_CHUNK_SIZE,
            tasks: TaskTracker::new(),
        });
        inner
            .tasks
            .spawn(write_frames(inner.clone(), established.sink, outbound_rx, control_rx));
        inner
            .tasks
            .spawn(read_frames(inner.clone(), established.source));
        inner.tasks.close();

        Ok(Self {
            session: Arc::new(Session {
                inner: inner.clone(),
            }),
            inner,
        })
    }

    /// Dial `address` through the broker.
    ///
    /// `ctx` bounds the wait for the answer; once the connection exists it is
    /// closed by dropping or shutting down the returned [`TunnelConn`].
    pub async fn dial(
        &self,
        ctx: &RequestContext,
        protocol: &str,
        address: &str,
    ) -> Result<TunnelConn, DialError> {
        let inner = &self.inner;
        if inner.single_use && inner.started.swap(true, Ordering::SeqCst) {
            return Err(inner.observe(DialError::AlreadyStarted));
        }
        let result = self.dial_inner(ctx, protocol, address).await;
        if result.is_err() && inner.single_use {
            inner.close();
        }
        result.map_err(|err| inner.observe(err))
    }

    async fn dial_inner(
        &self,
        ctx: &RequestContext,
        protocol: &str,
        address: &str,
    ) -> Result<TunnelConn, DialError> {
        let inner = &self.inner;
        if inner.done.is_cancelled() {
            return Err(DialError::TunnelClosed);
        }
        if let Some(err) = ctx.err() {
            return Err(DialError::Context(err));
        }

        let random: DialId = rand::random();
        let (tx, mut rx) = oneshot::channel();
        inner.pending.insert(random, tx);

        let request = Frame::from(Packet::DialRequest {
            random,
            protocol: protocol.to_string(),
            address: address.to_string(),
            timeout_hint_ms: ctx.remaining().map(|d| d.as_millis() as u64),
        });
        if inner.outbound.send(request).await.is_err() {
            inner.pending.remove(&random);
            return Err(DialError::TunnelClosed);
        }
        debug!(random, address = %address, "Sent DialRequest");

        let answer = tokio::select! {
            answer = &mut rx => answer,
            err = ctx.done() => {
                if inner.pending.remove(&random).is_some() {
                    inner.send_control(Packet::DialClose { random });
                    debug!(random, address = %address, "Dial abandoned: {}", err);
                } else if let Ok(Ok((connect_id, _))) = rx.await {
                    // Answered while we gave up
                    inner.conns.remove(&connect_id);
                    inner.send_control(Packet::CloseRequest {
                        connect_id,
                        error: Some(err.to_string()),
                    });
                }
                return Err(DialError::Context(err));
            }
        };

        match answer {
            Ok(Ok((connect_id, inbound))) => {
                debug!(random, connect_id, address = %address, "Tunnel connection established");
                Ok(TunnelConn::new(self.session.clone(), connect_id, inbound))
            }
            Ok(Err(error)) => Err(DialError::Endpoint(error)),
            Err(_) => Err(DialError::TunnelClosed),
        }
    }

    /// Completes when the session has ended
    pub fn done(&self) -> WaitForCancellationFuture<'_> {
        self.inner.done.cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    /// Connections currently open on this session
    pub fn connection_count(&self) -> usize {
        self.inner.conns.len()
    }

    /// End the session and wait for its tasks
    pub async fn close(&self) {
        self.inner.close();
        self.inner.tasks.wait().await;
    }
}

async fn write_frames(
    inner: Arc<Inner>,
    mut sink: BoxFrameSink,
    mut outbound: mpsc::Receiver<Frame>,
    mut control: mpsc::UnboundedReceiver<Frame>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = inner.done.cancelled() => break,
            Some(frame) = control.recv() => frame,
            Some(frame) = outbound.recv() => frame,
            else => break,
        };
        let sent = tokio::select! {
            _ = inner.done.cancelled() => break,
            sent = sink.send_frame(frame) => sent,
        };
        if let Err(e) = sent {
            warn!("Tunnel write failed: {}", e);
            break;
        }
    }
    inner.close();
    let _ = tokio::time::timeout(Duration::from_secs(1), sink.close()).await;
}

async fn read_frames(inner: Arc<Inner>, mut source: BoxFrameSource) {
    loop {
        let frame = tokio::select! {
            _ = inner.done.cancelled() => break,
            frame = source.recv_frame() => frame,
        };
        match frame {
            Ok(Some(Frame::Packet(packet))) => dispatch(&inner, packet),
            Ok(Some(Frame::Ping { timestamp })) => {
                let _ = inner.control.send(Frame::Pong { timestamp });
            }
            Ok(Some(Frame::Pong { .. })) => {}
            Ok(Some(other)) => {
                warn!("Unexpected frame on tunnel: {:?}", other);
                break;
            }
            Ok(None) => {
                debug!("Broker closed tunnel");
                break;
            }
            Err(e) => {
                warn!("Tunnel read failed: {}", e);
                break;
            }
        }
    }
    inner.close();
}

fn dispatch(inner: &Arc<Inner>, packet: Packet) {
    match packet {
        Packet::DialResponse {
            random,
            connect_id,
            error,
        } => {
            let Some((_, waiter)) = inner.pending.remove(&random) else {
                debug!(random, connect_id, "DialResponse for an abandoned dial");
                if error.is_none() {
                    inner.send_control(Packet::CloseRequest {
                        connect_id,
                        error: None,
                    });
                }
                return;
            };
            let result = match error {
                Some(error) => Err(error),
                None => {
                    // Registered before the dialer hears back so no Data is missed
                    let (tx, rx) = mpsc::channel(CONNECTION_QUEUE_CAPACITY);
                    inner.conns.insert(connect_id, tx);
                    Ok((connect_id, rx))
                }
            };
            if let Err(Ok((connect_id, _))) = waiter.send(result) {
                inner.conns.remove(&connect_id);
                inner.send_control(Packet::CloseRequest {
                    connect_id,
                    error: None,
                });
            }
        }
        Packet::Data { connect_id, data } => {
            let queued = match inner.conns.get(&connect_id) {
                Some(conn) if conn.capacity() > 1 => {
                    // A dropped connection removes itself
                    let _ = conn.try_send(ConnInbound::Data(data.into()));
                    true
                }
                Some(_) => false,
                None => {
                    debug!(connect_id, "Data for unknown connection");
                    true
                }
            };
            if !queued {
                warn!(connect_id, "Connection reader fell behind, closing");
                if let Some((_, conn)) = inner.conns.remove(&connect_id) {
                    let _ = conn.try_send(ConnInbound::Closed(Some(QUEUE_FULL.to_string())));
                }
                inner.send_control(Packet::CloseRequest {
                    connect_id,
                    error: Some(QUEUE_FULL.to_string()),
                });
            }
        }
        Packet::CloseResponse { connect_id, error } => {
            if let Some((_, conn)) = inner.conns.remove(&connect_id) {
                let _ = conn.try_send(ConnInbound::Closed(error));
            }
        }
        Packet::CloseRequest { connect_id, error } => {
            if let Some((_, conn)) = inner.conns.remove(&connect_id) {
                let _ = conn.try_send(ConnInbound::Closed(error));
            }
            inner.send_control(Packet::CloseResponse {
                connect_id,
                error: None,
            });
        }
        other => warn!(kind = other.kind(), "Ignoring packet not expected from a broker"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_metrics::ClientDialFailure;
    use backhaul_transport::{accept_handshake, Established};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct FakeBroker {
        link: Established,
    }

    impl FakeBroker {
        async fn send(&mut self, packet: Packet) {
            self.link.sink.send_frame(Frame::from(packet)).await.unwrap();
        }

        async fn next_packet(&mut self) -> Packet {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.link.source.recv_frame())
                .await
                .expect("no packet from client")
                .unwrap();
            match frame {
                Some(Frame::Packet(packet)) => packet,
                other => panic!("unexpected frame: {:?}", other),
            }
        }

        async fn next_dial(&mut self) -> DialId {
            match self.next_packet().await {
                Packet::DialRequest { random, .. } => random,
                other => panic!("expected DialRequest, got {:?}", other),
            }
        }
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    }

    async fn setup(single_use: bool) -> (FakeBroker, Tunnel, Arc<ClientMetrics>) {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let broker = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let pending = accept_handshake(stream, Duration::from_secs(5)).await.unwrap();
            FakeBroker {
                link: pending.accept(Metadata::new()).await.unwrap(),
            }
        });

        let metrics = ClientMetrics::new();
        let tunnel = if single_use {
            Tunnel::single_use(&addr, metrics.clone()).await.unwrap()
        } else {
            Tunnel::connect(&addr, metrics.clone()).await.unwrap()
        };
        (broker.await.unwrap(), tunnel, metrics)
    }

    #[tokio::test]
    async fn test_dial_and_relay() {
        let (mut broker, tunnel, _) = setup(false).await;

        let dial = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move {
                tunnel
                    .dial(&RequestContext::background(), "tcp", "10.0.0.1:80")
                    .await
            })
        };
        let random = broker.next_dial().await;
        broker
            .send(Packet::DialResponse {
                random,
                connect_id: 9,
                error: None,
            })
            .await;
        broker
            .send(Packet::Data {
                connect_id: 9,
                data: b"hello".to_vec(),
            })
            .await;

        let mut conn = dial.await.unwrap().unwrap();
        assert_eq!(conn.connect_id(), 9);
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        conn.write_all(b"world").await.unwrap();
        assert_eq!(
            broker.next_packet().await,
            Packet::Data {
                connect_id: 9,
                data: b"world".to_vec()
            }
        );

        conn.shutdown().await.unwrap();
        assert_eq!(
            broker.next_packet().await,
            Packet::CloseRequest {
                connect_id: 9,
                error: None
            }
        );
        broker
            .send(Packet::CloseResponse {
                connect_id: 9,
                error: None,
            })
            .await;
        let mut rest = Vec::new();
        conn.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(tunnel.connection_count(), 0);
        assert!(!tunnel.is_closed());
    }

    #[tokio::test]
    async fn test_endpoint_error() {
        let (mut broker, tunnel, metrics) = setup(false).await;

        let dial = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move {
                tunnel
                    .dial(&RequestContext::background(), "tcp", "127.0.0.1:1")
                    .await
            })
        };
        let random = broker.next_dial().await;
        broker
            .send(Packet::DialResponse {
                random,
                connect_id: 0,
                error: Some("dial tcp 127.0.0.1:1: connect: connection refused".into()),
            })
            .await;

        let err = dial.await.unwrap().unwrap_err();
        assert!(matches!(err, DialError::Endpoint(_)));
        assert!(err.to_string().contains("connection refused"));
        assert_eq!(metrics.dial_failures(ClientDialFailure::Endpoint), 1);
        // A multi-use tunnel survives a failed dial
        assert!(!tunnel.is_closed());
    }

    #[tokio::test]
    async fn test_context_cancel_sends_dial_close() {
        let (mut broker, tunnel, metrics) = setup(true).await;

        let ctx = RequestContext::background();
        let dial = {
            let tunnel = tunnel.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { tunnel.dial(&ctx, "tcp", "10.0.0.1:80").await })
        };
        broker.next_dial().await;
        ctx.cancel();

        let err = dial.await.unwrap().unwrap_err();
        assert!(matches!(err, DialError::Context(_)));
        assert_eq!(metrics.dial_failures(ClientDialFailure::Context), 1);
        assert_eq!(crate::dial_failure_reason(&err), Some(ClientDialFailure::Context));

        // Single-use: the session is over
        tokio::time::timeout(Duration::from_secs(5), tunnel.done())
            .await
            .expect("tunnel not done");
    }

    #[tokio::test]
    async fn test_dial_timeout() {
        let (mut broker, tunnel, metrics) = setup(false).await;

        let ctx = RequestContext::background().with_timeout(Duration::from_millis(50));
        let dial = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.dial(&ctx, "tcp", "10.0.0.1:80").await })
        };
        let random = match broker.next_packet().await {
            Packet::DialRequest {
                random,
                timeout_hint_ms,
                ..
            } => {
                assert!(timeout_hint_ms.is_some());
                random
            }
            other => panic!("unexpected packet: {:?}", other),
        };

        let err = dial.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "dial timeout, context deadline exceeded");
        assert_eq!(broker.next_packet().await, Packet::DialClose { random });
        assert_eq!(metrics.dial_failures(ClientDialFailure::Context), 1);
    }

    #[tokio::test]
    async fn test_single_use_allows_one_dial() {
        let (mut broker, tunnel, metrics) = setup(true).await;

        let dial = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move {
                tunnel
                    .dial(&RequestContext::background(), "tcp", "10.0.0.1:80")
                    .await
            })
        };
        let random = broker.next_dial().await;

        let second = tunnel
            .dial(&RequestContext::background(), "tcp", "10.0.0.1:81")
            .await;
        assert!(matches!(second, Err(DialError::AlreadyStarted)));
        assert_eq!(metrics.dial_failures(ClientDialFailure::AlreadyStarted), 1);

        broker
            .send(Packet::DialResponse {
                random,
                connect_id: 1,
                error: None,
            })
            .await;
        let conn = dial.await.unwrap().unwrap();
        assert!(!tunnel.is_closed());

        // Closing the only connection ends the session
        drop(conn);
        tokio::time::timeout(Duration::from_secs(5), tunnel.done())
            .await
            .expect("tunnel not done");
    }

    #[tokio::test]
    async fn test_broker_disconnect_fails_pending_dial() {
        let (mut broker, tunnel, metrics) = setup(false).await;

        let dial = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move {
                tunnel
                    .dial(&RequestContext::background(), "tcp", "10.0.0.1:80")
                    .await
            })
        };
        broker.next_dial().await;
        drop(broker);

        let err = dial.await.unwrap().unwrap_err();
        assert!(matches!(err, DialError::TunnelClosed));
        assert_eq!(metrics.dial_failures(ClientDialFailure::TunnelClosed), 1);
        tokio::time::timeout(Duration::from_secs(5), tunnel.done())
            .await
            .expect("tunnel not done");

        let after = tunnel
            .dial(&RequestContext::background(), "tcp", "10.0.0.1:80")
            .await;
        assert!(matches!(after, Err(DialError::TunnelClosed)));
        tunnel.close().await;
    }

    async fn established(broker: &mut FakeBroker, tunnel: &Tunnel, connect_id: ConnectId) -> TunnelConn {
        let dial = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move {
                tunnel
                    .dial(&RequestContext::background(), "tcp", "10.0.0.1:80")
                    .await
            })
        };
        let random = broker.next_dial().await;
        broker
            .send(Packet::DialResponse {
                random,
                connect_id,
                error: None,
            })
            .await;
        dial.await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_close_survives_full_session_queue() {
        let (mut broker, tunnel, _) = setup(false).await;
        let mut conn = established(&mut broker, &tunnel, 4).await;

        // The broker stops reading until the ordered queue is full
        let chunk = vec![0u8; DEFAULT_CHUNK_SIZE];
        loop {
            match tokio::time::timeout(Duration::from_millis(200), conn.write_all(&chunk)).await {
                Ok(written) => written.unwrap(),
                Err(_) => break,
            }
        }
        drop(conn);

        loop {
            match broker.next_packet().await {
                Packet::Data { connect_id: 4, .. } => {}
                Packet::CloseRequest {
                    connect_id: 4,
                    error: None,
                } => break,
                other => panic!("unexpected packet: {:?}", other),
            }
        }
        assert_eq!(tunnel.connection_count(), 0);
        assert!(!tunnel.is_closed());
    }

    #[tokio::test]
    async fn test_unread_connection_is_closed_when_its_queue_fills() {
        let (mut broker, tunnel, _) = setup(false).await;
        let mut conn = established(&mut broker, &tunnel, 7).await;

        for _ in 0..CONNECTION_QUEUE_CAPACITY + 10 {
            broker
                .send(Packet::Data {
                    connect_id: 7,
                    data: vec![1u8; 1024],
                })
                .await;
        }
        assert_eq!(
            broker.next_packet().await,
            Packet::CloseRequest {
                connect_id: 7,
                error: Some(QUEUE_FULL.to_string()),
            }
        );
        assert_eq!(tunnel.connection_count(), 0);

        // Queued bytes are bounded and still readable, then the reason
        let mut queued = 0;
        let err = loop {
            match conn.recv().await {
                Ok(Some(chunk)) => queued += chunk.len(),
                Ok(None) => panic!("connection ended without an error"),
                Err(e) => break e,
            }
        };
        assert_eq!(queued, (CONNECTION_QUEUE_CAPACITY - 1) * 1024);
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
        assert_eq!(err.to_string(), QUEUE_FULL);

        // Dropping it sends nothing more: the next packet is a new dial
        drop(conn);
        let _next = established(&mut broker, &tunnel, 8).await;
        assert!(!tunnel.is_closed());
    }
}
