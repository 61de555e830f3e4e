//! Streaming tunnel frontend
//!
//! A session is one TCP stream from the tunnel-client library carrying the
//! same packet union the agents speak. The session read loop only routes:
//! each connection has one task per direction, and the loop hands
//! client-to-agent bytes over a bounded queue without waiting. Ending a
//! session cancels its dials, closes its connections and joins all of its
//! tasks before the session is gone.

use crate::connection::ConnectionWriter;
use crate::multiplexer::Multiplexer;
use backhaul_proto::metadata::SERVER_ID;
use backhaul_proto::{
    ConnectId, DialId, Frame, Metadata, Packet, RequestContext, CONNECTION_QUEUE_CAPACITY, QUEUE_FULL,
};
use backhaul_transport::{accept_handshake, BoxFrameSink, BoxFrameSource};
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

const SESSION_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct TunnelServiceConfig {
    pub server_id: String,
    pub handshake_timeout: Duration,
    /// Close sessions that have no connections or dials for this long
    pub idle_timeout: Option<Duration>,
}

pub struct TunnelService {
    mux: Arc<Multiplexer>,
    config: TunnelServiceConfig,
    shutdown: CancellationToken,
    sessions: TaskTracker,
    next_session_id: AtomicU64,
}

enum SessionEvent {
    Established(ConnectId, ConnectionWriter),
    Finished(ConnectId),
}

/// Client-to-agent traffic of one connection, in order
enum Upstream {
    Data(Vec<u8>),
    /// The client closed its side
    Close,
}

/// Session-side end of a connection's client-to-agent task
struct Route {
    /// Data never takes the last free place, so `Close` always fits
    upstream: mpsc::Sender<Upstream>,
    /// Fails the connection even while its writer waits on the agent stream
    abort: CancellationToken,
}

/// Handles shared by a session's tasks
#[derive(Clone)]
struct SessionHandles {
    session_id: u64,
    mux: Arc<Multiplexer>,
    ctx: RequestContext,
    outbound: mpsc::Sender<Frame>,
    events: mpsc::UnboundedSender<SessionEvent>,
    dials: Arc<DashMap<DialId, RequestContext>>,
}

impl TunnelService {
    pub fn new(mux: Arc<Multiplexer>, config: TunnelServiceConfig, shutdown: CancellationToken) -> Self {
        Self {
            mux,
            config,
            shutdown,
            sessions: TaskTracker::new(),
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Accept sessions until shutdown, then wait for every session to end
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!("Tunnel service listening on {}", addr);
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let service = self.clone();
                        self.sessions.spawn(async move {
                            service.handle_stream(stream, peer_addr).await;
                        });
                    }
                    Err(e) => error!("Failed to accept tunnel connection: {}", e),
                },
            }
        }

        drop(listener);
        self.sessions.close();
        self.sessions.wait().await;
        debug!("Tunnel service stopped");
    }

    /// Sessions currently open
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    async fn handle_stream(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let pending = match accept_handshake(stream, self.config.handshake_timeout).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(peer = %peer_addr, "Tunnel handshake failed: {}", e);
                return;
            }
        };
        let established = match pending
            .accept(Metadata::new().with(SERVER_ID, self.config.server_id.clone()))
            .await
        {
            Ok(established) => established,
            Err(e) => {
                warn!(peer = %peer_addr, "Failed to accept tunnel session: {}", e);
                return;
            }
        };

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        info!(session_id, peer = %peer_addr, "Tunnel session opened");
        self.run_session(session_id, established.sink, established.source)
            .await;
        info!(session_id, peer = %peer_addr, "Tunnel session closed");
    }

    async fn run_session(&self, session_id: u64, sink: BoxFrameSink, mut source: BoxFrameSource) {
        let ctx = RequestContext::from_token(self.shutdown.child_token());
        let (outbound, outbound_rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let tasks = TaskTracker::new();
        let writer = tokio::spawn(write_frames(session_id, sink, outbound_rx, ctx.clone()));

        let handles = SessionHandles {
            session_id,
            mux: self.mux.clone(),
            ctx: ctx.clone(),
            outbound,
            events: events_tx,
            dials: Arc::new(DashMap::new()),
        };
        let mut routes: HashMap<ConnectId, Route> = HashMap::new();
        let mut live: usize = 0;

        let idle_timeout = self.config.idle_timeout;
        let idle = tokio::time::sleep(idle_timeout.unwrap_or(Duration::from_secs(3600)));
        tokio::pin!(idle);

        loop {
            let busy = live > 0 || !handles.dials.is_empty();

            tokio::select! {
                biased;
                _ = ctx.done() => break,
                Some(event) = events.recv() => match event {
                    SessionEvent::Established(connect_id, writer) => {
                        let (upstream, rx) = mpsc::channel(CONNECTION_QUEUE_CAPACITY);
                        let abort = CancellationToken::new();
                        tasks.spawn(forward_to_agent(session_id, writer, rx, abort.clone()));
                        routes.insert(connect_id, Route { upstream, abort });
                        live += 1;
                    }
                    SessionEvent::Finished(connect_id) => {
                        routes.remove(&connect_id);
                        live = live.saturating_sub(1);
                    }
                },
                frame = source.recv_frame() => {
                    if let Some(timeout) = idle_timeout {
                        idle.as_mut().reset(Instant::now() + timeout);
                    }
                    match frame {
                        Ok(Some(Frame::Packet(packet))) => {
                            handles.handle_packet(packet, &mut routes, &tasks).await;
                        }
                        Ok(Some(Frame::Ping { timestamp })) => {
                            let _ = handles.outbound.send(Frame::Pong { timestamp }).await;
                        }
                        Ok(Some(Frame::Pong { .. })) => {}
                        Ok(Some(other)) => {
                            warn!(session_id, "Unexpected frame on tunnel session: {:?}", other);
                            break;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(session_id, "Tunnel session stream error: {}", e);
                            break;
                        }
                    }
                }
                _ = &mut idle, if idle_timeout.is_some() && !busy => {
                    info!(session_id, "Tunnel session idle, closing");
                    break;
                }
            }
        }

        // Teardown: nothing the session started may outlive it
        ctx.cancel();
        routes.clear();
        tasks.close();
        tasks.wait().await;
        drop(handles);
        drop(events);
        let _ = writer.await;
    }
}

impl SessionHandles {
    async fn handle_packet(
        &self,
        packet: Packet,
        routes: &mut HashMap<ConnectId, Route>,
        tasks: &TaskTracker,
    ) {
        match packet {
            Packet::DialRequest {
                random,
                protocol,
                address,
                timeout_hint_ms,
            } => {
                debug!(session_id = self.session_id, random, address = %address, timeout_hint_ms, "Frontend dial");
                let dial_ctx = self.ctx.child();
                self.dials.insert(random, dial_ctx.clone());
                tasks.spawn(self.clone().dial(random, protocol, address, dial_ctx));
            }
            Packet::DialClose { random } => {
                if let Some((_, dial_ctx)) = self.dials.remove(&random) {
                    debug!(session_id = self.session_id, random, "Frontend canceled dial");
                    dial_ctx.cancel();
                }
            }
            Packet::Data { connect_id, data } => match routes.get(&connect_id) {
                // Aborted; the relay task reports the close
                Some(route) if route.abort.is_cancelled() => {}
                Some(route) if route.upstream.capacity() > 1 => {
                    // A finished writer drops the bytes
                    let _ = route.upstream.try_send(Upstream::Data(data));
                }
                Some(route) => {
                    warn!(
                        session_id = self.session_id,
                        connect_id, "Agent side fell behind the client, closing connection"
                    );
                    route.abort.cancel();
                }
                None => {
                    let _ = self
                        .outbound
                        .send(Frame::from(Packet::CloseResponse {
                            connect_id,
                            error: Some(format!("unknown connection {}", connect_id)),
                        }))
                        .await;
                }
            },
            Packet::CloseRequest { connect_id, .. } => match routes.remove(&connect_id) {
                // The relay task answers once the agent confirms
                Some(route) => {
                    let _ = route.upstream.try_send(Upstream::Close);
                }
                None => {
                    let _ = self
                        .outbound
                        .send(Frame::from(Packet::CloseResponse {
                            connect_id,
                            error: None,
                        }))
                        .await;
                }
            },
            other => {
                warn!(
                    session_id = self.session_id,
                    kind = other.kind(),
                    "Ignoring packet not expected from a frontend"
                );
            }
        }
    }

    async fn dial(self, random: DialId, protocol: String, address: String, dial_ctx: RequestContext) {
        let result = self.mux.dial(&dial_ctx, &protocol, &address, None).await;
        self.dials.remove(&random);

        let conn = match result {
            Ok(conn) => conn,
            Err(e) => {
                let _ = self
                    .outbound
                    .send(Frame::from(Packet::DialResponse {
                        random,
                        connect_id: 0,
                        error: Some(e.to_string()),
                    }))
                    .await;
                return;
            }
        };

        let connect_id = conn.connect_id();
        let (mut reader, writer) = conn.split();
        // Register the writer before the client can learn the token
        if self
            .events
            .send(SessionEvent::Established(connect_id, writer))
            .is_err()
        {
            return;
        }
        let response = Frame::from(Packet::DialResponse {
            random,
            connect_id,
            error: None,
        });
        if self.outbound.send(response).await.is_err() {
            return;
        }

        loop {
            let chunk = tokio::select! {
                _ = self.ctx.done() => break,
                chunk = reader.recv() => chunk,
            };
            let frame = match chunk {
                Ok(Some(data)) => Packet::Data {
                    connect_id,
                    data: data.to_vec(),
                },
                Ok(None) => Packet::CloseResponse {
                    connect_id,
                    error: None,
                },
                Err(e) => Packet::CloseResponse {
                    connect_id,
                    error: Some(e.to_string()),
                },
            };
            let last = matches!(frame, Packet::CloseResponse { .. });
            if self.outbound.send(Frame::from(frame)).await.is_err() || last {
                break;
            }
        }

        let _ = self.events.send(SessionEvent::Finished(connect_id));
    }
}

/// Client-to-agent direction of one connection
async fn forward_to_agent(
    session_id: u64,
    mut writer: ConnectionWriter,
    mut upstream: mpsc::Receiver<Upstream>,
    abort: CancellationToken,
) {
    let connect_id = writer.connect_id();
    loop {
        let next = tokio::select! {
            biased;
            _ = abort.cancelled() => break,
            next = upstream.recv() => next,
        };
        let result = match next {
            Some(Upstream::Data(data)) => tokio::select! {
                biased;
                _ = abort.cancelled() => break,
                written = writer.write_all(&data) => written,
            },
            Some(Upstream::Close) => tokio::select! {
                biased;
                _ = abort.cancelled() => break,
                closed = writer.shutdown() => closed,
            },
            None => return,
        };
        if let Err(e) = result {
            debug!(session_id, connect_id, "Write towards agent failed: {}", e);
            return;
        }
    }
    writer.abort(QUEUE_FULL);
}

async fn write_frames(
    session_id: u64,
    mut sink: BoxFrameSink,
    mut outbound: mpsc::Receiver<Frame>,
    ctx: RequestContext,
) {
    loop {
        let frame = tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = ctx.done() => break,
        };
        let sent = tokio::select! {
            sent = sink.send_frame(frame) => sent,
            _ = ctx.done() => break,
        };
        if let Err(e) = sent {
            debug!(session_id, "Tunnel session write failed: {}", e);
            break;
        }
    }
    let _ = tokio::time::timeout(Duration::from_secs(1), sink.close()).await;
}
