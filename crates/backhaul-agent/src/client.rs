//! One agent link to one broker replica
//!
//! The link reader dispatches broker packets; every dial and every endpoint
//! relay direction runs in its own task, tracked so that closing the link
//! joins all of them before it returns.

use crate::dialer::dial_tcp;
use crate::endpoint::{Endpoint, EndpointCommand, EndpointTable, Routed};
use crate::{AgentConfig, AgentError};
use backhaul_metrics::AgentMetrics;
use backhaul_proto::metadata::{
    AGENT_ID, AGENT_IDENTIFIERS, PROTOCOL_VERSION as PROTOCOL_VERSION_KEY, SERVER_COUNT, SERVER_ID,
};
use backhaul_proto::{
    ConnectId, DialId, Frame, Metadata, Packet, CONNECTION_QUEUE_CAPACITY, PROTOCOL_VERSION, QUEUE_FULL,
};
use backhaul_transport::{connect_with_metadata, BoxFrameSink, BoxFrameSource};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

const LINK_CHANNEL_CAPACITY: usize = 256;

/// Probes missed before a link stops counting as healthy
const MISSED_PROBES: u32 = 3;

pub struct AgentClient {
    server_id: String,
    server_count: Option<u32>,
    config: Arc<AgentConfig>,
    metrics: Arc<AgentMetrics>,
    outbound: mpsc::Sender<Frame>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    endpoints: EndpointTable,
    dials: DashMap<DialId, CancellationToken>,
    next_connect_id: AtomicU64,
    last_seen: Mutex<Instant>,
}

impl std::fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClient")
            .field("server_id", &self.server_id)
            .field("agent_id", &self.config.agent_id)
            .field("endpoints", &self.endpoints.len())
            .finish()
    }
}

impl AgentClient {
    /// Open a link to the broker. The returned source must be handed to [`serve`](Self::serve).
    pub async fn connect(
        config: Arc<AgentConfig>,
        metrics: Arc<AgentMetrics>,
        parent: &CancellationToken,
    ) -> Result<(Arc<Self>, BoxFrameSource), AgentError> {
        let mut metadata = Metadata::new()
            .with(AGENT_ID, config.agent_id.clone())
            .with(PROTOCOL_VERSION_KEY, PROTOCOL_VERSION.to_string());
        if !config.agent_identifiers.is_empty() {
            metadata.insert(AGENT_IDENTIFIERS, config.agent_identifiers.join(","));
        }

        let established = connect_with_metadata(&config.broker_address, metadata).await?;
        let server_id = established
            .metadata
            .get(SERVER_ID)
            .filter(|id| !id.is_empty())
            .ok_or(AgentError::MissingServerId)?
            .to_string();
        let server_count = established
            .metadata
            .get(SERVER_COUNT)
            .and_then(|count| count.parse().ok());

        let (outbound, outbound_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        let client = Arc::new(Self {
            server_id,
            server_count,
            metrics: metrics.clone(),
            outbound,
            shutdown: parent.child_token(),
            tasks: TaskTracker::new(),
            endpoints: EndpointTable::new(metrics),
            dials: DashMap::new(),
            next_connect_id: AtomicU64::new(1),
            last_seen: Mutex::new(Instant::now()),
            config,
        });
        client
            .tasks
            .spawn(client.clone().write_frames(established.sink, outbound_rx));

        info!(
            agent_id = %client.config.agent_id,
            server_id = %client.server_id,
            peer = %established.peer_addr,
            "Link established"
        );
        Ok((client, established.source))
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Replica count the broker announced
    pub fn server_count(&self) -> Option<u32> {
        self.server_count
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Open and heard from within the last few probe intervals
    pub fn is_healthy(&self) -> bool {
        let window = self.config.probe_interval() * MISSED_PROBES;
        !self.is_closed() && self.last_seen.lock().unwrap().elapsed() <= window
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn pending_dial_count(&self) -> usize {
        self.dials.len()
    }

    /// Tasks still running on this link
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Read broker packets until the link ends, then tear everything down
    pub async fn serve(self: Arc<Self>, mut source: BoxFrameSource) {
        self.tasks.spawn(self.clone().probe());

        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                frame = source.recv_frame() => frame,
            };
            *self.last_seen.lock().unwrap() = Instant::now();

            match frame {
                Ok(Some(Frame::Packet(packet))) => self.handle_packet(packet).await,
                Ok(Some(Frame::Ping { timestamp })) => {
                    let _ = self.outbound.send(Frame::Pong { timestamp }).await;
                }
                Ok(Some(Frame::Pong { .. })) => {}
                Ok(Some(other)) => {
                    warn!(server_id = %self.server_id, "Unexpected frame on link: {:?}", other);
                    break;
                }
                Ok(None) => {
                    info!(server_id = %self.server_id, "Broker closed link");
                    break;
                }
                Err(e) => {
                    warn!(server_id = %self.server_id, "Link read failed: {}", e);
                    break;
                }
            }
        }

        drop(source);
        self.close().await;
    }

    /// Cancel every dial and endpoint of this link and wait for their tasks
    pub async fn close(&self) {
        self.shutdown.cancel();
        for dial in self.dials.iter() {
            dial.value().cancel();
        }
        self.endpoints.cancel_all();
        self.tasks.close();
        self.tasks.wait().await;
        self.dials.clear();
        let leftover = self.endpoints.clear();
        if leftover > 0 {
            debug!(server_id = %self.server_id, leftover, "Dropped endpoints at link close");
        }
        info!(server_id = %self.server_id, "Link closed");
    }

    async fn handle_packet(self: &Arc<Self>, packet: Packet) {
        match packet {
            Packet::DialRequest {
                random,
                protocol,
                address,
                timeout_hint_ms,
            } => {
                debug!(random, address = %address, timeout_hint_ms, "DialRequest");
                let token = self.shutdown.child_token();
                self.dials.insert(random, token.clone());
                self.tasks
                    .spawn(self.clone().dial(random, protocol, address, token));
            }
            Packet::DialClose { random } => {
                if let Some((_, token)) = self.dials.remove(&random) {
                    debug!(random, "Broker abandoned dial");
                    token.cancel();
                }
            }
            Packet::Data { connect_id, data } => {
                match self.endpoints.send(connect_id, EndpointCommand::Data(data)) {
                    Routed::Queued => {}
                    Routed::Unknown => {
                        debug!(connect_id, "Data for unknown connection");
                        self.send(Packet::CloseResponse {
                            connect_id,
                            error: Some(format!("unknown connection {}", connect_id)),
                        })
                        .await;
                    }
                    Routed::Overflow => {
                        warn!(connect_id, "Destination fell behind the broker, closing");
                        self.send(Packet::CloseResponse {
                            connect_id,
                            error: Some(QUEUE_FULL.to_string()),
                        })
                        .await;
                    }
                }
            }
            Packet::CloseRequest { connect_id, error } => {
                debug!(connect_id, error = ?error, "CloseRequest");
                // The endpoint's reader answers once it has stopped
                if self.endpoints.send(connect_id, EndpointCommand::Close) != Routed::Queued {
                    self.send(Packet::CloseResponse {
                        connect_id,
                        error: None,
                    })
                    .await;
                }
            }
            Packet::CloseResponse { connect_id, .. } => {
                debug!(connect_id, "CloseResponse from broker");
            }
            other => {
                warn!(kind = other.kind(), "Ignoring packet not expected from a broker");
            }
        }
    }

    async fn dial(self: Arc<Self>, random: DialId, protocol: String, address: String, token: CancellationToken) {
        let result = if protocol == "tcp" {
            tokio::select! {
                _ = token.cancelled() => {
                    self.dials.remove(&random);
                    debug!(random, address = %address, "Dial canceled");
                    return;
                }
                result = dial_tcp(&address, self.config.dial_timeout()) => result,
            }
        } else {
            Err(crate::dialer::DialFailure {
                reason: backhaul_metrics::AgentDialFailure::Unknown,
                message: format!("dial {}: unknown network {}", address, protocol),
            })
        };

        // Past this point a DialClose no longer applies; the broker closes by token
        let canceled = self.dials.remove(&random).is_none() || token.is_cancelled();

        let stream = match result {
            Ok(stream) if canceled => {
                debug!(random, address = %address, "Dial finished after cancel, dropping");
                drop(stream);
                return;
            }
            Ok(stream) => stream,
            Err(failure) => {
                warn!(random, address = %address, "Dial failed: {}", failure);
                self.metrics.observe_dial_failure(failure.reason);
                self.send(Packet::DialResponse {
                    random,
                    connect_id: 0,
                    error: Some(failure.message),
                })
                .await;
                return;
            }
        };

        let connect_id: ConnectId = self.next_connect_id.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = stream.into_split();
        let (commands, commands_rx) = mpsc::channel(CONNECTION_QUEUE_CAPACITY);
        let endpoint_token = self.shutdown.child_token();
        self.endpoints.insert(
            connect_id,
            Endpoint {
                commands,
                token: endpoint_token.clone(),
                address: address.clone(),
            },
        );
        self.tasks.spawn(write_endpoint(
            connect_id,
            write_half,
            commands_rx,
            endpoint_token.clone(),
        ));

        info!(random, connect_id, address = %address, "Endpoint connected");
        self.send(Packet::DialResponse {
            random,
            connect_id,
            error: None,
        })
        .await;

        // Data may follow only after the response is queued
        self.tasks
            .spawn(self.clone().read_endpoint(connect_id, read_half, endpoint_token));
    }

    async fn read_endpoint(self: Arc<Self>, connect_id: ConnectId, mut read_half: OwnedReadHalf, token: CancellationToken) {
        let mut buf = vec![0u8; self.config.data_chunk_size];
        let error = loop {
            let read = tokio::select! {
                _ = token.cancelled() => break None,
                read = read_half.read(&mut buf) => read,
            };
            match read {
                Ok(0) => break None,
                Ok(n) => {
                    let frame = Frame::from(Packet::Data {
                        connect_id,
                        data: buf[..n].to_vec(),
                    });
                    let sent = tokio::select! {
                        _ = token.cancelled() => break None,
                        sent = self.outbound.send(frame) => sent,
                    };
                    if sent.is_err() {
                        break None;
                    }
                }
                Err(e) => break Some(e.to_string()),
            }
        };
        token.cancel();

        if let Some(endpoint) = self.endpoints.remove(connect_id) {
            debug!(connect_id, address = %endpoint.address, "Endpoint closed");
            if !self.shutdown.is_cancelled() {
                self.send(Packet::CloseResponse { connect_id, error }).await;
            }
        }
    }

    async fn probe(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.probe_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let timestamp = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or_default();
                    if self.outbound.send(Frame::Ping { timestamp }).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    async fn write_frames(self: Arc<Self>, mut sink: BoxFrameSink, mut outbound: mpsc::Receiver<Frame>) {
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                frame = outbound.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            let sent = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                sent = sink.send_frame(frame) => sent,
            };
            if let Err(e) = sent {
                warn!(server_id = %self.server_id, "Link write failed: {}", e);
                break;
            }
        }
        // A dead writer means a dead link
        self.shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(1), sink.close()).await;
    }

    async fn send(&self, packet: Packet) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = self.outbound.send(Frame::from(packet)) => {}
        }
    }
}

async fn write_endpoint(
    connect_id: ConnectId,
    mut write_half: OwnedWriteHalf,
    mut commands: mpsc::Receiver<EndpointCommand>,
    token: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            _ = token.cancelled() => break,
            command = commands.recv() => command,
        };
        match command {
            Some(EndpointCommand::Data(data)) => {
                let written = tokio::select! {
                    _ = token.cancelled() => break,
                    written = write_half.write_all(&data) => written,
                };
                if let Err(e) = written {
                    debug!(connect_id, "Endpoint write failed: {}", e);
                    break;
                }
            }
            Some(EndpointCommand::Close) | None => break,
        }
    }
    let _ = write_half.shutdown().await;
    token.cancel();
}
