//! Agent-facing `Connect` service
//!
//! Each accepted TCP stream must open with `Open { agentID }`. The broker
//! answers with its own identity and replica count, registers the stream as a
//! backend and reads it until it ends.

use crate::backend::{Backend, BackendInfo};
use crate::multiplexer::Multiplexer;
use backhaul_proto::metadata::{AGENT_ID, AGENT_IDENTIFIERS, SERVER_COUNT, SERVER_ID};
use backhaul_proto::Metadata;
use backhaul_transport::accept_handshake;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct AgentServiceConfig {
    pub server_id: String,
    pub server_count: u32,
    pub handshake_timeout: Duration,
    pub channel_capacity: usize,
}

pub struct AgentService {
    mux: Arc<Multiplexer>,
    config: AgentServiceConfig,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl AgentService {
    pub fn new(mux: Arc<Multiplexer>, config: AgentServiceConfig, shutdown: CancellationToken) -> Self {
        Self {
            mux,
            config,
            shutdown,
            tasks: TaskTracker::new(),
        }
    }

    /// Accept agent streams until shutdown, then wait for every stream to finish
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!(server_id = %self.config.server_id, "Agent service listening on {}", addr);
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let service = self.clone();
                        self.tasks.spawn(async move {
                            service.handle_stream(stream, peer_addr).await;
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept agent connection: {}", e);
                    }
                },
            }
        }

        drop(listener);
        self.tasks.close();
        self.tasks.wait().await;
        debug!("Agent service stopped");
    }

    async fn handle_stream(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let pending = match accept_handshake(stream, self.config.handshake_timeout).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(peer = %peer_addr, "Agent handshake failed: {}", e);
                return;
            }
        };

        let agent_id = match pending.metadata().get(AGENT_ID) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                warn!(peer = %peer_addr, "Rejecting agent stream without {} metadata", AGENT_ID);
                let _ = pending
                    .reject(format!("missing {} metadata", AGENT_ID))
                    .await;
                return;
            }
        };
        let identifiers = pending.metadata().get_list(AGENT_IDENTIFIERS);

        let reply = Metadata::new()
            .with(SERVER_ID, self.config.server_id.clone())
            .with(SERVER_COUNT, self.config.server_count.to_string());
        let established = match pending.accept(reply).await {
            Ok(established) => established,
            Err(e) => {
                warn!(agent_id = %agent_id, peer = %peer_addr, "Failed to accept agent stream: {}", e);
                return;
            }
        };

        info!(agent_id = %agent_id, peer = %peer_addr, "Agent connected");

        let backend = Backend::new(
            BackendInfo {
                agent_id,
                identifiers,
                peer_addr: Some(peer_addr),
            },
            established.sink,
            self.config.channel_capacity,
            &self.shutdown,
            self.mux.metrics().clone(),
        );
        self.mux.serve_backend(backend, established.source).await;
    }

    /// Agent streams still being served, including ones still handshaking.
    /// The registry's backend count only covers registered streams.
    pub fn stream_count(&self) -> usize {
        self.tasks.len()
    }
}
