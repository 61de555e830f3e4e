//! Broker orchestration: binds the listeners and runs the services

use crate::agent_service::{AgentService, AgentServiceConfig};
use crate::config::ServerConfig;
use crate::frontend::{HttpConnectConfig, HttpConnectService, TunnelService, TunnelServiceConfig};
use crate::multiplexer::Multiplexer;
use crate::registry::BackendRegistry;
use crate::{strategy, ServerError};
use backhaul_metrics::ServerMetrics;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Addresses the listeners actually bound (port 0 resolved)
#[derive(Debug, Clone, Copy, Default)]
pub struct BoundAddrs {
    pub agent: Option<SocketAddr>,
    pub tunnel: Option<SocketAddr>,
    pub http_connect: Option<SocketAddr>,
}

pub struct ProxyServer {
    config: ServerConfig,
    mux: Arc<Multiplexer>,
    metrics: Arc<ServerMetrics>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    agent_service: Option<Arc<AgentService>>,
    tunnel_service: Option<Arc<TunnelService>>,
    http_connect_service: Option<Arc<HttpConnectService>>,
}

impl ProxyServer {
    pub fn new(config: ServerConfig, metrics: Arc<ServerMetrics>) -> Result<Self, ServerError> {
        config.validate()?;

        let strategies = config.strategies.iter().copied().map(strategy::build).collect();
        let registry = Arc::new(BackendRegistry::new(strategies, metrics.clone()));
        let mux = Arc::new(Multiplexer::new(
            registry,
            metrics.clone(),
            config.data_chunk_size,
        ));

        Ok(Self {
            config,
            mux,
            metrics,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            agent_service: None,
            tunnel_service: None,
            http_connect_service: None,
        })
    }

    /// Bind every configured listener and start serving in the background
    pub async fn start(&mut self) -> Result<BoundAddrs, ServerError> {
        let mut bound = BoundAddrs::default();

        // Bind everything first so a bad address fails startup before anything runs
        let agent_listener = match &self.config.agent_bind {
            Some(addr) => Some(bind_with_retry(addr).await?),
            None => None,
        };
        let tunnel_listener = match &self.config.tunnel_bind {
            Some(addr) => Some(bind_with_retry(addr).await?),
            None => None,
        };
        let http_listener = match &self.config.http_connect_bind {
            Some(addr) => Some(bind_with_retry(addr).await?),
            None => None,
        };

        if let Some(listener) = agent_listener {
            bound.agent = Some(listener.local_addr()?);
            let service = Arc::new(AgentService::new(
                self.mux.clone(),
                AgentServiceConfig {
                    server_id: self.config.server_id.clone(),
                    server_count: self.config.server_count,
                    handshake_timeout: self.config.handshake_timeout(),
                    channel_capacity: self.config.backend_channel_capacity,
                },
                self.shutdown.clone(),
            ));
            self.tasks.spawn(service.clone().serve(listener));
            self.agent_service = Some(service);
        }

        if let Some(listener) = tunnel_listener {
            bound.tunnel = Some(listener.local_addr()?);
            let service = Arc::new(TunnelService::new(
                self.mux.clone(),
                TunnelServiceConfig {
                    server_id: self.config.server_id.clone(),
                    handshake_timeout: self.config.handshake_timeout(),
                    idle_timeout: self.config.frontend_idle_timeout(),
                },
                self.shutdown.clone(),
            ));
            self.tasks.spawn(service.clone().serve(listener));
            self.tunnel_service = Some(service);
        }

        if let Some(listener) = http_listener {
            bound.http_connect = Some(listener.local_addr()?);
            let service = Arc::new(HttpConnectService::new(
                self.mux.clone(),
                HttpConnectConfig {
                    dial_timeout: self.config.http_connect_dial_timeout(),
                },
                self.shutdown.clone(),
            ));
            self.tasks.spawn(service.clone().serve(listener));
            self.http_connect_service = Some(service);
        }

        info!(
            server_id = %self.config.server_id,
            agent = ?bound.agent,
            tunnel = ?bound.tunnel,
            http_connect = ?bound.http_connect,
            "Proxy server started"
        );
        Ok(bound)
    }

    /// Serve until the shutdown token fires
    pub async fn run(&mut self) -> Result<(), ServerError> {
        self.start().await?;
        self.shutdown.cancelled().await;
        self.shutdown().await;
        Ok(())
    }

    /// Stop the listeners, end every backend and session and wait for their tasks
    pub async fn shutdown(&self) {
        info!(server_id = %self.config.server_id, "Shutting down proxy server");
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!(server_id = %self.config.server_id, "Proxy server stopped");
    }

    /// Canceling this token stops the server
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        self.mux.registry()
    }

    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.mux
    }

    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    pub fn agent_stream_count(&self) -> usize {
        self.agent_service
            .as_ref()
            .map(|s| s.stream_count())
            .unwrap_or(0)
    }

    pub fn tunnel_session_count(&self) -> usize {
        self.tunnel_service
            .as_ref()
            .map(|s| s.session_count())
            .unwrap_or(0)
    }

    pub fn http_connect_active(&self) -> usize {
        self.http_connect_service
            .as_ref()
            .map(|s| s.active_connections())
            .unwrap_or(0)
    }
}

/// Retries a few times while the port sits in TIME_WAIT
async fn bind_with_retry(addr: &str) -> Result<TcpListener, ServerError> {
    const ATTEMPTS: u32 = 3;

    for attempt in 1..=ATTEMPTS {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                if attempt > 1 {
                    info!("Bound {} on attempt {}/{}", addr, attempt, ATTEMPTS);
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < ATTEMPTS => {
                warn!(
                    "Address {} in use (attempt {}/{}), retrying in 1 second...",
                    addr, attempt, ATTEMPTS
                );
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(source) => {
                return Err(ServerError::BindError {
                    address: addr.to_string(),
                    source,
                });
            }
        }
    }

    Err(ServerError::BindError {
        address: addr.to_string(),
        source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
    })
}
