//! Broker configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backend selection strategies, tried in the configured order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Uniformly random among live backends
    Default,
    /// Backends whose agent advertised the destination host
    DestHost,
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(StrategyKind::Default),
            "dest-host" | "destHost" => Ok(StrategyKind::DestHost),
            other => Err(format!("unknown proxy strategy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener for agent links
    pub agent_bind: Option<String>,
    /// Listener for streaming tunnel sessions
    pub tunnel_bind: Option<String>,
    /// Listener for HTTP CONNECT
    pub http_connect_bind: Option<String>,
    /// Identity of this broker replica
    pub server_id: String,
    /// Number of broker replicas agents should connect to
    pub server_count: u32,
    pub strategies: Vec<StrategyKind>,
    /// Tunnel sessions with no connections close after this long (0 disables)
    pub frontend_idle_timeout_ms: u64,
    /// Deadline for an HTTP CONNECT dial (0 waits for the agent)
    pub http_connect_dial_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Frames buffered towards one agent before writers wait
    pub backend_channel_capacity: usize,
    pub data_chunk_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            agent_bind: None,
            tunnel_bind: None,
            http_connect_bind: None,
            server_id: uuid::Uuid::new_v4().to_string(),
            server_count: 1,
            strategies: vec![StrategyKind::Default],
            frontend_idle_timeout_ms: 0,
            http_connect_dial_timeout_ms: 0,
            handshake_timeout_ms: 10_000,
            backend_channel_capacity: 256,
            data_chunk_size: backhaul_proto::DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ServerConfig {
    pub fn with_agent_bind(mut self, addr: impl Into<String>) -> Self {
        self.agent_bind = Some(addr.into());
        self
    }

    pub fn with_tunnel_bind(mut self, addr: impl Into<String>) -> Self {
        self.tunnel_bind = Some(addr.into());
        self
    }

    pub fn with_http_connect_bind(mut self, addr: impl Into<String>) -> Self {
        self.http_connect_bind = Some(addr.into());
        self
    }

    pub fn with_server_id(mut self, id: impl Into<String>) -> Self {
        self.server_id = id.into();
        self
    }

    pub fn with_server_count(mut self, count: u32) -> Self {
        self.server_count = count;
        self
    }

    pub fn with_strategies(mut self, strategies: Vec<StrategyKind>) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn with_frontend_idle_timeout(mut self, timeout: Duration) -> Self {
        self.frontend_idle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_http_connect_dial_timeout(mut self, timeout: Duration) -> Self {
        self.http_connect_dial_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn frontend_idle_timeout(&self) -> Option<Duration> {
        non_zero_ms(self.frontend_idle_timeout_ms)
    }

    pub fn http_connect_dial_timeout(&self) -> Option<Duration> {
        non_zero_ms(self.http_connect_dial_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), crate::ServerError> {
        if self.agent_bind.is_none() {
            return Err(crate::ServerError::Config(
                "an agent listener address is required".into(),
            ));
        }
        if self.tunnel_bind.is_none() && self.http_connect_bind.is_none() {
            return Err(crate::ServerError::Config(
                "at least one frontend listener (tunnel or HTTP CONNECT) is required".into(),
            ));
        }
        if self.strategies.is_empty() {
            return Err(crate::ServerError::Config(
                "at least one proxy strategy is required".into(),
            ));
        }
        if self.server_count == 0 || self.backend_channel_capacity == 0 || self.data_chunk_size == 0
        {
            return Err(crate::ServerError::Config(
                "server_count, backend_channel_capacity and data_chunk_size must be positive"
                    .into(),
            ));
        }
        Ok(())
    }
}

fn non_zero_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parse() {
        assert_eq!("default".parse::<StrategyKind>(), Ok(StrategyKind::Default));
        assert_eq!("dest-host".parse::<StrategyKind>(), Ok(StrategyKind::DestHost));
        assert!("least-loaded".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn test_validate_requires_listeners() {
        let config = ServerConfig::default();
        assert!(config.validate().is_err());

        let config = ServerConfig::default()
            .with_agent_bind("127.0.0.1:8091")
            .with_http_connect_bind("127.0.0.1:8090");
        assert!(config.validate().is_ok());
        assert_eq!(config.frontend_idle_timeout(), None);
    }
}
