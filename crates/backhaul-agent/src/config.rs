//! Agent configuration

use crate::AgentError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Broker agent listener, `host:port`
    pub broker_address: String,
    pub agent_id: String,
    /// Destination hosts this agent serves, advertised for host-based selection
    pub agent_identifiers: Vec<String>,
    /// How often the link set is re-evaluated
    pub sync_interval_ms: u64,
    /// How often each link is probed
    pub probe_interval_ms: u64,
    /// Ceiling for the sync backoff after failures
    pub sync_interval_cap_ms: u64,
    /// Overrides the replica count announced by the broker
    pub server_count: Option<u32>,
    /// Hard bound on dialing a destination
    pub dial_timeout_ms: u64,
    pub data_chunk_size: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            broker_address: String::new(),
            agent_id: uuid::Uuid::new_v4().to_string(),
            agent_identifiers: Vec::new(),
            sync_interval_ms: 1_000,
            probe_interval_ms: 1_000,
            sync_interval_cap_ms: 10_000,
            server_count: None,
            dial_timeout_ms: 5_000,
            data_chunk_size: backhaul_proto::DEFAULT_CHUNK_SIZE,
        }
    }
}

impl AgentConfig {
    pub fn new(broker_address: impl Into<String>) -> Self {
        Self {
            broker_address: broker_address.into(),
            ..Self::default()
        }
    }

    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    pub fn with_agent_identifiers(mut self, identifiers: Vec<String>) -> Self {
        self.agent_identifiers = identifiers;
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_sync_interval_cap(mut self, cap: Duration) -> Self {
        self.sync_interval_cap_ms = cap.as_millis() as u64;
        self
    }

    pub fn with_server_count(mut self, count: u32) -> Self {
        self.server_count = Some(count);
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn sync_interval_cap(&self) -> Duration {
        Duration::from_millis(self.sync_interval_cap_ms.max(self.sync_interval_ms))
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.broker_address.is_empty() {
            return Err(AgentError::Config("broker address is required".into()));
        }
        if self.agent_id.is_empty() {
            return Err(AgentError::Config("agent id must not be empty".into()));
        }
        if self.sync_interval_ms == 0 || self.probe_interval_ms == 0 {
            return Err(AgentError::Config(
                "sync and probe intervals must be positive".into(),
            ));
        }
        if self.dial_timeout_ms == 0 || self.data_chunk_size == 0 {
            return Err(AgentError::Config(
                "dial timeout and chunk size must be positive".into(),
            ));
        }
        if self.server_count == Some(0) {
            return Err(AgentError::Config("server count must be positive".into()));
        }
        Ok(())
    }
}
