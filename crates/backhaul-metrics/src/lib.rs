//! Countable events observed by the client, the broker and the agent
//!
//! Each component receives its metrics as an `Arc` handle instead of reaching
//! for process globals, so tests can create fresh instances or `reset()` them
//! between cases. Exporting the values is left to whoever owns the handle.

mod counter;

pub use counter::{FailureReason, Gauge, ReasonCounter};

use std::sync::Arc;
use tracing::debug;

/// Dial failures as seen by the tunnel client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientDialFailure {
    /// The caller's context was canceled or expired
    Context,
    /// The agent reported a dial error
    Endpoint,
    /// The tunnel session died while the dial was pending
    TunnelClosed,
    /// A single-use tunnel was asked to dial twice
    AlreadyStarted,
}

impl FailureReason for ClientDialFailure {
    const ALL: &'static [Self] = &[
        Self::Context,
        Self::Endpoint,
        Self::TunnelClosed,
        Self::AlreadyStarted,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::Context => "context",
            Self::Endpoint => "endpoint",
            Self::TunnelClosed => "tunnelclosed",
            Self::AlreadyStarted => "alreadystarted",
        }
    }
}

/// Dial failures as seen by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerDialFailure {
    /// The agent answered with an error
    ErrorResponse,
    /// The frontend gave up before the agent answered
    FrontendClose,
    /// No agent stream could take the dial
    NoBackendAvailable,
    /// The selected agent stream went away while the dial was pending
    BackendClose,
}

impl FailureReason for ServerDialFailure {
    const ALL: &'static [Self] = &[
        Self::ErrorResponse,
        Self::FrontendClose,
        Self::NoBackendAvailable,
        Self::BackendClose,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::ErrorResponse => "error_response",
            Self::FrontendClose => "frontend_close",
            Self::NoBackendAvailable => "no_backend_available",
            Self::BackendClose => "backend_close",
        }
    }
}

/// Dial failures as seen by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentDialFailure {
    /// Refused, unresolvable or any other dial error
    Unknown,
    /// The agent's own dial deadline expired
    Timeout,
}

impl FailureReason for AgentDialFailure {
    const ALL: &'static [Self] = &[Self::Unknown, Self::Timeout];

    fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Default)]
pub struct ClientMetrics {
    dial_failures: ReasonCounter<ClientDialFailure>,
}

impl ClientMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn observe_dial_failure(&self, reason: ClientDialFailure) {
        debug!(reason = reason.as_str(), "Client dial failure");
        self.dial_failures.inc(reason);
    }

    pub fn dial_failures(&self, reason: ClientDialFailure) -> u64 {
        self.dial_failures.get(reason)
    }

    pub fn reset(&self) {
        self.dial_failures.reset();
    }
}

#[derive(Debug, Default)]
pub struct ServerMetrics {
    dial_failures: ReasonCounter<ServerDialFailure>,
    pending_dials: Gauge,
    established_connections: Gauge,
    backends: Gauge,
}

impl ServerMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn observe_dial_failure(&self, reason: ServerDialFailure) {
        debug!(reason = reason.as_str(), "Server dial failure");
        self.dial_failures.inc(reason);
    }

    pub fn dial_failures(&self, reason: ServerDialFailure) -> u64 {
        self.dial_failures.get(reason)
    }

    pub fn pending_dials(&self) -> &Gauge {
        &self.pending_dials
    }

    /// Logical connections currently established through this broker
    pub fn established_connections(&self) -> &Gauge {
        &self.established_connections
    }

    /// Agent streams currently registered
    pub fn backends(&self) -> &Gauge {
        &self.backends
    }

    pub fn reset(&self) {
        self.dial_failures.reset();
        self.pending_dials.reset();
        self.established_connections.reset();
        self.backends.reset();
    }
}

#[derive(Debug, Default)]
pub struct AgentMetrics {
    dial_failures: ReasonCounter<AgentDialFailure>,
    endpoint_connections: Gauge,
}

impl AgentMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn observe_dial_failure(&self, reason: AgentDialFailure) {
        debug!(reason = reason.as_str(), "Agent dial failure");
        self.dial_failures.inc(reason);
    }

    pub fn dial_failures(&self, reason: AgentDialFailure) -> u64 {
        self.dial_failures.get(reason)
    }

    /// Open connections from the agent to real destinations
    pub fn endpoint_connections(&self) -> &Gauge {
        &self.endpoint_connections
    }

    pub fn reset(&self) {
        self.dial_failures.reset();
        self.endpoint_connections.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_metrics_reset() {
        let metrics = ServerMetrics::new();

        metrics.observe_dial_failure(ServerDialFailure::FrontendClose);
        metrics.observe_dial_failure(ServerDialFailure::FrontendClose);
        metrics.established_connections().inc();

        assert_eq!(metrics.dial_failures(ServerDialFailure::FrontendClose), 2);
        assert_eq!(metrics.dial_failures(ServerDialFailure::ErrorResponse), 0);
        assert_eq!(metrics.established_connections().get(), 1);

        metrics.reset();
        assert_eq!(metrics.dial_failures(ServerDialFailure::FrontendClose), 0);
        assert_eq!(metrics.established_connections().get(), 0);
    }

    #[test]
    fn test_instances_are_independent() {
        let first = AgentMetrics::new();
        let second = AgentMetrics::new();

        first.observe_dial_failure(AgentDialFailure::Timeout);
        first.endpoint_connections().inc();

        assert_eq!(first.dial_failures(AgentDialFailure::Timeout), 1);
        assert_eq!(second.dial_failures(AgentDialFailure::Timeout), 0);
        assert_eq!(second.endpoint_connections().get(), 0);
    }

    #[test]
    fn test_client_snapshot_lists_every_reason() {
        let metrics = ClientMetrics::new();
        metrics.observe_dial_failure(ClientDialFailure::Endpoint);

        let snapshot = metrics.dial_failures.snapshot();
        assert_eq!(snapshot.len(), ClientDialFailure::ALL.len());
        assert!(snapshot.contains(&("endpoint", 1)));
        assert!(snapshot.contains(&("context", 0)));
    }
}
