//! Broker error types

use backhaul_metrics::ServerDialFailure;
use backhaul_proto::ContextError;
use backhaul_transport::TransportError;
use thiserror::Error;

/// Why a dial through the multiplexer did not produce a connection
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DialError {
    #[error("no backend available")]
    NoBackendAvailable,

    /// The caller's context finished before the agent answered
    #[error("{0}")]
    Context(#[from] ContextError),

    /// The agent reported an error; the text is the agent's own
    #[error("{0}")]
    Endpoint(String),

    #[error("backend closed before the dial completed")]
    BackendClosed,
}

impl DialError {
    /// Broker-side classification, if the failure is counted by the broker
    pub fn server_failure(&self) -> ServerDialFailure {
        match self {
            DialError::NoBackendAvailable => ServerDialFailure::NoBackendAvailable,
            DialError::Context(_) => ServerDialFailure::FrontendClose,
            DialError::Endpoint(_) => ServerDialFailure::ErrorResponse,
            DialError::BackendClosed => ServerDialFailure::BackendClose,
        }
    }
}

/// Errors surfaced by the broker's listeners and services
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {address}: {source}")]
    BindError {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(String),
}
