use backhaul_transport::TransportError;
use thiserror::Error;

/// Agent-side errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("broker did not identify itself")]
    MissingServerId,

    #[error("already connected to broker {0}")]
    DuplicateServer(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
