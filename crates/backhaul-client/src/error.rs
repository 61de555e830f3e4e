use backhaul_metrics::ClientDialFailure;
use backhaul_proto::ContextError;
use backhaul_transport::TransportError;
use thiserror::Error;

/// Why a tunnel dial failed
#[derive(Debug, Error)]
pub enum DialError {
    /// The caller's context ended before the broker answered
    #[error("dial timeout, {0}")]
    Context(#[from] ContextError),

    /// The broker or agent reported an error; the text is theirs
    #[error("{0}")]
    Endpoint(String),

    #[error("tunnel closed")]
    TunnelClosed,

    #[error("single-use dialer already dialed")]
    AlreadyStarted,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl DialError {
    pub fn reason(&self) -> Option<ClientDialFailure> {
        match self {
            DialError::Context(_) => Some(ClientDialFailure::Context),
            DialError::Endpoint(_) => Some(ClientDialFailure::Endpoint),
            DialError::TunnelClosed => Some(ClientDialFailure::TunnelClosed),
            DialError::AlreadyStarted => Some(ClientDialFailure::AlreadyStarted),
            DialError::Transport(_) => None,
        }
    }
}

/// Failure reason of an error returned by a dial, if it is a dial failure
pub fn dial_failure_reason(err: &(dyn std::error::Error + 'static)) -> Option<ClientDialFailure> {
    err.downcast_ref::<DialError>().and_then(DialError::reason)
}
