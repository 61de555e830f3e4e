//! Frame transport for agent links and tunnel sessions
//!
//! A physical stream is split into a [`FrameSink`] and a [`FrameSource`] so the
//! writer and reader can live in different tasks. The broker and the agent only
//! see these traits; [`framed`] provides the TCP implementation and
//! [`handshake`] the `Open`/`Accepted` exchange that starts every stream.
//!
//! ```text
//!   agent / client                         broker
//!   ──────────────                         ──────
//!   Open { metadata }        ───────────▶
//!                            ◀───────────  Accepted { metadata } | Rejected
//!   Packet / Ping / Pong     ◀──────────▶  Packet / Ping / Pong
//! ```

pub mod framed;
pub mod handshake;

use async_trait::async_trait;
use backhaul_proto::{CodecError, Frame};
use std::fmt::Debug;
use thiserror::Error;

pub use framed::{FramedSink, FramedSource, FramedStream};
pub use handshake::{accept_handshake, connect_with_metadata, Established, PendingHandshake};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Handshake rejected: {0}")]
    Rejected(String),

    #[error("Timeout")]
    Timeout,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Sending half of a physical stream
#[async_trait]
pub trait FrameSink: Send + Debug {
    /// Send one frame, waiting for the transport to accept it
    async fn send_frame(&mut self, frame: Frame) -> TransportResult<()>;

    /// Flush and close the sending side
    async fn close(&mut self) -> TransportResult<()>;
}

/// Receiving half of a physical stream
#[async_trait]
pub trait FrameSource: Send + Debug {
    /// Receive the next frame
    ///
    /// Returns `None` once the peer closed the stream gracefully.
    async fn recv_frame(&mut self) -> TransportResult<Option<Frame>>;
}

pub type BoxFrameSink = Box<dyn FrameSink>;
pub type BoxFrameSource = Box<dyn FrameSource>;
