//! Backhaul wire protocol
//!
//! Frame and packet types exchanged on agent links and tunnel sessions, the
//! length-prefixed codec that carries them, stream metadata keys and the
//! per-request cancellation context shared by the broker and its clients.

pub mod codec;
pub mod context;
pub mod messages;
pub mod metadata;

pub use codec::{CodecError, FrameCodec};
pub use context::{ContextError, RequestContext};
pub use messages::{ConnectId, DialId, Frame, Packet};
pub use metadata::Metadata;

/// Protocol version, sent as stream metadata on `Open`
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum encoded frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Default size of a relayed data chunk
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Chunks one logical connection may have queued for a slower consumer.
///
/// Stream readers never wait on a single connection; a connection that
/// outruns its consumer by more than this is closed with [`QUEUE_FULL`].
pub const CONNECTION_QUEUE_CAPACITY: usize = 128;

/// Close reason for a connection whose queue overflowed
pub const QUEUE_FULL: &str = "connection queue full";
