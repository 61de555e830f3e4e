//! Tunnel client
//!
//! Dials destinations behind agents through a broker's streaming tunnel
//! listener. A [`Tunnel`] is one session; each successful [`Tunnel::dial`]
//! yields a [`TunnelConn`] that reads and writes like a TCP stream.
//!
//! ```no_run
//! use backhaul_client::Tunnel;
//! use backhaul_metrics::ClientMetrics;
//! use backhaul_proto::RequestContext;
//! use tokio::io::AsyncWriteExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let tunnel = Tunnel::connect("broker:8090", ClientMetrics::new()).await?;
//! let mut conn = tunnel
//!     .dial(&RequestContext::background(), "tcp", "10.0.0.5:5432")
//!     .await?;
//! conn.write_all(b"hello").await?;
//! # Ok(())
//! # }
//! ```

mod conn;
mod error;
mod tunnel;

pub use conn::TunnelConn;
pub use error::{dial_failure_reason, DialError};
pub use tunnel::Tunnel;
