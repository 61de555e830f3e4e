//! Caller-facing adapters built on the [`Multiplexer`](crate::Multiplexer)

pub mod http_connect;
pub mod tunnel;

pub use http_connect::{HttpConnectConfig, HttpConnectError, HttpConnectService};
pub use tunnel::{TunnelService, TunnelServiceConfig};
