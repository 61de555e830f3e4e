//! Backhaul agent
//!
//! Runs inside the isolated network. A [`ClientSet`] keeps one outbound link
//! per broker replica; every link is an [`AgentClient`] that executes the
//! broker's dial requests against real destinations and relays their bytes.

mod backoff;
pub mod client;
pub mod client_set;
pub mod config;
mod dialer;
mod endpoint;
pub mod error;

pub use client::AgentClient;
pub use client_set::ClientSet;
pub use config::AgentConfig;
pub use error::AgentError;
