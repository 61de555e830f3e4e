//! Backhaul broker
//!
//! Agents inside isolated networks hold long-lived streams to the broker.
//! Frontends ask the broker to dial a destination; the [`Multiplexer`] picks
//! a backend through the [`BackendRegistry`], forwards the dial and relays
//! bytes over the resulting logical connection.
//!
//! - [`agent_service`]: accepts agent streams and registers them as backends
//! - [`frontend`]: the streaming tunnel and HTTP CONNECT adapters
//! - [`server`]: binds the listeners and runs everything

pub mod agent_service;
pub mod backend;
pub mod config;
pub mod connection;
pub mod error;
pub mod frontend;
pub mod multiplexer;
mod pending;
pub mod registry;
pub mod server;
pub mod strategy;

pub use backend::{Backend, BackendId, BackendInfo};
pub use config::{ServerConfig, StrategyKind};
pub use connection::{ConnectionReader, ConnectionState, ConnectionWriter, ProxyConnection};
pub use error::{DialError, ServerError};
pub use multiplexer::{DialTarget, Multiplexer, PendingConnection};
pub use registry::BackendRegistry;
pub use server::{BoundAddrs, ProxyServer};
pub use strategy::{SelectionHint, SelectionStrategy};
