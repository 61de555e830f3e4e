//! Stream metadata exchanged in the `Open`/`Accepted` handshake

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Agent identity header, required on agent links
pub const AGENT_ID: &str = "agentID";

/// Comma separated list of destination hosts an agent serves
pub const AGENT_IDENTIFIERS: &str = "agentIdentifiers";

/// Identity of the broker replica that accepted the stream
pub const SERVER_ID: &str = "serverID";

/// Number of broker replicas the agent should keep links to
pub const SERVER_COUNT: &str = "serverCount";

/// Protocol version of the initiator
pub const PROTOCOL_VERSION: &str = "protocolVersion";

/// Key/value headers attached to a stream at establishment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Values of a comma separated header, trimmed, empty entries dropped
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
