//! Agent-side table of connections to real destinations

use backhaul_metrics::AgentMetrics;
use backhaul_proto::ConnectId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Work for an endpoint's writer task
#[derive(Debug)]
pub(crate) enum EndpointCommand {
    Data(Vec<u8>),
    /// Write what is queued, then close
    Close,
}

/// What became of a command for an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Routed {
    Queued,
    /// Unknown token, or the endpoint's writer is gone
    Unknown,
    /// The destination fell too far behind; the endpoint was removed
    Overflow,
}

#[derive(Debug)]
pub(crate) struct Endpoint {
    /// Bounded; data never takes the last free place, so `Close` always fits
    pub commands: mpsc::Sender<EndpointCommand>,
    /// Stops both relay tasks of this endpoint
    pub token: CancellationToken,
    pub address: String,
}

/// Live endpoints of one link.
///
/// The endpoint gauge moves only here, so every insert is matched by exactly
/// one decrement however the endpoint ends.
#[derive(Debug)]
pub(crate) struct EndpointTable {
    entries: Mutex<HashMap<ConnectId, Endpoint>>,
    metrics: Arc<AgentMetrics>,
}

impl EndpointTable {
    pub fn new(metrics: Arc<AgentMetrics>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    pub fn insert(&self, connect_id: ConnectId, endpoint: Endpoint) {
        let previous = self
            .entries
            .lock()
            .unwrap()
            .insert(connect_id, endpoint);
        match previous {
            Some(previous) => previous.token.cancel(),
            None => self.metrics.endpoint_connections().inc(),
        }
    }

    pub fn remove(&self, connect_id: ConnectId) -> Option<Endpoint> {
        let removed = self.entries.lock().unwrap().remove(&connect_id);
        if removed.is_some() {
            self.metrics.endpoint_connections().dec();
        }
        removed
    }

    /// Queue a command without waiting.
    ///
    /// Data for a destination that stopped keeping up removes the endpoint
    /// and stops its relay tasks rather than stalling the link reader.
    pub fn send(&self, connect_id: ConnectId, command: EndpointCommand) -> Routed {
        let mut entries = self.entries.lock().unwrap();
        let Some(endpoint) = entries.get(&connect_id) else {
            return Routed::Unknown;
        };
        if matches!(command, EndpointCommand::Data(_)) && endpoint.commands.capacity() <= 1 {
            if let Some(endpoint) = entries.remove(&connect_id) {
                endpoint.token.cancel();
                self.metrics.endpoint_connections().dec();
            }
            return Routed::Overflow;
        }
        match endpoint.commands.try_send(command) {
            Ok(()) => Routed::Queued,
            Err(_) => Routed::Unknown,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Stop every endpoint's relay tasks; the entries go away as the tasks finish
    pub fn cancel_all(&self) {
        for endpoint in self.entries.lock().unwrap().values() {
            endpoint.token.cancel();
        }
    }

    /// Drop whatever is left, returning how many entries were removed
    pub fn clear(&self) -> usize {
        let drained: Vec<_> = self.entries.lock().unwrap().drain().collect();
        for (_, endpoint) in &drained {
            endpoint.token.cancel();
            self.metrics.endpoint_connections().dec();
        }
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> (Endpoint, mpsc::Receiver<EndpointCommand>) {
        endpoint_with_capacity(backhaul_proto::CONNECTION_QUEUE_CAPACITY)
    }

    fn endpoint_with_capacity(capacity: usize) -> (Endpoint, mpsc::Receiver<EndpointCommand>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Endpoint {
                commands: tx,
                token: CancellationToken::new(),
                address: "127.0.0.1:80".to_string(),
            },
            rx,
        )
    }

    #[test]
    fn test_gauge_follows_table() {
        let metrics = AgentMetrics::new();
        let table = EndpointTable::new(metrics.clone());

        let (a, _rx_a) = endpoint();
        let (b, _rx_b) = endpoint();
        table.insert(1, a);
        table.insert(2, b);
        assert_eq!(metrics.endpoint_connections().get(), 2);

        assert!(table.remove(1).is_some());
        assert!(table.remove(1).is_none());
        assert_eq!(metrics.endpoint_connections().get(), 1);

        assert_eq!(table.clear(), 1);
        assert_eq!(metrics.endpoint_connections().get(), 0);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_send_routes_by_token() {
        let table = EndpointTable::new(AgentMetrics::new());
        let (a, mut rx) = endpoint();
        table.insert(5, a);

        assert_eq!(table.send(5, EndpointCommand::Data(b"hi".to_vec())), Routed::Queued);
        assert_eq!(table.send(6, EndpointCommand::Close), Routed::Unknown);
        assert!(matches!(rx.try_recv(), Ok(EndpointCommand::Data(data)) if data == b"hi"));

        drop(rx);
        assert_eq!(table.send(5, EndpointCommand::Close), Routed::Unknown);
    }

    #[test]
    fn test_lagging_destination_is_dropped() {
        let metrics = AgentMetrics::new();
        let table = EndpointTable::new(metrics.clone());
        let (a, mut rx) = endpoint_with_capacity(3);
        let token = a.token.clone();
        table.insert(2, a);

        for _ in 0..2 {
            assert_eq!(table.send(2, EndpointCommand::Data(vec![0u8; 8])), Routed::Queued);
        }
        assert_eq!(table.send(2, EndpointCommand::Data(vec![0u8; 8])), Routed::Overflow);
        assert!(token.is_cancelled());
        assert_eq!(table.len(), 0);
        assert_eq!(metrics.endpoint_connections().get(), 0);
        assert_eq!(table.send(2, EndpointCommand::Close), Routed::Unknown);

        // Only what fit was buffered
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_close_fits_behind_queued_data() {
        let table = EndpointTable::new(AgentMetrics::new());
        let (a, mut rx) = endpoint_with_capacity(2);
        table.insert(1, a);

        assert_eq!(table.send(1, EndpointCommand::Data(vec![1])), Routed::Queued);
        assert_eq!(table.send(1, EndpointCommand::Close), Routed::Queued);
        assert!(matches!(rx.try_recv(), Ok(EndpointCommand::Data(_))));
        assert!(matches!(rx.try_recv(), Ok(EndpointCommand::Close)));
    }

    #[test]
    fn test_cancel_all_keeps_entries() {
        let table = EndpointTable::new(AgentMetrics::new());
        let (a, _rx) = endpoint();
        let token = a.token.clone();
        table.insert(1, a);

        table.cancel_all();
        assert!(token.is_cancelled());
        assert_eq!(table.len(), 1);
    }
}
