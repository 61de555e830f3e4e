//! Dials waiting for the agent's `DialResponse`
//!
//! Keyed by the dial's random correlation ID. The waiter owns the receiving
//! end; whoever removes the entry (the response, a cancellation or a backend
//! teardown) decides its fate.

use crate::connection::Inbound;
use backhaul_metrics::ServerMetrics;
use backhaul_proto::{ConnectId, DialId};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// What the backend reader hands back to a pending dial
#[derive(Debug)]
pub(crate) enum DialOutcome {
    Established {
        connect_id: ConnectId,
        inbound: mpsc::Receiver<Inbound>,
    },
    Failed(String),
}

#[derive(Debug)]
pub(crate) struct PendingDial {
    pub tx: oneshot::Sender<DialOutcome>,
    pub address: String,
    pub started: Instant,
}

#[derive(Clone)]
pub(crate) struct PendingDials {
    dials: Arc<DashMap<DialId, PendingDial>>,
    metrics: Arc<ServerMetrics>,
}

impl PendingDials {
    pub fn new(metrics: Arc<ServerMetrics>) -> Self {
        Self {
            dials: Arc::new(DashMap::new()),
            metrics,
        }
    }

    /// Register a dial; the receiver completes when the agent answers
    pub fn register(&self, random: DialId, address: &str) -> oneshot::Receiver<DialOutcome> {
        let (tx, rx) = oneshot::channel();
        let previous = self.dials.insert(
            random,
            PendingDial {
                tx,
                address: address.to_string(),
                started: Instant::now(),
            },
        );
        if previous.is_none() {
            self.metrics.pending_dials().inc();
        }
        debug!(random, address, "Registered pending dial");
        rx
    }

    /// Remove the entry so the caller can answer it
    pub fn take(&self, random: DialId) -> Option<PendingDial> {
        let (_, dial) = self.dials.remove(&random)?;
        self.metrics.pending_dials().dec();
        Some(dial)
    }

    /// Drop a pending dial; returns false if it was already answered or canceled
    pub fn cancel(&self, random: DialId) -> bool {
        if self.dials.remove(&random).is_some() {
            self.metrics.pending_dials().dec();
            debug!(random, "Cancelled pending dial");
            return true;
        }
        false
    }

    /// Drop every pending dial, waking their waiters with a closed channel
    pub fn clear(&self) -> usize {
        let randoms: Vec<DialId> = self.dials.iter().map(|entry| *entry.key()).collect();
        randoms
            .into_iter()
            .filter(|random| self.cancel(*random))
            .count()
    }

    pub fn count(&self) -> usize {
        self.dials.len()
    }
}
