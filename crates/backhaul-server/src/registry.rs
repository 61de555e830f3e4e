//! Registry of connected agent streams
//!
//! Agents are keyed by identity; one identity may hold several streams
//! (redundant links). Identities keep their first-connect order so iteration
//! is deterministic, while the configured strategies decide selection.

use crate::backend::{Backend, BackendId};
use crate::strategy::{SelectionHint, SelectionStrategy};
use backhaul_metrics::ServerMetrics;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct RegistryInner {
    backends: HashMap<String, Vec<Arc<Backend>>>,
    agent_ids: Vec<String>,
}

/// Read-only view handed to a [`SelectionStrategy`]
pub struct RegistrySnapshot<'a> {
    inner: &'a RegistryInner,
}

impl<'a> RegistrySnapshot<'a> {
    /// Identities in the order they first connected
    pub fn agent_ids(&self) -> impl Iterator<Item = &'a str> + 'a {
        self.inner.agent_ids.iter().map(String::as_str)
    }

    pub fn backends_for(&self, agent_id: &str) -> &'a [Arc<Backend>] {
        self.inner
            .backends
            .get(agent_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every backend, grouped by identity in connect order
    pub fn all(&self) -> impl Iterator<Item = &'a Arc<Backend>> + 'a {
        let inner = self.inner;
        inner
            .agent_ids
            .iter()
            .flat_map(move |agent_id| inner.backends.get(agent_id).into_iter().flatten())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.agent_ids.is_empty()
    }
}

pub struct BackendRegistry {
    inner: RwLock<RegistryInner>,
    strategies: Vec<Arc<dyn SelectionStrategy>>,
    metrics: Arc<ServerMetrics>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("strategies", &self.strategies)
            .field("backends", &self.backend_count())
            .finish()
    }
}

impl BackendRegistry {
    pub fn new(strategies: Vec<Arc<dyn SelectionStrategy>>, metrics: Arc<ServerMetrics>) -> Self {
        info!(
            strategies = ?strategies.iter().map(|s| s.name()).collect::<Vec<_>>(),
            "Creating backend registry"
        );
        Self {
            inner: RwLock::new(RegistryInner::default()),
            strategies,
            metrics,
        }
    }

    /// Add a stream under its agent identity
    pub fn add_backend(&self, backend: Arc<Backend>) {
        let mut inner = self.inner.write().unwrap();
        let agent_id = backend.agent_id().to_string();

        let slots = inner.backends.entry(agent_id.clone()).or_default();
        if slots.iter().any(|existing| existing.id() == backend.id()) {
            return;
        }
        slots.push(backend.clone());
        let streams = slots.len();
        if streams == 1 {
            inner.agent_ids.push(agent_id.clone());
        }
        self.metrics.backends().inc();

        info!(
            agent_id = %agent_id,
            backend_id = backend.id(),
            peer = ?backend.info().peer_addr,
            streams,
            "Registered backend"
        );
    }

    /// Remove a stream; the identity disappears with its last stream.
    /// Returns false if the backend was not registered.
    pub fn remove_backend(&self, backend: &Backend) -> bool {
        let mut inner = self.inner.write().unwrap();
        let agent_id = backend.agent_id();

        let Some(slots) = inner.backends.get_mut(agent_id) else {
            return false;
        };
        let Some(position) = slots.iter().position(|b| b.id() == backend.id()) else {
            return false;
        };
        slots.remove(position);
        let remaining = slots.len();
        if remaining == 0 {
            inner.backends.remove(agent_id);
            inner.agent_ids.retain(|id| id != agent_id);
        }
        self.metrics.backends().dec();

        info!(
            agent_id = %agent_id,
            backend_id = backend.id(),
            remaining,
            "Removed backend"
        );
        true
    }

    /// Ask each strategy in turn for a backend
    pub fn select(&self, hint: &SelectionHint<'_>) -> Option<Arc<Backend>> {
        let inner = self.inner.read().unwrap();
        let snapshot = RegistrySnapshot { inner: &inner };
        if snapshot.is_empty() {
            return None;
        }

        for strategy in &self.strategies {
            if let Some(backend) = strategy.select(&snapshot, hint) {
                debug!(
                    strategy = strategy.name(),
                    agent_id = %backend.agent_id(),
                    backend_id = backend.id(),
                    "Selected backend"
                );
                return Some(backend);
            }
        }
        None
    }

    /// Number of registered streams
    pub fn backend_count(&self) -> usize {
        self.inner
            .read()
            .unwrap()
            .backends
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Number of identities with at least one live stream
    pub fn healthy_count(&self) -> usize {
        self.inner.read().unwrap().agent_ids.len()
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.inner.read().unwrap().agent_ids.clone()
    }

    /// Snapshot of every registered backend
    pub fn backends(&self) -> Vec<Arc<Backend>> {
        let inner = self.inner.read().unwrap();
        RegistrySnapshot { inner: &inner }.all().cloned().collect()
    }

    pub fn contains(&self, id: BackendId) -> bool {
        self.backends().iter().any(|backend| backend.id() == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::test_backend;
    use crate::strategy::{DefaultStrategy, DestHostStrategy};
    use std::collections::HashSet;

    fn registry(strategies: Vec<Arc<dyn SelectionStrategy>>) -> BackendRegistry {
        BackendRegistry::new(strategies, ServerMetrics::new())
    }

    #[tokio::test]
    async fn test_add_and_remove() {
        let registry = registry(vec![Arc::new(DefaultStrategy)]);
        let (first, _) = test_backend("agent-a", &[]);
        let (second, _) = test_backend("agent-a", &[]);
        let (third, _) = test_backend("agent-b", &[]);

        registry.add_backend(first.clone());
        registry.add_backend(second.clone());
        registry.add_backend(third.clone());
        // Adding the same stream twice is a no-op
        registry.add_backend(first.clone());

        assert_eq!(registry.backend_count(), 3);
        assert_eq!(registry.healthy_count(), 2);
        assert_eq!(registry.agent_ids(), vec!["agent-a", "agent-b"]);

        assert!(registry.remove_backend(&first));
        assert!(!registry.remove_backend(&first));
        assert_eq!(registry.healthy_count(), 2);

        assert!(registry.remove_backend(&second));
        assert_eq!(registry.healthy_count(), 1);
        assert_eq!(registry.agent_ids(), vec!["agent-b"]);
        assert!(!registry.contains(second.id()));
    }

    #[tokio::test]
    async fn test_select_empty_registry() {
        let registry = registry(vec![Arc::new(DefaultStrategy)]);
        assert!(registry.select(&SelectionHint::default()).is_none());
    }

    #[tokio::test]
    async fn test_default_strategy_pinned_identity() {
        let registry = registry(vec![Arc::new(DefaultStrategy)]);
        let (a, _) = test_backend("agent-a", &[]);
        let (b, _) = test_backend("agent-b", &[]);
        registry.add_backend(a.clone());
        registry.add_backend(b.clone());

        let hint = SelectionHint {
            agent_id: Some("agent-b"),
            dest_host: None,
        };
        for _ in 0..20 {
            assert_eq!(registry.select(&hint).unwrap().id(), b.id());
        }

        let missing = SelectionHint {
            agent_id: Some("agent-c"),
            dest_host: None,
        };
        assert!(registry.select(&missing).is_none());
    }

    #[tokio::test]
    async fn test_default_strategy_spreads_selection() {
        let registry = registry(vec![Arc::new(DefaultStrategy)]);
        let mut ids = HashSet::new();
        for i in 0..3 {
            let (backend, _) = test_backend(&format!("agent-{}", i), &[]);
            ids.insert(backend.id());
            registry.add_backend(backend);
        }

        let mut seen = HashSet::new();
        for _ in 0..200 {
            seen.insert(registry.select(&SelectionHint::default()).unwrap().id());
        }
        assert_eq!(seen, ids);
    }

    #[tokio::test]
    async fn test_dest_host_falls_through_to_default() {
        let registry = registry(vec![Arc::new(DestHostStrategy), Arc::new(DefaultStrategy)]);
        let (db, _) = test_backend("agent-db", &["db.internal"]);
        let (other, _) = test_backend("agent-other", &[]);
        registry.add_backend(db.clone());
        registry.add_backend(other.clone());

        let hint = SelectionHint {
            agent_id: None,
            dest_host: Some("db.internal"),
        };
        for _ in 0..20 {
            assert_eq!(registry.select(&hint).unwrap().id(), db.id());
        }

        let hint = SelectionHint {
            agent_id: None,
            dest_host: Some("unknown.internal"),
        };
        assert!(registry.select(&hint).is_some());
    }

    #[tokio::test]
    async fn test_dest_host_respects_pinned_identity() {
        let registry = registry(vec![Arc::new(DestHostStrategy), Arc::new(DefaultStrategy)]);
        let (db_a, _) = test_backend("agent-a", &["db.internal"]);
        let (db_b, _) = test_backend("agent-b", &["db.internal"]);
        let (plain_c, _) = test_backend("agent-c", &[]);
        registry.add_backend(db_a.clone());
        registry.add_backend(db_b.clone());
        registry.add_backend(plain_c.clone());

        let hint = SelectionHint {
            agent_id: Some("agent-b"),
            dest_host: Some("db.internal"),
        };
        for _ in 0..20 {
            assert_eq!(registry.select(&hint).unwrap().id(), db_b.id());
        }

        // No backend of the pinned identity serves the host; default still pins
        let hint = SelectionHint {
            agent_id: Some("agent-c"),
            dest_host: Some("db.internal"),
        };
        for _ in 0..20 {
            assert_eq!(registry.select(&hint).unwrap().id(), plain_c.id());
        }
    }
}
