//! Backend selection strategies

use crate::backend::Backend;
use crate::config::StrategyKind;
use crate::registry::RegistrySnapshot;
use rand::seq::SliceRandom;
use std::sync::Arc;

/// Hints a dial carries into backend selection
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectionHint<'a> {
    /// Pin the dial to one agent identity
    pub agent_id: Option<&'a str>,
    /// Host part of the destination address
    pub dest_host: Option<&'a str>,
}

/// Pick one live backend from a registry snapshot
pub trait SelectionStrategy: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// `None` lets the registry fall through to the next strategy
    fn select(&self, snapshot: &RegistrySnapshot<'_>, hint: &SelectionHint<'_>)
        -> Option<Arc<Backend>>;
}

pub fn build(kind: StrategyKind) -> Arc<dyn SelectionStrategy> {
    match kind {
        StrategyKind::Default => Arc::new(DefaultStrategy),
        StrategyKind::DestHost => Arc::new(DestHostStrategy),
    }
}

/// Uniformly random among the pinned identity's backends, or among all
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultStrategy;

impl SelectionStrategy for DefaultStrategy {
    fn name(&self) -> &'static str {
        "default"
    }

    fn select(
        &self,
        snapshot: &RegistrySnapshot<'_>,
        hint: &SelectionHint<'_>,
    ) -> Option<Arc<Backend>> {
        let mut rng = rand::thread_rng();
        match hint.agent_id {
            Some(agent_id) => snapshot.backends_for(agent_id).choose(&mut rng).cloned(),
            None => {
                let all: Vec<&Arc<Backend>> = snapshot.all().collect();
                all.choose(&mut rng).map(|backend| Arc::clone(backend))
            }
        }
    }
}

/// Random among backends whose agent serves the destination host, within the
/// pinned identity when there is one
#[derive(Debug, Default, Clone, Copy)]
pub struct DestHostStrategy;

impl SelectionStrategy for DestHostStrategy {
    fn name(&self) -> &'static str {
        "dest-host"
    }

    fn select(
        &self,
        snapshot: &RegistrySnapshot<'_>,
        hint: &SelectionHint<'_>,
    ) -> Option<Arc<Backend>> {
        let host = hint.dest_host?;
        let eligible: Vec<&Arc<Backend>> = match hint.agent_id {
            Some(agent_id) => snapshot
                .backends_for(agent_id)
                .iter()
                .filter(|backend| backend.serves_host(host))
                .collect(),
            None => snapshot
                .all()
                .filter(|backend| backend.serves_host(host))
                .collect(),
        };
        eligible
            .choose(&mut rand::thread_rng())
            .map(|backend| Arc::clone(backend))
    }
}
