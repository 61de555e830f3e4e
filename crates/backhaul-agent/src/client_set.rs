//! Agent connection set
//!
//! Keeps one link per broker replica. The broker announces how many replicas
//! exist; the sync loop dials the broker address until it holds that many
//! links with distinct server IDs, backing off while dials fail or keep
//! landing on replicas it already has. A link that stops answering probes is
//! closed and replaced on the next pass.

use crate::backoff::Backoff;
use crate::client::AgentClient;
use crate::{AgentConfig, AgentError};
use backhaul_metrics::AgentMetrics;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

pub struct ClientSet {
    config: Arc<AgentConfig>,
    metrics: Arc<AgentMetrics>,
    shutdown: CancellationToken,
    clients: Mutex<HashMap<String, Arc<AgentClient>>>,
    /// Dials to the broker in progress
    connecting: AtomicUsize,
    /// Replica count last announced by a broker
    announced_count: AtomicU32,
    tasks: TaskTracker,
}

impl ClientSet {
    pub fn new(config: AgentConfig, metrics: Arc<AgentMetrics>) -> Result<Arc<Self>, AgentError> {
        config.validate()?;
        Ok(Arc::new(Self {
            config: Arc::new(config),
            metrics,
            shutdown: CancellationToken::new(),
            clients: Mutex::new(HashMap::new()),
            connecting: AtomicUsize::new(0),
            announced_count: AtomicU32::new(0),
            tasks: TaskTracker::new(),
        }))
    }

    /// Run the sync loop in the background
    pub fn spawn(self: &Arc<Self>) {
        let set = self.clone();
        self.tasks.spawn(async move { set.serve().await });
    }

    /// Sync until shutdown
    pub async fn serve(self: Arc<Self>) {
        info!(
            agent_id = %self.config.agent_id,
            broker = %self.config.broker_address,
            "Starting agent connection set"
        );
        let mut backoff = Backoff::new(self.config.sync_interval(), self.config.sync_interval_cap());

        loop {
            let delay = match self.sync_once().await {
                Ok(()) => {
                    backoff.reset();
                    self.config.sync_interval()
                }
                Err(e) => {
                    warn!(broker = %self.config.broker_address, "Sync failed: {}", e);
                    backoff.next_delay()
                }
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!("Sync loop stopped");
    }

    /// Replace silent links, then dial until the set holds the target number
    async fn sync_once(self: &Arc<Self>) -> Result<(), AgentError> {
        self.close_unhealthy().await;
        while !self.shutdown.is_cancelled() && self.link_count() < self.target_count() {
            self.connect_one().await?;
        }
        Ok(())
    }

    async fn connect_one(self: &Arc<Self>) -> Result<(), AgentError> {
        self.connecting.fetch_add(1, Ordering::SeqCst);
        let connected = AgentClient::connect(self.config.clone(), self.metrics.clone(), &self.shutdown).await;
        self.connecting.fetch_sub(1, Ordering::SeqCst);
        let (client, source) = connected?;

        if let Some(count) = client.server_count() {
            self.announced_count.store(count, Ordering::SeqCst);
        }

        let server_id = client.server_id().to_string();
        {
            let mut clients = self.clients.lock().unwrap();
            if !clients.contains_key(&server_id) {
                clients.insert(server_id.clone(), client.clone());
                drop(clients);

                let set = self.clone();
                self.tasks.spawn(async move {
                    client.clone().serve(source).await;
                    set.remove(&client);
                });
                return Ok(());
            }
        }

        debug!(server_id = %server_id, "Already linked to this broker, closing duplicate");
        drop(source);
        client.close().await;
        Err(AgentError::DuplicateServer(server_id))
    }

    /// Close links that are open but no longer hear from their broker
    async fn close_unhealthy(&self) {
        let silent: Vec<Arc<AgentClient>> = self
            .clients
            .lock()
            .unwrap()
            .values()
            .filter(|client| !client.is_healthy())
            .cloned()
            .collect();
        for client in silent {
            warn!(server_id = %client.server_id(), "Link stopped answering, replacing it");
            self.remove(&client);
            client.close().await;
        }
    }

    fn remove(&self, client: &Arc<AgentClient>) {
        let mut clients = self.clients.lock().unwrap();
        if let Some(current) = clients.get(client.server_id()) {
            if Arc::ptr_eq(current, client) {
                clients.remove(client.server_id());
                info!(server_id = %client.server_id(), "Link removed from set");
            }
        }
    }

    /// Links currently held
    pub fn link_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    /// Links to keep: the configured override, else the broker's announcement
    pub fn target_count(&self) -> usize {
        if let Some(count) = self.config.server_count {
            return count as usize;
        }
        match self.announced_count.load(Ordering::SeqCst) {
            0 => 1,
            count => count as usize,
        }
    }

    /// Links that are open and answered recently
    pub fn healthy_count(&self) -> usize {
        self.clients
            .lock()
            .unwrap()
            .values()
            .filter(|client| client.is_healthy())
            .count()
    }

    /// Links held plus links still being dialed
    pub fn total_count(&self) -> usize {
        self.link_count() + self.connecting.load(Ordering::SeqCst)
    }

    /// Tasks still running across every held link
    pub fn link_task_count(&self) -> usize {
        self.clients
            .lock()
            .unwrap()
            .values()
            .map(|client| client.task_count())
            .sum()
    }

    /// Server IDs of the brokers currently linked
    pub fn server_ids(&self) -> Vec<String> {
        self.clients.lock().unwrap().keys().cloned().collect()
    }

    pub fn metrics(&self) -> &Arc<AgentMetrics> {
        &self.metrics
    }

    /// Canceling this token stops the set
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop syncing, close every link and wait for all of their tasks
    pub async fn shutdown(&self) {
        info!(agent_id = %self.config.agent_id, "Shutting down agent connection set");
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}
