//! Explicit wiring of one node process.
//!
//! ```text
//!                    ┌──────────────────┐
//!                    │ CoordinationStore│◄───────────────┐
//!                    └──────┬───────────┘                │
//!          ┌────────────────┼─────────────────┐          │
//!          ▼                ▼                 ▼          │
//!    NodeRegistry ◄──── CollabEngine    ControlPlane     │
//!          ▲                ▲                            │
//!          └──── SessionRegistry ◄── SessionServer       │
//!                       ▲                                │
//!                  AutoHealer ───────────────────────────┘
//! ```
//!
//! Components receive their collaborators at construction; nothing is
//! global. [`CoreService::start`] registers the local node and spawns the
//! periodic loops (store health, node refresh, node health, garbage
//! collection, session reaping, metrics, evaluation). The loops hold only
//! weak references and are aborted on shutdown or drop.

use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cluster::{MetricsSource, NodeRegistry, SystemTelemetry};
use crate::collab::{CollabEngine, CollabError};
use crate::config::NodeConfig;
use crate::control::ControlPlane;
use crate::healer::actions::{migrate_sessions, MigrationSummary};
use crate::healer::{AutoHealer, HealerError};
use crate::protocol::{ClusterAnnouncement, GLOBAL_BROADCAST};
use crate::server::{ServerConfig, ServerError, SessionServer};
use crate::session::{IdentityVerifier, SessionRegistry, TrustedIdentity};
use crate::store::{ArchiveConfig, ArchiveError, CoordinationStore, ResourceArchive, StoreError};

/// Service errors.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Collab(#[from] CollabError),
    #[error(transparent)]
    Healer(#[from] HealerError),
    #[error(transparent)]
    Server(#[from] ServerError),
}

/// One node: every component plus its background loops.
pub struct CoreService {
    config: NodeConfig,
    store: Arc<CoordinationStore>,
    nodes: Arc<NodeRegistry>,
    engine: Arc<CollabEngine>,
    sessions: Arc<SessionRegistry>,
    healer: Arc<AutoHealer>,
    control: ControlPlane,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Set once with the reason the node must stop
    fatal: watch::Sender<Option<String>>,
}

impl CoreService {
    /// Build a node from configuration with OS telemetry, trusted
    /// identities and the configured archive. Connects to NATS when the
    /// store config names a server.
    pub async fn new(config: NodeConfig) -> Result<Self, ServiceError> {
        let store = Arc::new(CoordinationStore::connect(&config.store, &config.node_id).await?);
        let archive = match &config.store.archive_path {
            Some(path) => Some(Arc::new(ResourceArchive::open(ArchiveConfig::new(path.clone()))?)),
            None => None,
        };
        Ok(Self::with_parts(
            config,
            store,
            Arc::new(SystemTelemetry::new()),
            Arc::new(TrustedIdentity),
            archive,
        ))
    }

    /// Build a node around an existing store. Several services sharing one
    /// store form a cluster.
    pub fn with_parts(
        config: NodeConfig,
        store: Arc<CoordinationStore>,
        telemetry: Arc<dyn MetricsSource>,
        verifier: Arc<dyn IdentityVerifier>,
        archive: Option<Arc<ResourceArchive>>,
    ) -> Self {
        let nodes = Arc::new(NodeRegistry::new(
            config.node_id.clone(),
            config.balancer.clone(),
            store.clone(),
            telemetry,
        ));
        let engine = Arc::new(CollabEngine::new(store.clone(), config.collab.clone(), archive));
        let sessions = Arc::new(SessionRegistry::new(
            config.session.clone(),
            store.clone(),
            engine.clone(),
            nodes.clone(),
            verifier,
        ));
        let healer = Arc::new(AutoHealer::new(
            config.healer.clone(),
            store.clone(),
            nodes.clone(),
            sessions.clone(),
            config.session.session_ttl(),
        ));
        let control = ControlPlane::new(store.clone());
        let (fatal, _) = watch::channel(None);

        Self {
            config,
            store,
            nodes,
            engine,
            sessions,
            healer,
            control,
            tasks: Mutex::new(Vec::new()),
            fatal,
        }
    }

    /// Register the local node and spawn the background loops.
    pub async fn start(self: &Arc<Self>) -> Result<(), ServiceError> {
        self.nodes
            .register_node(&self.config.node_id, &self.config.region, self.config.capacity)
            .await?;
        self.nodes.refresh_metrics().await?;
        self.nodes.sync_from_store().await?;

        let config = &self.config;
        let mut tasks = vec![
            self.sessions.spawn_announcement_listener(),
            self.spawn_announcement_log(),
        ];
        tasks.push(self.spawn_periodic(config.store.health_check_interval(), |s| async move {
            s.check_store_health().await;
        }));
        tasks.push(self.spawn_periodic(
            Duration::from_secs(config.balancer.refresh_interval_secs),
            |s| async move { s.refresh_nodes().await },
        ));
        tasks.push(self.spawn_periodic(
            Duration::from_secs(config.balancer.health_check_interval_secs),
            |s| async move { s.check_node_health().await },
        ));
        tasks.push(self.spawn_periodic(
            Duration::from_secs(config.collab.gc_interval_secs),
            |s| async move { s.collect_garbage().await },
        ));
        tasks.push(self.spawn_periodic(
            Duration::from_secs(config.session.reap_interval_secs),
            |s| async move {
                s.sessions.reap_stale().await;
            },
        ));
        tasks.push(self.spawn_periodic(
            Duration::from_secs(config.healer.metrics_interval_secs),
            |s| async move {
                s.healer.collect_metrics().await;
            },
        ));
        tasks.push(self.spawn_periodic(
            Duration::from_secs(config.healer.evaluate_interval_secs),
            |s| async move {
                s.healer.evaluate().await;
            },
        ));

        lock_tasks(&self.tasks).extend(tasks);
        log::info!(
            "Node {} started in {} (capacity {})",
            self.config.node_id,
            self.config.region,
            self.config.capacity
        );
        Ok(())
    }

    /// Run `tick` every `period`, skipping the immediate first tick.
    fn spawn_periodic<F, Fut>(self: &Arc<Self>, period: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let service: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period.max(Duration::from_millis(10)));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(service) = service.upgrade() else {
                    break;
                };
                tick(service).await;
            }
        })
    }

    /// Surface requests meant for the external orchestrator.
    fn spawn_announcement_log(&self) -> JoinHandle<()> {
        let mut subscription = self.store.subscribe(GLOBAL_BROADCAST);
        let node_id = self.config.node_id.clone();
        tokio::spawn(async move {
            while let Some(text) = subscription.recv().await {
                match ClusterAnnouncement::decode(&text) {
                    Ok(ClusterAnnouncement::RestartRequested { node_id: target, reason }) => {
                        if target == node_id {
                            log::warn!("Restart of this node requested: {reason}");
                        } else {
                            log::info!("Restart of {target} requested: {reason}");
                        }
                    }
                    Ok(ClusterAnnouncement::AddNodeRequested { region, reason }) => {
                        log::warn!("Additional node requested in {region}: {reason}");
                    }
                    Ok(ClusterAnnouncement::ScaleUpRequested { node_id, region, reason }) => {
                        log::warn!("More capacity requested for {node_id} in {region}: {reason}");
                    }
                    Ok(ClusterAnnouncement::ScaleDownRequested { node_id, region, reason }) => {
                        log::info!("Capacity for {node_id} in {region} can be released: {reason}");
                    }
                    Ok(ClusterAnnouncement::StorePrimaryChanged { primary }) => {
                        log::info!("Coordination store primary is now {primary}");
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("Malformed cluster announcement: {e}"),
                }
            }
        })
    }

    // ─── Loop bodies ──────────────────────────────────────────────────

    /// Probe the store peers once.
    pub async fn check_store_health(&self) {
        match self.store.health_check().await {
            Ok(report) => {
                if let Some(primary) = report.promoted {
                    log::warn!("Store failover: {primary} promoted");
                }
            }
            Err(e) => self.store_failed(&e),
        }
    }

    /// Publish local metrics and merge the fleet mirror.
    pub async fn refresh_nodes(&self) {
        if let Err(e) = self.nodes.refresh_metrics().await {
            self.store_failed(&e);
            return;
        }
        if let Err(e) = self.nodes.sync_from_store().await {
            self.store_failed(&e);
        }
    }

    pub async fn check_node_health(&self) {
        let report = self.nodes.health_check(self.config.store.probe_timeout()).await;
        for node_id in &report.newly_unhealthy {
            log::warn!("Node {node_id} is unhealthy");
        }
        for node_id in &report.recovered {
            log::info!("Node {node_id} recovered");
        }
    }

    pub async fn collect_garbage(&self) {
        match self.engine.gc_inactive().await {
            Ok(evicted) if !evicted.is_empty() => {
                log::debug!("Evicted {} idle resources", evicted.len());
            }
            Ok(_) => {}
            Err(CollabError::Store(e)) => self.store_failed(&e),
            Err(e) => log::warn!("Resource garbage collection failed: {e}"),
        }
        match self.store.housekeeping().await {
            Ok(0) => {}
            Ok(purged) => log::trace!("Purged {purged} expired store keys"),
            Err(e) => self.store_failed(&e),
        }
    }

    fn store_failed(&self, error: &StoreError) {
        if self.healer.report_store_failure(error) {
            self.fatal.send_if_modified(|reason| {
                if reason.is_some() {
                    return false;
                }
                *reason = Some(error.to_string());
                true
            });
        } else {
            log::warn!("Store call failed: {error}");
        }
    }

    // ─── Operations ───────────────────────────────────────────────────

    /// Migrate every session off `node_id`, then remove it from the fleet.
    pub async fn deregister_node(&self, node_id: &str) -> Result<MigrationSummary, ServiceError> {
        let summary = migrate_sessions(&self.store, &self.nodes, node_id, self.config.session.session_ttl()).await?;
        self.nodes.deregister_node(node_id).await?;
        log::info!(
            "Node {node_id} removed ({} sessions migrated, {} evicted)",
            summary.migrated,
            summary.evicted
        );
        Ok(summary)
    }

    /// Resolves with the reason once the node hit an unrecoverable error.
    pub async fn fatal(&self) -> String {
        let mut rx = self.fatal.subscribe();
        let reason = match rx.wait_for(|reason| reason.is_some()).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            // The sender lives in self, so this is unreachable while borrowed.
            Err(_) => String::new(),
        };
        reason
    }

    pub fn fatal_reason(&self) -> Option<String> {
        self.fatal.borrow().clone()
    }

    /// A session server bound to the configured address.
    pub fn server(&self) -> SessionServer {
        SessionServer::new(
            ServerConfig {
                bind_addr: self.config.bind_addr.clone(),
                outbound_capacity: self.config.session.outbound_capacity,
                monitor_interval: Duration::from_secs(self.config.healer.metrics_interval_secs),
            },
            self.sessions.clone(),
            self.healer.clone(),
        )
    }

    /// Stop the loops, close local sessions and leave the fleet.
    pub async fn shutdown(&self) {
        for task in lock_tasks(&self.tasks).drain(..) {
            task.abort();
        }
        for session_id in self.sessions.session_ids() {
            if let Err(e) = self.sessions.disconnect(&session_id).await {
                log::warn!("Failed to close session {session_id}: {e}");
            }
        }
        if let Err(e) = self.nodes.deregister_node(&self.config.node_id).await {
            log::warn!("Failed to deregister {}: {e}", self.config.node_id);
        }
        log::info!("Node {} stopped", self.config.node_id);
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CoordinationStore> {
        &self.store
    }

    pub fn nodes(&self) -> &Arc<NodeRegistry> {
        &self.nodes
    }

    pub fn engine(&self) -> &Arc<CollabEngine> {
        &self.engine
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn healer(&self) -> &Arc<AutoHealer> {
        &self.healer
    }

    pub fn control(&self) -> &ControlPlane {
        &self.control
    }
}

impl Drop for CoreService {
    fn drop(&mut self) {
        for task in lock_tasks(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

fn lock_tasks(tasks: &Mutex<Vec<JoinHandle<()>>>) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
    tasks.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{node_key, FixedMetrics};
    use crate::healer::{AlertType, HealthStatus};

    fn service(node_id: &str, store: Arc<CoordinationStore>) -> Arc<CoreService> {
        Arc::new(CoreService::with_parts(
            NodeConfig::for_testing(node_id, "us-east"),
            store,
            Arc::new(FixedMetrics::new(10.0, 20.0)),
            Arc::new(TrustedIdentity),
            None,
        ))
    }

    #[tokio::test]
    async fn test_start_registers_local_node() {
        let store = Arc::new(CoordinationStore::standalone());
        let svc = service("node-a", store.clone());
        svc.start().await.unwrap();

        assert!(svc.nodes().contains("node-a"));
        assert!(store.get(&node_key("node-a")).await.unwrap().is_some());
        assert_eq!(svc.healer().status(), HealthStatus::Healthy);
        assert_eq!(svc.fatal_reason(), None);
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn test_nodes_sharing_a_store_see_each_other() {
        let store = Arc::new(CoordinationStore::standalone());
        let a = service("node-a", store.clone());
        let b = service("node-b", store.clone());
        a.start().await.unwrap();
        b.start().await.unwrap();

        a.refresh_nodes().await;
        assert!(a.nodes().contains("node-b"));
        assert_eq!(a.nodes().nodes().len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_the_fleet() {
        let store = Arc::new(CoordinationStore::standalone());
        let svc = service("node-a", store.clone());
        svc.start().await.unwrap();
        svc.shutdown().await;

        assert!(!svc.nodes().contains("node-a"));
        assert!(store.get(&node_key("node-a")).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_losing_every_store_peer_is_fatal() {
        let store = Arc::new(CoordinationStore::standalone());
        let svc = service("node-a", store.clone());
        svc.start().await.unwrap();

        store.peer("store-local").unwrap().set_online(false);
        for _ in 0..3 {
            svc.check_store_health().await;
        }

        assert!(svc.fatal_reason().is_some());
        assert_eq!(svc.fatal().await, StoreError::NoHealthyPeers.to_string());
        let alerts = svc.healer().unresolved_alerts();
        assert!(alerts.iter().any(|a| a.alert_type == AlertType::StoreUnavailable));
        assert_eq!(svc.healer().status(), HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_deregister_unknown_node_is_harmless() {
        let store = Arc::new(CoordinationStore::standalone());
        let svc = service("node-a", store);
        svc.start().await.unwrap();

        let summary = svc.deregister_node("node-z").await.unwrap();
        assert_eq!(summary.migrated, 0);
        assert_eq!(summary.evicted, 0);
    }
}
