//! Auto-healer: a closed loop over fleet metrics.
//!
//! ```text
//!  every 10s  collect_metrics() ──► MetricsSnapshot ──► history (bounded)
//!                                        │
//!  every 5s   evaluate() ◄───────────────┘
//!               ├─ detect breaches ──► AlertBook (dedup 60s, resolve < 0.8×)
//!               ├─ critical breach ──► schedule remedy (dedup 30s)
//!               │     cpu / memory / saturation → scale_up
//!               │     latency                   → add_node
//!               │     node failure              → migrate_connections
//!               ├─ resolved after scale_up    ──► scale_down
//!               ├─ node failure open 60s / 300s → restart_node / remove_node
//!               └─ run scheduled actions under a timeout
//! ```
//!
//! The healer only reads the node and session registries and mutates the
//! node registry through [`ActionExecutor`]. Scaling is never simulated
//! locally: scale up and scale down are announced as requests, so the
//! capacity the balancer reads stays whatever nodes registered. Its
//! outward surface is [`AutoHealer::report`].

pub mod actions;
pub mod alerts;

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::clock::now_millis;
use crate::cluster::{Node, NodeRegistry};
use crate::config::HealerConfig;
use crate::session::SessionRegistry;
use crate::store::{encode_json, CoordinationStore, StoreError};

pub use actions::{
    migrate_sessions, ActionExecutor, ActionLog, ActionStatus, ActionType, HealingAction,
    MigrationSummary,
};
pub use alerts::{Alert, AlertBook, AlertType, Breach, Raised, Severity};

/// Healer errors.
#[derive(Debug, Clone, Error)]
pub enum HealerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Unknown node {0}")]
    UnknownNode(String),
    #[error("{0:?} needs a target node")]
    MissingTarget(ActionType),
    #[error("{0:?} timed out after {1:?}")]
    Timeout(ActionType, Duration),
}

/// Aggregate figures of one metrics cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    /// Live sessions on this node
    pub connection_count: usize,
    pub node_count: usize,
    pub healthy_node_count: usize,
    /// Averages over healthy nodes
    pub avg_cpu_pct: f64,
    pub avg_mem_pct: f64,
    pub avg_latency_ms: f64,
    /// Errors per handled client message since the last cycle, in percent
    pub error_rate_pct: f64,
    /// Client messages per second since the last cycle
    pub throughput_per_sec: f64,
    pub store_healthy_peers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Read-only view for monitoring tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub node_id: String,
    pub status: HealthStatus,
    pub metrics: Option<MetricsSnapshot>,
    pub nodes: Vec<Node>,
    pub alerts: Vec<Alert>,
    pub actions: Vec<HealingAction>,
}

/// What one evaluation cycle did.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub raised: Vec<Alert>,
    pub resolved: Vec<Alert>,
    pub actions: Vec<HealingAction>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn remedy(alert_type: AlertType) -> Option<ActionType> {
    match alert_type {
        AlertType::HighCpu | AlertType::HighMemory | AlertType::ConnectionSaturation => {
            Some(ActionType::ScaleUp)
        }
        AlertType::HighLatency => Some(ActionType::AddNode),
        AlertType::NodeFailure => Some(ActionType::MigrateConnections),
        AlertType::HighErrorRate | AlertType::StoreUnavailable => None,
    }
}

pub struct AutoHealer {
    node_id: String,
    config: HealerConfig,
    store: Arc<CoordinationStore>,
    nodes: Arc<NodeRegistry>,
    sessions: Arc<SessionRegistry>,
    executor: ActionExecutor,
    history: Mutex<VecDeque<MetricsSnapshot>>,
    alerts: Mutex<AlertBook>,
    actions: Mutex<ActionLog>,
    last_collect: Mutex<Option<Instant>>,
}

impl AutoHealer {
    pub fn new(
        config: HealerConfig,
        store: Arc<CoordinationStore>,
        nodes: Arc<NodeRegistry>,
        sessions: Arc<SessionRegistry>,
        session_ttl: Duration,
    ) -> Self {
        let executor = ActionExecutor::new(store.clone(), nodes.clone(), session_ttl);
        Self {
            node_id: nodes.local_node_id().to_string(),
            config,
            store,
            nodes,
            sessions,
            executor,
            history: Mutex::new(VecDeque::new()),
            alerts: Mutex::new(AlertBook::new()),
            actions: Mutex::new(ActionLog::new()),
            last_collect: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HealerConfig {
        &self.config
    }

    // ─── Metrics loop ─────────────────────────────────────────────────

    /// Take a snapshot of the fleet and this node's session activity,
    /// append it to the history and persist it to the store.
    pub async fn collect_metrics(&self) -> MetricsSnapshot {
        let nodes = self.nodes.nodes();
        let healthy: Vec<&Node> = nodes.iter().filter(|n| n.healthy).collect();
        let average = |f: fn(&Node) -> f64| {
            if healthy.is_empty() {
                0.0
            } else {
                healthy.iter().map(|n| f(n)).sum::<f64>() / healthy.len() as f64
            }
        };

        let (messages, errors) = self.sessions.take_activity();
        let elapsed = {
            let mut last = lock(&self.last_collect);
            let elapsed = last.map(|at| at.elapsed());
            *last = Some(Instant::now());
            elapsed
        };
        let throughput_per_sec = match elapsed {
            Some(elapsed) if elapsed.as_secs_f64() > 0.0 => messages as f64 / elapsed.as_secs_f64(),
            _ => 0.0,
        };
        let error_rate_pct = if messages == 0 {
            0.0
        } else {
            errors as f64 * 100.0 / messages as f64
        };

        let snapshot = MetricsSnapshot {
            timestamp: now_millis(),
            connection_count: self.sessions.connection_count(),
            node_count: nodes.len(),
            healthy_node_count: healthy.len(),
            avg_cpu_pct: average(|n| n.cpu_usage_pct),
            avg_mem_pct: average(|n| n.mem_usage_pct),
            avg_latency_ms: average(|n| n.network_latency_ms),
            error_rate_pct,
            throughput_per_sec,
            store_healthy_peers: self.store.healthy_peer_count(),
        };

        {
            let mut history = lock(&self.history);
            history.push_back(snapshot.clone());
            while history.len() > self.config.history_len.max(1) {
                history.pop_front();
            }
        }

        let key = format!("metrics:{}", self.node_id);
        let ttl = Duration::from_secs(self.config.history_ttl_secs);
        let persisted = match encode_json(&snapshot) {
            Ok(text) => self.store.set(&key, &text, Some(ttl)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = persisted {
            log::warn!("Failed to persist metrics snapshot: {e}");
        }

        log::debug!(
            "Metrics: {} connections, {}/{} nodes healthy, cpu {:.1}%, errors {:.1}%",
            snapshot.connection_count,
            snapshot.healthy_node_count,
            snapshot.node_count,
            snapshot.avg_cpu_pct,
            snapshot.error_rate_pct
        );
        snapshot
    }

    pub fn latest_metrics(&self) -> Option<MetricsSnapshot> {
        lock(&self.history).back().cloned()
    }

    pub fn metrics_history(&self) -> Vec<MetricsSnapshot> {
        lock(&self.history).iter().cloned().collect()
    }

    // ─── Alerting / healing loop ──────────────────────────────────────

    /// One alerting and healing cycle over the latest snapshot.
    pub async fn evaluate(&self) -> Evaluation {
        let snapshot = match self.latest_metrics() {
            Some(snapshot) => snapshot,
            None => self.collect_metrics().await,
        };
        let nodes = self.nodes.nodes();
        let breaches = alerts::detect(&snapshot, &nodes, &self.config.thresholds, &self.node_id);
        let dedup = Duration::from_secs(self.config.alert_dedup_secs);
        let ttl = Duration::from_secs(self.config.history_ttl_secs);

        let mut evaluation = Evaluation::default();
        let mut remedies: Vec<(ActionType, Option<String>, String)> = Vec::new();
        let mut cleared: Vec<(Option<String>, String)> = Vec::new();
        {
            let mut book = lock(&self.alerts);
            for breach in &breaches {
                match book.raise(breach, dedup) {
                    Raised::New(alert) | Raised::Reopened(alert) => {
                        log::warn!("Alert [{:?}] {}", alert.severity, alert.message);
                        evaluation.raised.push(alert);
                    }
                    Raised::Refreshed(_) => {}
                }
                if breach.severity == Severity::Critical {
                    if let Some(action_type) = remedy(breach.alert_type) {
                        remedies.push((action_type, breach.node_id.clone(), format!("{:?}", breach.alert_type)));
                    }
                }
            }

            evaluation.resolved = book.resolve_cleared(self.config.resolve_ratio, |key| {
                alerts::reading(key, &snapshot, &nodes)
            });
            for alert in &evaluation.resolved {
                log::info!("Resolved: {}", alert.message);
                if remedy(alert.alert_type) == Some(ActionType::ScaleUp) {
                    cleared.push((alert.node_id.clone(), format!("{:?} resolved", alert.alert_type)));
                }
            }

            let restart_after = Duration::from_secs(self.config.restart_after_secs);
            let remove_after = Duration::from_secs(self.config.remove_after_secs);
            for (alert, age) in book.open_with_age() {
                if alert.alert_type != AlertType::NodeFailure {
                    continue;
                }
                let reason = format!("{} for {}s", alert.message, age.as_secs());
                if age >= remove_after {
                    remedies.push((ActionType::RemoveNode, alert.node_id.clone(), reason));
                } else if age >= restart_after {
                    remedies.push((ActionType::RestartNode, alert.node_id.clone(), reason));
                }
            }
            book.prune(ttl);
        }

        let scheduled: Vec<HealingAction> = {
            let mut log = lock(&self.actions);
            let window = Duration::from_secs(self.config.action_dedup_secs);
            for (node_id, reason) in cleared {
                if log.holds_extra_capacity(node_id.as_deref()) {
                    remedies.push((ActionType::ScaleDown, node_id, reason));
                }
            }
            let scheduled = remedies
                .into_iter()
                .filter_map(|(action_type, node_id, reason)| {
                    let region = node_id
                        .as_deref()
                        .and_then(|id| self.nodes.get(id))
                        .map(|n| n.region);
                    log.schedule(action_type, node_id.as_deref(), region.as_deref(), reason, window)
                })
                .collect();
            log.prune(ttl);
            scheduled
        };

        for action in scheduled {
            evaluation.actions.push(self.run_action(action).await);
        }
        evaluation
    }

    /// Execute one scheduled action under the action timeout.
    async fn run_action(&self, action: HealingAction) -> HealingAction {
        log::info!(
            "Healing: {:?} on {} ({})",
            action.action_type,
            action.node_id.as_deref().unwrap_or("cluster"),
            action.reason
        );
        lock(&self.actions).set_status(&action.id, ActionStatus::InProgress, None);

        let timeout = Duration::from_secs(self.config.action_timeout_secs);
        let outcome = match tokio::time::timeout(timeout, self.executor.execute(&action)).await {
            Ok(result) => result,
            Err(_) => Err(HealerError::Timeout(action.action_type, timeout)),
        };
        let (status, detail) = match outcome {
            Ok(detail) => (ActionStatus::Completed, detail),
            Err(e) => {
                log::error!("Healing action {:?} failed: {e}", action.action_type);
                (ActionStatus::Failed, e.to_string())
            }
        };

        let mut log = lock(&self.actions);
        log.set_status(&action.id, status, Some(detail));
        log.get(&action.id).unwrap_or(action)
    }

    /// Record a store failure. Returns whether it is fatal for this node
    /// (no healthy store peers), in which case a critical alert is raised.
    pub fn report_store_failure(&self, error: &StoreError) -> bool {
        if !matches!(error, StoreError::NoHealthyPeers) {
            return false;
        }
        let breach = Breach {
            alert_type: AlertType::StoreUnavailable,
            severity: Severity::Critical,
            node_id: None,
            value: 1.0,
            threshold: 1.0,
        };
        let raised = lock(&self.alerts).raise(&breach, Duration::from_secs(self.config.alert_dedup_secs));
        log::error!("CRITICAL: {}", raised.alert().message);
        true
    }

    // ─── Reporting ────────────────────────────────────────────────────

    pub fn unresolved_alerts(&self) -> Vec<Alert> {
        lock(&self.alerts).unresolved()
    }

    pub fn alert_history(&self) -> Vec<Alert> {
        lock(&self.alerts).all()
    }

    pub fn action_history(&self) -> Vec<HealingAction> {
        lock(&self.actions).history()
    }

    /// Unhealthy with an open critical alert or no healthy node, degraded
    /// with any other open alert, healthy otherwise.
    pub fn status(&self) -> HealthStatus {
        let book = lock(&self.alerts);
        if book.has_unresolved_critical() || self.nodes.healthy_count() == 0 {
            HealthStatus::Unhealthy
        } else if book.has_unresolved() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    pub fn report(&self) -> HealthReport {
        HealthReport {
            node_id: self.node_id.clone(),
            status: self.status(),
            metrics: self.latest_metrics(),
            nodes: self.nodes.nodes(),
            alerts: self.unresolved_alerts(),
            actions: self.action_history(),
        }
    }
}
