//! Healing actions: scheduling, deduplication and execution.
//!
//! ```text
//! schedule() ── pending ──► execute() ── in_progress ──► completed
//!     │                        │
//!     │ same (type, node)      └── error / timeout ──────► failed
//!     └ in flight or < 30s ago → dropped
//! ```

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::HealerError;
use crate::clock::now_millis;
use crate::cluster::{NodeRegistry, SelectionRequest};
use crate::protocol::ClusterAnnouncement;
use crate::session::{Session, SESSION_KEY_PREFIX};
use crate::store::{decode_json, encode_json, CoordinationStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ScaleUp,
    ScaleDown,
    MigrateConnections,
    RestartNode,
    AddNode,
    RemoveNode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ActionStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, ActionStatus::Completed | ActionStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingAction {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub reason: String,
    pub timestamp: u64,
    pub status: ActionStatus,
    /// Outcome or failure description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone)]
struct Tracked {
    action: HealingAction,
    scheduled_at: Instant,
    finished_at: Option<Instant>,
}

/// Action history with per-(type, node) deduplication.
#[derive(Debug, Default)]
pub struct ActionLog {
    actions: VecDeque<Tracked>,
}

impl ActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pending action unless one for the same `(type, node)` is
    /// still in flight or was scheduled within `dedup_window`.
    pub fn schedule(
        &mut self,
        action_type: ActionType,
        node_id: Option<&str>,
        region: Option<&str>,
        reason: impl Into<String>,
        dedup_window: Duration,
    ) -> Option<HealingAction> {
        let duplicate = self.actions.iter().any(|t| {
            t.action.action_type == action_type
                && t.action.node_id.as_deref() == node_id
                && (!t.action.status.is_finished() || t.scheduled_at.elapsed() < dedup_window)
        });
        if duplicate {
            log::trace!("Skipping duplicate {action_type:?} for {node_id:?}");
            return None;
        }

        let action = HealingAction {
            id: Uuid::new_v4(),
            action_type,
            node_id: node_id.map(str::to_string),
            region: region.map(str::to_string),
            reason: reason.into(),
            timestamp: now_millis(),
            status: ActionStatus::Pending,
            detail: None,
        };
        self.actions.push_back(Tracked {
            action: action.clone(),
            scheduled_at: Instant::now(),
            finished_at: None,
        });
        Some(action)
    }

    pub fn set_status(&mut self, id: &Uuid, status: ActionStatus, detail: Option<String>) {
        if let Some(tracked) = self.actions.iter_mut().find(|t| t.action.id == *id) {
            tracked.action.status = status;
            if detail.is_some() {
                tracked.action.detail = detail;
            }
            if status.is_finished() {
                tracked.finished_at = Some(Instant::now());
            }
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<HealingAction> {
        self.actions
            .iter()
            .find(|t| t.action.id == *id)
            .map(|t| t.action.clone())
    }

    /// Whether the latest scale action on `node_id` is a completed scale up,
    /// i.e. extra capacity was requested and not yet handed back.
    pub fn holds_extra_capacity(&self, node_id: Option<&str>) -> bool {
        self.actions
            .iter()
            .rev()
            .find(|t| {
                matches!(t.action.action_type, ActionType::ScaleUp | ActionType::ScaleDown)
                    && t.action.node_id.as_deref() == node_id
            })
            .is_some_and(|t| {
                t.action.action_type == ActionType::ScaleUp && t.action.status == ActionStatus::Completed
            })
    }

    /// Every retained action, oldest first.
    pub fn history(&self) -> Vec<HealingAction> {
        self.actions.iter().map(|t| t.action.clone()).collect()
    }

    /// Drop actions finished longer ago than `ttl`.
    pub fn prune(&mut self, ttl: Duration) -> usize {
        let before = self.actions.len();
        self.actions
            .retain(|t| !t.finished_at.is_some_and(|at| at.elapsed() > ttl));
        before - self.actions.len()
    }
}

// ───────────────────────────────────────────────────────────────────
// Migration
// ───────────────────────────────────────────────────────────────────

/// Outcome of moving a node's sessions elsewhere.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationSummary {
    pub migrated: usize,
    pub evicted: usize,
}

/// Reassign every mirrored session hosted on `from` to the best other
/// node, and announce it so the owning registry rehomes the connection.
/// Sessions no node can take are evicted.
pub async fn migrate_sessions(
    store: &CoordinationStore,
    nodes: &NodeRegistry,
    from: &str,
    session_ttl: Duration,
) -> Result<MigrationSummary, HealerError> {
    let mut summary = MigrationSummary::default();

    for (key, text) in store.scan_prefix(SESSION_KEY_PREFIX).await? {
        let mut session: Session = match decode_json(&text) {
            Ok(session) => session,
            Err(e) => {
                log::warn!("Skipping unreadable session mirror {key}: {e}");
                continue;
            }
        };
        if session.node_id != from {
            continue;
        }

        let user_id = session.user_id.clone().unwrap_or_default();
        let target = nodes.select_excluding(&SelectionRequest::new(user_id), from);
        nodes.update_node_load(from, -1);
        match target {
            Some(to) => {
                session.node_id = to.clone();
                store
                    .set(&key, &encode_json(&session)?, Some(session_ttl))
                    .await?;
                nodes.update_node_load(&to, 1);
                store.announce(&ClusterAnnouncement::SessionMigrated {
                    session_id: session.session_id,
                    from: from.to_string(),
                    to: to.clone(),
                });
                log::info!("Migrated session {} from {from} to {to}", session.session_id);
                summary.migrated += 1;
            }
            None => {
                store.delete(&key).await?;
                store.announce(&ClusterAnnouncement::SessionEvicted {
                    session_id: session.session_id,
                    node_id: from.to_string(),
                });
                log::warn!(
                    "Evicted session {} from {from}: no node has capacity",
                    session.session_id
                );
                summary.evicted += 1;
            }
        }
    }
    Ok(summary)
}

// ───────────────────────────────────────────────────────────────────
// Execution
// ───────────────────────────────────────────────────────────────────

/// Carries out actions against the node registry and the store.
///
/// Capacity changes (scale up, scale down, add node, restart) are requests
/// to the external orchestrator announced on `global:broadcast`; nothing
/// here changes the capacity or load the balancer reads. Migration and
/// removal act on the registry directly.
pub struct ActionExecutor {
    store: Arc<CoordinationStore>,
    nodes: Arc<NodeRegistry>,
    session_ttl: Duration,
}

impl ActionExecutor {
    pub fn new(store: Arc<CoordinationStore>, nodes: Arc<NodeRegistry>, session_ttl: Duration) -> Self {
        Self {
            store,
            nodes,
            session_ttl,
        }
    }

    fn target<'a>(&self, action: &'a HealingAction) -> Result<&'a str, HealerError> {
        action
            .node_id
            .as_deref()
            .ok_or(HealerError::MissingTarget(action.action_type))
    }

    fn region_of(&self, node_id: &str) -> Result<String, HealerError> {
        self.nodes
            .get(node_id)
            .map(|n| n.region)
            .ok_or_else(|| HealerError::UnknownNode(node_id.to_string()))
    }

    /// Run one action. Returns a short description of what was done.
    pub async fn execute(&self, action: &HealingAction) -> Result<String, HealerError> {
        match action.action_type {
            ActionType::ScaleUp => {
                let node_id = self.target(action)?;
                let region = self.region_of(node_id)?;
                self.store.announce(&ClusterAnnouncement::ScaleUpRequested {
                    node_id: node_id.to_string(),
                    region,
                    reason: action.reason.clone(),
                });
                Ok(format!("more capacity requested for {node_id}"))
            }
            ActionType::ScaleDown => {
                let node_id = self.target(action)?;
                let region = self.region_of(node_id)?;
                self.store.announce(&ClusterAnnouncement::ScaleDownRequested {
                    node_id: node_id.to_string(),
                    region,
                    reason: action.reason.clone(),
                });
                Ok(format!("release of extra capacity for {node_id} requested"))
            }
            ActionType::MigrateConnections => {
                let node_id = self.target(action)?;
                let summary =
                    migrate_sessions(&self.store, &self.nodes, node_id, self.session_ttl).await?;
                Ok(format!(
                    "{} sessions migrated, {} evicted",
                    summary.migrated, summary.evicted
                ))
            }
            ActionType::RestartNode => {
                let node_id = self.target(action)?;
                self.store.announce(&ClusterAnnouncement::RestartRequested {
                    node_id: node_id.to_string(),
                    reason: action.reason.clone(),
                });
                Ok(format!("restart of {node_id} requested"))
            }
            ActionType::AddNode => {
                let region = action
                    .region
                    .clone()
                    .or_else(|| {
                        action
                            .node_id
                            .as_deref()
                            .and_then(|id| self.nodes.get(id))
                            .map(|n| n.region)
                    })
                    .unwrap_or_default();
                self.store.announce(&ClusterAnnouncement::AddNodeRequested {
                    region: region.clone(),
                    reason: action.reason.clone(),
                });
                Ok(format!("new node requested in {region}"))
            }
            ActionType::RemoveNode => {
                let node_id = self.target(action)?;
                let summary =
                    migrate_sessions(&self.store, &self.nodes, node_id, self.session_ttl).await?;
                self.nodes.deregister_node(node_id).await?;
                Ok(format!(
                    "{node_id} removed ({} sessions migrated, {} evicted)",
                    summary.migrated, summary.evicted
                ))
            }
        }
    }
}
