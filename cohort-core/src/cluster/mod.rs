//! Node registry: the fleet's capacity and health picture.
//!
//! ```text
//!  refresh_metrics (5s) ── local Node ──► store "node:{id}"  ──► other nodes
//!                                     └─► publish "node:{id}:metrics"
//!  sync_from_store      ◄── "node:*" records, merged last-write-wins
//!  health_check (30s)   ── freshness probe per remote node, 3 strikes
//! ```
//!
//! The node map is a `DashMap`, so metric merges and load updates for
//! different nodes never contend. Any health transition drops the cached
//! region-weight table used by the balancer (see [`balancer`]).

pub mod balancer;
pub mod telemetry;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::clock::now_millis;
use crate::config::BalancerConfig;
use crate::protocol::{node_metrics_channel, ClusterAnnouncement};
use crate::store::{decode_json, encode_json, CoordinationStore, StoreError};

pub use balancer::{Priority, SelectionRequest};
pub use telemetry::{FixedMetrics, MetricsSample, MetricsSource, SystemTelemetry};

/// Store key prefix of node mirrors.
pub const NODE_KEY_PREFIX: &str = "node:";

/// Store key of one node's mirror.
pub fn node_key(node_id: &str) -> String {
    format!("{NODE_KEY_PREFIX}{node_id}")
}

/// One running instance of the collaboration service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub node_id: String,
    pub region: String,
    pub capacity: u32,
    pub current_load: u32,
    pub cpu_usage_pct: f64,
    pub mem_usage_pct: f64,
    pub network_latency_ms: f64,
    pub healthy: bool,
    /// Milliseconds since the Unix epoch; the last-write-wins key
    pub last_updated: u64,
}

impl Node {
    pub fn new(node_id: impl Into<String>, region: impl Into<String>, capacity: u32) -> Self {
        Self {
            node_id: node_id.into(),
            region: region.into(),
            capacity,
            current_load: 0,
            cpu_usage_pct: 0.0,
            mem_usage_pct: 0.0,
            network_latency_ms: 0.0,
            healthy: true,
            last_updated: now_millis(),
        }
    }

    /// Load as a fraction of capacity. A zero-capacity node counts as full.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            1.0
        } else {
            self.current_load as f64 / self.capacity as f64
        }
    }
}

/// Result of one node health-check round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeHealthReport {
    pub newly_unhealthy: Vec<String>,
    pub recovered: Vec<String>,
}

/// Fleet registry as seen from one process.
pub struct NodeRegistry {
    local_node_id: String,
    config: BalancerConfig,
    store: Arc<CoordinationStore>,
    telemetry: Arc<dyn MetricsSource>,
    nodes: DashMap<String, Node>,
    /// Consecutive failed health probes per remote node
    failures: DashMap<String, u32>,
    /// region → weight, rebuilt lazily after invalidation
    region_weights: RwLock<Option<Arc<HashMap<String, f64>>>>,
}

impl NodeRegistry {
    pub fn new(
        local_node_id: impl Into<String>,
        config: BalancerConfig,
        store: Arc<CoordinationStore>,
        telemetry: Arc<dyn MetricsSource>,
    ) -> Self {
        Self {
            local_node_id: local_node_id.into(),
            config,
            store,
            telemetry,
            nodes: DashMap::new(),
            failures: DashMap::new(),
            region_weights: RwLock::new(None),
        }
    }

    pub fn local_node_id(&self) -> &str {
        &self.local_node_id
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    // ─── Membership ───────────────────────────────────────────────────

    /// Add a node locally and to the store mirror.
    pub async fn register_node(
        &self,
        node_id: &str,
        region: &str,
        capacity: u32,
    ) -> Result<Node, StoreError> {
        let node = Node::new(node_id, region, capacity);
        self.store
            .set(&node_key(node_id), &encode_json(&node)?, None)
            .await?;
        self.nodes.insert(node_id.to_string(), node.clone());
        self.failures.remove(node_id);
        self.invalidate_region_weights();

        self.store.announce(&ClusterAnnouncement::NodeRegistered {
            node_id: node_id.to_string(),
            region: region.to_string(),
        });
        log::info!("Registered node {node_id} in {region} (capacity {capacity})");
        Ok(node)
    }

    /// Remove a node locally and from the mirror. Session migration off the
    /// node is the caller's job (the healer owns it).
    pub async fn deregister_node(&self, node_id: &str) -> Result<Option<Node>, StoreError> {
        self.store.delete(&node_key(node_id)).await?;
        let removed = self.nodes.remove(node_id).map(|(_, node)| node);
        self.failures.remove(node_id);
        self.invalidate_region_weights();

        self.store.announce(&ClusterAnnouncement::NodeDeregistered {
            node_id: node_id.to_string(),
        });
        log::info!("Deregistered node {node_id}");
        Ok(removed)
    }

    pub fn get(&self, node_id: &str) -> Option<Node> {
        self.nodes.get(node_id).map(|n| n.clone())
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Snapshot of every known node, ordered by id.
    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.iter().map(|n| n.value().clone()).collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    pub fn healthy_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.healthy).count()
    }

    // ─── Metrics ──────────────────────────────────────────────────────

    /// Sample local telemetry, measure store latency, and write the local
    /// record back to the mirror and the node's metrics channel.
    ///
    /// Returns `None` while the local node is not registered.
    pub async fn refresh_metrics(&self) -> Result<Option<Node>, StoreError> {
        let key = node_key(&self.local_node_id);
        let started = tokio::time::Instant::now();
        self.store.get(&key).await?;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let sample = self.telemetry.sample();

        let node = {
            let Some(mut entry) = self.nodes.get_mut(&self.local_node_id) else {
                return Ok(None);
            };
            entry.cpu_usage_pct = sample.cpu_usage_pct;
            entry.mem_usage_pct = sample.mem_usage_pct;
            entry.network_latency_ms = latency_ms;
            entry.last_updated = now_millis().max(entry.last_updated + 1);
            entry.clone()
        };

        let text = encode_json(&node)?;
        self.store.set(&key, &text, None).await?;
        self.store
            .publish(&node_metrics_channel(&self.local_node_id), text);
        log::trace!(
            "Refreshed metrics: cpu {:.1}% mem {:.1}% latency {:.2}ms load {}/{}",
            node.cpu_usage_pct,
            node.mem_usage_pct,
            node.network_latency_ms,
            node.current_load,
            node.capacity
        );
        Ok(Some(node))
    }

    /// Merge a node record observed elsewhere. Only a strictly newer
    /// `last_updated` replaces the local copy. Returns whether it did.
    pub fn apply_remote(&self, incoming: Node) -> bool {
        let mut health_changed = false;
        let applied = match self.nodes.entry(incoming.node_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if incoming.last_updated > entry.get().last_updated {
                    health_changed = entry.get().healthy != incoming.healthy;
                    entry.insert(incoming);
                    true
                } else {
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(incoming);
                health_changed = true;
                true
            }
        };
        if health_changed {
            self.invalidate_region_weights();
        }
        applied
    }

    /// Pull every mirrored node record and merge it. Nodes whose mirror is
    /// gone (deregistered elsewhere) are dropped, except the local node.
    pub async fn sync_from_store(&self) -> Result<usize, StoreError> {
        let records = self.store.scan_prefix(NODE_KEY_PREFIX).await?;
        let mut seen = HashSet::with_capacity(records.len());
        let mut merged = 0;

        for (key, value) in records {
            match decode_json::<Node>(&value) {
                Ok(node) => {
                    seen.insert(node.node_id.clone());
                    if self.apply_remote(node) {
                        merged += 1;
                    }
                }
                Err(e) => log::warn!("Skipping malformed node record {key}: {e}"),
            }
        }

        let before = self.nodes.len();
        self.nodes
            .retain(|id, _| id == &self.local_node_id || seen.contains(id));
        if self.nodes.len() != before {
            self.invalidate_region_weights();
        }
        Ok(merged)
    }

    /// Adjust a node's load by `delta`, clamped into `[0, capacity]`.
    pub fn update_node_load(&self, node_id: &str, delta: i64) -> Option<u32> {
        let mut node = self.nodes.get_mut(node_id)?;
        let next = (node.current_load as i64 + delta).clamp(0, node.capacity as i64);
        node.current_load = next as u32;
        Some(node.current_load)
    }

    // ─── Health ───────────────────────────────────────────────────────

    /// Probe every remote node once. A probe passes when the node's mirror
    /// answers within the store probe budget and is fresher than
    /// `stale_after_secs`. `failure_threshold` consecutive failures mark
    /// the node unhealthy; one pass marks it healthy again.
    pub async fn health_check(&self, probe_timeout: Duration) -> NodeHealthReport {
        let mut report = NodeHealthReport::default();
        let stale_after_ms = self.config.stale_after_secs * 1000;
        let ids: Vec<String> = self
            .nodes
            .iter()
            .map(|n| n.node_id.clone())
            .filter(|id| id != &self.local_node_id)
            .collect();

        for node_id in ids {
            let was_healthy = self.nodes.get(&node_id).is_some_and(|n| n.healthy);
            let key = node_key(&node_id);
            let probe = tokio::time::timeout(probe_timeout, self.store.get(&key));
            let fresh = match probe.await {
                Ok(Ok(Some(text))) => match decode_json::<Node>(&text) {
                    Ok(remote) => {
                        let fresh = now_millis().saturating_sub(remote.last_updated) <= stale_after_ms;
                        self.apply_remote(remote);
                        fresh
                    }
                    Err(_) => false,
                },
                _ => false,
            };

            if fresh {
                self.failures.remove(&node_id);
                self.set_healthy(&node_id, true);
                if !was_healthy {
                    log::info!("Node {node_id} recovered");
                    report.recovered.push(node_id);
                }
                continue;
            }

            let failures = {
                let mut count = self.failures.entry(node_id.clone()).or_insert(0);
                *count += 1;
                *count
            };
            log::warn!(
                "Node {node_id} failed health check ({failures}/{})",
                self.config.failure_threshold
            );
            if failures >= self.config.failure_threshold && self.set_healthy(&node_id, false) {
                log::error!("Node {node_id} marked unhealthy");
                report.newly_unhealthy.push(node_id);
            }
        }
        report
    }

    /// Set a node's health flag. Returns whether it changed.
    pub fn set_healthy(&self, node_id: &str, healthy: bool) -> bool {
        let changed = match self.nodes.get_mut(node_id) {
            Some(mut node) if node.healthy != healthy => {
                node.healthy = healthy;
                true
            }
            _ => false,
        };
        if changed {
            self.invalidate_region_weights();
        }
        changed
    }

    pub fn consecutive_failures(&self, node_id: &str) -> u32 {
        self.failures.get(node_id).map_or(0, |f| *f)
    }

    // ─── Region weights ───────────────────────────────────────────────

    pub fn invalidate_region_weights(&self) {
        let mut table = self.region_weights.write().unwrap_or_else(|e| e.into_inner());
        *table = None;
    }

    /// Per-region weight: aggregate healthy capacity ÷ average latency.
    pub fn region_weights(&self) -> Arc<HashMap<String, f64>> {
        if let Some(table) = self
            .region_weights
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            return table.clone();
        }

        let table = Arc::new(balancer::compute_region_weights(&self.nodes()));
        let mut slot = self.region_weights.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(table.clone());
        table
    }

    pub fn region_weights_cached(&self) -> bool {
        self.region_weights
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(store: Arc<CoordinationStore>, local: &str) -> NodeRegistry {
        NodeRegistry::new(
            local,
            BalancerConfig::default(),
            store,
            Arc::new(FixedMetrics::new(20.0, 30.0)),
        )
    }

    #[tokio::test]
    async fn test_register_mirrors_and_announces() {
        let store = Arc::new(CoordinationStore::standalone());
        let mut sub = store.subscribe(crate::protocol::GLOBAL_BROADCAST);
        let nodes = registry(store.clone(), "node-a");

        nodes.register_node("node-a", "us-east", 100).await.unwrap();
        let mirrored: Node = decode_json(&store.get("node:node-a").await.unwrap().unwrap()).unwrap();
        assert_eq!(mirrored.capacity, 100);
        assert!(mirrored.healthy);

        let text = sub.recv().await.unwrap();
        assert_eq!(
            ClusterAnnouncement::decode(&text).unwrap(),
            ClusterAnnouncement::NodeRegistered {
                node_id: "node-a".into(),
                region: "us-east".into()
            }
        );
    }

    #[tokio::test]
    async fn test_deregister_removes_mirror() {
        let store = Arc::new(CoordinationStore::standalone());
        let nodes = registry(store.clone(), "node-a");
        nodes.register_node("node-b", "us-east", 100).await.unwrap();

        let removed = nodes.deregister_node("node-b").await.unwrap();
        assert_eq!(removed.unwrap().node_id, "node-b");
        assert!(!nodes.contains("node-b"));
        assert!(store.get("node:node-b").await.unwrap().is_none());

        // Deregistering twice is harmless.
        assert!(nodes.deregister_node("node-b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refresh_metrics_writes_back() {
        let store = Arc::new(CoordinationStore::standalone());
        let telemetry = Arc::new(FixedMetrics::new(42.0, 17.0));
        let nodes = NodeRegistry::new(
            "node-a",
            BalancerConfig::default(),
            store.clone(),
            telemetry.clone(),
        );
        nodes.register_node("node-a", "us-east", 100).await.unwrap();
        let mut metrics = store.subscribe("node:node-a:metrics");

        let node = nodes.refresh_metrics().await.unwrap().unwrap();
        assert_eq!(node.cpu_usage_pct, 42.0);
        assert_eq!(node.mem_usage_pct, 17.0);

        let published: Node = decode_json(&metrics.recv().await.unwrap()).unwrap();
        assert_eq!(published, node);
        let mirrored: Node = decode_json(&store.get("node:node-a").await.unwrap().unwrap()).unwrap();
        assert_eq!(mirrored.cpu_usage_pct, 42.0);
    }

    #[tokio::test]
    async fn test_refresh_without_registration_is_skipped() {
        let store = Arc::new(CoordinationStore::standalone());
        let nodes = registry(store, "node-a");
        assert!(nodes.refresh_metrics().await.unwrap().is_none());
    }

    #[test]
    fn test_last_write_wins() {
        let nodes = registry(Arc::new(CoordinationStore::standalone()), "node-a");
        let mut newer = Node::new("node-b", "eu-west", 100);
        newer.last_updated = 2_000;
        newer.cpu_usage_pct = 50.0;
        let mut older = newer.clone();
        older.last_updated = 1_000;
        older.cpu_usage_pct = 10.0;

        assert!(nodes.apply_remote(newer));
        assert!(!nodes.apply_remote(older));
        assert_eq!(nodes.get("node-b").unwrap().cpu_usage_pct, 50.0);

        let mut same_time = nodes.get("node-b").unwrap();
        same_time.cpu_usage_pct = 99.0;
        assert!(!nodes.apply_remote(same_time));
    }

    #[tokio::test]
    async fn test_sync_from_store_merges_and_drops() {
        let store = Arc::new(CoordinationStore::standalone());
        let a = registry(store.clone(), "node-a");
        let b = registry(store.clone(), "node-b");
        a.register_node("node-a", "us-east", 100).await.unwrap();
        b.register_node("node-b", "eu-west", 200).await.unwrap();

        assert_eq!(a.sync_from_store().await.unwrap(), 1);
        assert_eq!(a.get("node-b").unwrap().capacity, 200);

        b.deregister_node("node-b").await.unwrap();
        a.sync_from_store().await.unwrap();
        assert!(!a.contains("node-b"));
        assert!(a.contains("node-a"));
    }

    #[test]
    fn test_update_load_clamps() {
        let nodes = registry(Arc::new(CoordinationStore::standalone()), "node-a");
        nodes.apply_remote(Node::new("node-a", "us-east", 10));

        assert_eq!(nodes.update_node_load("node-a", 4), Some(4));
        assert_eq!(nodes.update_node_load("node-a", -9), Some(0));
        assert_eq!(nodes.update_node_load("node-a", 25), Some(10));
        assert_eq!(nodes.update_node_load("missing", 1), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_node_unhealthy_after_three_checks() {
        let store = Arc::new(CoordinationStore::standalone());
        let nodes = registry(store.clone(), "node-a");
        nodes.register_node("node-a", "us-east", 100).await.unwrap();

        let mut stale = Node::new("node-b", "us-east", 100);
        stale.last_updated = now_millis() - 60_000;
        store.set("node:node-b", &encode_json(&stale).unwrap(), None).await.unwrap();
        nodes.apply_remote(stale.clone());

        let timeout = Duration::from_secs(2);
        assert!(nodes.health_check(timeout).await.newly_unhealthy.is_empty());
        assert!(nodes.health_check(timeout).await.newly_unhealthy.is_empty());
        assert_eq!(nodes.consecutive_failures("node-b"), 2);
        assert!(nodes.get("node-b").unwrap().healthy);

        let report = nodes.health_check(timeout).await;
        assert_eq!(report.newly_unhealthy, vec!["node-b".to_string()]);
        assert!(!nodes.get("node-b").unwrap().healthy);

        // A fresh record brings it back.
        let mut fresh = stale;
        fresh.last_updated = now_millis();
        fresh.healthy = true;
        store.set("node:node-b", &encode_json(&fresh).unwrap(), None).await.unwrap();
        let report = nodes.health_check(timeout).await;
        assert_eq!(report.recovered, vec!["node-b".to_string()]);
        assert_eq!(nodes.consecutive_failures("node-b"), 0);
    }

    #[test]
    fn test_health_transition_invalidates_region_weights() {
        let nodes = registry(Arc::new(CoordinationStore::standalone()), "node-a");
        nodes.apply_remote(Node::new("node-b", "us-east", 100));
        nodes.region_weights();
        assert!(nodes.region_weights_cached());

        assert!(!nodes.set_healthy("node-b", true));
        assert!(nodes.region_weights_cached());

        assert!(nodes.set_healthy("node-b", false));
        assert!(!nodes.region_weights_cached());
    }
}
