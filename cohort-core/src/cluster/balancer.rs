//! Weighted multi-factor node selection.
//!
//! ```text
//! score = w_cpu·(100 − cpu) + w_mem·(100 − mem)
//!       + w_cap·100·(1 − load/capacity) + w_lat·latencyScore
//!       + proximityBonus + ln(1 + regionWeight)
//! score ×= 1.2 (high) | 0.8 (low)
//! ```
//!
//! Only healthy nodes strictly below `max_utilization` of their capacity
//! qualify. No qualifying node is a normal outcome ("no capacity"), not an
//! error.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{Node, NodeRegistry};
use crate::config::BalancerConfig;

/// Latency at which the latency sub-score reaches zero.
const LATENCY_FLOOR_MS: f64 = 1000.0;

/// Request priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

/// Placement request for a new or migrating session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionRequest {
    pub user_id: String,
    #[serde(default)]
    pub region_hint: Option<String>,
    #[serde(default)]
    pub priority: Priority,
}

impl SelectionRequest {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    pub fn in_region(mut self, region: impl Into<String>) -> Self {
        self.region_hint = Some(region.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Whether a node may receive new sessions.
pub fn qualifies(node: &Node, config: &BalancerConfig) -> bool {
    node.healthy && (node.current_load as f64) < config.max_utilization * node.capacity as f64
}

/// Region family: everything before the first `-` (`us-east` → `us`).
fn region_family(region: &str) -> &str {
    region.split('-').next().unwrap_or(region)
}

fn proximity_bonus(node: &Node, hint: Option<&str>, config: &BalancerConfig) -> f64 {
    match hint {
        Some(hint) if hint == node.region => config.same_region_bonus,
        Some(hint) if region_family(hint) == region_family(&node.region) => {
            config.nearby_region_bonus
        }
        _ => 0.0,
    }
}

/// Per-region weight: aggregate capacity of healthy nodes divided by their
/// average latency (at least 1ms).
pub fn compute_region_weights(nodes: &[Node]) -> HashMap<String, f64> {
    let mut totals: HashMap<&str, (f64, f64, usize)> = HashMap::new();
    for node in nodes.iter().filter(|n| n.healthy) {
        let entry = totals.entry(node.region.as_str()).or_default();
        entry.0 += node.capacity as f64;
        entry.1 += node.network_latency_ms;
        entry.2 += 1;
    }
    totals
        .into_iter()
        .map(|(region, (capacity, latency, count))| {
            let avg_latency = (latency / count as f64).max(1.0);
            (region.to_string(), capacity / avg_latency)
        })
        .collect()
}

/// Base score of a node before bonuses, in `[0, 100]`.
pub fn base_score(node: &Node, config: &BalancerConfig) -> f64 {
    let w = &config.weights;
    let cpu = (100.0 - node.cpu_usage_pct).clamp(0.0, 100.0);
    let mem = (100.0 - node.mem_usage_pct).clamp(0.0, 100.0);
    let capacity = ((1.0 - node.utilization()) * 100.0).clamp(0.0, 100.0);
    let latency = (100.0 - node.network_latency_ms * 100.0 / LATENCY_FLOOR_MS).clamp(0.0, 100.0);
    w.cpu * cpu + w.memory * mem + w.capacity * capacity + w.latency * latency
}

/// Full score of a node for one request.
pub fn score_node(
    node: &Node,
    request: &SelectionRequest,
    region_weights: &HashMap<String, f64>,
    config: &BalancerConfig,
) -> f64 {
    let region_bonus = region_weights
        .get(&node.region)
        .map_or(0.0, |weight| weight.ln_1p());
    let score = base_score(node, config)
        + proximity_bonus(node, request.region_hint.as_deref(), config)
        + region_bonus;

    match request.priority {
        Priority::High => score * config.high_priority_multiplier,
        Priority::Normal => score,
        Priority::Low => score * config.low_priority_multiplier,
    }
}

impl NodeRegistry {
    /// Qualifying nodes with their scores, best first. Equal scores are
    /// ordered by node id.
    pub fn rank_nodes(&self, request: &SelectionRequest) -> Vec<(String, f64)> {
        let weights = self.region_weights();
        let config = self.config();
        let mut ranked: Vec<(String, f64)> = self
            .nodes()
            .into_iter()
            .filter(|node| qualifies(node, config))
            .map(|node| {
                let score = score_node(&node, request, &weights, config);
                (node.node_id, score)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked
    }

    /// Best node for a new session, or `None` when no node has capacity.
    pub fn select_optimal_node(&self, request: &SelectionRequest) -> Option<String> {
        let selected = self.rank_nodes(request).into_iter().next().map(|(id, _)| id);
        match &selected {
            Some(node_id) => log::debug!("Selected node {node_id} for user {}", request.user_id),
            None => log::warn!("No node has capacity for user {}", request.user_id),
        }
        selected
    }

    /// Best node other than `excluded` (migration target).
    pub fn select_excluding(&self, request: &SelectionRequest, excluded: &str) -> Option<String> {
        self.rank_nodes(request)
            .into_iter()
            .map(|(id, _)| id)
            .find(|id| id != excluded)
    }
}
