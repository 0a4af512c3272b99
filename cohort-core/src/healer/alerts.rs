//! Threshold evaluation and the alert book.
//!
//! ```text
//! snapshot + nodes ──detect()──► [Breach] ──raise()──► AlertBook
//!                                                        │
//!               reading < 0.8 × threshold ──resolve()────┘
//! ```
//!
//! There is at most one live alert per `(type, node)`. A breach while that
//! alert is open refreshes it. A breach within the dedup window after it
//! resolved reopens it. Only later breaches open a new alert.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::MetricsSnapshot;
use crate::clock::now_millis;
use crate::cluster::Node;
use crate::config::Thresholds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    HighCpu,
    HighMemory,
    HighLatency,
    ConnectionSaturation,
    HighErrorRate,
    NodeFailure,
    StoreUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub value: f64,
    pub threshold: f64,
    /// Last time the condition was observed, epoch ms
    pub timestamp: u64,
    pub resolved: bool,
}

/// Identity used for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlertKey {
    pub alert_type: AlertType,
    pub node_id: Option<String>,
}

impl Alert {
    pub fn key(&self) -> AlertKey {
        AlertKey {
            alert_type: self.alert_type,
            node_id: self.node_id.clone(),
        }
    }
}

/// One threshold crossing found in a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Breach {
    pub alert_type: AlertType,
    pub severity: Severity,
    pub node_id: Option<String>,
    pub value: f64,
    pub threshold: f64,
}

impl Breach {
    fn message(&self) -> String {
        let subject = self.node_id.as_deref().unwrap_or("cluster");
        match self.alert_type {
            AlertType::HighCpu => format!("CPU at {:.1}% on {subject}", self.value),
            AlertType::HighMemory => format!("Memory at {:.1}% on {subject}", self.value),
            AlertType::HighLatency => format!("Latency {:.0}ms on {subject}", self.value),
            AlertType::ConnectionSaturation => {
                format!("{subject} at {:.1}% of its connection capacity", self.value)
            }
            AlertType::HighErrorRate => format!("Error rate {:.1}% on {subject}", self.value),
            AlertType::NodeFailure => format!("{subject} failed its health checks"),
            AlertType::StoreUnavailable => "No healthy coordination store peers".to_string(),
        }
    }
}

/// Warning/critical check of one metric. `None` when under both.
fn graded(value: f64, high: f64, critical: f64) -> Option<(Severity, f64)> {
    if value >= critical {
        Some((Severity::Critical, critical))
    } else if value >= high {
        Some((Severity::Warning, high))
    } else {
        None
    }
}

/// Every threshold crossing in `snapshot` and the node records.
///
/// Resource metrics are judged on healthy nodes only (an unhealthy node's
/// figures are stale); unhealthy nodes raise `node_failure` instead.
pub fn detect(
    snapshot: &MetricsSnapshot,
    nodes: &[Node],
    thresholds: &Thresholds,
    local_node_id: &str,
) -> Vec<Breach> {
    let mut breaches = Vec::new();
    let mut push = |alert_type, node_id: Option<&str>, value, graded: Option<(Severity, f64)>| {
        if let Some((severity, threshold)) = graded {
            breaches.push(Breach {
                alert_type,
                severity,
                node_id: node_id.map(str::to_string),
                value,
                threshold,
            });
        }
    };

    for node in nodes {
        let id = Some(node.node_id.as_str());
        if !node.healthy {
            push(AlertType::NodeFailure, id, 1.0, Some((Severity::Critical, 1.0)));
            continue;
        }
        push(
            AlertType::HighCpu,
            id,
            node.cpu_usage_pct,
            graded(node.cpu_usage_pct, thresholds.cpu_high, thresholds.cpu_critical),
        );
        push(
            AlertType::HighMemory,
            id,
            node.mem_usage_pct,
            graded(node.mem_usage_pct, thresholds.memory_high, thresholds.memory_critical),
        );
        push(
            AlertType::HighLatency,
            id,
            node.network_latency_ms,
            graded(
                node.network_latency_ms,
                thresholds.latency_high_ms,
                thresholds.latency_critical_ms,
            ),
        );
        let saturation = node.utilization() * 100.0;
        push(
            AlertType::ConnectionSaturation,
            id,
            saturation,
            (saturation > thresholds.saturation_pct)
                .then_some((Severity::Critical, thresholds.saturation_pct)),
        );
    }

    push(
        AlertType::HighErrorRate,
        Some(local_node_id),
        snapshot.error_rate_pct,
        graded(
            snapshot.error_rate_pct,
            thresholds.error_rate_high,
            thresholds.error_rate_critical,
        ),
    );
    if snapshot.store_healthy_peers == 0 {
        push(AlertType::StoreUnavailable, None, 1.0, Some((Severity::Critical, 1.0)));
    }
    breaches
}

/// Current value of the metric behind `key`. Metrics of nodes that are
/// gone read as zero so their alerts resolve.
pub fn reading(
    key: &AlertKey,
    snapshot: &MetricsSnapshot,
    nodes: &[Node],
) -> f64 {
    let node = key
        .node_id
        .as_deref()
        .and_then(|id| nodes.iter().find(|n| n.node_id == id));
    match key.alert_type {
        AlertType::HighCpu => node.map_or(0.0, |n| n.cpu_usage_pct),
        AlertType::HighMemory => node.map_or(0.0, |n| n.mem_usage_pct),
        AlertType::HighLatency => node.map_or(0.0, |n| n.network_latency_ms),
        AlertType::ConnectionSaturation => node.map_or(0.0, |n| n.utilization() * 100.0),
        AlertType::NodeFailure => node.map_or(0.0, |n| if n.healthy { 0.0 } else { 1.0 }),
        AlertType::HighErrorRate => snapshot.error_rate_pct,
        AlertType::StoreUnavailable => {
            if snapshot.store_healthy_peers == 0 {
                1.0
            } else {
                0.0
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Alert book
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Tracked {
    alert: Alert,
    opened_at: Instant,
    raised_at: Instant,
    resolved_at: Option<Instant>,
}

/// What `raise` did with a breach.
#[derive(Debug, Clone, PartialEq)]
pub enum Raised {
    New(Alert),
    Refreshed(Alert),
    Reopened(Alert),
}

impl Raised {
    pub fn alert(&self) -> &Alert {
        match self {
            Raised::New(a) | Raised::Refreshed(a) | Raised::Reopened(a) => a,
        }
    }
}

#[derive(Debug, Default)]
pub struct AlertBook {
    latest: HashMap<AlertKey, Tracked>,
    retired: VecDeque<Tracked>,
}

impl AlertBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&mut self, breach: &Breach, dedup_window: Duration) -> Raised {
        let key = AlertKey {
            alert_type: breach.alert_type,
            node_id: breach.node_id.clone(),
        };
        let now = Instant::now();

        if let Some(tracked) = self.latest.get_mut(&key) {
            let reopen = tracked.alert.resolved && tracked.raised_at.elapsed() < dedup_window;
            if !tracked.alert.resolved || reopen {
                tracked.alert.severity = breach.severity;
                tracked.alert.threshold = breach.threshold;
                tracked.alert.value = breach.value;
                tracked.alert.message = breach.message();
                tracked.alert.timestamp = now_millis();
                tracked.raised_at = now;
                if reopen {
                    tracked.alert.resolved = false;
                    tracked.resolved_at = None;
                    return Raised::Reopened(tracked.alert.clone());
                }
                return Raised::Refreshed(tracked.alert.clone());
            }
        }

        let alert = Alert {
            id: Uuid::new_v4(),
            alert_type: breach.alert_type,
            severity: breach.severity,
            message: breach.message(),
            node_id: breach.node_id.clone(),
            value: breach.value,
            threshold: breach.threshold,
            timestamp: now_millis(),
            resolved: false,
        };
        let tracked = Tracked {
            alert: alert.clone(),
            opened_at: now,
            raised_at: now,
            resolved_at: None,
        };
        if let Some(previous) = self.latest.insert(key, tracked) {
            self.retired.push_back(previous);
        }
        Raised::New(alert)
    }

    /// Resolve every open alert whose reading is strictly below
    /// `ratio × threshold`.
    pub fn resolve_cleared(&mut self, ratio: f64, reading: impl Fn(&AlertKey) -> f64) -> Vec<Alert> {
        let mut resolved = Vec::new();
        for (key, tracked) in self.latest.iter_mut() {
            if tracked.alert.resolved {
                continue;
            }
            let value = reading(key);
            if value < ratio * tracked.alert.threshold {
                tracked.alert.resolved = true;
                tracked.alert.value = value;
                tracked.alert.timestamp = now_millis();
                tracked.resolved_at = Some(Instant::now());
                resolved.push(tracked.alert.clone());
            }
        }
        resolved
    }

    /// Open alerts with how long each has been open.
    pub fn open_with_age(&self) -> Vec<(Alert, Duration)> {
        self.latest
            .values()
            .filter(|t| !t.alert.resolved)
            .map(|t| (t.alert.clone(), t.opened_at.elapsed()))
            .collect()
    }

    /// Open alerts, critical first, then oldest first.
    pub fn unresolved(&self) -> Vec<Alert> {
        let mut open: Vec<&Tracked> = self.latest.values().filter(|t| !t.alert.resolved).collect();
        open.sort_by(|a, b| {
            b.alert
                .severity
                .cmp(&a.alert.severity)
                .then(a.opened_at.cmp(&b.opened_at))
        });
        open.into_iter().map(|t| t.alert.clone()).collect()
    }

    /// Every retained alert, open or resolved.
    pub fn all(&self) -> Vec<Alert> {
        self.retired
            .iter()
            .chain(self.latest.values())
            .map(|t| t.alert.clone())
            .collect()
    }

    pub fn has_unresolved_critical(&self) -> bool {
        self.latest
            .values()
            .any(|t| !t.alert.resolved && t.alert.severity == Severity::Critical)
    }

    pub fn has_unresolved(&self) -> bool {
        self.latest.values().any(|t| !t.alert.resolved)
    }

    /// Drop alerts resolved longer ago than `ttl`. Returns how many.
    pub fn prune(&mut self, ttl: Duration) -> usize {
        let expired = |t: &Tracked| t.resolved_at.is_some_and(|at| at.elapsed() > ttl);
        let before = self.latest.len() + self.retired.len();
        self.latest.retain(|_, t| !expired(t));
        self.retired.retain(|t| !expired(t));
        before - self.latest.len() - self.retired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            store_healthy_peers: 3,
            ..MetricsSnapshot::default()
        }
    }

    fn node(id: &str, cpu: f64) -> Node {
        let mut node = Node::new(id, "us-east", 100);
        node.cpu_usage_pct = cpu;
        node.healthy = true;
        node
    }

    fn cpu_breach(value: f64) -> Breach {
        Breach {
            alert_type: AlertType::HighCpu,
            severity: Severity::Warning,
            node_id: Some("node-a".into()),
            value,
            threshold: 85.0,
        }
    }

    #[test]
    fn test_detect_grades_cpu() {
        let thresholds = Thresholds::default();
        let nodes = [node("a", 84.0), node("b", 88.0), node("c", 96.0)];
        let breaches = detect(&snapshot(), &nodes, &thresholds, "a");
        let cpu: Vec<(&str, Severity)> = breaches
            .iter()
            .filter(|b| b.alert_type == AlertType::HighCpu)
            .map(|b| (b.node_id.as_deref().unwrap(), b.severity))
            .collect();
        assert_eq!(cpu, vec![("b", Severity::Warning), ("c", Severity::Critical)]);
    }

    #[test]
    fn test_detect_node_failure_and_saturation() {
        let thresholds = Thresholds::default();
        let mut down = node("down", 99.0);
        down.healthy = false;
        let mut full = node("full", 10.0);
        full.current_load = 95;

        let breaches = detect(&snapshot(), &[down, full], &thresholds, "full");
        assert!(breaches.iter().any(|b| b.alert_type == AlertType::NodeFailure
            && b.node_id.as_deref() == Some("down")
            && b.severity == Severity::Critical));
        // Stale figures of a failed node are not judged.
        assert!(!breaches
            .iter()
            .any(|b| b.alert_type == AlertType::HighCpu && b.node_id.as_deref() == Some("down")));
        assert!(breaches
            .iter()
            .any(|b| b.alert_type == AlertType::ConnectionSaturation && b.severity == Severity::Critical));
    }

    #[test]
    fn test_detect_store_unavailable() {
        let snapshot = MetricsSnapshot::default();
        let breaches = detect(&snapshot, &[], &Thresholds::default(), "a");
        assert_eq!(breaches.len(), 1);
        assert_eq!(breaches[0].alert_type, AlertType::StoreUnavailable);
        assert_eq!(breaches[0].node_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_alert_refreshed_not_duplicated() {
        let mut book = AlertBook::new();
        let window = Duration::from_secs(60);
        let first = book.raise(&cpu_breach(86.0), window);
        assert!(matches!(first, Raised::New(_)));

        tokio::time::advance(Duration::from_secs(90)).await;
        let again = book.raise(&cpu_breach(87.0), window);
        assert!(matches!(again, Raised::Refreshed(_)));
        assert_eq!(again.alert().id, first.alert().id);
        assert_eq!(book.unresolved().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolved_alert_reopens_within_window() {
        let mut book = AlertBook::new();
        let window = Duration::from_secs(60);
        let first = book.raise(&cpu_breach(86.0), window);
        assert_eq!(book.resolve_cleared(0.8, |_| 60.0).len(), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        let reopened = book.raise(&cpu_breach(86.0), window);
        assert!(matches!(reopened, Raised::Reopened(_)));
        assert_eq!(reopened.alert().id, first.alert().id);

        book.resolve_cleared(0.8, |_| 60.0);
        tokio::time::advance(Duration::from_secs(61)).await;
        let fresh = book.raise(&cpu_breach(86.0), window);
        assert!(matches!(fresh, Raised::New(_)));
        assert_eq!(book.all().len(), 2);
    }

    #[test]
    fn test_resolution_hysteresis() {
        let mut book = AlertBook::new();
        book.raise(&cpu_breach(90.0), Duration::from_secs(60));

        // 0.8 × 85 = 68: at the boundary the alert stays open.
        assert!(book.resolve_cleared(0.8, |_| 68.0).is_empty());
        assert!(book.resolve_cleared(0.8, |_| 80.0).is_empty());
        let resolved = book.resolve_cleared(0.8, |_| 67.9);
        assert_eq!(resolved.len(), 1);
        assert!(resolved[0].resolved);
        assert!(!book.has_unresolved());
    }

    #[test]
    fn test_reading_of_missing_node_is_zero() {
        let key = AlertKey {
            alert_type: AlertType::NodeFailure,
            node_id: Some("gone".into()),
        };
        assert_eq!(reading(&key, &snapshot(), &[]), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_drops_old_resolved() {
        let mut book = AlertBook::new();
        book.raise(&cpu_breach(90.0), Duration::from_secs(60));
        book.resolve_cleared(0.8, |_| 0.0);
        let mut open = cpu_breach(90.0);
        open.node_id = Some("node-b".into());
        book.raise(&open, Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(3601)).await;
        assert_eq!(book.prune(Duration::from_secs(3600)), 1);
        assert_eq!(book.all().len(), 1);
        assert!(book.has_unresolved());
    }

    #[test]
    fn test_unresolved_orders_critical_first() {
        let mut book = AlertBook::new();
        book.raise(&cpu_breach(86.0), Duration::from_secs(60));
        book.raise(
            &Breach {
                alert_type: AlertType::NodeFailure,
                severity: Severity::Critical,
                node_id: Some("node-b".into()),
                value: 1.0,
                threshold: 1.0,
            },
            Duration::from_secs(60),
        );
        let open = book.unresolved();
        assert_eq!(open[0].alert_type, AlertType::NodeFailure);
        assert!(book.has_unresolved_critical());
    }
}
