//! Node configuration.
//!
//! Every section deserializes from JSON with per-field defaults, so a config
//! file only needs to name what it changes:
//!
//! ```json
//! {
//!   "node_id": "node-eu-1",
//!   "region": "eu-west",
//!   "healer": { "thresholds": { "cpu_high": 80.0 } }
//! }
//! ```
//!
//! `NodeConfig::from_env()` reads the file named by `COHORT_CONFIG` and then
//! applies `COHORT_NODE_ID`, `COHORT_REGION`, `COHORT_BIND_ADDR` and
//! `COHORT_NATS_URL`. Setting a NATS url moves the coordination store onto
//! NATS so every node process shares it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::store::RetryPolicy;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Top-level configuration for one node process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identifier of this node in the fleet
    pub node_id: String,
    /// Region label used for proximity and region weighting
    pub region: String,
    /// Address the session server binds to
    pub bind_addr: String,
    /// Session capacity advertised to the load balancer
    pub capacity: u32,
    pub store: StoreConfig,
    pub session: SessionConfig,
    pub balancer: BalancerConfig,
    pub collab: CollabConfig,
    pub healer: HealerConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            region: "us-east".to_string(),
            bind_addr: "127.0.0.1:9090".to_string(),
            capacity: 1000,
            store: StoreConfig::default(),
            session: SessionConfig::default(),
            balancer: BalancerConfig::default(),
            collab: CollabConfig::default(),
            healer: HealerConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from `COHORT_CONFIG` (if set) and apply environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("COHORT_CONFIG") {
            Some(path) => Self::from_file(PathBuf::from(path))?,
            None => Self::default(),
        };
        if let Ok(node_id) = std::env::var("COHORT_NODE_ID") {
            config.node_id = node_id;
        }
        if let Ok(region) = std::env::var("COHORT_REGION") {
            config.region = region;
        }
        if let Ok(addr) = std::env::var("COHORT_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(url) = std::env::var("COHORT_NATS_URL") {
            config.store.nats = Some(NatsConfig {
                url,
                ..config.store.nats.unwrap_or_default()
            });
        }
        Ok(config)
    }

    /// Short intervals and small capacities for tests.
    pub fn for_testing(node_id: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            region: region.into(),
            bind_addr: "127.0.0.1:0".to_string(),
            capacity: 100,
            store: StoreConfig::for_testing(),
            session: SessionConfig {
                max_connections: 100,
                ..SessionConfig::default()
            },
            ..Self::default()
        }
    }
}

/// Coordination store cluster settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Peer identifiers; the lowest healthy id is promoted on primary loss
    pub peers: Vec<String>,
    pub health_check_interval_secs: u64,
    /// Probe round trip budget before it counts as a failure
    pub probe_timeout_ms: u64,
    /// Consecutive failed probes before a peer is marked unhealthy
    pub failure_threshold: u32,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Buffered messages per pub/sub subscriber
    pub channel_capacity: usize,
    /// RocksDB archive for evicted resources (None = no archive)
    pub archive_path: Option<PathBuf>,
    /// Shared NATS backend; `None` keeps the store inside this process
    pub nats: Option<NatsConfig>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            peers: vec![
                "store-a".to_string(),
                "store-b".to_string(),
                "store-c".to_string(),
            ],
            health_check_interval_secs: 30,
            probe_timeout_ms: 2_000,
            failure_threshold: 3,
            retry_attempts: 3,
            retry_base_delay_ms: 50,
            retry_max_delay_ms: 1_000,
            channel_capacity: 256,
            archive_path: None,
            nats: None,
        }
    }
}

impl StoreConfig {
    pub fn for_testing() -> Self {
        Self {
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 5,
            probe_timeout_ms: 100,
            channel_capacity: 64,
            ..Self::default()
        }
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }
}

/// NATS connection for the shared coordination store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    pub url: String,
    /// JetStream key/value bucket holding keys and ordered sets
    pub bucket: String,
    /// Pub/sub channels become subjects under this prefix
    pub subject_prefix: String,
    pub connect_timeout_ms: u64,
    /// Publishes queued ahead of the connection before new ones are dropped
    pub outbound_capacity: usize,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            bucket: "cohort".to_string(),
            subject_prefix: "cohort".to_string(),
            connect_timeout_ms: 5_000,
            outbound_capacity: 4_096,
        }
    }
}

/// Connection session registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Handshakes beyond this many live sessions are refused
    pub max_connections: usize,
    /// TTL of the session mirror, refreshed on heartbeat
    pub session_ttl_secs: u64,
    /// Sessions silent for longer than this are reaped
    pub heartbeat_timeout_secs: u64,
    pub reap_interval_secs: u64,
    /// Buffered outbound messages per connection
    pub outbound_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            session_ttl_secs: 3600,
            heartbeat_timeout_secs: 300,
            reap_interval_secs: 30,
            outbound_capacity: 256,
        }
    }
}

impl SessionConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

/// Weights of the node score. They sum to 1.0 by default.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub cpu: f64,
    pub memory: f64,
    pub capacity: f64,
    pub latency: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            cpu: 0.3,
            memory: 0.2,
            capacity: 0.4,
            latency: 0.1,
        }
    }
}

/// Node registry and load balancer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub refresh_interval_secs: u64,
    pub health_check_interval_secs: u64,
    pub failure_threshold: u32,
    /// A node whose metrics are older than this fails its health probe
    pub stale_after_secs: u64,
    /// Nodes at or above this load ratio are never selected
    pub max_utilization: f64,
    pub weights: ScoreWeights,
    pub high_priority_multiplier: f64,
    pub low_priority_multiplier: f64,
    /// Bonus for a node in exactly the hinted region
    pub same_region_bonus: f64,
    /// Bonus for a node in the same region family (`us-east` ~ `us-west`)
    pub nearby_region_bonus: f64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 5,
            health_check_interval_secs: 30,
            failure_threshold: 3,
            stale_after_secs: 15,
            max_utilization: 0.9,
            weights: ScoreWeights::default(),
            high_priority_multiplier: 1.2,
            low_priority_multiplier: 0.8,
            same_region_bonus: 10.0,
            nearby_region_bonus: 5.0,
        }
    }
}

/// Collaboration engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// Presence older than this is not listed as active
    pub presence_active_secs: u64,
    /// Presence older than this is purged
    pub presence_reap_secs: u64,
    /// Resources idle this long are evicted from the node cache
    pub resource_idle_secs: u64,
    pub gc_interval_secs: u64,
    /// Attempts to commit an operation when another node wins the race
    pub commit_attempts: u32,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            presence_active_secs: 30,
            presence_reap_secs: 300,
            resource_idle_secs: 1800,
            gc_interval_secs: 60,
            commit_attempts: 8,
        }
    }
}

/// Alerting thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub cpu_high: f64,
    pub cpu_critical: f64,
    pub memory_high: f64,
    pub memory_critical: f64,
    pub latency_high_ms: f64,
    pub latency_critical_ms: f64,
    /// Connection saturation in percent of node capacity
    pub saturation_pct: f64,
    /// Error rate in percent of handled messages
    pub error_rate_high: f64,
    pub error_rate_critical: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_high: 85.0,
            cpu_critical: 95.0,
            memory_high: 85.0,
            memory_critical: 95.0,
            latency_high_ms: 200.0,
            latency_critical_ms: 500.0,
            saturation_pct: 90.0,
            error_rate_high: 5.0,
            error_rate_critical: 10.0,
        }
    }
}

/// Auto-healer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealerConfig {
    pub metrics_interval_secs: u64,
    pub evaluate_interval_secs: u64,
    pub thresholds: Thresholds,
    /// Repeated alerts for the same (type, node) inside this window merge
    pub alert_dedup_secs: u64,
    /// Repeated actions for the same (type, node) inside this window merge
    pub action_dedup_secs: u64,
    /// Alerts resolve when the metric falls below `resolve_ratio × threshold`
    pub resolve_ratio: f64,
    pub action_timeout_secs: u64,
    /// A node failure unresolved this long schedules `restart_node`
    pub restart_after_secs: u64,
    /// A node failure unresolved this long schedules `remove_node`
    pub remove_after_secs: u64,
    /// Metric snapshots kept for short-term history
    pub history_len: usize,
    /// Resolved alerts and finished actions are pruned after this
    pub history_ttl_secs: u64,
}

impl Default for HealerConfig {
    fn default() -> Self {
        Self {
            metrics_interval_secs: 10,
            evaluate_interval_secs: 5,
            thresholds: Thresholds::default(),
            alert_dedup_secs: 60,
            action_dedup_secs: 30,
            resolve_ratio: 0.8,
            action_timeout_secs: 30,
            restart_after_secs: 60,
            remove_after_secs: 300,
            history_len: 360,
            history_ttl_secs: 3600,
        }
    }
}
