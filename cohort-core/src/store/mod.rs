//! Coordination store: key/value with TTLs, ordered sets and pub/sub.
//!
//! Architecture:
//! ```text
//!   writers (session registry, node registry, collab engine, healer)
//!        │
//!        ▼
//! ┌──────────────────────┐
//! │ CoordinationStore    │──► Backend::Nats       shared by every node
//! │                      │──► Backend::InProcess  one process, tests
//! └──────────┬───────────┘
//!            │ subscribe
//!            ▼
//!       ChannelBus (local fan-out)
//! ```
//!
//! With a NATS url configured the store lives in a JetStream key/value
//! bucket and channels are NATS subjects, so every node process sees the
//! same registry, sessions and resource state ([`nats`]). Without one the
//! store is a replicated set of in-process peers ([`replica`]), which
//! behaves the same for a single process and lets tests take peers down.
//!
//! Every call is a suspension point. Transient failures (primary
//! unreachable, backend timeouts) are retried with bounded backoff. With
//! no healthy peer left the store returns [`StoreError::NoHealthyPeers`],
//! which callers treat as fatal.

pub mod archive;
pub mod nats;
pub mod peer;
pub mod pubsub;
pub mod replica;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::StoreConfig;
use crate::protocol::{ClusterAnnouncement, GLOBAL_BROADCAST};

pub use archive::{ArchiveConfig, ArchiveError, ArchiveMetadata, ResourceArchive};
pub use nats::NatsBackend;
pub use peer::{SortedMember, StorePeer};
pub use pubsub::{ChannelBus, ChannelStats, Subscription};
pub use replica::ReplicaSet;
pub use retry::{with_backoff, RetryPolicy};

/// Store errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The peer did not answer; retrying may succeed
    #[error("Store peer {0} unreachable")]
    Unreachable(String),
    /// Every peer is unhealthy; nothing to retry against
    #[error("No healthy coordination store peers")]
    NoHealthyPeers,
    /// The networked backend failed a request; retrying may succeed
    #[error("Store backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unreachable(_) | StoreError::Backend(_))
    }
}

/// Status of one peer, for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub peer_id: String,
    pub healthy: bool,
    pub primary: bool,
    pub consecutive_failures: u32,
}

/// Result of one health-check round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthCheckReport {
    /// Peers that became unhealthy this round
    pub newly_unhealthy: Vec<String>,
    /// Peers that recovered (and were resynced) this round
    pub recovered: Vec<String>,
    /// New primary, if a promotion happened
    pub promoted: Option<String>,
}

enum Backend {
    InProcess(ReplicaSet),
    Nats(Box<NatsBackend>),
}

/// Run the same call on whichever backend is configured. NATS calls are
/// retried here; the replica set retries internally.
macro_rules! dispatch {
    ($store:ident . $method:ident ( $($arg:expr),* )) => {
        match &$store.backend {
            Backend::InProcess(replicas) => replicas.$method($($arg),*).await,
            Backend::Nats(nats) => with_backoff($store.retry, || nats.$method($($arg),*)).await,
        }
    };
}

/// The coordination store every component talks to.
pub struct CoordinationStore {
    backend: Backend,
    bus: Arc<ChannelBus>,
    retry: RetryPolicy,
    probe_timeout: Duration,
    failure_threshold: u32,
}

impl CoordinationStore {
    /// In-process store over `config.peers`.
    pub fn new(config: &StoreConfig) -> Self {
        Self::with_backend(config, Backend::InProcess(ReplicaSet::new(config)))
    }

    /// Single-peer store for tests and embedded use.
    pub fn standalone() -> Self {
        Self::new(&StoreConfig {
            peers: vec!["store-local".to_string()],
            ..StoreConfig::for_testing()
        })
    }

    /// Connect to NATS when `config.nats` is set, else build the
    /// in-process store.
    pub async fn connect(config: &StoreConfig, client_name: &str) -> Result<Self, StoreError> {
        match &config.nats {
            Some(nats) => {
                let backend = NatsBackend::connect(nats, client_name).await?;
                Ok(Self::with_backend(config, Backend::Nats(Box::new(backend))))
            }
            None => Ok(Self::new(config)),
        }
    }

    fn with_backend(config: &StoreConfig, backend: Backend) -> Self {
        Self {
            backend,
            bus: Arc::new(ChannelBus::new(config.channel_capacity)),
            retry: config.retry_policy(),
            probe_timeout: config.probe_timeout(),
            failure_threshold: config.failure_threshold.max(1),
        }
    }

    pub fn is_networked(&self) -> bool {
        matches!(self.backend, Backend::Nats(_))
    }

    // ─── Topology ─────────────────────────────────────────────────────

    pub fn primary_id(&self) -> String {
        match &self.backend {
            Backend::InProcess(replicas) => replicas.primary_id().to_string(),
            Backend::Nats(nats) => nats.server_name(),
        }
    }

    /// In-process peer by id. Always `None` on NATS.
    pub fn peer(&self, peer_id: &str) -> Option<&Arc<StorePeer>> {
        match &self.backend {
            Backend::InProcess(replicas) => replicas.peer(peer_id),
            Backend::Nats(_) => None,
        }
    }

    pub fn peer_statuses(&self) -> Vec<PeerStatus> {
        match &self.backend {
            Backend::InProcess(replicas) => replicas.peer_statuses(),
            Backend::Nats(nats) => nats.peer_statuses(),
        }
    }

    pub fn healthy_peer_count(&self) -> usize {
        match &self.backend {
            Backend::InProcess(replicas) => replicas.healthy_peer_count(),
            Backend::Nats(nats) => nats.healthy_peer_count(),
        }
    }

    // ─── Key/value ────────────────────────────────────────────────────

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        dispatch!(self.get(key))
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        dispatch!(self.set(key, value, ttl))
    }

    pub async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        dispatch!(self.delete(key))
    }

    /// Refresh the TTL of a live key.
    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        dispatch!(self.expire(key, ttl))
    }

    /// Atomic compare-and-swap. `expected == None` means the key must be
    /// absent.
    pub async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        dispatch!(self.compare_and_swap(key, expected, value, ttl))
    }

    pub async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        dispatch!(self.scan_prefix(prefix))
    }

    // ─── Ordered sets ─────────────────────────────────────────────────

    pub async fn append_ordered(&self, key: &str, score: f64, value: &str) -> Result<(), StoreError> {
        dispatch!(self.append_ordered(key, score, value))
    }

    /// Insert unless a member already holds `score`. Returns whether the
    /// member was inserted.
    pub async fn insert_ordered_unique(&self, key: &str, score: f64, value: &str) -> Result<bool, StoreError> {
        dispatch!(self.insert_ordered_unique(key, score, value))
    }

    /// Highest-scored member.
    pub async fn last_member(&self, key: &str) -> Result<Option<SortedMember>, StoreError> {
        dispatch!(self.last_member(key))
    }

    /// Members by rank, both ends inclusive; negative indices count from
    /// the end.
    pub async fn range(&self, key: &str, from: i64, to: i64) -> Result<Vec<String>, StoreError> {
        dispatch!(self.range(key, from, to))
    }

    pub async fn range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<SortedMember>, StoreError> {
        dispatch!(self.range_by_score(key, min, max))
    }

    pub async fn ordered_len(&self, key: &str) -> Result<usize, StoreError> {
        dispatch!(self.ordered_len(key))
    }

    // ─── Pub/sub ──────────────────────────────────────────────────────

    /// Fire-and-forget publish. Returns how many subscribers on this node
    /// it reached (on NATS: how many are listening here).
    pub fn publish(&self, channel: &str, message: impl Into<Arc<str>>) -> usize {
        match &self.backend {
            Backend::InProcess(_) => self.bus.publish(channel, message),
            Backend::Nats(nats) => {
                nats.publish(channel, message.into());
                self.bus.subscriber_count(channel)
            }
        }
    }

    pub fn subscribe(&self, channel: &str) -> Subscription {
        let subscription = self.bus.subscribe(channel);
        if let Backend::Nats(nats) = &self.backend {
            nats.forward(channel, &self.bus);
        }
        subscription
    }

    /// Subscribe and wait until messages published from now on are
    /// guaranteed to arrive.
    pub async fn subscribe_ready(&self, channel: &str) -> Subscription {
        let subscription = self.bus.subscribe(channel);
        if let Backend::Nats(nats) = &self.backend {
            let mut ready = nats.forward(channel, &self.bus);
            if ready.wait_for(|ready| *ready).await.is_err() {
                log::warn!("NATS subscription to {channel} never became ready");
            }
        }
        subscription
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.bus.subscriber_count(channel)
    }

    pub fn channel_stats(&self, channel: &str) -> ChannelStats {
        self.bus.stats(channel)
    }

    /// Publish a cluster announcement on `global:broadcast`.
    pub fn announce(&self, announcement: &ClusterAnnouncement) {
        match announcement.encode() {
            Ok(text) => {
                self.publish(GLOBAL_BROADCAST, text);
            }
            Err(e) => log::error!("Failed to encode announcement: {e}"),
        }
    }

    // ─── Health and failover ──────────────────────────────────────────

    /// Probe the backend once and announce a primary change.
    pub async fn health_check(&self) -> Result<HealthCheckReport, StoreError> {
        let report = match &self.backend {
            Backend::InProcess(replicas) => replicas.health_check().await?,
            Backend::Nats(nats) => {
                nats.health_check(self.probe_timeout, self.failure_threshold)
                    .await?
            }
        };
        if let Some(primary) = &report.promoted {
            self.announce(&ClusterAnnouncement::StorePrimaryChanged {
                primary: primary.clone(),
            });
        }
        Ok(report)
    }

    /// Sweep expired keys and idle channels. Returns how many keys were
    /// purged.
    pub async fn housekeeping(&self) -> Result<usize, StoreError> {
        let purged = match &self.backend {
            Backend::InProcess(replicas) => replicas.purge_expired(),
            Backend::Nats(nats) => {
                nats.prune_forwarders(&self.bus);
                nats.purge_expired().await?
            }
        };
        self.bus.prune_idle();
        Ok(purged)
    }
}

/// Serialize a value to a store string.
pub fn encode_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Deserialize a store string.
pub fn decode_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, StoreError> {
    serde_json::from_str(text).map_err(|e| StoreError::Deserialization(e.to_string()))
}
