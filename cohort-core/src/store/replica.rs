//! In-process replicated backend: a primary plus replicas, each a
//! [`StorePeer`].
//!
//! ```text
//! ┌──────────────────────┐     replicate     ┌────────────┐
//! │ ReplicaSet           │ ────────────────► │ replica b  │
//! │   primary ──► peer a │ ────────────────► │ replica c  │
//! └──────────────────────┘                   └────────────┘
//! ```
//!
//! Every call goes through the current primary. Writes are copied to every
//! healthy, reachable replica. A health check probes each peer; after
//! `failure_threshold` consecutive failed (or timed out) probes a peer is
//! marked unhealthy, and if it was the primary the healthy peer with the
//! lowest id is promoted. Callers resolve the primary per call, so they
//! re-target the new primary without further coordination.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::peer::{SortedMember, StorePeer};
use super::retry::{with_backoff, RetryPolicy};
use super::{HealthCheckReport, PeerStatus, StoreError};
use crate::config::StoreConfig;

/// Health bookkeeping for one peer.
struct PeerHealth {
    consecutive_failures: AtomicU32,
    healthy: AtomicBool,
}

impl PeerHealth {
    fn new() -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            healthy: AtomicBool::new(true),
        }
    }
}

pub struct ReplicaSet {
    /// Sorted by peer id so promotion order is deterministic
    peers: Vec<Arc<StorePeer>>,
    health: Vec<PeerHealth>,
    primary: AtomicUsize,
    retry: RetryPolicy,
    probe_timeout: Duration,
    failure_threshold: u32,
}

impl ReplicaSet {
    pub fn new(config: &StoreConfig) -> Self {
        let mut ids = config.peers.clone();
        if ids.is_empty() {
            ids.push("store-local".to_string());
        }
        ids.sort();
        ids.dedup();

        let peers: Vec<Arc<StorePeer>> = ids.into_iter().map(|id| Arc::new(StorePeer::new(id))).collect();
        let health = peers.iter().map(|_| PeerHealth::new()).collect();

        log::info!(
            "In-process coordination store with {} peers, primary {}",
            peers.len(),
            peers[0].id()
        );

        Self {
            peers,
            health,
            primary: AtomicUsize::new(0),
            retry: config.retry_policy(),
            probe_timeout: config.probe_timeout(),
            failure_threshold: config.failure_threshold.max(1),
        }
    }

    // ─── Topology ─────────────────────────────────────────────────────

    pub fn primary_id(&self) -> &str {
        self.peers[self.primary.load(Ordering::Acquire)].id()
    }

    pub fn peer(&self, peer_id: &str) -> Option<&Arc<StorePeer>> {
        self.peers.iter().find(|p| p.id() == peer_id)
    }

    pub fn peer_statuses(&self) -> Vec<PeerStatus> {
        let primary = self.primary.load(Ordering::Acquire);
        self.peers
            .iter()
            .zip(&self.health)
            .enumerate()
            .map(|(i, (peer, health))| PeerStatus {
                peer_id: peer.id().to_string(),
                healthy: health.healthy.load(Ordering::Acquire),
                primary: i == primary,
                consecutive_failures: health.consecutive_failures.load(Ordering::Acquire),
            })
            .collect()
    }

    pub fn healthy_peer_count(&self) -> usize {
        self.health
            .iter()
            .filter(|h| h.healthy.load(Ordering::Acquire))
            .count()
    }

    fn primary_peer(&self) -> Result<&Arc<StorePeer>, StoreError> {
        let index = self.primary.load(Ordering::Acquire);
        if !self.health[index].healthy.load(Ordering::Acquire) {
            return Err(StoreError::NoHealthyPeers);
        }
        let peer = &self.peers[index];
        if !peer.is_online() {
            return Err(StoreError::Unreachable(peer.id().to_string()));
        }
        Ok(peer)
    }

    /// Healthy, reachable peers other than the primary.
    fn replicas(&self) -> impl Iterator<Item = &Arc<StorePeer>> {
        let primary = self.primary.load(Ordering::Acquire);
        self.peers
            .iter()
            .zip(&self.health)
            .enumerate()
            .filter(move |(i, (peer, health))| {
                *i != primary && health.healthy.load(Ordering::Acquire) && peer.is_online()
            })
            .map(|(_, (peer, _))| peer)
    }

    /// Run a read against the primary with retries.
    async fn read<T>(&self, op: impl Fn(&StorePeer) -> T) -> Result<T, StoreError> {
        let op = &op;
        with_backoff(self.retry, move || async move {
            self.primary_peer().map(|p| op(p.as_ref()))
        })
        .await
    }

    /// Run a write against the primary, then copy it to each replica.
    async fn write<T>(&self, op: impl Fn(&StorePeer) -> T) -> Result<T, StoreError> {
        let result = self.read(&op).await?;
        for replica in self.replicas() {
            op(replica.as_ref());
        }
        Ok(result)
    }

    /// Run a conditional write on the primary; replicas apply `then` only
    /// when the primary accepted it.
    async fn write_if(
        &self,
        op: impl Fn(&StorePeer) -> bool,
        then: impl Fn(&StorePeer),
    ) -> Result<bool, StoreError> {
        let accepted = self.read(op).await?;
        if accepted {
            for replica in self.replicas() {
                then(replica.as_ref());
            }
        }
        Ok(accepted)
    }

    // ─── Key/value ────────────────────────────────────────────────────

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.read(|p| p.get(key)).await
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.write(|p| p.set(key, value.to_string(), ttl)).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.write(|p| p.delete(key)).await
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.write(|p| p.expire(key, ttl)).await
    }

    pub async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        self.write_if(
            |p| p.compare_and_swap(key, expected, value.to_string(), ttl),
            |replica| replica.set(key, value.to_string(), ttl),
        )
        .await
    }

    pub async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        self.read(|p| p.scan_prefix(prefix)).await
    }

    // ─── Ordered sets ─────────────────────────────────────────────────

    pub async fn append_ordered(&self, key: &str, score: f64, value: &str) -> Result<(), StoreError> {
        self.write(|p| p.append_ordered(key, score, value.to_string())).await
    }

    pub async fn insert_ordered_unique(&self, key: &str, score: f64, value: &str) -> Result<bool, StoreError> {
        self.write_if(
            |p| p.insert_ordered_unique(key, score, value.to_string()),
            |replica| {
                replica.insert_ordered_unique(key, score, value.to_string());
            },
        )
        .await
    }

    pub async fn last_member(&self, key: &str) -> Result<Option<SortedMember>, StoreError> {
        self.read(|p| p.last_member(key)).await
    }

    pub async fn range(&self, key: &str, from: i64, to: i64) -> Result<Vec<String>, StoreError> {
        self.read(|p| p.range(key, from, to)).await
    }

    pub async fn range_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<SortedMember>, StoreError> {
        self.read(|p| p.range_by_score(key, min, max)).await
    }

    pub async fn ordered_len(&self, key: &str) -> Result<usize, StoreError> {
        self.read(|p| p.ordered_len(key)).await
    }

    // ─── Health and failover ──────────────────────────────────────────

    /// Probe every peer once, update health and promote if needed.
    pub async fn health_check(&self) -> Result<HealthCheckReport, StoreError> {
        let mut report = HealthCheckReport::default();

        for (index, (peer, health)) in self.peers.iter().zip(&self.health).enumerate() {
            let answered = tokio::time::timeout(self.probe_timeout, peer.probe())
                .await
                .is_ok();
            let was_healthy = health.healthy.load(Ordering::Acquire);

            if answered {
                health.consecutive_failures.store(0, Ordering::Release);
                if !was_healthy {
                    // Stale after downtime; take the primary's copy first.
                    if let Ok(primary) = self.primary_peer() {
                        if primary.id() != peer.id() {
                            peer.copy_from(primary);
                        }
                    }
                    health.healthy.store(true, Ordering::Release);
                    log::info!("Store peer {} recovered", peer.id());
                    report.recovered.push(peer.id().to_string());
                }
                continue;
            }

            let failures = health.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
            log::warn!(
                "Store peer {} failed health probe ({failures}/{})",
                peer.id(),
                self.failure_threshold
            );
            if was_healthy && failures >= self.failure_threshold {
                health.healthy.store(false, Ordering::Release);
                log::error!("Store peer {} marked unhealthy", peer.id());
                report.newly_unhealthy.push(peer.id().to_string());

                if index == self.primary.load(Ordering::Acquire) {
                    report.promoted = Some(self.promote()?);
                }
            }
        }

        // A recovered cluster whose primary was lost with nobody to promote
        if !self.health[self.primary.load(Ordering::Acquire)]
            .healthy
            .load(Ordering::Acquire)
        {
            report.promoted = Some(self.promote()?);
        }

        if self.healthy_peer_count() == 0 {
            return Err(StoreError::NoHealthyPeers);
        }
        Ok(report)
    }

    /// Promote the healthy peer with the lowest id.
    fn promote(&self) -> Result<String, StoreError> {
        let (index, peer) = self
            .peers
            .iter()
            .enumerate()
            .find(|(i, _)| self.health[*i].healthy.load(Ordering::Acquire))
            .ok_or(StoreError::NoHealthyPeers)?;

        self.primary.store(index, Ordering::Release);
        log::warn!("Promoted store peer {} to primary", peer.id());
        Ok(peer.id().to_string())
    }

    /// Sweep expired keys on every reachable peer.
    pub fn purge_expired(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.is_online())
            .map(|p| p.purge_expired())
            .sum()
    }
}
