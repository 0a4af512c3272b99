//! Networked coordination store on NATS.
//!
//! ```text
//!  node process A ──┐                      ┌── node process B
//!                   ▼                      ▼
//!          ┌─────────────────────────────────────┐
//!          │ NATS (JetStream)                    │
//!          │   KV bucket                         │
//!          │     v.<hex key>   value + expiry    │
//!          │     z.<hex key>   ordered set       │
//!          │   subjects <prefix>.<hex channel>   │
//!          └─────────────────────────────────────┘
//! ```
//!
//! Every node process shares the bucket and the subjects, so node records,
//! session mirrors, resource state and broadcasts are visible fleet-wide.
//! Keys and channel names are hex-encoded: NATS restricts the characters of
//! keys and subject tokens, and hex keeps prefixes, so a prefix scan is a
//! prefix match on encoded keys.
//!
//! TTLs travel inside the value as an absolute expiry, enforced on read and
//! swept by housekeeping. Conditional writes (compare-and-swap, ordered-set
//! inserts) are checked against the key's revision in the bucket.
//!
//! Publishes go through one queue per process so they leave in publish
//! order. Local subscribers are fed from the NATS subscription by one
//! forwarder per channel; this node's own publishes come back the same way.

use async_nats::connection::State;
use async_nats::jetstream::{self, kv};
use async_nats::{Client, ConnectOptions};
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::peer::{insert_sorted, insert_unique, rank_slice, score_slice, SortedMember};
use super::pubsub::ChannelBus;
use super::{encode_json, HealthCheckReport, PeerStatus, StoreError};
use crate::clock::now_millis;
use crate::config::NatsConfig;

/// Revision conflicts tolerated before a read-modify-write gives up.
const UPDATE_ATTEMPTS: u32 = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredValue {
    value: String,
    /// Unix milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<u64>,
}

impl StoredValue {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at: expiry(ttl),
        }
    }

    fn is_live(&self, now: u64) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

fn expiry(ttl: Option<Duration>) -> Option<u64> {
    ttl.map(|t| now_millis().saturating_add(t.as_millis() as u64))
}

fn value_key(key: &str) -> String {
    format!("v.{}", hex::encode(key))
}

fn set_key(key: &str) -> String {
    format!("z.{}", hex::encode(key))
}

fn decode_value_key(name: &str) -> Option<String> {
    let encoded = name.strip_prefix("v.")?;
    String::from_utf8(hex::decode(encoded).ok()?).ok()
}

fn backend_error(context: &str, error: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(format!("NATS {context}: {error}"))
}

fn payload<T: Serialize>(value: &T) -> Result<Bytes, StoreError> {
    encode_json(value).map(Bytes::from)
}

fn is_put(entry: &kv::Entry) -> bool {
    matches!(entry.operation, kv::Operation::Put)
}

/// Value of an entry that is neither deleted nor expired.
fn live_value(entry: &kv::Entry, now: u64) -> Option<StoredValue> {
    if !is_put(entry) {
        return None;
    }
    serde_json::from_slice::<StoredValue>(&entry.value)
        .ok()
        .filter(|v| v.is_live(now))
}

fn members_of(entry: &kv::Entry) -> Result<Vec<SortedMember>, StoreError> {
    if !is_put(entry) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(&entry.value).map_err(|e| StoreError::Deserialization(e.to_string()))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Outcome of a revision-checked write.
enum Written {
    Done,
    Conflict,
}

/// Task feeding one channel from NATS into the local bus.
struct Forwarder {
    task: JoinHandle<()>,
    /// Turns true once the NATS subscription is registered with the server
    ready: watch::Receiver<bool>,
}

struct ProbeState {
    consecutive_failures: AtomicU32,
    healthy: AtomicBool,
    /// Server the connection last answered from
    server: Mutex<String>,
}

pub struct NatsBackend {
    client: Client,
    kv: kv::Store,
    url: String,
    subject_prefix: String,
    outbound: mpsc::Sender<(String, Arc<str>)>,
    publisher: JoinHandle<()>,
    forwarders: DashMap<String, Forwarder>,
    probe: ProbeState,
}

impl NatsBackend {
    /// Connect and open (or create) the shared bucket.
    pub async fn connect(config: &NatsConfig, client_name: &str) -> Result<Self, StoreError> {
        log::info!("Connecting to NATS at {}", config.url);
        let client = ConnectOptions::new()
            .name(client_name)
            .connection_timeout(Duration::from_millis(config.connect_timeout_ms))
            .connect(&config.url)
            .await
            .map_err(|e| backend_error("connect", e))?;

        let jetstream = jetstream::new(client.clone());
        let kv = match jetstream.get_key_value(config.bucket.as_str()).await {
            Ok(kv) => kv,
            Err(_) => jetstream
                .create_key_value(kv::Config {
                    bucket: config.bucket.clone(),
                    history: 1,
                    ..Default::default()
                })
                .await
                .map_err(|e| backend_error("create bucket", e))?,
        };

        let (outbound, queue) = mpsc::channel(config.outbound_capacity.max(1));
        let publisher = tokio::spawn(publish_queued(client.clone(), queue));
        let server = client.server_info().server_name;
        log::info!(
            "Coordination store on NATS server {server}, bucket {}",
            config.bucket
        );

        Ok(Self {
            client,
            kv,
            url: config.url.clone(),
            subject_prefix: config.subject_prefix.clone(),
            outbound,
            publisher,
            forwarders: DashMap::new(),
            probe: ProbeState {
                consecutive_failures: AtomicU32::new(0),
                healthy: AtomicBool::new(true),
                server: Mutex::new(server),
            },
        })
    }

    pub fn server_name(&self) -> String {
        lock(&self.probe.server).clone()
    }

    pub fn peer_statuses(&self) -> Vec<PeerStatus> {
        vec![PeerStatus {
            peer_id: self.server_name(),
            healthy: self.probe.healthy.load(Ordering::Acquire),
            primary: true,
            consecutive_failures: self.probe.consecutive_failures.load(Ordering::Acquire),
        }]
    }

    pub fn healthy_peer_count(&self) -> usize {
        usize::from(self.probe.healthy.load(Ordering::Acquire))
    }

    async fn entry(&self, name: &str) -> Result<Option<kv::Entry>, StoreError> {
        self.kv
            .entry(name)
            .await
            .map_err(|e| backend_error("read", e))
    }

    /// Write `payload` only if the key is still at the revision of `seen`
    /// (or still absent when `seen` is `None`).
    async fn write_at(&self, name: &str, seen: Option<&kv::Entry>, payload: Bytes) -> Result<Written, StoreError> {
        match seen {
            Some(entry) => match self.kv.update(name, payload, entry.revision).await {
                Ok(_) => Ok(Written::Done),
                Err(e) if matches!(e.kind(), kv::UpdateErrorKind::WrongLastRevision) => Ok(Written::Conflict),
                Err(e) => Err(backend_error("update", e)),
            },
            None => match self.kv.create(name, payload).await {
                Ok(_) => Ok(Written::Done),
                Err(e) if matches!(e.kind(), kv::CreateErrorKind::AlreadyExists) => Ok(Written::Conflict),
                Err(e) => Err(backend_error("create", e)),
            },
        }
    }

    /// Bucket keys starting with `prefix` (already encoded).
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let keys = self
            .kv
            .keys()
            .await
            .map_err(|e| backend_error("list keys", e))?;
        let mut keys = std::pin::pin!(keys);
        let mut names = Vec::new();
        while let Some(name) = keys.next().await {
            let name = name.map_err(|e| backend_error("list keys", e))?;
            if name.starts_with(prefix) {
                names.push(name);
            }
        }
        Ok(names)
    }

    // ─── Key/value ────────────────────────────────────────────────────

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entry = self.entry(&value_key(key)).await?;
        Ok(entry
            .and_then(|e| live_value(&e, now_millis()))
            .map(|v| v.value))
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.kv
            .put(value_key(key), payload(&StoredValue::new(value, ttl))?)
            .await
            .map_err(|e| backend_error("put", e))?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = now_millis();
        let value = value_key(key);
        let had_value = self
            .entry(&value)
            .await?
            .is_some_and(|e| live_value(&e, now).is_some());
        if had_value {
            self.kv
                .delete(&value)
                .await
                .map_err(|e| backend_error("delete", e))?;
        }

        let set = set_key(key);
        let had_set = self.entry(&set).await?.is_some_and(|e| is_put(&e));
        if had_set {
            self.kv
                .delete(&set)
                .await
                .map_err(|e| backend_error("delete", e))?;
        }
        Ok(had_value || had_set)
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let name = value_key(key);
        for _ in 0..UPDATE_ATTEMPTS {
            let Some(entry) = self.entry(&name).await? else {
                return Ok(false);
            };
            let Some(mut stored) = live_value(&entry, now_millis()) else {
                return Ok(false);
            };
            stored.expires_at = expiry(Some(ttl));
            if let Written::Done = self.write_at(&name, Some(&entry), payload(&stored)?).await? {
                return Ok(true);
            }
        }
        Err(StoreError::Backend(format!("{key}: too many concurrent writers")))
    }

    pub async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let name = value_key(key);
        let entry = self.entry(&name).await?;
        let current = entry.as_ref().and_then(|e| live_value(e, now_millis()));
        if current.as_ref().map(|v| v.value.as_str()) != expected {
            return Ok(false);
        }
        let written = self
            .write_at(&name, entry.as_ref(), payload(&StoredValue::new(value, ttl))?)
            .await?;
        Ok(matches!(written, Written::Done))
    }

    pub async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let now = now_millis();
        let mut found = Vec::new();
        for name in self.list(&value_key(prefix)).await? {
            let Some(key) = decode_value_key(&name) else {
                continue;
            };
            if let Some(stored) = self.entry(&name).await?.and_then(|e| live_value(&e, now)) {
                found.push((key, stored.value));
            }
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }

    /// Delete values whose expiry has passed. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = now_millis();
        let mut purged = 0;
        for name in self.list("v.").await? {
            let expired = self.entry(&name).await?.is_some_and(|e| {
                is_put(&e)
                    && serde_json::from_slice::<StoredValue>(&e.value).is_ok_and(|v| !v.is_live(now))
            });
            if expired {
                self.kv
                    .delete(&name)
                    .await
                    .map_err(|e| backend_error("delete", e))?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    // ─── Ordered sets ─────────────────────────────────────────────────

    async fn members(&self, key: &str) -> Result<Vec<SortedMember>, StoreError> {
        match self.entry(&set_key(key)).await? {
            Some(entry) => members_of(&entry),
            None => Ok(Vec::new()),
        }
    }

    /// Read-modify-write of one ordered set under its revision. `change`
    /// returns false to leave the set untouched.
    async fn modify_set(
        &self,
        key: &str,
        change: impl Fn(&mut Vec<SortedMember>) -> bool,
    ) -> Result<bool, StoreError> {
        let name = set_key(key);
        for _ in 0..UPDATE_ATTEMPTS {
            let entry = self.entry(&name).await?;
            let mut members = match &entry {
                Some(entry) => members_of(entry)?,
                None => Vec::new(),
            };
            if !change(&mut members) {
                return Ok(false);
            }
            if let Written::Done = self.write_at(&name, entry.as_ref(), payload(&members)?).await? {
                return Ok(true);
            }
        }
        Err(StoreError::Backend(format!("{key}: too many concurrent writers")))
    }

    pub async fn append_ordered(&self, key: &str, score: f64, value: &str) -> Result<(), StoreError> {
        self.modify_set(key, |members| {
            insert_sorted(members, score, value.to_string());
            true
        })
        .await
        .map(|_| ())
    }

    pub async fn insert_ordered_unique(&self, key: &str, score: f64, value: &str) -> Result<bool, StoreError> {
        self.modify_set(key, |members| insert_unique(members, score, value.to_string()))
            .await
    }

    pub async fn last_member(&self, key: &str) -> Result<Option<SortedMember>, StoreError> {
        Ok(self.members(key).await?.pop())
    }

    pub async fn range(&self, key: &str, from: i64, to: i64) -> Result<Vec<String>, StoreError> {
        Ok(rank_slice(&self.members(key).await?, from, to))
    }

    pub async fn range_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<SortedMember>, StoreError> {
        Ok(score_slice(&self.members(key).await?, min, max))
    }

    pub async fn ordered_len(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self.members(key).await?.len())
    }

    // ─── Pub/sub ──────────────────────────────────────────────────────

    fn subject(&self, channel: &str) -> String {
        format!("{}.{}", self.subject_prefix, hex::encode(channel))
    }

    /// Queue a publish. Returns false when the message was dropped.
    pub fn publish(&self, channel: &str, message: Arc<str>) -> bool {
        match self.outbound.try_send((self.subject(channel), message)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("NATS publish queue full, dropping message on {channel}");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Make sure `channel` is fed from NATS into `bus`. The returned
    /// receiver turns true once the server knows the subscription.
    pub fn forward(&self, channel: &str, bus: &Arc<ChannelBus>) -> watch::Receiver<bool> {
        let spawn = || {
            log::debug!("Forwarding NATS channel {channel}");
            let (ready_tx, ready) = watch::channel(false);
            let task = tokio::spawn(forward_channel(
                self.client.clone(),
                self.subject(channel),
                channel.to_string(),
                Arc::downgrade(bus),
                ready_tx,
            ));
            Forwarder { task, ready }
        };
        let mut forwarder = self
            .forwarders
            .entry(channel.to_string())
            .or_insert_with(spawn);
        if forwarder.task.is_finished() {
            *forwarder = spawn();
        }
        forwarder.ready.clone()
    }

    /// Stop forwarders of channels nobody on this node listens to.
    pub fn prune_forwarders(&self, bus: &ChannelBus) -> usize {
        let before = self.forwarders.len();
        self.forwarders.retain(|channel, forwarder| {
            let keep = !forwarder.task.is_finished() && bus.subscriber_count(channel) > 0;
            if !keep {
                forwarder.task.abort();
            }
            keep
        });
        before - self.forwarders.len()
    }

    // ─── Health ───────────────────────────────────────────────────────

    /// Probe the connection once. The NATS cluster replicates and fails
    /// over by itself; a reconnect to another server is reported as a
    /// promotion. `failure_threshold` failed probes in a row mean no
    /// server is reachable.
    pub async fn health_check(
        &self,
        probe_timeout: Duration,
        failure_threshold: u32,
    ) -> Result<HealthCheckReport, StoreError> {
        let mut report = HealthCheckReport::default();
        let answered = matches!(self.client.connection_state(), State::Connected)
            && matches!(
                tokio::time::timeout(probe_timeout, self.client.flush()).await,
                Ok(Ok(()))
            );
        let was_healthy = self.probe.healthy.load(Ordering::Acquire);

        if answered {
            self.probe.consecutive_failures.store(0, Ordering::Release);
            if !was_healthy {
                self.probe.healthy.store(true, Ordering::Release);
                log::info!("NATS at {} reachable again", self.url);
                report.recovered.push(self.url.clone());
            }
            let server = self.client.server_info().server_name;
            let mut current = lock(&self.probe.server);
            if *current != server {
                log::warn!("NATS connection moved from {current} to {server}");
                *current = server.clone();
                report.promoted = Some(server);
            }
            return Ok(report);
        }

        let failures = self.probe.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        log::warn!(
            "NATS at {} failed health probe ({failures}/{failure_threshold})",
            self.url
        );
        if failures >= failure_threshold.max(1) {
            if was_healthy {
                self.probe.healthy.store(false, Ordering::Release);
                log::error!("NATS at {} marked unhealthy", self.url);
            }
            return Err(StoreError::NoHealthyPeers);
        }
        Ok(report)
    }
}

impl Drop for NatsBackend {
    fn drop(&mut self) {
        self.publisher.abort();
        for forwarder in self.forwarders.iter() {
            forwarder.task.abort();
        }
    }
}

async fn publish_queued(client: Client, mut queue: mpsc::Receiver<(String, Arc<str>)>) {
    while let Some((subject, message)) = queue.recv().await {
        if let Err(e) = client
            .publish(subject, Bytes::copy_from_slice(message.as_bytes()))
            .await
        {
            log::warn!("NATS publish failed: {e}");
        }
    }
}

async fn forward_channel(
    client: Client,
    subject: String,
    channel: String,
    bus: Weak<ChannelBus>,
    ready: watch::Sender<bool>,
) {
    let mut subscriber = match client.subscribe(subject).await {
        Ok(subscriber) => subscriber,
        Err(e) => {
            log::error!("Failed to subscribe to {channel} on NATS: {e}");
            return;
        }
    };
    if let Err(e) = client.flush().await {
        log::warn!("NATS flush after subscribing to {channel} failed: {e}");
    }
    ready.send_replace(true);
    while let Some(message) = subscriber.next().await {
        let Some(bus) = bus.upgrade() else {
            break;
        };
        match std::str::from_utf8(&message.payload) {
            Ok(text) => {
                bus.publish(&channel, text);
            }
            Err(_) => log::warn!("Dropping non-UTF-8 message on {channel}"),
        }
    }
}
