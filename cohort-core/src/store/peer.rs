//! One in-process coordination-store peer: key/value entries with TTL plus
//! score-ordered sets.
//!
//! Peers back the in-process store, which serves single-process
//! deployments and tests; a fleet of node processes shares the NATS
//! backend instead. Entries live in a `DashMap`, so unrelated keys never
//! contend on a shared lock. Expiry is lazy on read and swept by
//! [`StorePeer::purge_expired`].

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Member of an ordered set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortedMember {
    pub score: f64,
    pub value: String,
}

/// Insert after every member with a score `<=` `score`, so equal scores
/// keep insertion order.
pub(crate) fn insert_sorted(members: &mut Vec<SortedMember>, score: f64, value: String) {
    let at = members.partition_point(|m| m.score <= score);
    members.insert(at, SortedMember { score, value });
}

/// Insert unless a member already holds exactly `score`.
pub(crate) fn insert_unique(members: &mut Vec<SortedMember>, score: f64, value: String) -> bool {
    let at = members.partition_point(|m| m.score < score);
    if members.get(at).is_some_and(|m| m.score == score) {
        return false;
    }
    members.insert(at, SortedMember { score, value });
    true
}

pub(crate) fn rank_slice(members: &[SortedMember], from: i64, to: i64) -> Vec<String> {
    let len = members.len() as i64;
    let resolve = |i: i64| if i < 0 { len + i } else { i };
    let start = resolve(from).max(0);
    let end = resolve(to).min(len - 1);
    if len == 0 || start > end {
        return Vec::new();
    }
    members[start as usize..=end as usize]
        .iter()
        .map(|m| m.value.clone())
        .collect()
}

pub(crate) fn score_slice(members: &[SortedMember], min: f64, max: f64) -> Vec<SortedMember> {
    let start = members.partition_point(|m| m.score < min);
    members[start..]
        .iter()
        .take_while(|m| m.score <= max)
        .cloned()
        .collect()
}

/// A single in-memory store peer.
pub struct StorePeer {
    id: String,
    /// Cleared while the peer is crashed or partitioned away
    online: AtomicBool,
    entries: DashMap<String, Entry>,
    /// Members kept sorted by score; equal scores keep insertion order
    sorted: DashMap<String, Vec<SortedMember>>,
}

impl StorePeer {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            online: AtomicBool::new(true),
            entries: DashMap::new(),
            sorted: DashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Take the peer off the network (or bring it back).
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    /// Lightweight round-trip probe. An unreachable peer never answers;
    /// callers bound the wait with a timeout.
    pub async fn probe(&self) {
        if !self.is_online() {
            std::future::pending::<()>().await;
        }
    }

    // ─── Key/value ────────────────────────────────────────────────────

    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        {
            let entry = self.entries.get(key)?;
            if !entry.is_expired(now) {
                return Some(entry.value.clone());
            }
        }
        self.entries.remove_if(key, |_, e| e.is_expired(now));
        None
    }

    pub fn set(&self, key: &str, value: String, ttl: Option<Duration>) {
        self.entries.insert(key.to_string(), Entry::new(value, ttl));
    }

    pub fn delete(&self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        let removed_set = self.sorted.remove(key).is_some();
        removed || removed_set
    }

    /// Reset the TTL of a live key. Returns false if the key is absent.
    pub fn expire(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(now + ttl);
                true
            }
            _ => false,
        }
    }

    /// Replace the value only if it currently equals `expected`
    /// (`None` = key must be absent).
    pub fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
        ttl: Option<Duration>,
    ) -> bool {
        let now = Instant::now();
        let mut slot = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: String::new(),
            expires_at: Some(now),
        });
        let current = if slot.is_expired(now) {
            None
        } else {
            Some(slot.value.as_str())
        };
        if current != expected {
            return false;
        }
        *slot = Entry::new(value, ttl);
        true
    }

    /// All live entries whose key starts with `prefix`.
    pub fn scan_prefix(&self, prefix: &str) -> Vec<(String, String)> {
        let now = Instant::now();
        let mut found: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.value().is_expired(now))
            .map(|e| (e.key().clone(), e.value().value.clone()))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    // ─── Ordered sets ─────────────────────────────────────────────────

    pub fn append_ordered(&self, key: &str, score: f64, value: String) {
        let mut members = self.sorted.entry(key.to_string()).or_default();
        insert_sorted(&mut members, score, value);
    }

    /// Returns false (and changes nothing) when `score` is already taken.
    pub fn insert_ordered_unique(&self, key: &str, score: f64, value: String) -> bool {
        let mut members = self.sorted.entry(key.to_string()).or_default();
        insert_unique(&mut members, score, value)
    }

    /// Member with the highest score.
    pub fn last_member(&self, key: &str) -> Option<SortedMember> {
        self.sorted.get(key).and_then(|m| m.last().cloned())
    }

    /// Members by rank, both ends inclusive. Negative indices count from the
    /// end (`-1` is the last member).
    pub fn range(&self, key: &str, from: i64, to: i64) -> Vec<String> {
        self.sorted
            .get(key)
            .map_or_else(Vec::new, |members| rank_slice(&members, from, to))
    }

    /// Members with `min <= score <= max`, in score order.
    pub fn range_by_score(&self, key: &str, min: f64, max: f64) -> Vec<SortedMember> {
        self.sorted
            .get(key)
            .map_or_else(Vec::new, |members| score_slice(&members, min, max))
    }

    pub fn ordered_len(&self, key: &str) -> usize {
        self.sorted.get(key).map_or(0, |m| m.len())
    }

    // ─── Replication ──────────────────────────────────────────────────

    /// Overwrite this peer's data with `source`'s (resync after recovery).
    pub fn copy_from(&self, source: &StorePeer) {
        self.entries.clear();
        self.sorted.clear();
        for item in source.entries.iter() {
            self.entries.insert(item.key().clone(), item.value().clone());
        }
        for item in source.sorted.iter() {
            self.sorted.insert(item.key().clone(), item.value().clone());
        }
    }

    pub fn key_count(&self) -> usize {
        self.entries.len() + self.sorted.len()
    }
}
