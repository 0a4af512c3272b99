//! Live cursor presence per resource.
//!
//! ```text
//! update(resource, user, cursor)
//!       │
//!       ▼
//! PresenceTracker ── resource ──► { user → entry(presence, seen_at) }
//!       │
//!       ├─ active():  seen within 30s
//!       └─ reap():    drop entries older than 5 min
//! ```
//!
//! Colors come from a fixed palette, handed out in order of first
//! appearance and cached per user for the lifetime of the process, so a
//! user keeps the same color across resources and reconnects.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::clock::now_millis;
use crate::protocol::{Cursor, Presence, ResourceKey};

/// Cursor colors, in assignment order.
pub const PALETTE: &[&str] = &[
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#FFA07A", "#98D8C8", "#F7DC6F", "#BB8FCE", "#85C1E2",
    "#F8B739", "#52B788",
];

#[derive(Debug, Clone)]
struct Entry {
    presence: Presence,
    seen_at: Instant,
}

/// Presence entries keyed by resource, then user.
pub struct PresenceTracker {
    rooms: DashMap<ResourceKey, HashMap<String, Entry>>,
    colors: DashMap<String, String>,
    next_color: AtomicUsize,
    active_window: Duration,
    reap_after: Duration,
}

impl PresenceTracker {
    pub fn new(active_window: Duration, reap_after: Duration) -> Self {
        Self {
            rooms: DashMap::new(),
            colors: DashMap::new(),
            next_color: AtomicUsize::new(0),
            active_window,
            reap_after,
        }
    }

    /// Stable color for `user_id`, assigned on first appearance.
    pub fn color_for(&self, user_id: &str) -> String {
        if let Some(color) = self.colors.get(user_id) {
            return color.clone();
        }
        self.colors
            .entry(user_id.to_string())
            .or_insert_with(|| {
                let index = self.next_color.fetch_add(1, Ordering::Relaxed) % PALETTE.len();
                PALETTE[index].to_string()
            })
            .clone()
    }

    /// Upsert a local user's cursor.
    pub fn update(&self, key: &ResourceKey, user_id: &str, cursor: Cursor) -> Presence {
        let presence = Presence {
            user_id: user_id.to_string(),
            resource_id: key.resource_id.clone(),
            cursor,
            color: self.color_for(user_id),
            last_seen: now_millis(),
        };
        self.observe(key, presence.clone());
        presence
    }

    /// Record a presence seen elsewhere (another node's broadcast).
    pub fn observe(&self, key: &ResourceKey, presence: Presence) {
        self.colors
            .entry(presence.user_id.clone())
            .or_insert_with(|| presence.color.clone());
        self.rooms.entry(key.clone()).or_default().insert(
            presence.user_id.clone(),
            Entry {
                presence,
                seen_at: Instant::now(),
            },
        );
    }

    /// Remove a user's entry. Returns whether one existed.
    pub fn remove(&self, key: &ResourceKey, user_id: &str) -> bool {
        let Some(mut room) = self.rooms.get_mut(key) else {
            return false;
        };
        let removed = room.remove(user_id).is_some();
        let empty = room.is_empty();
        drop(room);
        if empty {
            self.rooms.remove_if(key, |_, room| room.is_empty());
        }
        removed
    }

    /// Presences seen within the active window, ordered by user id.
    pub fn active(&self, key: &ResourceKey) -> Vec<Presence> {
        let Some(room) = self.rooms.get(key) else {
            return Vec::new();
        };
        let mut active: Vec<Presence> = room
            .values()
            .filter(|e| e.seen_at.elapsed() <= self.active_window)
            .map(|e| e.presence.clone())
            .collect();
        active.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        active
    }

    /// Whether anyone was seen on `key` within the active window.
    pub fn has_active(&self, key: &ResourceKey) -> bool {
        self.rooms.get(key).is_some_and(|room| {
            room.values()
                .any(|e| e.seen_at.elapsed() <= self.active_window)
        })
    }

    /// Purge entries older than the reap window. Returns `(resource, user)`
    /// of every purged entry.
    pub fn reap(&self) -> Vec<(ResourceKey, String)> {
        let mut purged = Vec::new();
        for mut room in self.rooms.iter_mut() {
            let key = room.key().clone();
            room.value_mut().retain(|user_id, entry| {
                let keep = entry.seen_at.elapsed() <= self.reap_after;
                if !keep {
                    purged.push((key.clone(), user_id.clone()));
                }
                keep
            });
        }
        self.rooms.retain(|_, room| !room.is_empty());
        if !purged.is_empty() {
            log::debug!("Reaped {} stale presence entries", purged.len());
        }
        purged
    }

    pub fn len(&self, key: &ResourceKey) -> usize {
        self.rooms.get(key).map_or(0, |room| room.len())
    }
}
