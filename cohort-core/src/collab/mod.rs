//! Collaboration engine: operation reconciliation and presence.
//!
//! ## Architecture
//!
//! ```text
//! apply_operation(key, op)
//!       │
//!       ▼
//!  store "resource:{type}:{id}:state"  (content + version)  ◄─ CAS fence
//!  store "resource:{type}:{id}:ops"    (ordered log, score = version)
//!       │
//!       ├─ transform op over the unseen log suffix
//!       ├─ claim log score v+1 (unique insert)      ◄─ commit point
//!       ├─ CAS state v → v+1
//!       └─ publish operation_broadcast on "resource:{type}:{id}"
//! ```
//!
//! The store copy is the source of truth and the log leads the state.
//! Writers race on the log score: exactly one insert at score v+1 wins and
//! the losers re-read and transform again. A state that trails its log
//! (a writer stopped between logging and swapping) is caught up by the
//! next reader or writer, which folds the logged suffix into the content.
//! A state ahead of its log has its missing entries filled with no-ops, so
//! no failure between the two writes can wedge a resource.
//!
//! Each node keeps a cache of the resources it serves, advanced by local
//! commits and by operation broadcasts from other nodes. Idle resources
//! leave the cache and, with an archive configured, are snapshotted to
//! RocksDB so a store that lost them can be refilled.

pub mod presence;
pub mod transform;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::clock::now_millis;
use crate::config::CollabConfig;
use crate::protocol::{
    ChannelMessage, CodeChange, CodeChangeRecord, Cursor, ErrorCode, Operation, Presence,
    ResourceKey, ResourceType, ServerMessage,
};
use crate::store::{decode_json, encode_json, ArchiveError, CoordinationStore, ResourceArchive, StoreError};

pub use presence::{PresenceTracker, PALETTE};

/// Collaboration errors.
#[derive(Debug, Clone, Error)]
pub enum CollabError {
    #[error("Position {position} is out of bounds (length {length})")]
    OutOfBounds { position: usize, length: usize },
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    /// Every commit attempt lost the race on the resource
    #[error("Could not commit to {0}: too much contention")]
    Contention(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

impl CollabError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CollabError::OutOfBounds { .. } => ErrorCode::OutOfBounds,
            CollabError::InvalidOperation(_) => ErrorCode::InvalidOperation,
            CollabError::Contention(_) | CollabError::Store(_) | CollabError::Archive(_) => {
                ErrorCode::Unavailable
            }
        }
    }
}

/// Persisted part of a resource (everything but the log).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceState {
    pub resource_id: String,
    pub resource_type: ResourceType,
    pub content: String,
    /// Equals the operation log length
    pub version: u64,
    pub updated_at: u64,
}

impl ResourceState {
    fn empty(key: &ResourceKey) -> Self {
        Self {
            resource_id: key.resource_id.clone(),
            resource_type: key.resource_type,
            content: String::new(),
            version: 0,
            updated_at: now_millis(),
        }
    }
}

/// A collaboratively edited entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub resource_id: String,
    pub resource_type: ResourceType,
    pub content: String,
    pub version: u64,
    pub operation_log: Vec<Operation>,
    pub participants: Vec<Presence>,
}

/// Outcome of a committed operation.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedOperation {
    pub key: ResourceKey,
    /// The operation as transformed and logged
    pub operation: Operation,
    pub version: u64,
    pub content: String,
}

/// Archive record: state plus the raw log entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArchivedResource {
    state: ResourceState,
    log: Vec<String>,
}

struct CachedResource {
    state: ResourceState,
    log: Vec<Operation>,
    last_active: Instant,
}

/// Author of the no-op entries that fill a log gap.
const GAP_AUTHOR: &str = "cohort";

/// Store key of a code project's change log.
pub fn code_changes_key(project_id: &str) -> String {
    format!("{}:changes", ResourceKey::new(ResourceType::Code, project_id).channel())
}

/// Reconciles edits and tracks presence for every resource this node serves.
pub struct CollabEngine {
    store: Arc<CoordinationStore>,
    config: CollabConfig,
    cache: DashMap<ResourceKey, CachedResource>,
    presence: PresenceTracker,
    archive: Option<Arc<ResourceArchive>>,
}

impl CollabEngine {
    pub fn new(
        store: Arc<CoordinationStore>,
        config: CollabConfig,
        archive: Option<Arc<ResourceArchive>>,
    ) -> Self {
        let presence = PresenceTracker::new(
            Duration::from_secs(config.presence_active_secs),
            Duration::from_secs(config.presence_reap_secs),
        );
        Self {
            store,
            config,
            cache: DashMap::new(),
            presence,
            archive,
        }
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn is_cached(&self, key: &ResourceKey) -> bool {
        self.cache.contains_key(key)
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    // ─── Resources ────────────────────────────────────────────────────

    /// Load a resource, creating it (or restoring it from the archive)
    /// when the store has no copy.
    pub async fn get_or_create_resource(&self, key: &ResourceKey) -> Result<Resource, CollabError> {
        let state = match self.store.get(&key.state_key()).await? {
            Some(text) => {
                let state = decode_json::<ResourceState>(&text)?;
                let logged_len = self.store.ordered_len(&key.log_key()).await? as u64;
                if logged_len > state.version {
                    self.catch_up(key, &text, state, logged_len).await?
                } else {
                    state
                }
            }
            None => self.create_resource(key).await?,
        };
        let log = self.read_log(key, 0, state.version).await?;

        let resource = Resource {
            resource_id: state.resource_id.clone(),
            resource_type: state.resource_type,
            content: state.content.clone(),
            version: state.version,
            operation_log: log.clone(),
            participants: self.presence.active(key),
        };
        self.cache.insert(
            key.clone(),
            CachedResource {
                state,
                log,
                last_active: Instant::now(),
            },
        );
        Ok(resource)
    }

    async fn create_resource(&self, key: &ResourceKey) -> Result<ResourceState, CollabError> {
        if let Some(restored) = self.restore_from_archive(key).await? {
            return Ok(restored);
        }

        let state = ResourceState::empty(key);
        if self
            .store
            .compare_and_swap(&key.state_key(), None, &encode_json(&state)?, None)
            .await?
        {
            log::info!("Created resource {key}");
            return Ok(state);
        }
        // Another node created it first.
        match self.store.get(&key.state_key()).await? {
            Some(text) => Ok(decode_json(&text)?),
            None => Err(CollabError::Contention(key.to_string())),
        }
    }

    async fn restore_from_archive(
        &self,
        key: &ResourceKey,
    ) -> Result<Option<ResourceState>, CollabError> {
        let Some(archive) = &self.archive else {
            return Ok(None);
        };
        let Some(archived) = archive.load::<ArchivedResource>(&key.to_string())? else {
            return Ok(None);
        };

        let text = encode_json(&archived.state)?;
        if !self
            .store
            .compare_and_swap(&key.state_key(), None, &text, None)
            .await?
        {
            return Ok(None);
        }
        let log_key = key.log_key();
        for (index, entry) in archived.log.iter().enumerate() {
            self.store
                .insert_ordered_unique(&log_key, (index + 1) as f64, entry)
                .await?;
        }
        log::info!(
            "Restored resource {key} from archive at version {}",
            archived.state.version
        );
        Ok(Some(archived.state))
    }

    /// Logged operations with versions in `(from, to]`.
    async fn read_log(&self, key: &ResourceKey, from: u64, to: u64) -> Result<Vec<Operation>, CollabError> {
        if to <= from {
            return Ok(Vec::new());
        }
        self.store
            .range(&key.log_key(), from as i64, to as i64 - 1)
            .await?
            .iter()
            .map(|text| decode_json(text).map_err(CollabError::from))
            .collect()
    }

    /// Operations committed after `since_version`, with their versions.
    pub async fn ops_since(
        &self,
        key: &ResourceKey,
        since_version: u64,
    ) -> Result<Vec<(u64, Operation)>, CollabError> {
        self.store
            .range_by_score(&key.log_key(), since_version as f64 + 1.0, f64::INFINITY)
            .await?
            .into_iter()
            .map(|member| Ok((member.score as u64, decode_json(&member.value)?)))
            .collect()
    }

    // ─── Operations ───────────────────────────────────────────────────

    /// Transform `op` over what its author had not seen, apply it, log it
    /// and broadcast it. `origin` is the session that sent it.
    pub async fn apply_operation(
        &self,
        key: &ResourceKey,
        op: Operation,
        origin: Option<Uuid>,
    ) -> Result<AppliedOperation, CollabError> {
        let state_key = key.state_key();
        let log_key = key.log_key();
        let attempts = self.config.commit_attempts.max(1);

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::task::yield_now().await;
            }

            let Some(state_text) = self.store.get(&state_key).await? else {
                self.get_or_create_resource(key).await?;
                continue;
            };
            let state: ResourceState = decode_json(&state_text)?;
            let logged_len = self.store.ordered_len(&log_key).await? as u64;
            if logged_len > state.version {
                self.catch_up(key, &state_text, state, logged_len).await?;
                continue;
            }
            if logged_len < state.version {
                self.fill_log_gap(key, logged_len, state.version).await?;
                continue;
            }

            let prior = match op.base_version {
                Some(base) if base > state.version => {
                    return Err(CollabError::InvalidOperation(format!(
                        "base version {base} is ahead of {key} at version {}",
                        state.version
                    )));
                }
                Some(base) => self.read_log(key, base, state.version).await?,
                None => self.read_log(key, 0, state.version).await?,
            };

            let rebased = match op.base_version {
                Some(_) => transform::transform(&op, &prior),
                None => transform::transform(
                    &op,
                    prior.iter().filter(|p| transform::is_unseen_by(p, &op)),
                ),
            };
            let content = transform::apply(&state.content, &rebased)?;

            let version = state.version + 1;
            let mut logged = rebased;
            logged.base_version = Some(state.version);

            // The log entry is the commit point; whoever holds the score
            // owns the version.
            if !self
                .store
                .insert_ordered_unique(&log_key, version as f64, &encode_json(&logged)?)
                .await?
            {
                log::debug!("Lost commit race on {key} (attempt {})", attempt + 1);
                continue;
            }

            let next = ResourceState {
                content,
                version,
                updated_at: now_millis(),
                ..state
            };
            match self
                .store
                .compare_and_swap(&state_key, Some(&state_text), &encode_json(&next)?, None)
                .await
            {
                Ok(true) => {}
                // Another caller folded the logged entry into the state first.
                Ok(false) => log::trace!("State of {key} already at or past version {version}"),
                Err(e) => log::warn!(
                    "Logged {key} version {version} but could not advance its state ({e}); the next commit folds it"
                ),
            }

            self.advance_cache(key, &logged, version);
            self.publish(
                key,
                origin,
                ServerMessage::OperationBroadcast {
                    resource_id: key.resource_id.clone(),
                    op: logged.clone(),
                    version,
                },
            );
            log::trace!("Applied {:?} to {key} at version {version}", logged.kind);

            return Ok(AppliedOperation {
                key: key.clone(),
                operation: logged,
                version,
                content: next.content,
            });
        }

        log::warn!("Giving up on {key} after {attempts} commit attempts");
        Err(CollabError::Contention(key.to_string()))
    }

    /// Fold logged operations the state does not include yet (their writer
    /// stopped between logging and swapping the state). Returns the
    /// caught-up state whether or not this call won the swap.
    async fn catch_up(
        &self,
        key: &ResourceKey,
        state_text: &str,
        state: ResourceState,
        logged_len: u64,
    ) -> Result<ResourceState, CollabError> {
        let suffix = self.read_log(key, state.version, logged_len).await?;
        let mut content = state.content.clone();
        for op in &suffix {
            content = transform::apply(&content, op)?;
        }
        let next = ResourceState {
            content,
            version: state.version + suffix.len() as u64,
            updated_at: now_millis(),
            ..state
        };
        if self
            .store
            .compare_and_swap(&key.state_key(), Some(state_text), &encode_json(&next)?, None)
            .await?
        {
            log::info!(
                "Folded {} logged operations into {key}, now at version {}",
                suffix.len(),
                next.version
            );
        }
        Ok(next)
    }

    /// The state counts versions whose log entries are missing. Their
    /// effect is already in the content, so the gap is filled with no-op
    /// entries to keep log length equal to the version.
    async fn fill_log_gap(&self, key: &ResourceKey, logged_len: u64, version: u64) -> Result<(), CollabError> {
        log::warn!("Log of {key} has {logged_len} entries for version {version}, filling the gap");
        let log_key = key.log_key();
        let filler = encode_json(&Operation::retain(0, GAP_AUTHOR, now_millis()))?;
        for missing in logged_len + 1..=version {
            self.store
                .insert_ordered_unique(&log_key, missing as f64, &filler)
                .await?;
        }
        Ok(())
    }

    /// Move the cached copy forward by one committed operation. A gap (or a
    /// mismatch) drops the cached copy so the next read reloads it.
    fn advance_cache(&self, key: &ResourceKey, op: &Operation, version: u64) {
        let Some(mut cached) = self.cache.get_mut(key) else {
            return;
        };
        cached.last_active = Instant::now();
        if version <= cached.state.version {
            return;
        }
        let advanced = (version == cached.state.version + 1)
            .then(|| transform::apply(&cached.state.content, op).ok())
            .flatten();
        match advanced {
            Some(content) => {
                cached.state.content = content;
                cached.state.version = version;
                cached.state.updated_at = now_millis();
                cached.log.push(op.clone());
            }
            None => {
                drop(cached);
                self.cache.remove(key);
            }
        }
    }

    /// Cached copy of a resource, if this node serves it.
    pub fn cached_resource(&self, key: &ResourceKey) -> Option<Resource> {
        let cached = self.cache.get(key)?;
        Some(Resource {
            resource_id: cached.state.resource_id.clone(),
            resource_type: cached.state.resource_type,
            content: cached.state.content.clone(),
            version: cached.state.version,
            operation_log: cached.log.clone(),
            participants: self.presence.active(key),
        })
    }

    /// Fold a message received on a resource channel into local state:
    /// operations advance the cache, presence events update the tracker.
    pub fn observe_remote(&self, key: &ResourceKey, message: &ServerMessage) {
        match message {
            ServerMessage::OperationBroadcast { op, version, .. } => {
                self.advance_cache(key, op, *version)
            }
            ServerMessage::PresenceBroadcast { presence, .. } => {
                self.presence.observe(key, presence.clone())
            }
            ServerMessage::PresenceLeft { user_id, .. } => {
                self.presence.remove(key, user_id);
            }
            _ => {}
        }
    }

    fn publish(&self, key: &ResourceKey, origin: Option<Uuid>, message: ServerMessage) {
        match ChannelMessage::new(origin, message).encode() {
            Ok(text) => {
                self.store.publish(&key.channel(), text);
            }
            Err(e) => log::error!("Failed to encode broadcast for {key}: {e}"),
        }
    }

    fn touch(&self, key: &ResourceKey) {
        if let Some(mut cached) = self.cache.get_mut(key) {
            cached.last_active = Instant::now();
        }
    }

    // ─── Presence ─────────────────────────────────────────────────────

    /// Upsert a user's cursor and broadcast it.
    pub async fn update_presence(
        &self,
        key: &ResourceKey,
        user_id: &str,
        cursor: Cursor,
        origin: Option<Uuid>,
    ) -> Result<Presence, CollabError> {
        if !self.is_cached(key) {
            self.get_or_create_resource(key).await?;
        }
        let presence = self.presence.update(key, user_id, cursor);
        self.touch(key);
        self.publish(
            key,
            origin,
            ServerMessage::PresenceBroadcast {
                resource_id: key.resource_id.clone(),
                presence: presence.clone(),
            },
        );
        Ok(presence)
    }

    /// Drop a user's presence and broadcast `presence_left`. No-op when the
    /// user had none.
    pub fn remove_presence(&self, key: &ResourceKey, user_id: &str, origin: Option<Uuid>) -> bool {
        if !self.presence.remove(key, user_id) {
            return false;
        }
        self.publish(
            key,
            origin,
            ServerMessage::PresenceLeft {
                resource_id: key.resource_id.clone(),
                user_id: user_id.to_string(),
            },
        );
        true
    }

    /// Presences seen within the active window.
    pub fn list_active_users(&self, key: &ResourceKey) -> Vec<Presence> {
        self.presence.active(key)
    }

    // ─── Code projects ────────────────────────────────────────────────

    /// Record a code change in the project's replay log and broadcast it.
    ///
    /// Timestamps are unique and increasing per project: a change landing
    /// in the same millisecond as the last one is stamped one later, so
    /// replay order is arrival order.
    pub async fn sync_code_change(
        &self,
        project_id: &str,
        user_id: &str,
        change: CodeChange,
        origin: Option<Uuid>,
    ) -> Result<CodeChangeRecord, CollabError> {
        let changes_key = code_changes_key(project_id);
        let attempts = self.config.commit_attempts.max(1);
        let mut recorded = None;

        for _ in 0..attempts {
            let last = self.store.last_member(&changes_key).await?;
            let timestamp = last.map_or(0, |m| m.score as u64 + 1).max(now_millis());
            let record = CodeChangeRecord {
                project_id: project_id.to_string(),
                user_id: user_id.to_string(),
                timestamp,
                change: change.clone(),
            };
            if self
                .store
                .insert_ordered_unique(&changes_key, timestamp as f64, &encode_json(&record)?)
                .await?
            {
                recorded = Some(record);
                break;
            }
        }
        let Some(record) = recorded else {
            log::warn!("Giving up on code change for {project_id} after {attempts} attempts");
            return Err(CollabError::Contention(changes_key));
        };

        let key = ResourceKey::new(ResourceType::Code, project_id);
        self.touch(&key);
        self.publish(
            &key,
            origin,
            ServerMessage::CodeChangeBroadcast {
                record: record.clone(),
            },
        );
        Ok(record)
    }

    /// Code changes in timestamp order, optionally only those after `since`.
    pub async fn get_code_changes(
        &self,
        project_id: &str,
        since: Option<u64>,
    ) -> Result<Vec<CodeChangeRecord>, CollabError> {
        let min = since.map_or(f64::NEG_INFINITY, |t| t as f64 + 1.0);
        self.store
            .range_by_score(&code_changes_key(project_id), min, f64::INFINITY)
            .await?
            .iter()
            .map(|member| decode_json(&member.value).map_err(CollabError::from))
            .collect()
    }

    // ─── Garbage collection ───────────────────────────────────────────

    /// Reap stale presence and evict resources idle for longer than the
    /// configured window. Returns the evicted keys.
    pub async fn gc_inactive(&self) -> Result<Vec<ResourceKey>, CollabError> {
        for (key, user_id) in self.presence.reap() {
            self.publish(
                &key,
                None,
                ServerMessage::PresenceLeft {
                    resource_id: key.resource_id.clone(),
                    user_id,
                },
            );
        }

        let idle_after = Duration::from_secs(self.config.resource_idle_secs);
        let idle: Vec<ResourceKey> = self
            .cache
            .iter()
            .filter(|c| c.last_active.elapsed() > idle_after && !self.presence.has_active(c.key()))
            .map(|c| c.key().clone())
            .collect();

        for key in &idle {
            if let Err(e) = self.archive_resource(key).await {
                log::warn!("Failed to archive {key}: {e}");
            }
            self.cache.remove(key);
            log::debug!("Evicted idle resource {key}");
        }
        Ok(idle)
    }

    /// Snapshot the store copy of a resource into the archive.
    async fn archive_resource(&self, key: &ResourceKey) -> Result<(), CollabError> {
        let Some(archive) = &self.archive else {
            return Ok(());
        };
        let Some(text) = self.store.get(&key.state_key()).await? else {
            return Ok(());
        };
        let state: ResourceState = decode_json(&text)?;
        let log = self.store.range(&key.log_key(), 0, -1).await?;
        let meta = archive.save(&key.to_string(), &ArchivedResource { state, log })?;
        log::info!(
            "Archived {key} ({} → {} bytes)",
            meta.raw_size,
            meta.compressed_size
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ArchiveConfig;

    fn engine(store: Arc<CoordinationStore>) -> CollabEngine {
        CollabEngine::new(store, CollabConfig::default(), None)
    }

    fn doc(id: &str) -> ResourceKey {
        ResourceKey::new(ResourceType::Document, id)
    }

    #[tokio::test]
    async fn test_get_or_create_is_lazy_and_idempotent() {
        let store = Arc::new(CoordinationStore::standalone());
        let engine = engine(store.clone());
        let key = doc("d1");

        assert!(store.get(&key.state_key()).await.unwrap().is_none());
        let created = engine.get_or_create_resource(&key).await.unwrap();
        assert_eq!(created.version, 0);
        assert_eq!(created.content, "");
        assert!(store.get(&key.state_key()).await.unwrap().is_some());

        let again = engine.get_or_create_resource(&key).await.unwrap();
        assert_eq!(again, created);
    }

    #[tokio::test]
    async fn test_version_equals_log_length() {
        let store = Arc::new(CoordinationStore::standalone());
        let engine = engine(store.clone());
        let key = doc("d1");

        for (i, ch) in ["a", "b", "c", "d"].iter().enumerate() {
            let applied = engine
                .apply_operation(&key, Operation::insert(i, *ch, "alice", i as u64 + 1), None)
                .await
                .unwrap();
            assert_eq!(applied.version, i as u64 + 1);
        }

        let resource = engine.get_or_create_resource(&key).await.unwrap();
        assert_eq!(resource.content, "abcd");
        assert_eq!(resource.version, 4);
        assert_eq!(resource.operation_log.len(), 4);
        assert_eq!(store.ordered_len(&key.log_key()).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_converge_in_either_order() {
        let mut results = Vec::new();
        for order in [[0usize, 1], [1, 0]] {
            let store = Arc::new(CoordinationStore::standalone());
            let engine = engine(store);
            let key = doc("d1");
            let ops = [
                Operation::insert(0, "X", "alice", 1),
                Operation::insert(0, "Y", "bob", 2),
            ];
            for i in order {
                engine.apply_operation(&key, ops[i].clone(), None).await.unwrap();
            }
            results.push(engine.get_or_create_resource(&key).await.unwrap().content);
        }
        assert_eq!(results[0], results[1]);
        assert!(results[0].contains('X') && results[0].contains('Y'));
    }

    #[tokio::test]
    async fn test_base_version_transform() {
        let store = Arc::new(CoordinationStore::standalone());
        let engine = engine(store);
        let key = doc("d1");
        engine
            .apply_operation(&key, Operation::insert(0, "hello", "alice", 1), None)
            .await
            .unwrap();

        // Both authors saw "hello" (version 1).
        engine
            .apply_operation(&key, Operation::insert(0, ">> ", "alice", 10).based_on(1), None)
            .await
            .unwrap();
        let applied = engine
            .apply_operation(&key, Operation::insert(5, "!", "bob", 5).based_on(1), None)
            .await
            .unwrap();
        assert_eq!(applied.operation.position, 8);
        assert_eq!(applied.content, ">> hello!");
    }

    #[tokio::test]
    async fn test_invalid_operation_does_not_touch_log() {
        let store = Arc::new(CoordinationStore::standalone());
        let engine = engine(store.clone());
        let key = doc("d1");
        engine
            .apply_operation(&key, Operation::insert(0, "abc", "alice", 1), None)
            .await
            .unwrap();

        let err = engine
            .apply_operation(&key, Operation::delete(2, 5, "alice", 2), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::OutOfBounds);

        let err = engine
            .apply_operation(&key, Operation::insert(0, "x", "alice", 3).based_on(9), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidOperation);

        assert_eq!(store.ordered_len(&key.log_key()).await.unwrap(), 1);
        assert_eq!(engine.get_or_create_resource(&key).await.unwrap().content, "abc");
    }

    #[tokio::test]
    async fn test_operation_is_broadcast_with_origin() {
        let store = Arc::new(CoordinationStore::standalone());
        let engine = engine(store.clone());
        let key = doc("d1");
        let mut sub = store.subscribe(&key.channel());
        let origin = Uuid::new_v4();

        engine
            .apply_operation(&key, Operation::insert(0, "hi", "alice", 1), Some(origin))
            .await
            .unwrap();

        let msg = ChannelMessage::decode(&sub.recv().await.unwrap()).unwrap();
        assert_eq!(msg.origin, Some(origin));
        match msg.message {
            ServerMessage::OperationBroadcast { resource_id, version, op } => {
                assert_eq!(resource_id, "d1");
                assert_eq!(version, 1);
                assert_eq!(op.payload.as_deref(), Some("hi"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_two_nodes_share_store_state() {
        let store = Arc::new(CoordinationStore::standalone());
        let a = engine(store.clone());
        let b = engine(store.clone());
        let key = doc("shared");

        a.get_or_create_resource(&key).await.unwrap();
        b.get_or_create_resource(&key).await.unwrap();
        let applied = a
            .apply_operation(&key, Operation::insert(0, "X", "alice", 1).based_on(0), None)
            .await
            .unwrap();

        // b's cache follows a's commit through the broadcast path.
        b.observe_remote(
            &key,
            &ServerMessage::OperationBroadcast {
                resource_id: "shared".into(),
                op: applied.operation,
                version: 1,
            },
        );
        assert_eq!(b.cached_resource(&key).unwrap().content, "X");

        b.apply_operation(&key, Operation::insert(0, "Y", "bob", 2).based_on(0), None)
            .await
            .unwrap();
        assert_eq!(b.cached_resource(&key).unwrap().content, "YX");

        let from_a = a.get_or_create_resource(&key).await.unwrap();
        assert_eq!(from_a.content, "YX");
        assert_eq!(from_a.version, 2);
    }

    #[tokio::test]
    async fn test_state_ahead_of_log_is_repaired() {
        let store = Arc::new(CoordinationStore::standalone());
        let engine = engine(store.clone());
        let key = doc("d1");
        let state = ResourceState {
            content: "ab".into(),
            version: 2,
            ..ResourceState::empty(&key)
        };
        store
            .set(&key.state_key(), &encode_json(&state).unwrap(), None)
            .await
            .unwrap();

        let applied = engine
            .apply_operation(&key, Operation::insert(2, "c", "alice", 1).based_on(2), None)
            .await
            .unwrap();
        assert_eq!(applied.version, 3);
        assert_eq!(applied.content, "abc");
        assert_eq!(store.ordered_len(&key.log_key()).await.unwrap(), 3);

        // Later commits proceed normally.
        let applied = engine
            .apply_operation(&key, Operation::insert(3, "d", "bob", 2), None)
            .await
            .unwrap();
        assert_eq!(applied.version, 4);
        assert_eq!(engine.get_or_create_resource(&key).await.unwrap().content, "abcd");
    }

    #[tokio::test]
    async fn test_log_ahead_of_state_is_folded() {
        let store = Arc::new(CoordinationStore::standalone());
        let engine = engine(store.clone());
        let key = doc("d1");
        engine.get_or_create_resource(&key).await.unwrap();

        // A writer that logged version 1 and stopped before swapping the state
        let orphan = Operation::insert(0, "X", "alice", 1).based_on(0);
        store
            .insert_ordered_unique(&key.log_key(), 1.0, &encode_json(&orphan).unwrap())
            .await
            .unwrap();

        let resource = engine.get_or_create_resource(&key).await.unwrap();
        assert_eq!(resource.content, "X");
        assert_eq!(resource.version, 1);

        let applied = engine
            .apply_operation(&key, Operation::insert(1, "Y", "bob", 2).based_on(1), None)
            .await
            .unwrap();
        assert_eq!(applied.version, 2);
        assert_eq!(applied.content, "XY");
        let state: ResourceState =
            decode_json(&store.get(&key.state_key()).await.unwrap().unwrap()).unwrap();
        assert_eq!(state.version, 2);
    }

    #[tokio::test]
    async fn test_ops_since() {
        let store = Arc::new(CoordinationStore::standalone());
        let engine = engine(store);
        let key = doc("d1");
        for i in 0..5u64 {
            engine
                .apply_operation(&key, Operation::insert(i as usize, "x", "alice", i + 1), None)
                .await
                .unwrap();
        }
        let since: Vec<u64> = engine
            .ops_since(&key, 3)
            .await
            .unwrap()
            .into_iter()
            .map(|(v, _)| v)
            .collect();
        assert_eq!(since, vec![4, 5]);
        assert!(engine.ops_since(&key, 5).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_lifecycle() {
        let store = Arc::new(CoordinationStore::standalone());
        let engine = engine(store.clone());
        let key = doc("d1");
        let mut sub = store.subscribe(&key.channel());

        let presence = engine
            .update_presence(&key, "alice", Cursor::at(1, 2), None)
            .await
            .unwrap();
        assert_eq!(presence.color, PALETTE[0]);
        assert!(engine.is_cached(&key));
        assert_eq!(engine.list_active_users(&key).len(), 1);

        let msg = ChannelMessage::decode(&sub.recv().await.unwrap()).unwrap();
        assert!(matches!(msg.message, ServerMessage::PresenceBroadcast { .. }));

        assert!(engine.remove_presence(&key, "alice", None));
        assert!(!engine.remove_presence(&key, "alice", None));
        let msg = ChannelMessage::decode(&sub.recv().await.unwrap()).unwrap();
        assert_eq!(
            msg.message,
            ServerMessage::PresenceLeft {
                resource_id: "d1".into(),
                user_id: "alice".into()
            }
        );
        assert!(engine.list_active_users(&key).is_empty());
    }

    #[tokio::test]
    async fn test_code_changes_replay() {
        let store = Arc::new(CoordinationStore::standalone());
        let engine = engine(store);
        let change = |content: &str| CodeChange {
            file_path: "src/main.rs".into(),
            content: content.into(),
            cursor: None,
        };

        let first = engine
            .sync_code_change("p1", "alice", change("fn main() {}"), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = engine
            .sync_code_change("p1", "bob", change("fn main() { run() }"), None)
            .await
            .unwrap();

        let all = engine.get_code_changes("p1", None).await.unwrap();
        assert_eq!(all, vec![first.clone(), second.clone()]);
        let later = engine.get_code_changes("p1", Some(first.timestamp)).await.unwrap();
        assert_eq!(later, vec![second]);
        assert!(engine.get_code_changes("other", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_same_millisecond_code_changes_keep_arrival_order() {
        let store = Arc::new(CoordinationStore::standalone());
        let engine = engine(store);
        let mut sent = Vec::new();
        for i in 0..20 {
            let change = CodeChange {
                file_path: "src/lib.rs".into(),
                content: format!("// revision {i}"),
                cursor: None,
            };
            sent.push(
                engine
                    .sync_code_change("p1", "alice", change, None)
                    .await
                    .unwrap(),
            );
        }

        assert!(sent.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        let replayed = engine.get_code_changes("p1", None).await.unwrap();
        assert_eq!(replayed, sent);
        let after = engine
            .get_code_changes("p1", Some(sent[9].timestamp))
            .await
            .unwrap();
        assert_eq!(after, sent[10..].to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_evicts_idle_and_reaps_presence() {
        let store = Arc::new(CoordinationStore::standalone());
        let engine = engine(store.clone());
        let busy = doc("busy");
        let idle = doc("idle");
        engine.get_or_create_resource(&idle).await.unwrap();
        engine
            .update_presence(&busy, "alice", Cursor::at(0, 0), None)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(301)).await;
        engine
            .update_presence(&busy, "alice", Cursor::at(0, 1), None)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(1500)).await;

        let evicted = engine.gc_inactive().await.unwrap();
        assert_eq!(evicted, vec![idle.clone()]);
        assert!(engine.is_cached(&busy));
        // Evicted from the cache, not from the store.
        assert!(store.get(&idle.state_key()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_archive_restores_lost_store_copy() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Arc::new(ResourceArchive::open(ArchiveConfig::new(dir.path().join("db"))).unwrap());
        let key = doc("kept");

        {
            let store = Arc::new(CoordinationStore::standalone());
            let config = CollabConfig {
                resource_idle_secs: 0,
                ..CollabConfig::default()
            };
            let engine = CollabEngine::new(store, config, Some(archive.clone()));
            engine
                .apply_operation(&key, Operation::insert(0, "persist me", "alice", 1), None)
                .await
                .unwrap();
            engine.get_or_create_resource(&key).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert_eq!(engine.gc_inactive().await.unwrap(), vec![key.clone()]);
        }

        // A fresh store (all peers restarted) refills from the archive.
        let store = Arc::new(CoordinationStore::standalone());
        let engine = CollabEngine::new(store, CollabConfig::default(), Some(archive));
        let restored = engine.get_or_create_resource(&key).await.unwrap();
        assert_eq!(restored.content, "persist me");
        assert_eq!(restored.version, 1);
        assert_eq!(restored.operation_log.len(), 1);

        let applied = engine
            .apply_operation(&key, Operation::insert(10, "!", "bob", 2), None)
            .await
            .unwrap();
        assert_eq!(applied.version, 2);
    }
}
