//! Connection session registry.
//!
//! ```text
//! transport ──► handshake ──► authenticate ──► join_resource ──► …
//!                  │               │                │
//!                  │               │                └─ channel forwarder
//!                  │               │                   "resource:{type}:{id}"
//!                  │               ├─ mirror "session:{id}" (TTL 1h)
//!                  │               └─ channel forwarder "user:{userId}"
//!                  └─ connection_established{sessionId, nodeId}
//! ```
//!
//! Sessions live in a `DashMap` owned by the hosting node; the store holds a
//! read-only mirror for other nodes. Each session gets outbound messages
//! through a bounded mpsc sender. Dropping the session drops the sender,
//! which closes the connection on the transport side.
//!
//! One forwarder task per subscribed channel per node receives store
//! messages and hands them to every local member session except the one
//! that caused them. The last member leaving stops the forwarder.
//!
//! Joining subscribes before reading the resource, so a commit can land
//! both in the snapshot and on the channel. While a join is in flight the
//! session's resource broadcasts are held; once the snapshot version is
//! known, held and later operation broadcasts at or below it are dropped.
//!
//! All cleanup paths are idempotent: heartbeats and disconnects for an
//! unknown session are no-ops.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::clock::now_millis;
use crate::cluster::NodeRegistry;
use crate::collab::{CollabEngine, CollabError, Resource};
use crate::config::SessionConfig;
use crate::protocol::{
    user_channel, ChannelMessage, ClientMessage, ClusterAnnouncement, CodeChange, Cursor,
    ErrorCode, Operation, ResourceKey, ResourceType, ServerMessage, GLOBAL_BROADCAST,
};
use crate::store::{encode_json, CoordinationStore, StoreError};

/// Store key prefix of session mirrors.
pub const SESSION_KEY_PREFIX: &str = "session:";

pub fn session_key(session_id: &Uuid) -> String {
    format!("{SESSION_KEY_PREFIX}{session_id}")
}

/// Session errors. Every variant maps to a client-visible [`ErrorCode`].
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Node is at its connection capacity")]
    CapacityExceeded,
    #[error("Session {0} not found")]
    NotFound(Uuid),
    #[error("Authenticate first")]
    Unauthenticated,
    #[error("Authentication failed: {0}")]
    AuthFailed(String),
    #[error("Not joined to resource {0}")]
    NotJoined(String),
    #[error(transparent)]
    Collab(#[from] CollabError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::CapacityExceeded => ErrorCode::CapacityExceeded,
            SessionError::NotFound(_) | SessionError::Store(_) => ErrorCode::Unavailable,
            SessionError::Unauthenticated => ErrorCode::Unauthenticated,
            SessionError::AuthFailed(_) => ErrorCode::AuthFailed,
            SessionError::NotJoined(_) => ErrorCode::NotJoined,
            SessionError::Collab(e) => e.code(),
        }
    }

    fn to_message(&self) -> ServerMessage {
        ServerMessage::error(self.code(), self.to_string())
    }
}

// ───────────────────────────────────────────────────────────────────
// Identity
// ───────────────────────────────────────────────────────────────────

/// External identity check for the session handoff.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, user_id: &str, token: Option<&str>) -> Result<(), String>;
}

/// Trusts the asserted identity (the web backend already authenticated
/// the user). Rejects only empty user ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustedIdentity;

impl IdentityVerifier for TrustedIdentity {
    fn verify(&self, user_id: &str, _token: Option<&str>) -> Result<(), String> {
        if user_id.trim().is_empty() {
            Err("empty user id".to_string())
        } else {
            Ok(())
        }
    }
}

/// Fixed user → token table.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, String>,
}

impl StaticTokens {
    pub fn new(tokens: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }
}

impl IdentityVerifier for StaticTokens {
    fn verify(&self, user_id: &str, token: Option<&str>) -> Result<(), String> {
        match (self.tokens.get(user_id), token) {
            (Some(expected), Some(given)) if expected == given => Ok(()),
            (Some(_), _) => Err("invalid token".to_string()),
            (None, _) => Err(format!("unknown user {user_id}")),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Sessions
// ───────────────────────────────────────────────────────────────────

/// One live client connection. The mirrored form is this struct as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: Uuid,
    pub user_id: Option<String>,
    pub node_id: String,
    pub resource: Option<ResourceKey>,
    pub connected_at: u64,
    pub last_heartbeat_at: u64,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

/// Broadcast fence of a session joining a resource channel.
enum JoinFence {
    /// Snapshot not read yet; broadcasts wait here
    Pending { channel: String, held: Vec<ServerMessage> },
    /// Operations up to `version` are in the snapshot the session received
    Joined { channel: String, version: u64 },
}

struct LocalSession {
    session: Session,
    outbound: mpsc::Sender<ServerMessage>,
    last_heartbeat: Instant,
    fence: Option<JoinFence>,
}

impl LocalSession {
    /// Hand a message from `channel` to the session, through its fence.
    fn forward(&mut self, channel: &str, message: ServerMessage) {
        match &mut self.fence {
            Some(JoinFence::Pending { channel: fenced, held }) if fenced.as_str() == channel => {
                held.push(message);
                return;
            }
            Some(JoinFence::Joined { channel: fenced, version }) if fenced.as_str() == channel => {
                if let ServerMessage::OperationBroadcast { version: v, .. } = &message {
                    if *v <= *version {
                        log::trace!(
                            "Session {} already has version {v} of {channel}",
                            self.session.session_id
                        );
                        return;
                    }
                }
            }
            _ => {}
        }
        deliver(&self.session.session_id, &self.outbound, message);
    }
}

type Members = DashMap<String, HashSet<Uuid>>;

/// Per-node session bookkeeping.
pub struct SessionRegistry {
    node_id: String,
    config: SessionConfig,
    store: Arc<CoordinationStore>,
    engine: Arc<CollabEngine>,
    nodes: Arc<NodeRegistry>,
    verifier: Arc<dyn IdentityVerifier>,
    sessions: Arc<DashMap<Uuid, LocalSession>>,
    /// Admitted connections, reserved before the session is inserted
    slots: AtomicUsize,
    /// channel → local member sessions
    members: Arc<Members>,
    /// channel → forwarder task
    forwarders: DashMap<String, JoinHandle<()>>,
    messages_handled: AtomicU64,
    errors: AtomicU64,
}

impl SessionRegistry {
    pub fn new(
        config: SessionConfig,
        store: Arc<CoordinationStore>,
        engine: Arc<CollabEngine>,
        nodes: Arc<NodeRegistry>,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Self {
        Self {
            node_id: nodes.local_node_id().to_string(),
            config,
            store,
            engine,
            nodes,
            verifier,
            sessions: Arc::new(DashMap::new()),
            slots: AtomicUsize::new(0),
            members: Arc::new(DashMap::new()),
            forwarders: DashMap::new(),
            messages_handled: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session(&self, session_id: &Uuid) -> Option<Session> {
        self.sessions.get(session_id).map(|s| s.session.clone())
    }

    pub fn session_ids(&self) -> Vec<Uuid> {
        self.sessions.iter().map(|s| *s.key()).collect()
    }

    /// Whether this node forwards `channel` to local sessions.
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.forwarders.contains_key(channel)
    }

    /// Messages handled and errors reported since the last call.
    pub fn take_activity(&self) -> (u64, u64) {
        (
            self.messages_handled.swap(0, Ordering::Relaxed),
            self.errors.swap(0, Ordering::Relaxed),
        )
    }

    fn send(&self, session_id: &Uuid, message: ServerMessage) {
        if let Some(local) = self.sessions.get(session_id) {
            deliver(session_id, &local.outbound, message);
        }
    }

    async fn mirror(&self, session: &Session) -> Result<(), StoreError> {
        if session.user_id.is_none() {
            return Ok(());
        }
        self.store
            .set(
                &session_key(&session.session_id),
                &encode_json(session)?,
                Some(self.config.session_ttl()),
            )
            .await
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Accept a connection: issue a session id and acknowledge it with
    /// `connection_established`.
    pub fn handshake(&self, outbound: mpsc::Sender<ServerMessage>) -> Result<Uuid, SessionError> {
        let max = self.config.max_connections;
        if let Err(admitted) = self
            .slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
        {
            log::warn!("Rejecting connection: {admitted} sessions at capacity");
            return Err(SessionError::CapacityExceeded);
        }

        let session_id = Uuid::new_v4();
        let now = now_millis();
        let session = Session {
            session_id,
            user_id: None,
            node_id: self.node_id.clone(),
            resource: None,
            connected_at: now,
            last_heartbeat_at: now,
            attributes: HashMap::new(),
        };
        deliver(
            &session_id,
            &outbound,
            ServerMessage::ConnectionEstablished {
                session_id,
                node_id: self.node_id.clone(),
            },
        );
        self.sessions.insert(
            session_id,
            LocalSession {
                session,
                outbound,
                last_heartbeat: Instant::now(),
                fence: None,
            },
        );
        self.nodes.update_node_load(&self.node_id, 1);
        log::debug!("Session {session_id} connected");
        Ok(session_id)
    }

    /// Bind the session to a verified identity and mirror it.
    pub async fn authenticate(
        &self,
        session_id: &Uuid,
        user_id: &str,
        token: Option<&str>,
    ) -> Result<(), SessionError> {
        if !self.sessions.contains_key(session_id) {
            return Err(SessionError::NotFound(*session_id));
        }
        if let Err(reason) = self.verifier.verify(user_id, token) {
            log::warn!("Authentication failed for session {session_id}: {reason}");
            return Err(SessionError::AuthFailed(reason));
        }

        let (session, previous_user) = {
            let mut local = self
                .sessions
                .get_mut(session_id)
                .ok_or(SessionError::NotFound(*session_id))?;
            let previous = local.session.user_id.replace(user_id.to_string());
            (local.session.clone(), previous)
        };
        if let Some(previous) = previous_user.filter(|p| p != user_id) {
            self.unsubscribe(&user_channel(&previous), session_id);
        }
        self.subscribe(user_channel(user_id), None, *session_id).await;
        self.mirror(&session).await?;
        log::info!("Session {session_id} authenticated as {user_id}");
        Ok(())
    }

    fn authenticated_user(&self, session_id: &Uuid) -> Result<String, SessionError> {
        let local = self
            .sessions
            .get(session_id)
            .ok_or(SessionError::NotFound(*session_id))?;
        local
            .session
            .user_id
            .clone()
            .ok_or(SessionError::Unauthenticated)
    }

    /// Attach the session to a resource (leaving any previous one) and
    /// make sure this node forwards the resource channel.
    pub async fn join_resource(
        &self,
        session_id: &Uuid,
        key: ResourceKey,
    ) -> Result<Resource, SessionError> {
        self.authenticated_user(session_id)?;
        if let Some(previous) = self.session(session_id).and_then(|s| s.resource) {
            if previous != key {
                self.leave(session_id, &previous);
            }
        }

        // Subscribe before reading so no commit falls in between; the
        // fence drops what the snapshot already covers.
        let channel = key.channel();
        self.hold_broadcasts(session_id, &channel);
        self.subscribe(channel.clone(), Some(key.clone()), *session_id)
            .await;
        let resource = match self.engine.get_or_create_resource(&key).await {
            Ok(resource) => resource,
            Err(e) => {
                self.clear_fence(session_id, &channel);
                self.unsubscribe(&channel, session_id);
                return Err(e.into());
            }
        };
        self.release_broadcasts(session_id, &channel, resource.version);

        let session = {
            let mut local = self
                .sessions
                .get_mut(session_id)
                .ok_or(SessionError::NotFound(*session_id))?;
            local.session.resource = Some(key.clone());
            local.session.clone()
        };
        self.mirror(&session).await?;
        log::info!("Session {session_id} joined {key}");
        Ok(resource)
    }

    /// Detach the session from `resource_id`. No-op if it is not joined.
    pub fn leave_resource(&self, session_id: &Uuid, resource_id: &str) -> bool {
        match self.session(session_id).and_then(|s| s.resource) {
            Some(key) if key.resource_id == resource_id => {
                self.leave(session_id, &key);
                true
            }
            _ => false,
        }
    }

    fn leave(&self, session_id: &Uuid, key: &ResourceKey) {
        self.clear_fence(session_id, &key.channel());
        let user_id = self.sessions.get_mut(session_id).and_then(|mut local| {
            if local.session.resource.as_ref() == Some(key) {
                local.session.resource = None;
            }
            local.session.user_id.clone()
        });
        if let Some(user_id) = user_id {
            let still_present = self.sessions.iter().any(|s| {
                s.key() != session_id
                    && s.session.user_id.as_deref() == Some(user_id.as_str())
                    && s.session.resource.as_ref() == Some(key)
            });
            if !still_present {
                self.engine.remove_presence(key, &user_id, Some(*session_id));
            }
        }
        self.unsubscribe(&key.channel(), session_id);
    }

    /// Refresh liveness and the mirror TTL. Returns whether the session
    /// exists.
    pub async fn heartbeat(&self, session_id: &Uuid) -> Result<bool, SessionError> {
        let session = match self.sessions.get_mut(session_id) {
            Some(mut local) => {
                local.last_heartbeat = Instant::now();
                local.session.last_heartbeat_at = now_millis();
                local.session.clone()
            }
            None => return Ok(false),
        };
        if session.user_id.is_some()
            && !self
                .store
                .expire(&session_key(session_id), self.config.session_ttl())
                .await?
        {
            self.mirror(&session).await?;
        }
        Ok(true)
    }

    /// Remove local and mirrored state. Returns whether there was any.
    pub async fn disconnect(&self, session_id: &Uuid) -> Result<bool, SessionError> {
        let Some(session) = self.detach(session_id) else {
            return Ok(false);
        };
        if session.user_id.is_some() {
            self.store.delete(&session_key(session_id)).await?;
        }
        log::info!("Session {session_id} disconnected");
        Ok(true)
    }

    /// Drop local state without touching the mirror (the session now
    /// belongs elsewhere, or the mirror is already gone).
    fn detach(&self, session_id: &Uuid) -> Option<Session> {
        let session = self.session(session_id)?;
        if let Some(key) = &session.resource {
            self.leave(session_id, key);
        }
        if let Some(user_id) = &session.user_id {
            self.unsubscribe(&user_channel(user_id), session_id);
        }
        self.sessions.remove(session_id)?;
        self.slots.fetch_sub(1, Ordering::AcqRel);
        self.nodes.update_node_load(&self.node_id, -1);
        Some(session)
    }

    /// Disconnect every session silent for longer than the heartbeat
    /// timeout. Returns the reaped ids.
    pub async fn reap_stale(&self) -> Vec<Uuid> {
        let timeout = self.config.heartbeat_timeout();
        let stale: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|s| s.last_heartbeat.elapsed() > timeout)
            .map(|s| *s.key())
            .collect();

        for session_id in &stale {
            log::info!("Reaping session {session_id}: no heartbeat for {timeout:?}");
            if let Err(e) = self.disconnect(session_id).await {
                log::warn!("Failed to clean up mirror of {session_id}: {e}");
            }
        }
        stale
    }

    // ─── Channel forwarding ───────────────────────────────────────────

    /// Hold the session's broadcasts on `channel` until
    /// [`release_broadcasts`](Self::release_broadcasts).
    fn hold_broadcasts(&self, session_id: &Uuid, channel: &str) {
        if let Some(mut local) = self.sessions.get_mut(session_id) {
            local.fence = Some(JoinFence::Pending {
                channel: channel.to_string(),
                held: Vec::new(),
            });
        }
    }

    /// The session received a snapshot at `version`: deliver what was held
    /// beyond it and drop older operation broadcasts from now on.
    fn release_broadcasts(&self, session_id: &Uuid, channel: &str, version: u64) {
        let Some(mut local) = self.sessions.get_mut(session_id) else {
            return;
        };
        let held = match local.fence.take() {
            Some(JoinFence::Pending { channel: fenced, held }) if fenced == channel => held,
            other => {
                local.fence = other;
                return;
            }
        };
        local.fence = Some(JoinFence::Joined {
            channel: channel.to_string(),
            version,
        });
        for message in held {
            local.forward(channel, message);
        }
    }

    fn clear_fence(&self, session_id: &Uuid, channel: &str) {
        if let Some(mut local) = self.sessions.get_mut(session_id) {
            let fenced = match &local.fence {
                Some(JoinFence::Pending { channel: fenced, .. })
                | Some(JoinFence::Joined { channel: fenced, .. }) => fenced == channel,
                None => false,
            };
            if fenced {
                local.fence = None;
            }
        }
    }

    async fn subscribe(&self, channel: String, resource: Option<ResourceKey>, session_id: Uuid) {
        self.members
            .entry(channel.clone())
            .or_default()
            .insert(session_id);
        if self.forwarders.contains_key(&channel) {
            return;
        }

        let subscription = self.store.subscribe_ready(&channel).await;
        let dashmap::mapref::entry::Entry::Vacant(slot) = self.forwarders.entry(channel.clone()) else {
            // Another join started the forwarder while this one waited.
            return;
        };
        log::debug!("Node {} subscribing to {channel}", self.node_id);
        let sessions = self.sessions.clone();
        let members = self.members.clone();
        let engine = self.engine.clone();
        slot.insert(tokio::spawn(async move {
            let mut subscription = subscription;
            while let Some(text) = subscription.recv().await {
                let message = match ChannelMessage::decode(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        log::warn!("Dropping malformed message on {channel}: {e}");
                        continue;
                    }
                };
                if let Some(key) = &resource {
                    engine.observe_remote(key, &message.message);
                }
                let targets: Vec<Uuid> = members
                    .get(&channel)
                    .map(|m| m.iter().copied().collect())
                    .unwrap_or_default();
                for target in targets {
                    if Some(target) == message.origin {
                        continue;
                    }
                    if let Some(mut local) = sessions.get_mut(&target) {
                        local.forward(&channel, message.message.clone());
                    }
                }
            }
        }));
    }

    fn unsubscribe(&self, channel: &str, session_id: &Uuid) {
        let Some(mut members) = self.members.get_mut(channel) else {
            return;
        };
        members.remove(session_id);
        if members.is_empty() {
            if let Some((_, task)) = self.forwarders.remove(channel) {
                task.abort();
                log::debug!("Node {} unsubscribed from {channel}", self.node_id);
            }
            drop(members);
            self.members.remove_if(channel, |_, m| m.is_empty());
        }
    }

    // ─── Cluster announcements ────────────────────────────────────────

    /// Follow `global:broadcast` for migrations and evictions of local
    /// sessions. The task ends when the registry is dropped.
    pub fn spawn_announcement_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        let mut subscription = self.store.subscribe(GLOBAL_BROADCAST);
        tokio::spawn(async move {
            while let Some(text) = subscription.recv().await {
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                match ClusterAnnouncement::decode(&text) {
                    Ok(announcement) => registry.on_announcement(announcement),
                    Err(e) => log::warn!("Malformed cluster announcement: {e}"),
                }
            }
        })
    }

    fn on_announcement(&self, announcement: ClusterAnnouncement) {
        match announcement {
            ClusterAnnouncement::SessionMigrated { session_id, to, .. } => {
                if to == self.node_id || !self.sessions.contains_key(&session_id) {
                    return;
                }
                log::info!("Session {session_id} migrated to {to}, rehoming");
                self.send(&session_id, ServerMessage::Rehome { node_id: to });
                self.detach(&session_id);
            }
            ClusterAnnouncement::SessionEvicted { session_id, .. } => {
                if !self.sessions.contains_key(&session_id) {
                    return;
                }
                log::warn!("Session {session_id} evicted: no node has capacity");
                self.send(
                    &session_id,
                    ServerMessage::error(ErrorCode::CapacityExceeded, "no node has capacity"),
                );
                self.detach(&session_id);
            }
            other => log::trace!("Ignoring announcement {other:?}"),
        }
    }

    // ─── Message dispatch ─────────────────────────────────────────────

    /// Handle one decoded client message. Returns the direct replies for
    /// this session; broadcasts travel through the forwarders.
    pub async fn handle_message(&self, session_id: &Uuid, message: ClientMessage) -> Vec<ServerMessage> {
        self.messages_handled.fetch_add(1, Ordering::Relaxed);
        log::trace!("Session {session_id} → {}", message.kind());

        let result = match message {
            ClientMessage::Authenticate { user_id, token } => self
                .authenticate(session_id, &user_id, token.as_deref())
                .await
                .map(|_| vec![ServerMessage::Authenticated { user_id }]),
            ClientMessage::JoinResource {
                resource_id,
                resource_type,
            } => self
                .join_resource(session_id, ResourceKey::new(resource_type, resource_id))
                .await
                .map(|resource| {
                    vec![ServerMessage::Joined {
                        resource_id: resource.resource_id,
                        resource_type: resource.resource_type,
                        version: resource.version,
                        content: resource.content,
                        participants: resource.participants,
                    }]
                }),
            ClientMessage::LeaveResource { resource_id } => {
                self.leave_resource(session_id, &resource_id);
                Ok(Vec::new())
            }
            ClientMessage::Operation { resource_id, op } => self
                .handle_operation(session_id, &resource_id, op)
                .await
                .map(|version| vec![ServerMessage::OperationAck { resource_id, version }]),
            ClientMessage::Presence {
                resource_id,
                cursor,
            } => self
                .handle_presence(session_id, &resource_id, cursor)
                .await
                .map(|_| Vec::new()),
            ClientMessage::Heartbeat {} => self
                .heartbeat(session_id)
                .await
                .map(|_| vec![ServerMessage::HeartbeatAck {}]),
            ClientMessage::Sync {
                resource_id,
                since_version,
            } => self.handle_sync(session_id, &resource_id, since_version).await,
            ClientMessage::CodeChange { project_id, change } => self
                .handle_code_change(session_id, &project_id, change)
                .await
                .map(|_| Vec::new()),
            ClientMessage::Unknown { kind } => {
                log::warn!("Session {session_id} sent unknown message type {kind:?}");
                self.errors.fetch_add(1, Ordering::Relaxed);
                return vec![ServerMessage::error(
                    ErrorCode::UnknownType,
                    format!("unknown message type {kind}"),
                )];
            }
        };

        result.unwrap_or_else(|e| {
            self.errors.fetch_add(1, Ordering::Relaxed);
            log::debug!("Session {session_id}: {e}");
            vec![e.to_message()]
        })
    }

    /// Resource the session is joined to, if its id matches.
    fn joined(&self, session_id: &Uuid, resource_id: &str) -> Result<(String, ResourceKey), SessionError> {
        let local = self
            .sessions
            .get(session_id)
            .ok_or(SessionError::NotFound(*session_id))?;
        let user_id = local
            .session
            .user_id
            .clone()
            .ok_or(SessionError::Unauthenticated)?;
        match &local.session.resource {
            Some(key) if key.resource_id == resource_id => Ok((user_id, key.clone())),
            _ => Err(SessionError::NotJoined(resource_id.to_string())),
        }
    }

    async fn handle_operation(
        &self,
        session_id: &Uuid,
        resource_id: &str,
        mut op: Operation,
    ) -> Result<u64, SessionError> {
        let (user_id, key) = self.joined(session_id, resource_id)?;
        op.author_id = user_id;
        let applied = self
            .engine
            .apply_operation(&key, op, Some(*session_id))
            .await?;
        Ok(applied.version)
    }

    async fn handle_presence(
        &self,
        session_id: &Uuid,
        resource_id: &str,
        cursor: Cursor,
    ) -> Result<(), SessionError> {
        let (user_id, key) = self.joined(session_id, resource_id)?;
        self.engine
            .update_presence(&key, &user_id, cursor, Some(*session_id))
            .await?;
        Ok(())
    }

    async fn handle_sync(
        &self,
        session_id: &Uuid,
        resource_id: &str,
        since_version: u64,
    ) -> Result<Vec<ServerMessage>, SessionError> {
        let (_, key) = self.joined(session_id, resource_id)?;
        let ops = self.engine.ops_since(&key, since_version).await?;
        let version = ops.last().map_or(since_version, |(v, _)| *v);

        let mut replies: Vec<ServerMessage> = ops
            .into_iter()
            .map(|(version, op)| ServerMessage::OperationBroadcast {
                resource_id: resource_id.to_string(),
                op,
                version,
            })
            .collect();
        replies.push(ServerMessage::SyncComplete {
            resource_id: resource_id.to_string(),
            version,
        });
        Ok(replies)
    }

    async fn handle_code_change(
        &self,
        session_id: &Uuid,
        project_id: &str,
        change: CodeChange,
    ) -> Result<(), SessionError> {
        let user_id = self.authenticated_user(session_id)?;
        let key = ResourceKey::new(ResourceType::Code, project_id);
        match self.session(session_id).and_then(|s| s.resource) {
            Some(joined) if joined == key => {}
            _ => return Err(SessionError::NotJoined(project_id.to_string())),
        }
        self.engine
            .sync_code_change(project_id, &user_id, change, Some(*session_id))
            .await?;
        Ok(())
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        for task in self.forwarders.iter() {
            task.abort();
        }
    }
}

/// Best-effort delivery to one session's outbound queue.
fn deliver(session_id: &Uuid, outbound: &mpsc::Sender<ServerMessage>, message: ServerMessage) {
    match outbound.try_send(message) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            log::warn!("Outbound queue of session {session_id} is full, dropping message");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            log::trace!("Session {session_id} outbound closed");
        }
    }
}
