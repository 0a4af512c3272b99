//! WebSocket client for the session server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect)
//! - Authentication and resource membership that survive reconnects
//! - Last acknowledged version per resource, used to `sync` after a drop
//! - Duplicate operation broadcasts filtered before they reach the app
//! - Offline queue for operations produced while disconnected
//!
//! ```text
//! app ── send_operation ──► outgoing mpsc ──► writer task ──► ws
//!  ▲                                                          │
//!  └──── ClientEvent ◄──── reader task (tracks versions) ◄────┘
//! ```

use futures_util::{SinkExt, StreamExt};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{ClientMessage, Cursor, Operation, ProtocolError, ResourceType, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Any message from the server, in arrival order
    Server(ServerMessage),
}

/// Offline queue for operations made while disconnected.
///
/// Queued operations are replayed after the resources are re-synced.
pub struct OfflineQueue {
    queue: VecDeque<QueuedOperation>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedOperation {
    resource_id: String,
    op: Operation,
}

impl OfflineQueue {
    /// Create a new offline queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an operation for later replay.
    pub fn enqueue(&mut self, resource_id: impl Into<String>, op: Operation) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedOperation {
            resource_id: resource_id.into(),
            op,
        });
        true
    }

    /// Drain all queued operations for replay.
    pub fn drain(&mut self) -> Vec<(String, Operation)> {
        self.queue.drain(..).map(|q| (q.resource_id, q.op)).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// Resource version a server message confirms, if any.
fn confirmed_version(message: &ServerMessage) -> Option<(&str, u64)> {
    match message {
        ServerMessage::Joined {
            resource_id,
            version,
            ..
        }
        | ServerMessage::OperationAck {
            resource_id,
            version,
        }
        | ServerMessage::OperationBroadcast {
            resource_id,
            version,
            ..
        }
        | ServerMessage::SyncComplete {
            resource_id,
            version,
        } => Some((resource_id.as_str(), *version)),
        _ => None,
    }
}

/// Operation versions of one resource already handed to the app.
#[derive(Debug, Default)]
struct Delivered {
    /// Everything up to here is covered
    through: u64,
    /// Delivered versions past a gap
    ahead: BTreeSet<u64>,
}

impl Delivered {
    /// Record `version`; false when it was covered already.
    fn accept(&mut self, version: u64) -> bool {
        if version <= self.through || !self.ahead.insert(version) {
            return false;
        }
        while self.ahead.remove(&(self.through + 1)) {
            self.through += 1;
        }
        true
    }

    /// A snapshot or sync covered everything up to `version`.
    fn cover(&mut self, version: u64) {
        self.through = self.through.max(version);
        let through = self.through;
        self.ahead.retain(|v| *v > through);
    }
}

/// Whether a server message is news to the app. Operation broadcasts the
/// app already has (inside a snapshot, or received before) are not.
fn is_news(delivered: &mut HashMap<String, Delivered>, message: &ServerMessage) -> bool {
    match message {
        ServerMessage::Joined {
            resource_id,
            version,
            ..
        }
        | ServerMessage::SyncComplete {
            resource_id,
            version,
        } => {
            delivered.entry(resource_id.clone()).or_default().cover(*version);
            true
        }
        ServerMessage::OperationAck {
            resource_id,
            version,
        } => {
            delivered.entry(resource_id.clone()).or_default().accept(*version);
            true
        }
        ServerMessage::OperationBroadcast {
            resource_id,
            version,
            ..
        } => delivered.entry(resource_id.clone()).or_default().accept(*version),
        _ => true,
    }
}

/// The collaboration client.
///
/// Holds one WebSocket connection to a node. Identity and joined resources
/// are remembered so [`CollabClient::reconnect`] can restore them and
/// resume every resource from its last acknowledged version.
pub struct CollabClient {
    user_id: String,
    token: Option<String>,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Session id assigned by the server for the current connection
    session_id: Arc<RwLock<Option<Uuid>>>,

    /// Last acknowledged version per resource id
    versions: Arc<RwLock<HashMap<String, u64>>>,

    /// Resources to rejoin after a reconnect
    joined: Arc<RwLock<Vec<(String, ResourceType)>>>,

    /// Offline queue for disconnected edits
    offline_queue: Arc<Mutex<OfflineQueue>>,

    /// Bumped on every connect so a stale reader cannot mark a newer
    /// connection as lost
    generation: Arc<AtomicU64>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<ClientMessage>>,

    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    event_tx: mpsc::Sender<ClientEvent>,

    server_url: String,
}

impl CollabClient {
    pub fn new(server_url: impl Into<String>, user_id: impl Into<String>, token: Option<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            user_id: user_id.into(),
            token,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            session_id: Arc::new(RwLock::new(None)),
            versions: Arc::new(RwLock::new(HashMap::new())),
            joined: Arc::new(RwLock::new(Vec::new())),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            generation: Arc::new(AtomicU64::new(0)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect, authenticate, rejoin known resources and replay the
    /// offline queue.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        {
            let mut state = self.state.write().await;
            if *state != ConnectionState::Reconnecting {
                *state = ConnectionState::Connecting;
            }
        }

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(connected) => connected,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        // Writer task: forward the outgoing channel to the socket, then close it
        let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(256);
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let text = match message.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        log::error!("Dropping unencodable {} message: {e}", message.kind());
                        continue;
                    }
                };
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });
        self.outgoing_tx = Some(out_tx);

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        // Reader task: track versions and surface every server message
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let session_id = self.session_id.clone();
        let versions = self.versions.clone();
        let current = self.generation.clone();
        tokio::spawn(async move {
            let mut delivered = HashMap::new();
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let message = match ServerMessage::decode(text.as_str()) {
                            Ok(message) => message,
                            Err(e) => {
                                log::warn!("Ignoring undecodable server frame: {e}");
                                continue;
                            }
                        };
                        if let ServerMessage::ConnectionEstablished { session_id: id, .. } = &message {
                            *session_id.write().await = Some(*id);
                        }
                        if let Some((resource_id, version)) = confirmed_version(&message) {
                            let mut versions = versions.write().await;
                            let entry = versions.entry(resource_id.to_string()).or_insert(0);
                            *entry = (*entry).max(version);
                        }
                        if !is_news(&mut delivered, &message) {
                            log::trace!("Dropping duplicate operation broadcast");
                            continue;
                        }
                        let _ = event_tx.send(ClientEvent::Server(message)).await;
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            if current.load(Ordering::SeqCst) == generation {
                *state.write().await = ConnectionState::Disconnected;
                *session_id.write().await = None;
                let _ = event_tx.send(ClientEvent::Disconnected).await;
            }
        });

        self.send(ClientMessage::Authenticate {
            user_id: self.user_id.clone(),
            token: self.token.clone(),
        })
        .await?;

        // Resume every joined resource from its last acknowledged version
        let joined = self.joined.read().await.clone();
        for (resource_id, resource_type) in joined {
            self.send(ClientMessage::JoinResource {
                resource_id: resource_id.clone(),
                resource_type,
            })
            .await?;
            if let Some(since_version) = self.acked_version(&resource_id).await {
                self.send(ClientMessage::Sync {
                    resource_id,
                    since_version,
                })
                .await?;
            }
        }

        let queued = self.offline_queue.lock().await.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued operations", queued.len());
            for (resource_id, op) in queued {
                self.send(ClientMessage::Operation { resource_id, op }).await?;
            }
        }

        Ok(())
    }

    /// Close the connection. Identity, resources and versions are kept.
    pub async fn disconnect(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        // Dropping the sender ends the writer task, which closes the socket.
        self.outgoing_tx = None;
        *self.session_id.write().await = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Drop the current connection and connect again.
    pub async fn reconnect(&mut self) -> Result<(), ProtocolError> {
        self.disconnect().await;
        *self.state.write().await = ConnectionState::Reconnecting;
        self.connect().await
    }

    /// Join a resource. Remembered across reconnects; a client is in one
    /// resource at a time, so joining replaces the previous one.
    pub async fn join(&self, resource_id: impl Into<String>, resource_type: ResourceType) -> Result<(), ProtocolError> {
        let resource_id = resource_id.into();
        {
            let mut joined = self.joined.write().await;
            joined.clear();
            joined.push((resource_id.clone(), resource_type));
        }
        if self.is_connected().await {
            self.send(ClientMessage::JoinResource {
                resource_id,
                resource_type,
            })
            .await?;
        }
        Ok(())
    }

    pub async fn leave(&self, resource_id: &str) -> Result<(), ProtocolError> {
        self.joined.write().await.retain(|(id, _)| id != resource_id);
        if self.is_connected().await {
            self.send(ClientMessage::LeaveResource {
                resource_id: resource_id.to_string(),
            })
            .await?;
        }
        Ok(())
    }

    /// Send an operation. Unless the caller set one, the operation is
    /// stamped with the last acknowledged version of its resource.
    ///
    /// If disconnected, queues the operation for replay.
    pub async fn send_operation(&self, resource_id: impl Into<String>, mut op: Operation) -> Result<(), ProtocolError> {
        let resource_id = resource_id.into();
        if op.base_version.is_none() {
            op.base_version = self.acked_version(&resource_id).await;
        }

        if !self.is_connected().await {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(resource_id, op) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        }
        self.send(ClientMessage::Operation { resource_id, op }).await
    }

    /// Send a cursor update. Dropped silently while offline.
    pub async fn send_presence(&self, resource_id: impl Into<String>, cursor: Cursor) -> Result<(), ProtocolError> {
        if !self.is_connected().await {
            return Ok(());
        }
        self.send(ClientMessage::Presence {
            resource_id: resource_id.into(),
            cursor,
        })
        .await
    }

    pub async fn heartbeat(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Heartbeat {}).await
    }

    /// Ask for every operation after the last acknowledged version.
    pub async fn sync(&self, resource_id: impl Into<String>) -> Result<(), ProtocolError> {
        let resource_id = resource_id.into();
        let since_version = self.acked_version(&resource_id).await.unwrap_or(0);
        self.send(ClientMessage::Sync {
            resource_id,
            since_version,
        })
        .await
    }

    async fn send(&self, message: ClientMessage) -> Result<(), ProtocolError> {
        match self.outgoing_tx {
            Some(ref tx) => tx.send(message).await.map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Session id of the current connection, once the server announced it.
    pub async fn session_id(&self) -> Option<Uuid> {
        *self.session_id.read().await
    }

    /// Highest version the server confirmed for `resource_id`.
    pub async fn acked_version(&self, resource_id: &str) -> Option<u64> {
        self.versions.read().await.get(resource_id).copied()
    }

    pub async fn joined_resources(&self) -> Vec<String> {
        self.joined.read().await.iter().map(|(id, _)| id.clone()).collect()
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
