//! Wire protocol between clients and the session layer, plus the payloads
//! carried on coordination-store channels.
//!
//! Every WebSocket text frame is one JSON envelope:
//! ```text
//! { "type": "operation", "payload": { "resourceId": "...", "op": { ... } } }
//! ```
//!
//! Inbound frames decode into the closed [`ClientMessage`] enum. Types the
//! server does not know decode to [`ClientMessage::Unknown`] so the caller
//! can log and answer them instead of dropping them.
//!
//! Channel names are shared with every other implementation of the cluster:
//! - `resource:{type}:{id}`: operation and presence fan-out
//! - `node:{nodeId}:metrics`: per-node metric publication
//! - `global:broadcast`: cluster-wide announcements
//! - `user:{userId}`: per-user notifications from the control plane

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Cluster-wide announcement channel.
pub const GLOBAL_BROADCAST: &str = "global:broadcast";

/// Channel carrying operations and presence for one resource.
pub fn resource_channel(kind: ResourceType, id: &str) -> String {
    format!("resource:{}:{}", kind.as_str(), id)
}

/// Channel carrying metric publications of one node.
pub fn node_metrics_channel(node_id: &str) -> String {
    format!("node:{node_id}:metrics")
}

/// Channel carrying notifications addressed to one user.
pub fn user_channel(user_id: &str) -> String {
    format!("user:{user_id}")
}

// ───────────────────────────────────────────────────────────────────
// Resources and operations
// ───────────────────────────────────────────────────────────────────

/// Kind of collaboratively edited entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    #[default]
    Document,
    Code,
    Notebook,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Document => "document",
            ResourceType::Code => "code",
            ResourceType::Notebook => "notebook",
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fully qualified resource identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceKey {
    pub resource_type: ResourceType,
    pub resource_id: String,
}

impl ResourceKey {
    pub fn new(resource_type: ResourceType, resource_id: impl Into<String>) -> Self {
        Self {
            resource_type,
            resource_id: resource_id.into(),
        }
    }

    /// Broadcast channel for this resource.
    pub fn channel(&self) -> String {
        resource_channel(self.resource_type, &self.resource_id)
    }

    /// Store key of the resource state (content + version).
    pub fn state_key(&self) -> String {
        format!("{}:state", self.channel())
    }

    /// Store key of the ordered operation log.
    pub fn log_key(&self) -> String {
        format!("{}:ops", self.channel())
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.resource_type, self.resource_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Delete,
    Retain,
}

/// An atomic edit. Positions and lengths count characters, not bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub position: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
    pub author_id: String,
    /// Client-supplied timestamp, used as a proxy for causal order
    pub timestamp: u64,
    /// Resource version the author had seen when producing the edit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<u64>,
}

impl Operation {
    pub fn insert(
        position: usize,
        text: impl Into<String>,
        author_id: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            kind: OperationKind::Insert,
            position,
            payload: Some(text.into()),
            length: None,
            author_id: author_id.into(),
            timestamp,
            base_version: None,
        }
    }

    pub fn delete(
        position: usize,
        length: usize,
        author_id: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            kind: OperationKind::Delete,
            position,
            payload: None,
            length: Some(length),
            author_id: author_id.into(),
            timestamp,
            base_version: None,
        }
    }

    pub fn retain(position: usize, author_id: impl Into<String>, timestamp: u64) -> Self {
        Self {
            kind: OperationKind::Retain,
            position,
            payload: None,
            length: None,
            author_id: author_id.into(),
            timestamp,
            base_version: None,
        }
    }

    /// Mark the version this edit was produced against.
    pub fn based_on(mut self, version: u64) -> Self {
        self.base_version = Some(version);
        self
    }

    /// Number of characters this operation inserts or removes.
    pub fn span(&self) -> usize {
        match self.kind {
            OperationKind::Insert => self
                .payload
                .as_deref()
                .map(|p| p.chars().count())
                .unwrap_or(0),
            OperationKind::Delete => self.length.unwrap_or(0),
            OperationKind::Retain => 0,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence
// ───────────────────────────────────────────────────────────────────

/// Cursor and optional selection inside a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub line: u32,
    pub column: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_start: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_end: Option<u32>,
}

impl Cursor {
    pub fn at(line: u32, column: u32) -> Self {
        Self {
            line,
            column,
            selection_start: None,
            selection_end: None,
        }
    }
}

/// A user's live cursor within a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub user_id: String,
    pub resource_id: String,
    pub cursor: Cursor,
    /// Hex color from the fixed palette, stable per user
    pub color: String,
    /// Milliseconds since the Unix epoch
    pub last_seen: u64,
}

// ───────────────────────────────────────────────────────────────────
// Code projects and control-plane notifications
// ───────────────────────────────────────────────────────────────────

/// A change to one file of a code project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeChange {
    pub file_path: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

/// A code change as recorded in the project's replay log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeChangeRecord {
    pub project_id: String,
    pub user_id: String,
    /// Wall-clock milliseconds; also the replay log score
    pub timestamp: u64,
    pub change: CodeChange,
}

/// Classroom events raised by the external web backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClassroomEvent {
    ClassroomCreated {
        classroom_id: String,
        name: String,
    },
    ClassroomJoined {
        classroom_id: String,
        user_id: String,
    },
    AssignmentSubmitted {
        classroom_id: String,
        assignment_id: String,
        student_id: String,
    },
    AssignmentGraded {
        classroom_id: String,
        assignment_id: String,
        student_id: String,
        grade: f64,
    },
}

// ───────────────────────────────────────────────────────────────────
// Client ↔ server messages
// ───────────────────────────────────────────────────────────────────

/// Stable error codes sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthenticated,
    AuthFailed,
    CapacityExceeded,
    NotJoined,
    InvalidOperation,
    OutOfBounds,
    UnknownType,
    BadMessage,
    Unavailable,
}

/// Raw `{type, payload}` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    Authenticate {
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    JoinResource {
        resource_id: String,
        #[serde(default)]
        resource_type: ResourceType,
    },
    LeaveResource {
        resource_id: String,
    },
    Operation {
        resource_id: String,
        op: Operation,
    },
    Presence {
        resource_id: String,
        cursor: Cursor,
    },
    Heartbeat {},
    /// Replay every operation after `since_version` (resume after reconnect)
    Sync {
        resource_id: String,
        since_version: u64,
    },
    CodeChange {
        project_id: String,
        change: CodeChange,
    },
    /// A `type` this server does not understand
    #[serde(skip)]
    Unknown { kind: String },
}

impl ClientMessage {
    const KNOWN_TYPES: &'static [&'static str] = &[
        "authenticate",
        "join_resource",
        "leave_resource",
        "operation",
        "presence",
        "heartbeat",
        "sync",
        "code_change",
    ];

    /// Decode one text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let mut envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;

        if !Self::KNOWN_TYPES.contains(&envelope.kind.as_str()) {
            return Ok(ClientMessage::Unknown {
                kind: envelope.kind,
            });
        }
        if envelope.payload.is_null() {
            envelope.payload = serde_json::Value::Object(serde_json::Map::new());
        }

        let normalized = serde_json::to_value(&envelope)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        serde_json::from_value(normalized).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Encode to one text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Wire name of this message type.
    pub fn kind(&self) -> &str {
        match self {
            ClientMessage::Authenticate { .. } => "authenticate",
            ClientMessage::JoinResource { .. } => "join_resource",
            ClientMessage::LeaveResource { .. } => "leave_resource",
            ClientMessage::Operation { .. } => "operation",
            ClientMessage::Presence { .. } => "presence",
            ClientMessage::Heartbeat {} => "heartbeat",
            ClientMessage::Sync { .. } => "sync",
            ClientMessage::CodeChange { .. } => "code_change",
            ClientMessage::Unknown { kind } => kind,
        }
    }
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    ConnectionEstablished {
        session_id: Uuid,
        node_id: String,
    },
    Authenticated {
        user_id: String,
    },
    Joined {
        resource_id: String,
        resource_type: ResourceType,
        version: u64,
        content: String,
        participants: Vec<Presence>,
    },
    OperationAck {
        resource_id: String,
        version: u64,
    },
    OperationBroadcast {
        resource_id: String,
        op: Operation,
        version: u64,
    },
    PresenceBroadcast {
        resource_id: String,
        presence: Presence,
    },
    PresenceLeft {
        resource_id: String,
        user_id: String,
    },
    SyncComplete {
        resource_id: String,
        version: u64,
    },
    CodeChangeBroadcast {
        record: CodeChangeRecord,
    },
    Notification {
        event: ClassroomEvent,
    },
    /// The session was migrated; reconnect through `node_id`
    Rehome {
        node_id: String,
    },
    HeartbeatAck {},
    Error {
        message: String,
        code: ErrorCode,
    },
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

// ───────────────────────────────────────────────────────────────────
// Store channel payloads
// ───────────────────────────────────────────────────────────────────

/// A server message fanned out on a resource or user channel.
///
/// `origin` is the session that caused it; that session is skipped on
/// delivery so authors never receive their own edits back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Uuid>,
    pub message: ServerMessage,
}

impl ChannelMessage {
    pub fn new(origin: Option<Uuid>, message: ServerMessage) -> Self {
        Self { origin, message }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Announcements on `global:broadcast`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClusterAnnouncement {
    NodeRegistered {
        node_id: String,
        region: String,
    },
    NodeDeregistered {
        node_id: String,
    },
    SessionMigrated {
        session_id: Uuid,
        from: String,
        to: String,
    },
    /// No node had capacity; the session must be closed
    SessionEvicted {
        session_id: Uuid,
        node_id: String,
    },
    /// Ask the orchestrator for more capacity behind `node_id`
    ScaleUpRequested {
        node_id: String,
        region: String,
        reason: String,
    },
    /// Extra capacity behind `node_id` is no longer needed
    ScaleDownRequested {
        node_id: String,
        region: String,
        reason: String,
    },
    AddNodeRequested {
        region: String,
        reason: String,
    },
    RestartRequested {
        node_id: String,
        reason: String,
    },
    StorePrimaryChanged {
        primary: String,
    },
}

impl ClusterAnnouncement {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names() {
        assert_eq!(
            resource_channel(ResourceType::Document, "doc-1"),
            "resource:document:doc-1"
        );
        assert_eq!(node_metrics_channel("node-a"), "node:node-a:metrics");
        assert_eq!(user_channel("alice"), "user:alice");
        assert_eq!(GLOBAL_BROADCAST, "global:broadcast");
    }

    #[test]
    fn test_resource_key_store_keys() {
        let key = ResourceKey::new(ResourceType::Notebook, "page-7");
        assert_eq!(key.channel(), "resource:notebook:page-7");
        assert_eq!(key.state_key(), "resource:notebook:page-7:state");
        assert_eq!(key.log_key(), "resource:notebook:page-7:ops");
    }

    #[test]
    fn test_decode_authenticate() {
        let msg = ClientMessage::decode(r#"{"type":"authenticate","payload":{"userId":"alice"}}"#)
            .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Authenticate {
                user_id: "alice".into(),
                token: None
            }
        );
    }

    #[test]
    fn test_decode_heartbeat_without_payload() {
        let msg = ClientMessage::decode(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Heartbeat {});

        let msg = ClientMessage::decode(r#"{"type":"heartbeat","payload":{}}"#).unwrap();
        assert_eq!(msg, ClientMessage::Heartbeat {});
    }

    #[test]
    fn test_decode_join_defaults_to_document() {
        let msg = ClientMessage::decode(r#"{"type":"join_resource","payload":{"resourceId":"d1"}}"#)
            .unwrap();
        assert_eq!(
            msg,
            ClientMessage::JoinResource {
                resource_id: "d1".into(),
                resource_type: ResourceType::Document
            }
        );
    }

    #[test]
    fn test_decode_operation() {
        let text = r#"{"type":"operation","payload":{"resourceId":"d1","op":
            {"type":"insert","position":3,"payload":"hi","authorId":"bob","timestamp":17,"baseVersion":2}}}"#;
        match ClientMessage::decode(text).unwrap() {
            ClientMessage::Operation { resource_id, op } => {
                assert_eq!(resource_id, "d1");
                assert_eq!(op.kind, OperationKind::Insert);
                assert_eq!(op.position, 3);
                assert_eq!(op.payload.as_deref(), Some("hi"));
                assert_eq!(op.base_version, Some(2));
            }
            other => panic!("Expected operation, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_unknown_type() {
        let msg = ClientMessage::decode(r#"{"type":"teleport","payload":{"x":1}}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Unknown {
                kind: "teleport".into()
            }
        );
        assert_eq!(msg.kind(), "teleport");
    }

    #[test]
    fn test_decode_known_type_with_bad_payload() {
        let err = ClientMessage::decode(r#"{"type":"join_resource","payload":{"nope":1}}"#);
        assert!(matches!(err, Err(ProtocolError::Deserialization(_))));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(ClientMessage::decode("not json").is_err());
        assert!(ClientMessage::decode(r#"{"payload":{}}"#).is_err());
    }

    #[test]
    fn test_server_message_wire_shape() {
        let msg = ServerMessage::ConnectionEstablished {
            session_id: Uuid::nil(),
            node_id: "node-a".into(),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "connection_established");
        assert_eq!(value["payload"]["nodeId"], "node-a");
        assert_eq!(
            value["payload"]["sessionId"],
            "00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_error_message_wire_shape() {
        let msg = ServerMessage::error(ErrorCode::OutOfBounds, "position 9 beyond length 3");
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["payload"]["code"], "out_of_bounds");
    }

    #[test]
    fn test_operation_span() {
        assert_eq!(Operation::insert(0, "héllo", "a", 1).span(), 5);
        assert_eq!(Operation::delete(0, 3, "a", 1).span(), 3);
        assert_eq!(Operation::retain(4, "a", 1).span(), 0);
    }

    #[test]
    fn test_classroom_event_tagging() {
        let event = ClassroomEvent::AssignmentSubmitted {
            classroom_id: "c1".into(),
            assignment_id: "a1".into(),
            student_id: "s1".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "assignment_submitted");
        assert_eq!(value["studentId"], "s1");
    }

    #[test]
    fn test_scale_request_wire_form() {
        let request = ClusterAnnouncement::ScaleDownRequested {
            node_id: "node-a".into(),
            region: "eu-west".into(),
            reason: "HighCpu resolved".into(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["type"], "scale_down_requested");
        assert_eq!(value["nodeId"], "node-a");
        assert_eq!(value["region"], "eu-west");
    }

    #[test]
    fn test_announcement_decode() {
        let text = r#"{"type":"session_migrated","sessionId":"00000000-0000-0000-0000-000000000000","from":"a","to":"b"}"#;
        let decoded = ClusterAnnouncement::decode(text).unwrap();
        assert_eq!(
            decoded,
            ClusterAnnouncement::SessionMigrated {
                session_id: Uuid::nil(),
                from: "a".into(),
                to: "b".into()
            }
        );
    }
}
