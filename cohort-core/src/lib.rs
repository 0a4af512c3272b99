//! # cohort-core: Real-time collaboration cluster core
//!
//! Shared documents, code and notebooks edited live by many users across a
//! fleet of nodes. Every node runs the same components; they coordinate only
//! through the replicated coordination store.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    WebSocket     ┌────────────────┐
//! │ CollabClient │ ◄──────────────► │ SessionServer  │
//! │ (per user)   │   JSON envelope  │ (per node)     │
//! └──────────────┘                  └───────┬────────┘
//!                                           │
//!                                   ┌───────┴─────────┐
//!                                   │ SessionRegistry │──► NodeRegistry
//!                                   └───────┬─────────┘    (balancer)
//!                                           │                  ▲
//!                                   ┌───────┴────────┐         │
//!                                   │ CollabEngine   │    AutoHealer
//!                                   │ (OT transform) │         │
//!                                   └───────┬────────┘         │
//!                                           ▼                  │
//!                                ┌──────────────────────┐      │
//!                                │ CoordinationStore    │◄─────┘
//!                                │ kv · sorted · pubsub │
//!                                └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`store`]: replicated key/value, ordered sets, pub/sub, failover, archive
//! - [`session`]: live client sessions, identity, liveness, fan-out
//! - [`cluster`]: node registry, telemetry and weighted node selection
//! - [`collab`]: resources, operational transform, presence, code changes
//! - [`healer`]: metrics, alerts and healing actions
//! - [`control`]: control-plane notifications to users
//! - [`server`]: WebSocket session server and `/monitor` feed
//! - [`client`]: WebSocket client with offline queue and resync
//! - [`service`]: wiring and background loops of one node

pub mod clock;
pub mod client;
pub mod cluster;
pub mod collab;
pub mod config;
pub mod control;
pub mod healer;
pub mod protocol;
pub mod server;
pub mod service;
pub mod session;
pub mod store;

// Re-exports for convenience
pub use client::{ClientEvent, CollabClient, ConnectionState, OfflineQueue};
pub use cluster::{MetricsSource, Node, NodeRegistry, SelectionRequest, SystemTelemetry};
pub use collab::{AppliedOperation, CollabEngine, CollabError, Resource};
pub use config::{ConfigError, NodeConfig};
pub use control::ControlPlane;
pub use healer::{Alert, AutoHealer, HealerError, HealthReport, HealthStatus, MetricsSnapshot};
pub use protocol::{
    ClientMessage, ClusterAnnouncement, Cursor, ErrorCode, Operation, Presence, ProtocolError,
    ResourceKey, ResourceType, ServerMessage,
};
pub use server::{ServerConfig, ServerError, ServerStats, SessionServer};
pub use service::{CoreService, ServiceError};
pub use session::{IdentityVerifier, Session, SessionError, SessionRegistry, StaticTokens, TrustedIdentity};
pub use store::{CoordinationStore, StoreError};
