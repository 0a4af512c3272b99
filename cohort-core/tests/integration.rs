//! End-to-end tests: a real session server on a free port driven by real
//! WebSocket clients.

use cohort_core::cluster::FixedMetrics;
use cohort_core::protocol::{ErrorCode, Operation, ResourceKey, ResourceType, ServerMessage};
use cohort_core::{ClientEvent, CollabClient, ConnectionState, CoreService, CoordinationStore, NodeConfig, TrustedIdentity};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_node(config: NodeConfig) -> (String, Arc<CoreService>) {
    let service = Arc::new(CoreService::with_parts(
        config,
        Arc::new(CoordinationStore::standalone()),
        Arc::new(FixedMetrics::new(10.0, 20.0)),
        Arc::new(TrustedIdentity),
        None,
    ));
    service.start().await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = service.server();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("ws://127.0.0.1:{port}"), service)
}

async fn start_test_server() -> (String, Arc<CoreService>) {
    start_node(NodeConfig::for_testing("node-a", "us-east")).await
}

/// Wait for the first server message matching `pred`, skipping others.
async fn wait_for(
    events: &mut mpsc::Receiver<ClientEvent>,
    pred: impl Fn(&ServerMessage) -> bool,
) -> ServerMessage {
    timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Some(ClientEvent::Server(message)) if pred(&message) => return message,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for server message")
}

async fn connected_client(url: &str, user: &str, resource: &str) -> (CollabClient, mpsc::Receiver<ClientEvent>) {
    let mut client = CollabClient::new(url, user, None);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    client.join(resource, ResourceType::Document).await.unwrap();
    wait_for(&mut events, |m| matches!(m, ServerMessage::Joined { .. })).await;
    (client, events)
}

async fn send_raw(ws: &mut Ws, text: &str) {
    ws.send(Message::Text(text.to_string().into())).await.unwrap();
}

async fn recv_raw(ws: &mut Ws) -> ServerMessage {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection ended")
            .unwrap();
        if let Message::Text(text) = frame {
            return ServerMessage::decode(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn test_connection_established_on_connect() {
    let (url, _service) = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    match recv_raw(&mut ws).await {
        ServerMessage::ConnectionEstablished { node_id, .. } => assert_eq!(node_id, "node-a"),
        other => panic!("Expected connection_established, got {other:?}"),
    }
}

#[tokio::test]
async fn test_client_connect() {
    let (url, service) = start_test_server().await;
    let mut client = CollabClient::new(&url, "alice", None);
    let mut events = client.take_event_rx().unwrap();

    client.connect().await.unwrap();
    match timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
        Some(ClientEvent::Connected) => {}
        other => panic!("Expected Connected event, got {other:?}"),
    }
    wait_for(&mut events, |m| matches!(m, ServerMessage::Authenticated { .. })).await;

    assert_eq!(client.connection_state().await, ConnectionState::Connected);
    assert!(client.session_id().await.is_some());
    assert_eq!(service.sessions().connection_count(), 1);
}

#[tokio::test]
async fn test_operation_broadcast_between_clients() {
    let (url, _service) = start_test_server().await;
    let (alice, mut alice_events) = connected_client(&url, "alice", "doc-1").await;
    let (_bob, mut bob_events) = connected_client(&url, "bob", "doc-1").await;

    alice
        .send_operation("doc-1", Operation::insert(0, "hello", "alice", 1))
        .await
        .unwrap();

    let ack = wait_for(&mut alice_events, |m| matches!(m, ServerMessage::OperationAck { .. })).await;
    assert_eq!(
        ack,
        ServerMessage::OperationAck {
            resource_id: "doc-1".into(),
            version: 1
        }
    );
    assert_eq!(alice.acked_version("doc-1").await, Some(1));

    match wait_for(&mut bob_events, |m| matches!(m, ServerMessage::OperationBroadcast { .. })).await {
        ServerMessage::OperationBroadcast { op, version, .. } => {
            assert_eq!(version, 1);
            assert_eq!(op.payload.as_deref(), Some("hello"));
            assert_eq!(op.author_id, "alice");
        }
        other => panic!("Expected operation_broadcast, got {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_and_unknown_frames_keep_connection() {
    let (url, _service) = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    recv_raw(&mut ws).await; // connection_established

    send_raw(&mut ws, "not json").await;
    match recv_raw(&mut ws).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::BadMessage),
        other => panic!("Expected error, got {other:?}"),
    }

    send_raw(&mut ws, r#"{"type":"teleport","payload":{}}"#).await;
    match recv_raw(&mut ws).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::UnknownType),
        other => panic!("Expected error, got {other:?}"),
    }

    send_raw(&mut ws, r#"{"type":"heartbeat","payload":{}}"#).await;
    assert_eq!(recv_raw(&mut ws).await, ServerMessage::HeartbeatAck {});
}

#[tokio::test]
async fn test_operation_before_authenticate_rejected() {
    let (url, _service) = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    recv_raw(&mut ws).await;

    send_raw(
        &mut ws,
        r#"{"type":"operation","payload":{"resourceId":"doc-1","op":{"type":"insert","position":0,"payload":"x","authorId":"eve","timestamp":1}}}"#,
    )
    .await;
    match recv_raw(&mut ws).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::Unauthenticated),
        other => panic!("Expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_capacity_exceeded_closes_connection() {
    let mut config = NodeConfig::for_testing("node-a", "us-east");
    config.session.max_connections = 1;
    let (url, service) = start_node(config).await;

    let (mut first, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    recv_raw(&mut first).await;

    let (mut second, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    match recv_raw(&mut second).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::CapacityExceeded),
        other => panic!("Expected capacity error, got {other:?}"),
    }
    let closed = timeout(Duration::from_secs(2), second.next()).await.unwrap();
    assert!(matches!(closed, Some(Ok(Message::Close(_))) | None | Some(Err(_))));

    assert_eq!(service.sessions().connection_count(), 1);
}

#[tokio::test]
async fn test_disconnect_cleans_up_session() {
    let (url, service) = start_test_server().await;
    let (mut client, _events) = connected_client(&url, "alice", "doc-1").await;
    assert_eq!(service.sessions().connection_count(), 1);

    client.disconnect().await;
    timeout(Duration::from_secs(2), async {
        while service.sessions().connection_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session was not cleaned up");

    assert_eq!(service.nodes().get("node-a").unwrap().current_load, 0);
}

#[tokio::test]
async fn test_reconnect_resyncs_and_replays_offline_edits() {
    let (url, service) = start_test_server().await;
    let (mut alice, mut alice_events) = connected_client(&url, "alice", "doc-1").await;
    let (bob, mut bob_events) = connected_client(&url, "bob", "doc-1").await;
    assert_eq!(alice.acked_version("doc-1").await, Some(0));

    alice.disconnect().await;
    bob.send_operation("doc-1", Operation::insert(0, "x", "bob", 10)).await.unwrap();
    bob.send_operation("doc-1", Operation::insert(1, "y", "bob", 11)).await.unwrap();
    wait_for(&mut bob_events, |m| matches!(m, ServerMessage::OperationAck { version: 2, .. })).await;

    // Produced offline against version 0
    alice
        .send_operation("doc-1", Operation::insert(0, "A", "alice", 12))
        .await
        .unwrap();
    assert_eq!(alice.offline_queue_len().await, 1);

    alice.reconnect().await.unwrap();
    let synced = wait_for(&mut alice_events, |m| matches!(m, ServerMessage::SyncComplete { .. })).await;
    assert!(matches!(synced, ServerMessage::SyncComplete { version: 2, .. }));

    wait_for(&mut alice_events, |m| matches!(m, ServerMessage::OperationAck { .. })).await;
    assert_eq!(alice.acked_version("doc-1").await, Some(3));
    assert_eq!(alice.offline_queue_len().await, 0);

    match wait_for(&mut bob_events, |m| matches!(m, ServerMessage::OperationBroadcast { .. })).await {
        ServerMessage::OperationBroadcast { version, .. } => assert_eq!(version, 3),
        other => panic!("Expected operation_broadcast, got {other:?}"),
    }

    let resource = service
        .engine()
        .get_or_create_resource(&ResourceKey::new(ResourceType::Document, "doc-1"))
        .await
        .unwrap();
    assert_eq!(resource.version, 3);
    assert_eq!(resource.content.chars().count(), 3);
    assert!(resource.content.contains('A'));
}

#[tokio::test]
async fn test_monitor_streams_health_report() {
    let (url, service) = start_test_server().await;
    service.healer().collect_metrics().await;

    let (mut monitor, _) = tokio_tungstenite::connect_async(format!("{url}/monitor"))
        .await
        .unwrap();
    let frame = timeout(Duration::from_secs(2), monitor.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let Message::Text(text) = frame else {
        panic!("Expected a text frame");
    };

    let report: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
    assert_eq!(report["nodeId"], "node-a");
    assert_eq!(report["status"], "healthy");
    assert_eq!(report["nodes"].as_array().unwrap().len(), 1);
    assert!(report["metrics"].is_object());

    // Monitors are not sessions
    assert_eq!(service.sessions().connection_count(), 0);
}
