//! Two nodes sharing one coordination store, each with its own session
//! server.

use cohort_core::cluster::FixedMetrics;
use cohort_core::protocol::{ClassroomEvent, ErrorCode, Operation, ResourceType, ServerMessage};
use cohort_core::session::session_key;
use cohort_core::{ClientEvent, CollabClient, CoordinationStore, CoreService, NodeConfig, TrustedIdentity};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

struct Node {
    url: String,
    service: Arc<CoreService>,
}

async fn start_node(node_id: &str, store: Arc<CoordinationStore>, capacity: u32) -> Node {
    let mut config = NodeConfig::for_testing(node_id, "us-east");
    config.capacity = capacity;
    let service = Arc::new(CoreService::with_parts(
        config,
        store,
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

    Node {
        url: format!("ws://127.0.0.1:{port}"),
        service,
    }
}

async fn next_event(events: &mut mpsc::Receiver<ClientEvent>, pred: impl Fn(&ClientEvent) -> bool) -> ClientEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn join(url: &str, user: &str, resource: &str) -> (CollabClient, mpsc::Receiver<ClientEvent>) {
    let mut client = CollabClient::new(url, user, None);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    client.join(resource, ResourceType::Document).await.unwrap();
    next_event(&mut events, |e| {
        matches!(e, ClientEvent::Server(ServerMessage::Joined { .. }))
    })
    .await;
    (client, events)
}

#[tokio::test]
async fn test_operation_reaches_session_on_other_node() {
    let store = Arc::new(CoordinationStore::standalone());
    let a = start_node("node-a", store.clone(), 100).await;
    let b = start_node("node-b", store.clone(), 100).await;

    let (alice, _alice_events) = join(&a.url, "alice", "doc-1").await;
    let (_bob, mut bob_events) = join(&b.url, "bob", "doc-1").await;

    alice
        .send_operation("doc-1", Operation::insert(0, "hi", "alice", 1))
        .await
        .unwrap();

    match next_event(&mut bob_events, |e| {
        matches!(e, ClientEvent::Server(ServerMessage::OperationBroadcast { .. }))
    })
    .await
    {
        ClientEvent::Server(ServerMessage::OperationBroadcast { op, version, .. }) => {
            assert_eq!(version, 1);
            assert_eq!(op.payload.as_deref(), Some("hi"));
        }
        other => panic!("Expected operation_broadcast, got {other:?}"),
    }

    // Node b's cache follows the remote edit
    let key = cohort_core::ResourceKey::new(ResourceType::Document, "doc-1");
    let cached = b.service.engine().cached_resource(&key).unwrap();
    assert_eq!(cached.version, 1);
    assert_eq!(cached.content, "hi");
}

#[tokio::test]
async fn test_concurrent_edits_on_two_nodes_converge() {
    let store = Arc::new(CoordinationStore::standalone());
    let a = start_node("node-a", store.clone(), 100).await;
    let b = start_node("node-b", store.clone(), 100).await;

    let (alice, mut alice_events) = join(&a.url, "alice", "doc-1").await;
    let (bob, mut bob_events) = join(&b.url, "bob", "doc-1").await;

    // Both produced against version 0
    let (r1, r2) = tokio::join!(
        alice.send_operation("doc-1", Operation::insert(0, "A", "alice", 5)),
        bob.send_operation("doc-1", Operation::insert(0, "B", "bob", 6)),
    );
    r1.unwrap();
    r2.unwrap();

    for events in [&mut alice_events, &mut bob_events] {
        next_event(events, |e| {
            matches!(e, ClientEvent::Server(ServerMessage::OperationAck { .. }))
        })
        .await;
    }

    let key = cohort_core::ResourceKey::new(ResourceType::Document, "doc-1");
    let on_a = a.service.engine().get_or_create_resource(&key).await.unwrap();
    let on_b = b.service.engine().get_or_create_resource(&key).await.unwrap();
    assert_eq!(on_a.version, 2);
    assert_eq!(on_a.content, on_b.content);
    assert_eq!(on_a.content, "BA");
}

#[tokio::test]
async fn test_deregistered_node_rehomes_its_sessions() {
    let store = Arc::new(CoordinationStore::standalone());
    let a = start_node("node-a", store.clone(), 100).await;
    let b = start_node("node-b", store.clone(), 100).await;

    let (alice, mut events) = join(&a.url, "alice", "doc-1").await;
    let session_id = alice.session_id().await.unwrap();

    let summary = b.service.deregister_node("node-a").await.unwrap();
    assert_eq!(summary.migrated, 1);
    assert_eq!(summary.evicted, 0);

    match next_event(&mut events, |e| {
        matches!(e, ClientEvent::Server(ServerMessage::Rehome { .. }))
    })
    .await
    {
        ClientEvent::Server(ServerMessage::Rehome { node_id }) => assert_eq!(node_id, "node-b"),
        other => panic!("Expected rehome, got {other:?}"),
    }
    next_event(&mut events, |e| matches!(e, ClientEvent::Disconnected)).await;

    let mirror = store.get(&session_key(&session_id)).await.unwrap().unwrap();
    assert!(mirror.contains("node-b"));
    assert!(!b.service.nodes().contains("node-a"));
    assert_eq!(a.service.sessions().connection_count(), 0);
}

#[tokio::test]
async fn test_deregister_without_capacity_evicts() {
    let store = Arc::new(CoordinationStore::standalone());
    let a = start_node("node-a", store.clone(), 100).await;
    let b = start_node("node-b", store.clone(), 0).await;

    let (alice, mut events) = join(&a.url, "alice", "doc-1").await;
    let session_id = alice.session_id().await.unwrap();

    let summary = b.service.deregister_node("node-a").await.unwrap();
    assert_eq!(summary.evicted, 1);

    match next_event(&mut events, |e| {
        matches!(e, ClientEvent::Server(ServerMessage::Error { .. }))
    })
    .await
    {
        ClientEvent::Server(ServerMessage::Error { code, .. }) => {
            assert_eq!(code, ErrorCode::CapacityExceeded)
        }
        other => panic!("Expected error, got {other:?}"),
    }
    assert!(store.get(&session_key(&session_id)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_notification_reaches_user_on_any_node() {
    let store = Arc::new(CoordinationStore::standalone());
    let a = start_node("node-a", store.clone(), 100).await;
    let b = start_node("node-b", store.clone(), 100).await;

    let (_student, mut events) = join(&a.url, "student-1", "doc-1").await;

    let event = ClassroomEvent::AssignmentGraded {
        classroom_id: "c1".into(),
        assignment_id: "a1".into(),
        student_id: "student-1".into(),
        grade: 92.5,
    };
    assert_eq!(b.service.control().notify_user("student-1", &event).unwrap(), 1);

    match next_event(&mut events, |e| {
        matches!(e, ClientEvent::Server(ServerMessage::Notification { .. }))
    })
    .await
    {
        ClientEvent::Server(ServerMessage::Notification { event: received }) => assert_eq!(received, event),
        other => panic!("Expected notification, got {other:?}"),
    }
}
