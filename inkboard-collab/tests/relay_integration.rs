//! Integration tests for the WebSocket relay.
//!
//! These tests start a real server and connect real clients,
//! verifying join, fan-out, late-joiner sync and room limits.

use inkboard_collab::client::{ConnectionState, SyncClient, SyncEvent};
use inkboard_collab::protocol::PeerInfo;
use inkboard_collab::server::{ServerConfig, SyncServer};
use inkboard_core::{DrawingOperation, OperationId, OperationKind, SharedDocumentStore, UserId};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return its URL.
async fn start_test_server(max_peers_per_room: usize) -> String {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_peers_per_room,
        broadcast_capacity: 64,
        heartbeat_interval_secs: 30,
        storage_path: None,
    };
    let server = SyncServer::new(config);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("ws://127.0.0.1:{port}")
}

async fn connect(url: &str, user: &str, room: &str) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let info = PeerInfo::new(UserId::from(user), user);
    let mut client = SyncClient::new(info, room, url);
    let events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    (client, events)
}

/// Wait for the first event matching `pred`, skipping others.
async fn wait_for<F>(events: &mut mpsc::Receiver<SyncEvent>, mut pred: F) -> SyncEvent
where
    F: FnMut(&SyncEvent) -> bool,
{
    timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn stroke(user: &str, seq: u64, x: f64, y: f64) -> DrawingOperation {
    DrawingOperation::stroke(
        OperationId::new(UserId::from(user), 1_000 + seq, seq),
        OperationKind::Draw,
        x,
        y,
        4.0,
        "#333333",
    )
}

#[tokio::test]
async fn test_client_connects() {
    let url = start_test_server(10).await;
    let (client, mut events) = connect(&url, "alice", "r1").await;

    let event = wait_for(&mut events, |_| true).await;
    assert!(matches!(event, SyncEvent::Connected));
    assert_eq!(client.connection_state().await, ConnectionState::Connected);

    // The relay opens with its state vector.
    wait_for(&mut events, |e| matches!(e, SyncEvent::SyncRequested(_))).await;
}

#[tokio::test]
async fn test_existing_peer_sees_join() {
    let url = start_test_server(10).await;
    let (_alice, mut alice_events) = connect(&url, "alice", "r1").await;
    wait_for(&mut alice_events, |e| matches!(e, SyncEvent::Connected)).await;

    let (_bob, _bob_events) = connect(&url, "bob", "r1").await;

    let event = wait_for(&mut alice_events, |e| matches!(e, SyncEvent::PeerJoined(_))).await;
    match event {
        SyncEvent::PeerJoined(info) => assert_eq!(info.user_id, UserId::from("bob")),
        other => panic!("Expected PeerJoined, got {other:?}"),
    }
}

#[tokio::test]
async fn test_delta_fans_out_to_room() {
    let url = start_test_server(10).await;
    let (alice, mut alice_events) = connect(&url, "alice", "r1").await;
    let (_bob, mut bob_events) = connect(&url, "bob", "r1").await;
    let (_carol, mut carol_events) = connect(&url, "carol", "other-room").await;
    wait_for(&mut alice_events, |e| matches!(e, SyncEvent::PeerJoined(_))).await;

    let mut store = SharedDocumentStore::new();
    let delta = store.add_operation(&stroke("alice", 0, 1.0, 2.0)).unwrap();
    alice.send_delta(delta.clone()).await.unwrap();

    let event = wait_for(&mut bob_events, |e| matches!(e, SyncEvent::RemoteDelta { .. })).await;
    let SyncEvent::RemoteDelta { update, peer_id, .. } = event else {
        unreachable!()
    };
    assert_eq!(update, delta);
    assert_eq!(peer_id, alice.peer_info().peer_id);

    let mut replica = SharedDocumentStore::new();
    let changes = replica.apply_update(&update).unwrap();
    assert_eq!(changes.operations.len(), 1);

    // Rooms are isolated.
    let leaked = timeout(Duration::from_millis(200), async {
        loop {
            match carol_events.recv().await {
                Some(SyncEvent::RemoteDelta { .. }) => return,
                Some(_) => continue,
                None => std::future::pending::<()>().await,
            }
        }
    })
    .await;
    assert!(leaked.is_err(), "Delta leaked into another room");
}

#[tokio::test]
async fn test_late_joiner_receives_history() {
    let url = start_test_server(10).await;
    let (alice, mut alice_events) = connect(&url, "alice", "r1").await;
    wait_for(&mut alice_events, |e| matches!(e, SyncEvent::Connected)).await;

    let mut source = SharedDocumentStore::new();
    for (seq, x) in [10.0, 12.0, 14.0].into_iter().enumerate() {
        let delta = source.add_operation(&stroke("alice", seq as u64, x, x)).unwrap();
        alice.send_delta(delta).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (bob, mut bob_events) = connect(&url, "bob", "r1").await;
    let mut replica = SharedDocumentStore::new();
    bob.request_sync(replica.state_vector()).await.unwrap();

    let event = wait_for(&mut bob_events, |e| matches!(e, SyncEvent::StateSynced(_))).await;
    let SyncEvent::StateSynced(diff) = event else {
        unreachable!()
    };
    replica.apply_update(&diff).unwrap();
    assert_eq!(replica.all_operations(), source.all_operations());
}

#[tokio::test]
async fn test_offline_deltas_replayed_on_connect() {
    let url = start_test_server(10).await;
    let (_bob, mut bob_events) = connect(&url, "bob", "r1").await;
    wait_for(&mut bob_events, |e| matches!(e, SyncEvent::Connected)).await;

    let info = PeerInfo::new(UserId::from("alice"), "alice");
    let mut alice = SyncClient::new(info, "r1", url.as_str());
    let mut store = SharedDocumentStore::new();
    for seq in 0..3 {
        let delta = store.add_operation(&stroke("alice", seq, 0.0, 0.0)).unwrap();
        alice.send_delta(delta).await.unwrap();
    }
    assert_eq!(alice.offline_queue_len().await, 3);

    alice.connect().await.unwrap();
    assert_eq!(alice.offline_queue_len().await, 0);

    let mut replica = SharedDocumentStore::new();
    for _ in 0..3 {
        let event = wait_for(&mut bob_events, |e| matches!(e, SyncEvent::RemoteDelta { .. })).await;
        if let SyncEvent::RemoteDelta { update, .. } = event {
            replica.apply_update(&update).unwrap();
        }
    }
    assert_eq!(replica.operation_count(), 3);
}

#[tokio::test]
async fn test_full_room_rejects_peer() {
    let url = start_test_server(1).await;
    let (_alice, mut alice_events) = connect(&url, "alice", "r1").await;
    // Sent only once the relay has admitted alice.
    wait_for(&mut alice_events, |e| matches!(e, SyncEvent::SyncRequested(_))).await;

    let (bob, mut bob_events) = connect(&url, "bob", "r1").await;
    wait_for(&mut bob_events, |e| matches!(e, SyncEvent::Disconnected)).await;
    assert_eq!(bob.connection_state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_ping() {
    let url = start_test_server(10).await;
    let (client, mut events) = connect(&url, "alice", "r1").await;
    wait_for(&mut events, |e| matches!(e, SyncEvent::Connected)).await;

    // Pong frames are consumed by the client.
    client.send_ping().await.unwrap();
}
