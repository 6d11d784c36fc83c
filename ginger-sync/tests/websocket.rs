//! End-to-end tests over a real WebSocket server.

use ginger_core::{fields_of, Document, KeyPath, SetOptions};
use ginger_sync::client::{ClientConfig, ConnectionState, SocketClient, Transport, TransportEvent};
use ginger_sync::protocol::Notification;
use ginger_sync::replica::{DocumentReplica, SequenceReplica};
use ginger_sync::server::{ServerConfig, SocketServer};
use ginger_sync::store::{Query, RemoteStore, StoreOptions};
use ginger_sync::SyncContext;
use serde_json::json;
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return the port.
async fn start_test_server() -> u16 {
    let port = free_port().await;
    let server = SocketServer::open(ServerConfig::for_testing(format!("127.0.0.1:{port}"))).unwrap();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    sleep(Duration::from_millis(50)).await;
    port
}

async fn connected_client(port: u16, user: &str) -> Arc<SocketClient> {
    let client = Arc::new(SocketClient::new(ClientConfig::for_testing(format!("ws://127.0.0.1:{port}"), user)));
    client.connect().await.unwrap();
    client
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let port = start_test_server().await;
    let result = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}")).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_client_handshake_and_round_trip() {
    let port = start_test_server().await;
    let client = SocketClient::new(ClientConfig::for_testing(format!("ws://127.0.0.1:{port}"), "alice"));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    match timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
        Some(TransportEvent::Connected) => {}
        other => panic!("Expected Connected event, got {other:?}"),
    }
    assert_eq!(client.connection_state().await, ConnectionState::Connected);

    let opts = StoreOptions::default();
    let animals = KeyPath::new(["animals"]);
    let id = client.create(&animals, json!({"name": "tiger", "legs": 4}), &opts).await.unwrap();
    let doc = client.fetch(&animals.child(id.clone()), &opts).await.unwrap();
    assert_eq!(doc, json!({"_id": id, "name": "tiger", "legs": 4}));

    let missing = client.fetch(&animals.child("nope"), &opts).await.unwrap_err();
    assert!(!missing.is_transient());
}

#[tokio::test]
async fn test_push_reaches_observer_but_not_author() {
    let port = start_test_server().await;
    let alice = connected_client(port, "alice").await;
    let bob = connected_client(port, "bob").await;
    let mut alice_events = alice.take_event_rx().unwrap();
    let mut bob_events = bob.take_event_rx().unwrap();
    // Connected events
    let _ = timeout(Duration::from_secs(1), alice_events.recv()).await;
    let _ = timeout(Duration::from_secs(1), bob_events.recv()).await;

    let opts = StoreOptions::default();
    let id = alice.create(&KeyPath::new(["animals"]), json!({"name": "owl"}), &opts).await.unwrap();
    let owl = KeyPath::new(["animals", id.as_str()]);
    alice.observe(&owl).await.unwrap();
    bob.observe(&owl).await.unwrap();

    alice.put(&owl, json!({"wings": 2}), &opts).await.unwrap();
    match timeout(Duration::from_secs(2), bob_events.recv()).await.unwrap() {
        Some(TransportEvent::Push(event)) => {
            assert_eq!(event.key_path, owl);
            assert_eq!(event.notification, Notification::Update { doc: json!({"wings": 2}) });
        }
        other => panic!("Expected a push, got {other:?}"),
    }
    assert!(timeout(Duration::from_millis(100), alice_events.recv()).await.is_err());
}

#[tokio::test]
async fn test_replicas_sync_over_sockets() {
    let port = start_test_server().await;
    let alice_link = connected_client(port, "alice").await;
    let bob_link = connected_client(port, "bob").await;
    let alice = SyncContext::in_memory(alice_link).unwrap();
    let bob = SyncContext::in_memory(bob_link).unwrap();
    let _alice_pump = alice.spawn();
    let _bob_pump = bob.spawn();

    let path = KeyPath::from(["parade", "1", "animals"]);
    let parade = SequenceReplica::load(&alice, path.clone()).await.unwrap();
    parade.keep_synced().await.unwrap();
    let other = SequenceReplica::load(&bob, path.clone()).await.unwrap();
    other.keep_synced().await.unwrap();

    let tiger = Document::create("animals", fields_of(json!({"name": "tiger"})));
    parade.sequence().push(&tiger, SetOptions::default()).unwrap();
    alice.sync().await.unwrap();

    let converged = timeout(Duration::from_secs(2), async {
        while other.sequence().len() != 1 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(converged.is_ok(), "Bob should receive the insert");
    assert_eq!(other.sequence().ids(), parade.sequence().ids());

    let seen = DocumentReplica::load(&bob, &tiger.key_path()).await.unwrap();
    assert_eq!(seen.doc().get("name"), Some(json!("tiger")));

    let entries = bob.queue().all(&path, &Query::new()).await.unwrap();
    assert_eq!(entries.len(), 1);
}
