//! Persistence across restarts with RocksDB-backed storage.
//!
//! Verifies:
//! - Queued mutations survive a client restart and replay in order
//! - Cached documents stay readable offline after a restart
//! - The socket server reopens its document store
//! - Document ownership survives a server restart

use ginger_core::{fields_of, Document, KeyPath, SetOptions, SyncError};
use ginger_sync::cache::{CacheConfig, LocalCache};
use ginger_sync::hub::{HubConfig, SyncHub};
use ginger_sync::loopback::LoopbackTransport;
use ginger_sync::queue::{QueueConfig, QueueEvent};
use ginger_sync::replica::DocumentReplica;
use ginger_sync::rights::AllowAll;
use ginger_sync::server::{Caller, RightsPolicy, Server, ServerConfig, SocketServer};
use ginger_sync::storage::rocks::{CF_CACHE, CF_QUEUE};
use ginger_sync::storage::{RocksDb, StoreConfig};
use ginger_sync::store::{MemoryStore, RemoteStore, StoreOptions};
use ginger_sync::SyncContext;
use serde_json::json;
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn start_server() -> Arc<Server> {
    let hub = SyncHub::local(HubConfig::for_testing(), None);
    Arc::new(Server::new(Arc::new(MemoryStore::new()), Arc::new(AllowAll), Some(hub)))
}

/// A client whose cache and journal live in `db`.
fn durable_client(db: &Arc<RocksDb>, transport: Arc<LoopbackTransport>) -> Arc<SyncContext> {
    let cache = Arc::new(LocalCache::open(Arc::new(db.partition(CF_CACHE)), CacheConfig::default()).unwrap());
    SyncContext::new(transport, cache, Arc::new(db.partition(CF_QUEUE)), QueueConfig::for_testing()).unwrap()
}

// ─── Client Restart ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_queued_mutations_survive_client_restart() {
    let dir = tempdir().unwrap();
    let server = start_server();

    let temp_path = {
        let db = RocksDb::open(StoreConfig::for_testing(dir.path())).unwrap();
        let link = LoopbackTransport::connect(Arc::clone(&server), "alice").await;
        link.set_online(false).await;
        let ctx = durable_client(&db, Arc::clone(&link));

        let gorilla = Document::create("animals", fields_of(json!({"name": "gorilla", "legs": 8})));
        let replica = DocumentReplica::new(&ctx, &gorilla);
        replica.keep_synced().await.unwrap();
        gorilla.set(fields_of(json!({"legs": 2})), SetOptions::default());
        assert_eq!(ctx.queue().len(), 2);

        let path = gorilla.key_path();
        drop(replica);
        drop(ctx);
        link.close().await;
        path
    };

    let db = RocksDb::open(StoreConfig::for_testing(dir.path())).unwrap();
    let link = LoopbackTransport::connect(Arc::clone(&server), "alice").await;
    link.set_online(false).await;
    let ctx = durable_client(&db, Arc::clone(&link));
    assert_eq!(ctx.queue().len(), 2);

    // Still offline: the optimistic copy answers from the cache.
    let cached = ctx.queue().fetch(&temp_path).await.unwrap();
    assert_eq!(cached["legs"], json!(2));

    let assigned = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&assigned);
    ctx.queue().on("id:", move |event| {
        if let QueueEvent::IdAssigned { key_path, .. } = event {
            *sink.lock().unwrap() = Some(key_path.clone());
        }
    });

    link.set_online(true).await;
    ctx.sync().await.unwrap();
    assert!(ctx.queue().is_empty());

    let key_path = assigned.lock().unwrap().clone().expect("create should be delivered");
    let stored = server.store().fetch(&key_path, &StoreOptions::default()).await.unwrap();
    assert_eq!(stored["name"], json!("gorilla"));
    assert_eq!(stored["legs"], json!(2));
}

#[tokio::test]
async fn test_cache_size_is_recovered_on_reopen() {
    let dir = tempdir().unwrap();
    let size = {
        let db = RocksDb::open(StoreConfig::for_testing(dir.path())).unwrap();
        let cache = LocalCache::open(Arc::new(db.partition(CF_CACHE)), CacheConfig::for_testing()).unwrap();
        cache.set_json("doc:animals:1", &json!({"name": "tiger"})).unwrap();
        cache.set_json("doc:animals:2", &json!({"name": "owl"})).unwrap();
        cache.size()
    };

    let db = RocksDb::open(StoreConfig::for_testing(dir.path())).unwrap();
    let cache = LocalCache::open(Arc::new(db.partition(CF_CACHE)), CacheConfig::for_testing()).unwrap();
    assert_eq!(cache.size(), size);
    let owl: serde_json::Value = cache.get_json("doc:animals:2").unwrap();
    assert_eq!(owl, json!({"name": "owl"}));
}

// ─── Server Restart ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_server_store_survives_restart() {
    let dir = tempdir().unwrap();
    let config = ServerConfig {
        storage_path: Some(dir.path().join("db")),
        ..ServerConfig::for_testing("127.0.0.1:0")
    };
    let opts = StoreOptions::default();
    let animals = KeyPath::from(["animals"]);

    let id = {
        let server = SocketServer::open(config.clone()).unwrap();
        server.server().store().create(&animals, json!({"name": "yak"}), &opts).await.unwrap()
    };

    let server = SocketServer::open(config).unwrap();
    let doc = server.server().store().fetch(&animals.child(id.clone()), &opts).await.unwrap();
    assert_eq!(doc, json!({"_id": id, "name": "yak"}));
}

#[tokio::test]
async fn test_ownership_survives_restart() {
    let dir = tempdir().unwrap();
    let config = ServerConfig {
        storage_path: Some(dir.path().join("db")),
        rights: RightsPolicy::Owner,
        ..ServerConfig::for_testing("127.0.0.1:0")
    };
    let animals = KeyPath::from(["animals"]);
    let alice = Caller::new("alice", "c-alice");
    let bob = Caller::new("bob", "c-bob");

    let kp = {
        let server = SocketServer::open(config.clone()).unwrap();
        let id = server.server().create(&alice, &animals, json!({"name": "yak"})).await.unwrap();
        animals.child(id)
    };

    let server = SocketServer::open(config).unwrap();
    let err = server.server().put(&bob, &kp, json!({"name": "ox"})).await.unwrap_err();
    assert!(matches!(err, SyncError::Authorization { .. }));
    server.server().put(&alice, &kp, json!({"legs": 4})).await.unwrap();
    let doc = server.server().fetch(&bob, &kp).await.unwrap();
    assert_eq!(doc["name"], json!("yak"));
    assert_eq!(doc["legs"], json!(4));
}
