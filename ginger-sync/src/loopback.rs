//! In-process transport that calls a [`Server`] directly.
//!
//! Behaves like a socket that can be unplugged: [`LoopbackTransport::set_online`]
//! toggles connectivity, emitting `Connected` / `Disconnected`. While offline
//! every request fails with [`SyncError::Network`] and pushes are dropped, the
//! same way a dropped socket loses them.

use crate::client::{Transport, TransportEvent};
use crate::server::{Caller, Server};
use crate::store::{InsertedItem, Query, RemoteStore, SequenceEntry, StoreOptions};
use async_trait::async_trait;
use ginger_core::event::lock;
use ginger_core::{KeyPath, Result, SyncError};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

pub struct LoopbackTransport {
    server: Arc<Server>,
    caller: Caller,
    online: Arc<AtomicBool>,
    connection_id: Option<String>,
    event_tx: mpsc::Sender<TransportEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

impl LoopbackTransport {
    /// Register with the server's hub and start forwarding pushes. Starts
    /// online.
    pub async fn connect(server: Arc<Server>, user_id: impl Into<String>) -> Arc<Self> {
        let caller = Caller::new(user_id, Uuid::new_v4().to_string());
        let (event_tx, event_rx) = mpsc::channel(256);
        let online = Arc::new(AtomicBool::new(true));

        let connection_id = match server.hub() {
            Some(hub) => {
                let (id, mut push_rx) = hub.connect(&caller.user_id, &caller.client_id).await;
                let forward_tx = event_tx.clone();
                let forward_online = Arc::clone(&online);
                tokio::spawn(async move {
                    while let Some(event) = push_rx.recv().await {
                        if !forward_online.load(Ordering::SeqCst) {
                            log::trace!("offline, dropping {}", event.event_name());
                            continue;
                        }
                        if forward_tx.send(TransportEvent::Push(event)).await.is_err() {
                            break;
                        }
                    }
                });
                Some(id)
            }
            None => None,
        };

        Arc::new(Self {
            server,
            caller,
            online,
            connection_id,
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        })
    }

    /// User this transport authenticates as.
    pub fn user_id(&self) -> &str {
        &self.caller.user_id
    }

    /// Plug or unplug the connection. Returns false when nothing changed.
    pub async fn set_online(&self, online: bool) -> bool {
        if self.online.swap(online, Ordering::SeqCst) == online {
            return false;
        }
        let event = if online { TransportEvent::Connected } else { TransportEvent::Disconnected };
        log::debug!("loopback {} -> {:?}", self.caller.client_id, event);
        if let Err(e) = self.event_tx.send(event).await {
            log::debug!("no listener for {:?} on {}", e.0, self.caller.client_id);
        }
        true
    }

    /// Leave the hub. Pushes stop arriving.
    pub async fn close(&self) {
        if let (Some(hub), Some(id)) = (self.server.hub(), &self.connection_id) {
            hub.disconnect(id).await;
        }
    }

    fn check_online(&self) -> Result<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::Network("loopback offline".into()))
        }
    }
}

#[async_trait]
impl RemoteStore for LoopbackTransport {
    async fn create(&self, key_path: &KeyPath, doc: Value, _opts: &StoreOptions) -> Result<String> {
        self.check_online()?;
        self.server.create(&self.caller, key_path, doc).await
    }

    async fn put(&self, key_path: &KeyPath, doc: Value, _opts: &StoreOptions) -> Result<()> {
        self.check_online()?;
        self.server.put(&self.caller, key_path, doc).await
    }

    async fn fetch(&self, key_path: &KeyPath, _opts: &StoreOptions) -> Result<Value> {
        self.check_online()?;
        self.server.fetch(&self.caller, key_path).await
    }

    async fn del(&self, key_path: &KeyPath, _opts: &StoreOptions) -> Result<()> {
        self.check_online()?;
        self.server.del(&self.caller, key_path).await
    }

    async fn add(&self, key_path: &KeyPath, items_key_path: &KeyPath, item_ids: &[String], _opts: &StoreOptions) -> Result<()> {
        self.check_online()?;
        self.server.add(&self.caller, key_path, items_key_path, item_ids).await
    }

    async fn remove(&self, key_path: &KeyPath, items_key_path: &KeyPath, item_ids: &[String], _opts: &StoreOptions) -> Result<()> {
        self.check_online()?;
        self.server.remove(&self.caller, key_path, items_key_path, item_ids).await
    }

    async fn find(&self, key_path: &KeyPath, query: &Query, _opts: &StoreOptions) -> Result<Vec<Value>> {
        self.check_online()?;
        self.server.find(&self.caller, key_path, query).await
    }

    async fn all(&self, key_path: &KeyPath, query: &Query, _opts: &StoreOptions) -> Result<Vec<SequenceEntry>> {
        self.check_online()?;
        self.server.all(&self.caller, key_path, query).await
    }

    async fn next(&self, key_path: &KeyPath, id: Option<&str>, _opts: &StoreOptions) -> Result<Option<SequenceEntry>> {
        self.check_online()?;
        self.server.next(&self.caller, key_path, id).await
    }

    async fn insert_before(
        &self,
        key_path: &KeyPath,
        ref_id: Option<&str>,
        item_key_path: &KeyPath,
        _opts: &StoreOptions,
    ) -> Result<InsertedItem> {
        self.check_online()?;
        self.server.insert_before(&self.caller, key_path, ref_id, item_key_path).await
    }

    async fn delete_item(&self, key_path: &KeyPath, id: &str, _opts: &StoreOptions) -> Result<()> {
        self.check_online()?;
        self.server.delete_item(&self.caller, key_path, id).await
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn client_id(&self) -> &str {
        &self.caller.client_id
    }

    fn is_connected(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn observe(&self, key_path: &KeyPath) -> Result<()> {
        self.check_online()?;
        match (self.server.hub(), &self.connection_id) {
            (Some(hub), Some(id)) => hub.observe(id, key_path).await,
            _ => Ok(()),
        }
    }

    async fn unobserve(&self, key_path: &KeyPath) -> Result<()> {
        if let (Some(hub), Some(id)) = (self.server.hub(), &self.connection_id) {
            hub.unobserve(id, key_path).await;
        }
        Ok(())
    }

    fn take_event_rx(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        lock(&self.event_rx).take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{HubConfig, SyncHub};
    use crate::rights::AllowAll;
    use crate::store::MemoryStore;
    use serde_json::json;
    use tokio::time::{timeout, Duration};

    fn server() -> Arc<Server> {
        let hub = SyncHub::local(HubConfig::for_testing(), None);
        Arc::new(Server::new(Arc::new(MemoryStore::new()), Arc::new(AllowAll), Some(hub)))
    }

    #[tokio::test]
    async fn test_offline_requests_are_transient_failures() {
        let transport = LoopbackTransport::connect(server(), "alice").await;
        let mut events = transport.take_event_rx().unwrap();
        assert!(transport.set_online(false).await);
        assert!(!transport.set_online(false).await);
        assert_eq!(events.recv().await, Some(TransportEvent::Disconnected));

        let err = transport.create(&KeyPath::parse("animals"), json!({}), &StoreOptions::default()).await.unwrap_err();
        assert!(err.is_transient());

        transport.set_online(true).await;
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));
        assert!(transport.create(&KeyPath::parse("animals"), json!({}), &StoreOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_toggle_without_listener() {
        let transport = LoopbackTransport::connect(server(), "alice").await;
        drop(transport.take_event_rx());
        assert!(transport.set_online(false).await);
        assert!(!transport.is_connected());
        assert!(transport.set_online(true).await);
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_pushes_reach_other_clients_only() {
        let server = server();
        let alice = LoopbackTransport::connect(Arc::clone(&server), "alice").await;
        let bob = LoopbackTransport::connect(Arc::clone(&server), "bob").await;
        let mut alice_events = alice.take_event_rx().unwrap();
        let mut bob_events = bob.take_event_rx().unwrap();

        let animals = KeyPath::parse("animals");
        let id = alice.create(&animals, json!({"legs": 4}), &StoreOptions::default()).await.unwrap();
        let kp = animals.child(id);
        alice.observe(&kp).await.unwrap();
        bob.observe(&kp).await.unwrap();

        alice.put(&kp, json!({"legs": 8}), &StoreOptions::default()).await.unwrap();
        match timeout(Duration::from_secs(1), bob_events.recv()).await.unwrap() {
            Some(TransportEvent::Push(event)) => assert_eq!(event.key_path, kp),
            other => panic!("expected a push, got {other:?}"),
        }
        assert!(timeout(Duration::from_millis(50), alice_events.recv()).await.is_err());
    }
}
