//! Server-side relay from the mutation bus to observing connections.
//!
//! ```text
//!  Server verb ──publish──► RelayBus ──► relay task (one per hub)
//!                                           │ room = keyPath.join(':')
//!                                           ▼
//!                                     RoomManager ─► Room { connection ids }
//!                                           │
//!                   ┌───────────────────────┼────────────────────┐
//!                   ▼                       ▼                    ▼
//!             outbox (conn A)         outbox (conn B)      (originator skipped)
//! ```
//!
//! Each connection has a bounded outbox. A full outbox drops the push and
//! counts it; the observer recovers through resync. The single relay task
//! keeps delivery ordered per room.

use crate::protocol::{Notification, PushEvent, RelayMessage};
use crate::rights::{Right, RightsGate};
use async_trait::async_trait;
use ginger_core::{KeyPath, Result, SyncError};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Pushes buffered per connection before new ones are dropped
    pub outbox_capacity: usize,
    /// Messages buffered on the local bus before the relay task lags
    pub bus_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self { outbox_capacity: 256, bus_capacity: 1024 }
    }
}

impl HubConfig {
    /// Config for testing (small outboxes and bus).
    pub fn for_testing() -> Self {
        Self { outbox_capacity: 16, bus_capacity: 64 }
    }
}

/// A raw bus message: channel name plus JSON payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

/// Publish/subscribe transport between server verbs and the relay.
#[async_trait]
pub trait RelayBus: Send + Sync {
    /// Returns the number of subscribers that will see the message.
    async fn publish(&self, message: BusMessage) -> Result<usize>;

    fn subscribe(&self) -> broadcast::Receiver<Arc<BusMessage>>;
}

/// In-process bus on a tokio broadcast channel.
pub struct LocalBus {
    sender: broadcast::Sender<Arc<BusMessage>>,
}

impl LocalBus {
    /// Bus buffering up to `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

#[async_trait]
impl RelayBus for LocalBus {
    async fn publish(&self, message: BusMessage) -> Result<usize> {
        Ok(self.sender.send(Arc::new(message)).unwrap_or(0))
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<BusMessage>> {
        self.sender.subscribe()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub messages_published: u64,
    pub deliveries: u64,
    pub dropped_deliveries: u64,
    pub active_rooms: usize,
    pub active_connections: usize,
}

#[derive(Default)]
struct AtomicHubStats {
    messages_published: AtomicU64,
    deliveries: AtomicU64,
    dropped_deliveries: AtomicU64,
}

/// Connection ids observing one key path.
#[derive(Default)]
pub struct Room {
    members: RwLock<HashSet<String>>,
}

impl Room {
    /// Add a member. Returns false if it was already there.
    pub async fn join(&self, connection_id: &str) -> bool {
        self.members.write().await.insert(connection_id.to_string())
    }

    /// Remove a member. Returns false if it was not there.
    pub async fn leave(&self, connection_id: &str) -> bool {
        self.members.write().await.remove(connection_id)
    }

    /// Snapshot of the member connection ids.
    pub async fn members(&self) -> Vec<String> {
        self.members.read().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.read().await.is_empty()
    }
}

/// Room key → room. Rooms exist while at least one connection observes them.
#[derive(Default)]
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The room for `room_key`, if anyone observes it.
    pub async fn get(&self, room_key: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_key).cloned()
    }

    /// The room for `room_key`, created empty if missing.
    pub async fn get_or_create(&self, room_key: &str) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_key) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Another task may have created it between the two locks.
        if let Some(room) = rooms.get(room_key) {
            return room.clone();
        }
        let room = Arc::new(Room::default());
        rooms.insert(room_key.to_string(), room.clone());
        room
    }

    /// Add `connection_id` to the room, creating it if needed. Runs under
    /// the map's write lock so a concurrent [`RoomManager::remove_if_empty`]
    /// cannot drop the room between lookup and join.
    pub async fn join(&self, room_key: &str, connection_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        rooms.entry(room_key.to_string()).or_default().join(connection_id).await
    }

    /// Drop the room once its last member left. Returns true if removed.
    pub async fn remove_if_empty(&self, room_key: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_key) {
            if room.is_empty().await {
                rooms.remove(room_key);
                return true;
            }
        }
        false
    }

    /// Number of open rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn room_keys(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

struct Connection {
    user_id: String,
    client_id: String,
    outbox: mpsc::Sender<PushEvent>,
    observing: HashSet<String>,
}

pub struct SyncHub {
    config: HubConfig,
    bus: Arc<dyn RelayBus>,
    rights: Option<Arc<dyn RightsGate>>,
    rooms: RoomManager,
    connections: RwLock<HashMap<String, Connection>>,
    stats: AtomicHubStats,
}

impl SyncHub {
    /// Create the hub and spawn its relay task. Must be called inside a
    /// tokio runtime. With `rights`, observing requires [`Right::Get`].
    pub fn start(bus: Arc<dyn RelayBus>, config: HubConfig, rights: Option<Arc<dyn RightsGate>>) -> Arc<Self> {
        let hub = Arc::new(Self {
            config,
            bus,
            rights,
            rooms: RoomManager::new(),
            connections: RwLock::new(HashMap::new()),
            stats: AtomicHubStats::default(),
        });
        let rx = hub.bus.subscribe();
        tokio::spawn(Self::relay(Arc::downgrade(&hub), rx));
        hub
    }

    /// Hub with an in-process bus.
    pub fn local(config: HubConfig, rights: Option<Arc<dyn RightsGate>>) -> Arc<Self> {
        let bus = Arc::new(LocalBus::new(config.bus_capacity));
        Self::start(bus, config, rights)
    }

    async fn relay(hub: std::sync::Weak<Self>, mut rx: broadcast::Receiver<Arc<BusMessage>>) {
        loop {
            let message = match rx.recv().await {
                Ok(message) => message,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    log::warn!("relay lagged, {} bus messages lost", missed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Some(hub) = hub.upgrade() else { break };
            match RelayMessage::decode(&message.channel, &message.payload) {
                Ok(msg) => hub.deliver(msg).await,
                Err(e) => log::warn!("dropping malformed {} relay message: {}", message.channel, e),
            }
        }
        log::debug!("relay task stopped");
    }

    /// Register a connection. Pushes for it arrive on the returned receiver.
    pub async fn connect(&self, user_id: &str, client_id: &str) -> (String, mpsc::Receiver<PushEvent>) {
        let connection_id = Uuid::new_v4().to_string();
        let (outbox, rx) = mpsc::channel(self.config.outbox_capacity);
        self.connections.write().await.insert(
            connection_id.clone(),
            Connection {
                user_id: user_id.to_string(),
                client_id: client_id.to_string(),
                outbox,
                observing: HashSet::new(),
            },
        );
        log::debug!("connection {} registered for user {} (client {})", connection_id, user_id, client_id);
        (connection_id, rx)
    }

    /// Subscribe a connection to pushes for `key_path`.
    ///
    /// Joins the room `key_path.room_key()`. Fails with `Authorization` when a
    /// rights gate is set and the user lacks [`Right::Get`].
    pub async fn observe(&self, connection_id: &str, key_path: &KeyPath) -> Result<()> {
        let user_id = {
            let connections = self.connections.read().await;
            let connection = connections
                .get(connection_id)
                .ok_or_else(|| SyncError::NotFound(format!("connection {}", connection_id)))?;
            connection.user_id.clone()
        };
        if let Some(rights) = &self.rights {
            if !rights.check_rights(&user_id, key_path, Right::Get).await? {
                return Err(SyncError::Authorization {
                    user_id,
                    right: Right::Get.to_string(),
                    key_path: key_path.clone(),
                });
            }
        }

        let room_key = key_path.room_key();
        self.rooms.join(&room_key, connection_id).await;
        if let Some(connection) = self.connections.write().await.get_mut(connection_id) {
            connection.observing.insert(room_key.clone());
        }
        log::debug!("{} observes {}", connection_id, room_key);
        Ok(())
    }

    /// Stop pushes for `key_path`. Returns false if the connection was not observing it.
    pub async fn unobserve(&self, connection_id: &str, key_path: &KeyPath) -> bool {
        let room_key = key_path.room_key();
        if let Some(connection) = self.connections.write().await.get_mut(connection_id) {
            connection.observing.remove(&room_key);
        }
        self.leave(connection_id, &room_key).await
    }

    async fn leave(&self, connection_id: &str, room_key: &str) -> bool {
        let Some(room) = self.rooms.get(room_key).await else {
            return false;
        };
        let left = room.leave(connection_id).await;
        if self.rooms.remove_if_empty(room_key).await {
            log::debug!("room {} closed", room_key);
        }
        left
    }

    /// Forget a connection and every room it observed.
    pub async fn disconnect(&self, connection_id: &str) {
        let Some(connection) = self.connections.write().await.remove(connection_id) else {
            return;
        };
        for room_key in &connection.observing {
            self.leave(connection_id, room_key).await;
        }
        log::debug!("connection {} unregistered", connection_id);
    }

    /// Fan a relay message out to the room, skipping the originating client.
    async fn deliver(&self, msg: RelayMessage) {
        let room_key = msg.key_path.room_key();
        let Some(room) = self.rooms.get(&room_key).await else {
            log::trace!("no observers for {}", room_key);
            return;
        };
        let members = room.members().await;
        let connections = self.connections.read().await;
        let event = PushEvent::from(msg.clone());
        for member in members {
            let Some(connection) = connections.get(&member) else { continue };
            if connection.client_id == msg.client_id {
                continue;
            }
            match connection.outbox.try_send(event.clone()) {
                Ok(()) => {
                    self.stats.deliveries.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.stats.dropped_deliveries.fetch_add(1, Ordering::Relaxed);
                    log::warn!("outbox of {} full, dropped {}", member, event.event_name());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    log::debug!("outbox of {} closed", member);
                }
            }
        }
    }

    /// Put a message on the bus. Returns how many subscribers will see it.
    ///
    /// Performance: one JSON encode per message, fan-out happens on the relay task.
    pub async fn publish(&self, msg: RelayMessage) -> Result<usize> {
        let message = BusMessage { channel: msg.channel(), payload: msg.encode()? };
        self.stats.messages_published.fetch_add(1, Ordering::Relaxed);
        log::trace!("publish {} {}", message.channel, msg.key_path);
        self.bus.publish(message).await
    }

    /// Announce a document change on `update:`.
    pub async fn update(&self, client_id: &str, key_path: &KeyPath, doc: Value) -> Result<usize> {
        self.publish(RelayMessage::new(key_path.clone(), client_id, Notification::Update { doc })).await
    }

    /// Announce a document deletion on `delete:`.
    pub async fn delete(&self, client_id: &str, key_path: &KeyPath) -> Result<usize> {
        self.publish(RelayMessage::new(key_path.clone(), client_id, Notification::Delete)).await
    }

    /// Announce new collection members on `add:`.
    pub async fn add(&self, client_id: &str, key_path: &KeyPath, items_key_path: &KeyPath, item_ids: &[String]) -> Result<usize> {
        let notification = Notification::Add { items_key_path: items_key_path.clone(), item_ids: item_ids.to_vec() };
        self.publish(RelayMessage::new(key_path.clone(), client_id, notification)).await
    }

    /// Announce removed collection members on `remove:`.
    pub async fn remove(&self, client_id: &str, key_path: &KeyPath, items_key_path: &KeyPath, item_ids: &[String]) -> Result<usize> {
        let notification = Notification::Remove { items_key_path: items_key_path.clone(), item_ids: item_ids.to_vec() };
        self.publish(RelayMessage::new(key_path.clone(), client_id, notification)).await
    }

    /// Announce a sequence insertion on `insertBefore:`.
    pub async fn insert_before(
        &self,
        client_id: &str,
        key_path: &KeyPath,
        id: &str,
        item_key_path: &KeyPath,
        ref_id: Option<&str>,
    ) -> Result<usize> {
        let notification = Notification::InsertBefore {
            id: id.to_string(),
            item_key_path: item_key_path.clone(),
            ref_id: ref_id.map(str::to_string),
        };
        self.publish(RelayMessage::new(key_path.clone(), client_id, notification)).await
    }

    /// Announce a removed sequence item on `deleteItem:`.
    pub async fn delete_item(&self, client_id: &str, key_path: &KeyPath, id: &str) -> Result<usize> {
        let notification = Notification::DeleteItem { id: id.to_string() };
        self.publish(RelayMessage::new(key_path.clone(), client_id, notification)).await
    }

    /// Counters plus the current room and connection totals.
    pub async fn stats(&self) -> HubStats {
        HubStats {
            messages_published: self.stats.messages_published.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            dropped_deliveries: self.stats.dropped_deliveries.load(Ordering::Relaxed),
            active_rooms: self.rooms.room_count().await,
            active_connections: self.connections.read().await.len(),
        }
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.rooms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_room_manager_get_or_create() {
        let manager = RoomManager::new();
        let a = manager.get_or_create("animals:1").await;
        let b = manager.get_or_create("animals:1").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.room_count().await, 1);

        a.join("c1").await;
        assert!(!manager.remove_if_empty("animals:1").await);
        a.leave("c1").await;
        assert!(manager.remove_if_empty("animals:1").await);
        assert_eq!(manager.room_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_observe_racing_last_leave_keeps_room() {
        let hub = SyncHub::local(HubConfig::for_testing(), None);
        let kp = KeyPath::parse("animals/1");
        let (c1, _rx1) = hub.connect("u1", "c1").await;
        let (c2, _rx2) = hub.connect("u2", "c2").await;

        for _ in 0..200 {
            hub.observe(&c1, &kp).await.unwrap();
            let (observed, _) = tokio::join!(hub.observe(&c2, &kp), hub.unobserve(&c1, &kp));
            observed.unwrap();
            let room = hub.rooms().get(&kp.room_key()).await.expect("room must stay registered");
            assert_eq!(room.members().await, vec![c2.clone()]);
            hub.unobserve(&c2, &kp).await;
            assert_eq!(hub.rooms().room_count().await, 0);
        }
    }

    #[tokio::test]
    async fn test_originator_is_skipped() {
        let hub = SyncHub::local(HubConfig::for_testing(), None);
        let kp = KeyPath::parse("animals/1");
        let (alice, mut alice_rx) = hub.connect("u1", "alice").await;
        let (bob, mut bob_rx) = hub.connect("u2", "bob").await;
        hub.observe(&alice, &kp).await.unwrap();
        hub.observe(&bob, &kp).await.unwrap();

        hub.update("alice", &kp, json!({"legs": 8})).await.unwrap();
        let push = timeout(Duration::from_secs(1), bob_rx.recv()).await.unwrap().unwrap();
        assert_eq!(push.event_name(), "update:animals:1");
        assert!(timeout(Duration::from_millis(50), alice_rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_only_the_room_receives() {
        let hub = SyncHub::local(HubConfig::for_testing(), None);
        let (c1, mut rx1) = hub.connect("u1", "c1").await;
        hub.observe(&c1, &KeyPath::parse("zoo/1/animals")).await.unwrap();

        hub.add("c2", &KeyPath::parse("zoo/2/animals"), &KeyPath::parse("animals"), &["a".into()]).await.unwrap();
        hub.delete_item("c2", &KeyPath::parse("zoo/1/animals"), "i1").await.unwrap();
        let push = timeout(Duration::from_secs(1), rx1.recv()).await.unwrap().unwrap();
        assert_eq!(push.notification, Notification::DeleteItem { id: "i1".into() });
    }

    #[tokio::test]
    async fn test_full_outbox_drops_and_counts() {
        let config = HubConfig { outbox_capacity: 1, bus_capacity: 16 };
        let hub = SyncHub::local(config, None);
        let kp = KeyPath::parse("animals/1");
        let (c1, mut rx) = hub.connect("u1", "c1").await;
        hub.observe(&c1, &kp).await.unwrap();

        hub.delete("c2", &kp).await.unwrap();
        hub.delete("c2", &kp).await.unwrap();
        timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = hub.stats().await;
        assert_eq!(stats.messages_published, 2);
        assert_eq!(stats.deliveries + stats.dropped_deliveries, 2);
    }

    #[tokio::test]
    async fn test_disconnect_closes_rooms() {
        let hub = SyncHub::local(HubConfig::for_testing(), None);
        let (c1, _rx) = hub.connect("u1", "c1").await;
        hub.observe(&c1, &KeyPath::parse("animals/1")).await.unwrap();
        hub.observe(&c1, &KeyPath::parse("animals/2")).await.unwrap();
        assert_eq!(hub.stats().await.active_rooms, 2);
        hub.disconnect(&c1).await;
        let stats = hub.stats().await;
        assert_eq!(stats.active_rooms, 0);
        assert_eq!(stats.active_connections, 0);
    }

    #[tokio::test]
    async fn test_observe_requires_get_right() {
        use crate::rights::{Predicate, RuleGate};
        use crate::storage::MemoryBackend;
        let gate = RuleGate::new(Arc::new(MemoryBackend::new())).allow(Right::Get, "public/**", Predicate::Anyone);
        let hub = SyncHub::local(HubConfig::for_testing(), Some(Arc::new(gate)));
        let (c1, _rx) = hub.connect("u1", "c1").await;
        assert!(hub.observe(&c1, &KeyPath::parse("public/1")).await.is_ok());
        assert!(matches!(
            hub.observe(&c1, &KeyPath::parse("private/1")).await,
            Err(SyncError::Authorization { .. })
        ));
    }
}
