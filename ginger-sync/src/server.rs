//! Authoritative server: verb orchestration and the WebSocket front end.
//!
//! Every mutating verb runs the same pipeline:
//! ```text
//!   check_rights ──► RemoteStore ──► rights side effect ──► SyncHub publish
//!        │ deny          │ err              │ err                 │ err
//!        ▼               ▼                  ▼                     ▼
//!   Authorization    propagated      RightsUpdateFailed     logged only
//! ```
//!
//! [`SocketServer`] accepts WebSocket connections, one task per connection:
//! ```text
//!  Client A ──┐                 ┌── Server ── RemoteStore (RocksDB / memory)
//!             ├── SocketServer ─┤
//!  Client B ──┘                 └── SyncHub ── rooms ── outboxes
//! ```

use crate::hub::{HubConfig, HubStats, SyncHub};
use crate::protocol::{ClientFrame, Operation, PushEvent, Reply, ServerFrame};
use crate::rights::{AllowAll, Right, RightsGate, RuleGate};
use crate::storage::rocks::CF_RIGHTS;
use crate::storage::{KvBackend, MemoryBackend, RocksDb, StoreConfig};
use crate::store::{InsertedItem, MemoryStore, Query, RemoteStore, RocksStore, SequenceEntry, StoreOptions};
use futures_util::{SinkExt, StreamExt};
use ginger_core::{KeyPath, Result, SyncError};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Who is asking: the authenticated user and the replica that sent the
/// request. Notifications caused by a request are not echoed to its client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub client_id: String,
}

impl Caller {
    pub fn new(user_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), client_id: client_id.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub failed_requests: u64,
    pub relay_deliveries: u64,
    pub dropped_deliveries: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    failed_requests: AtomicU64,
}

pub struct Server {
    store: Arc<dyn RemoteStore>,
    rights: Arc<dyn RightsGate>,
    hub: Option<Arc<SyncHub>>,
    stats: AtomicServerStats,
}

impl Server {
    /// Server over `store`, authorizing through `rights`. Without a hub nothing is relayed.
    pub fn new(store: Arc<dyn RemoteStore>, rights: Arc<dyn RightsGate>, hub: Option<Arc<SyncHub>>) -> Self {
        Self { store, rights, hub, stats: AtomicServerStats::default() }
    }

    pub fn hub(&self) -> Option<&Arc<SyncHub>> {
        self.hub.as_ref()
    }

    /// The authoritative document store.
    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    async fn authorize(&self, caller: &Caller, key_path: &KeyPath, right: Right) -> Result<()> {
        if self.rights.check_rights(&caller.user_id, key_path, right).await? {
            Ok(())
        } else {
            log::info!("{} denied {} on {}", caller.user_id, right, key_path);
            Err(SyncError::Authorization {
                user_id: caller.user_id.clone(),
                right: right.to_string(),
                key_path: key_path.clone(),
            })
        }
    }

    /// Surface a failed rights update after the store accepted the write.
    fn rights_updated(key_path: &KeyPath, result: Result<()>) -> Result<()> {
        result.map_err(|e| {
            log::error!("rights update after write to {} failed: {}", key_path, e);
            SyncError::RightsUpdateFailed { key_path: key_path.clone(), reason: e.to_string() }
        })
    }

    fn published(key_path: &KeyPath, result: Result<usize>) {
        match result {
            Ok(_) => {}
            Err(e) => log::error!("publish for {} failed: {}", key_path, e),
        }
    }

    /// Create a document in the bucket at `key_path` and make the caller its
    /// owner. Not relayed; containers announce it through `add` or `insertBefore`.
    pub async fn create(&self, caller: &Caller, key_path: &KeyPath, doc: Value) -> Result<String> {
        self.authorize(caller, key_path, Right::Create).await?;
        let id = self.store.create(key_path, doc, &StoreOptions::default()).await?;
        let doc_path = key_path.child(id.clone());
        Self::rights_updated(&doc_path, self.rights.create(&caller.user_id, &doc_path).await)?;
        log::debug!("{} created {}", caller.client_id, doc_path);
        Ok(id)
    }

    /// Merge `doc` into an existing document and relay `update:`.
    pub async fn put(&self, caller: &Caller, key_path: &KeyPath, doc: Value) -> Result<()> {
        self.authorize(caller, key_path, Right::Put).await?;
        self.store.put(key_path, doc.clone(), &StoreOptions::default()).await?;
        Self::rights_updated(key_path, self.rights.put(&caller.user_id, key_path).await)?;
        if let Some(hub) = &self.hub {
            Self::published(key_path, hub.update(&caller.client_id, key_path, doc).await);
        }
        Ok(())
    }

    /// Read one document. Needs [`Right::Get`].
    pub async fn fetch(&self, caller: &Caller, key_path: &KeyPath) -> Result<Value> {
        self.authorize(caller, key_path, Right::Get).await?;
        self.store.fetch(key_path, &StoreOptions::default()).await
    }

    /// Delete a document and relay `delete:`.
    pub async fn del(&self, caller: &Caller, key_path: &KeyPath) -> Result<()> {
        self.authorize(caller, key_path, Right::Del).await?;
        self.store.del(key_path, &StoreOptions::default()).await?;
        Self::rights_updated(key_path, self.rights.del(&caller.user_id, key_path).await)?;
        if let Some(hub) = &self.hub {
            Self::published(key_path, hub.delete(&caller.client_id, key_path).await);
        }
        Ok(())
    }

    /// Add members to a collection and relay `add:`.
    pub async fn add(&self, caller: &Caller, key_path: &KeyPath, items_key_path: &KeyPath, item_ids: &[String]) -> Result<()> {
        self.authorize(caller, key_path, Right::Put).await?;
        self.store.add(key_path, items_key_path, item_ids, &StoreOptions::default()).await?;
        Self::rights_updated(key_path, self.rights.add(&caller.user_id, key_path, items_key_path, item_ids).await)?;
        if let Some(hub) = &self.hub {
            Self::published(key_path, hub.add(&caller.client_id, key_path, items_key_path, item_ids).await);
        }
        Ok(())
    }

    /// Remove members from a collection and relay `remove:`. Needs [`Right::Del`].
    pub async fn remove(&self, caller: &Caller, key_path: &KeyPath, items_key_path: &KeyPath, item_ids: &[String]) -> Result<()> {
        self.authorize(caller, key_path, Right::Del).await?;
        self.store.remove(key_path, items_key_path, item_ids, &StoreOptions::default()).await?;
        Self::rights_updated(key_path, self.rights.remove(&caller.user_id, key_path, items_key_path, item_ids).await)?;
        if let Some(hub) = &self.hub {
            Self::published(key_path, hub.remove(&caller.client_id, key_path, items_key_path, item_ids).await);
        }
        Ok(())
    }

    /// Collection members matching `query`.
    pub async fn find(&self, caller: &Caller, key_path: &KeyPath, query: &Query) -> Result<Vec<Value>> {
        self.authorize(caller, key_path, Right::Get).await?;
        self.store.find(key_path, query, &StoreOptions::default()).await
    }

    /// Sequence items in order, filtered by `query`.
    pub async fn all(&self, caller: &Caller, key_path: &KeyPath, query: &Query) -> Result<Vec<SequenceEntry>> {
        self.authorize(caller, key_path, Right::Get).await?;
        self.store.all(key_path, query, &StoreOptions::default()).await
    }

    /// The item after `id`, or the first item when `id` is `None`.
    pub async fn next(&self, caller: &Caller, key_path: &KeyPath, id: Option<&str>) -> Result<Option<SequenceEntry>> {
        self.authorize(caller, key_path, Right::Get).await?;
        self.store.next(key_path, id, &StoreOptions::default()).await
    }

    /// Insert `item_key_path` before `ref_id` (append when `None`) and relay
    /// `insertBefore:` with the server item id.
    pub async fn insert_before(
        &self,
        caller: &Caller,
        key_path: &KeyPath,
        ref_id: Option<&str>,
        item_key_path: &KeyPath,
    ) -> Result<InsertedItem> {
        self.authorize(caller, key_path, Right::Put).await?;
        let item = self.store.insert_before(key_path, ref_id, item_key_path, &StoreOptions::default()).await?;
        if let Some(hub) = &self.hub {
            Self::published(
                key_path,
                hub.insert_before(&caller.client_id, key_path, &item.id, item_key_path, ref_id).await,
            );
        }
        Ok(item)
    }

    /// Remove a sequence item and relay `deleteItem:`. Needs [`Right::Del`].
    pub async fn delete_item(&self, caller: &Caller, key_path: &KeyPath, id: &str) -> Result<()> {
        self.authorize(caller, key_path, Right::Del).await?;
        self.store.delete_item(key_path, id, &StoreOptions::default()).await?;
        if let Some(hub) = &self.hub {
            Self::published(key_path, hub.delete_item(&caller.client_id, key_path, id).await);
        }
        Ok(())
    }

    /// Run one wire operation.
    pub async fn execute(&self, caller: &Caller, op: Operation) -> Result<Reply> {
        let result = match op {
            Operation::Create { key_path, doc } => self.create(caller, &key_path, doc).await.map(Reply::Id),
            Operation::Put { key_path, doc } => self.put(caller, &key_path, doc).await.map(|_| Reply::Unit),
            Operation::Fetch { key_path } => self.fetch(caller, &key_path).await.map(Reply::Doc),
            Operation::Del { key_path } => self.del(caller, &key_path).await.map(|_| Reply::Unit),
            Operation::Add { key_path, items_key_path, item_ids } => {
                self.add(caller, &key_path, &items_key_path, &item_ids).await.map(|_| Reply::Unit)
            }
            Operation::Remove { key_path, items_key_path, item_ids } => {
                self.remove(caller, &key_path, &items_key_path, &item_ids).await.map(|_| Reply::Unit)
            }
            Operation::Find { key_path, query } => self.find(caller, &key_path, &query).await.map(Reply::Docs),
            Operation::All { key_path, query } => self.all(caller, &key_path, &query).await.map(Reply::Entries),
            Operation::Next { key_path, id } => self.next(caller, &key_path, id.as_deref()).await.map(Reply::Entry),
            Operation::InsertBefore { key_path, ref_id, item_key_path } => self
                .insert_before(caller, &key_path, ref_id.as_deref(), &item_key_path)
                .await
                .map(Reply::Inserted),
            Operation::DeleteItem { key_path, id } => self.delete_item(caller, &key_path, &id).await.map(|_| Reply::Unit),
        };
        if result.is_err() {
            self.stats.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Connection and request counters merged with the hub's.
    pub async fn stats(&self) -> ServerStats {
        let hub = match &self.hub {
            Some(hub) => hub.stats().await,
            None => HubStats::default(),
        };
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            failed_requests: self.stats.failed_requests.load(Ordering::Relaxed),
            relay_deliveries: hub.deliveries,
            dropped_deliveries: hub.dropped_deliveries,
            active_rooms: hub.active_rooms,
        }
    }
}

/// Which rights gate [`SocketServer::open`] installs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RightsPolicy {
    /// Every request is allowed.
    #[default]
    Open,
    /// [`RuleGate::owner_policy`], with owners kept next to the documents.
    Owner,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB directory (None = in-memory store)
    pub storage_path: Option<PathBuf>,
    /// Pushes buffered per connection
    pub outbox_capacity: usize,
    /// Relay bus capacity
    pub bus_capacity: usize,
    /// Rights gate for incoming requests
    pub rights: RightsPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            outbox_capacity: 256,
            bus_capacity: 1024,
            rights: RightsPolicy::Open,
        }
    }
}

impl ServerConfig {
    /// Config for testing (in-memory store, small buffers).
    pub fn for_testing(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            storage_path: None,
            outbox_capacity: 16,
            bus_capacity: 64,
            rights: RightsPolicy::Open,
        }
    }

    fn hub_config(&self) -> HubConfig {
        HubConfig { outbox_capacity: self.outbox_capacity, bus_capacity: self.bus_capacity }
    }
}

/// WebSocket front end for a [`Server`].
pub struct SocketServer {
    config: ServerConfig,
    server: Arc<Server>,
}

impl SocketServer {
    /// Open the configured store and start the hub. With a storage path the
    /// owner table of [`RightsPolicy::Owner`] lives in the `rights` column
    /// family; use [`SocketServer::with_parts`] for any other gate.
    pub fn open(config: ServerConfig) -> Result<Self> {
        let (store, owners): (Arc<dyn RemoteStore>, Arc<dyn KvBackend>) = match &config.storage_path {
            Some(path) => {
                let db = RocksDb::open(StoreConfig { path: path.clone(), ..StoreConfig::default() })?;
                log::info!("opened document store at {}", path.display());
                (Arc::new(RocksStore::new(&db)), Arc::new(db.partition(CF_RIGHTS)))
            }
            None => (Arc::new(MemoryStore::new()), Arc::new(MemoryBackend::new())),
        };
        let rights: Arc<dyn RightsGate> = match config.rights {
            RightsPolicy::Open => Arc::new(AllowAll),
            RightsPolicy::Owner => Arc::new(RuleGate::owner_policy(owners)),
        };
        log::info!("rights policy: {:?}", config.rights);
        Ok(Self::with_parts(config, store, rights))
    }

    /// Must be called inside a tokio runtime; the hub spawns its relay task.
    pub fn with_parts(config: ServerConfig, store: Arc<dyn RemoteStore>, rights: Arc<dyn RightsGate>) -> Self {
        let hub = SyncHub::local(config.hub_config(), Some(Arc::clone(&rights)));
        let server = Arc::new(Server::new(store, rights, Some(hub)));
        Self { config, server }
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Accept connections until the listener fails. One task per connection.
    pub async fn run(&self) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("ginger server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");
            let server = Arc::clone(&self.server);
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, server).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        server: Arc<Server>,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        server.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        server.stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let mut caller: Option<Caller> = None;
        let mut connection_id: Option<String> = None;
        let mut push_rx: Option<mpsc::Receiver<PushEvent>> = None;

        let outcome = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("connection closed from {addr}");
                            break Ok(());
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                            continue;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break Ok(());
                        }
                        Some(Ok(_)) => continue,
                    };
                    server.stats.total_messages.fetch_add(1, Ordering::Relaxed);
                    server.stats.total_bytes.fetch_add(text.len() as u64, Ordering::Relaxed);

                    let frame = match ClientFrame::decode(text.as_str()) {
                        Ok(frame) => frame,
                        Err(e) => {
                            log::warn!("undecodable frame from {addr}: {e}");
                            continue;
                        }
                    };
                    let reply = match frame {
                        ClientFrame::Hello { user_id, client_id } => {
                            let Some(hub) = server.hub() else { continue };
                            if let Some(old) = connection_id.take() {
                                hub.disconnect(&old).await;
                            }
                            let (id, rx) = hub.connect(&user_id, &client_id).await;
                            log::info!("{addr} is user {user_id}, client {client_id}");
                            caller = Some(Caller::new(user_id, client_id));
                            connection_id = Some(id.clone());
                            push_rx = Some(rx);
                            ServerFrame::Ready { connection_id: id }
                        }
                        ClientFrame::Observe { req_id, key_path } => {
                            let result = match (server.hub(), &connection_id) {
                                (Some(hub), Some(id)) => hub.observe(id, &key_path).await.map(|_| Reply::Unit),
                                _ => Err(SyncError::Protocol("observe before hello".into())),
                            };
                            ServerFrame::Response { req_id, result }
                        }
                        ClientFrame::Unobserve { req_id, key_path } => {
                            if let (Some(hub), Some(id)) = (server.hub(), &connection_id) {
                                hub.unobserve(id, &key_path).await;
                            }
                            ServerFrame::Response { req_id, result: Ok(Reply::Unit) }
                        }
                        ClientFrame::Request { req_id, op } => {
                            let result = match &caller {
                                Some(caller) => server.execute(caller, op).await,
                                None => Err(SyncError::Protocol("request before hello".into())),
                            };
                            ServerFrame::Response { req_id, result }
                        }
                    };
                    let encoded = match reply.encode() {
                        Ok(encoded) => encoded,
                        Err(e) => {
                            log::error!("failed to encode reply for {addr}: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = ws_sender.send(Message::Text(encoded.into())).await {
                        break Err(e.into());
                    }
                }

                push = async {
                    match push_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    let Some(event) = push else {
                        push_rx = None;
                        continue;
                    };
                    log::trace!("push {} to {addr}", event.event_name());
                    match (ServerFrame::Push { event }).encode() {
                        Ok(encoded) => {
                            if let Err(e) = ws_sender.send(Message::Text(encoded.into())).await {
                                break Err(e.into());
                            }
                        }
                        Err(e) => log::error!("failed to encode push for {addr}: {e}"),
                    }
                }
            }
        };

        if let (Some(hub), Some(id)) = (server.hub(), &connection_id) {
            hub.disconnect(id).await;
        }
        server.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        outcome
    }
}
