//! Client transports: the remote store as seen from a replica.
//!
//! [`SocketClient`] speaks the WebSocket protocol:
//! ```text
//!   request() ──► pending[req_id] = oneshot ──► outgoing mpsc ──► writer task ──► socket
//!                                                                                  │
//!   TransportEvent ◄── event mpsc ◄── reader task ◄── response / push / ready ◄────┘
//! ```
//!
//! While disconnected every request fails fast with [`SyncError::Network`],
//! which leaves the mutation queue stalled until the next `Connected` event.

use crate::protocol::{ClientFrame, Operation, PushEvent, Reply, ServerFrame};
use crate::store::{InsertedItem, Query, RemoteStore, SequenceEntry, StoreOptions};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use ginger_core::event::lock;
use ginger_core::{KeyPath, Result, SyncError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Push(PushEvent),
}

/// A [`RemoteStore`] that can also observe key paths and reports
/// connectivity through [`TransportEvent`]s.
#[async_trait]
pub trait Transport: RemoteStore {
    fn client_id(&self) -> &str;

    fn is_connected(&self) -> bool;

    async fn observe(&self, key_path: &KeyPath) -> Result<()>;

    async fn unobserve(&self, key_path: &KeyPath) -> Result<()>;

    /// The event stream. Only the first caller gets it.
    fn take_event_rx(&self) -> Option<mpsc::Receiver<TransportEvent>>;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `ws://host:port`
    pub server_url: String,
    pub user_id: String,
    pub request_timeout: Duration,
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            user_id: "anonymous".to_string(),
            request_timeout: Duration::from_secs(10),
            event_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn for_testing(server_url: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            user_id: user_id.into(),
            request_timeout: Duration::from_secs(2),
            event_capacity: 64,
        }
    }
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Reply>>>>>;

pub struct SocketClient {
    config: ClientConfig,
    client_id: String,
    state: Arc<RwLock<ConnectionState>>,
    connected: Arc<std::sync::atomic::AtomicBool>,
    outgoing_tx: Arc<Mutex<Option<mpsc::Sender<Message>>>>,
    pending: Pending,
    next_req: AtomicU64,
    event_tx: mpsc::Sender<TransportEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

impl SocketClient {
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        Self {
            config,
            client_id: Uuid::new_v4().to_string(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            connected: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            outgoing_tx: Arc::new(Mutex::new(None)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_req: AtomicU64::new(1),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Open the socket, say hello and wait for `ready`.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
            }
        }
        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.config.server_url.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(SyncError::Network(format!("connect to {} failed: {}", self.config.server_url, e)));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if ws_writer.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        let (ready_tx, ready_rx) = oneshot::channel::<String>();
        let event_tx = self.event_tx.clone();
        let state = Arc::clone(&self.state);
        let connected = Arc::clone(&self.connected);
        let outgoing = Arc::clone(&self.outgoing_tx);
        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            let mut ready_tx = Some(ready_tx);
            while let Some(msg) = ws_reader.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let frame = match ServerFrame::decode(text.as_str()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::warn!("undecodable server frame: {e}");
                        continue;
                    }
                };
                match frame {
                    ServerFrame::Ready { connection_id } => {
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(connection_id);
                        }
                    }
                    ServerFrame::Response { req_id, result } => {
                        if let Some(tx) = lock(&pending).remove(&req_id) {
                            let _ = tx.send(result);
                        }
                    }
                    ServerFrame::Push { event } => {
                        let _ = event_tx.send(TransportEvent::Push(event)).await;
                    }
                }
            }

            connected.store(false, Ordering::SeqCst);
            *lock(&outgoing) = None;
            for (_, tx) in lock(&pending).drain() {
                let _ = tx.send(Err(SyncError::Network("connection lost".into())));
            }
            *state.write().await = ConnectionState::Disconnected;
            log::info!("disconnected from server");
            let _ = event_tx.send(TransportEvent::Disconnected).await;
        });

        let hello = ClientFrame::Hello { user_id: self.config.user_id.clone(), client_id: self.client_id.clone() };
        out_tx
            .send(Message::Text(hello.encode()?.into()))
            .await
            .map_err(|_| SyncError::Network("socket closed during handshake".into()))?;

        let connection_id = match tokio::time::timeout(self.config.request_timeout, ready_rx).await {
            Ok(Ok(id)) => id,
            _ => {
                let _ = out_tx.send(Message::Close(None)).await;
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(SyncError::Network("no ready from server".into()));
            }
        };

        *lock(&self.outgoing_tx) = Some(out_tx);
        self.connected.store(true, Ordering::SeqCst);
        *self.state.write().await = ConnectionState::Connected;
        log::info!("connected to {} as {}", self.config.server_url, connection_id);
        let _ = self.event_tx.send(TransportEvent::Connected).await;
        Ok(())
    }

    pub async fn reconnect(&self) -> Result<()> {
        *self.state.write().await = ConnectionState::Reconnecting;
        self.connect().await
    }

    /// Close the socket. The reader task reports `Disconnected`.
    pub async fn disconnect(&self) {
        let tx = lock(&self.outgoing_tx).take();
        self.connected.store(false, Ordering::SeqCst);
        if let Some(tx) = tx {
            let _ = tx.send(Message::Close(None)).await;
        }
    }

    async fn roundtrip(&self, build: impl FnOnce(u64) -> ClientFrame) -> Result<Reply> {
        let Some(tx) = lock(&self.outgoing_tx).clone() else {
            return Err(SyncError::Network("not connected".into()));
        };
        let req_id = self.next_req.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&self.pending).insert(req_id, reply_tx);

        let frame = build(req_id).encode()?;
        if tx.send(Message::Text(frame.into())).await.is_err() {
            lock(&self.pending).remove(&req_id);
            return Err(SyncError::Network("not connected".into()));
        }
        match tokio::time::timeout(self.config.request_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::Network("connection lost".into())),
            Err(_) => {
                lock(&self.pending).remove(&req_id);
                Err(SyncError::Network(format!("request {} timed out", req_id)))
            }
        }
    }

    async fn request(&self, op: Operation) -> Result<Reply> {
        self.roundtrip(|req_id| ClientFrame::Request { req_id, op }).await
    }
}

fn unexpected(reply: Reply) -> SyncError {
    SyncError::Protocol(format!("unexpected reply {:?}", reply))
}

#[async_trait]
impl RemoteStore for SocketClient {
    async fn create(&self, key_path: &KeyPath, doc: Value, _opts: &StoreOptions) -> Result<String> {
        match self.request(Operation::Create { key_path: key_path.clone(), doc }).await? {
            Reply::Id(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    async fn put(&self, key_path: &KeyPath, doc: Value, _opts: &StoreOptions) -> Result<()> {
        match self.request(Operation::Put { key_path: key_path.clone(), doc }).await? {
            Reply::Unit => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn fetch(&self, key_path: &KeyPath, _opts: &StoreOptions) -> Result<Value> {
        match self.request(Operation::Fetch { key_path: key_path.clone() }).await? {
            Reply::Doc(doc) => Ok(doc),
            other => Err(unexpected(other)),
        }
    }

    async fn del(&self, key_path: &KeyPath, _opts: &StoreOptions) -> Result<()> {
        match self.request(Operation::Del { key_path: key_path.clone() }).await? {
            Reply::Unit => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn add(&self, key_path: &KeyPath, items_key_path: &KeyPath, item_ids: &[String], _opts: &StoreOptions) -> Result<()> {
        let op = Operation::Add {
            key_path: key_path.clone(),
            items_key_path: items_key_path.clone(),
            item_ids: item_ids.to_vec(),
        };
        match self.request(op).await? {
            Reply::Unit => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn remove(&self, key_path: &KeyPath, items_key_path: &KeyPath, item_ids: &[String], _opts: &StoreOptions) -> Result<()> {
        let op = Operation::Remove {
            key_path: key_path.clone(),
            items_key_path: items_key_path.clone(),
            item_ids: item_ids.to_vec(),
        };
        match self.request(op).await? {
            Reply::Unit => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn find(&self, key_path: &KeyPath, query: &Query, _opts: &StoreOptions) -> Result<Vec<Value>> {
        match self.request(Operation::Find { key_path: key_path.clone(), query: query.clone() }).await? {
            Reply::Docs(docs) => Ok(docs),
            other => Err(unexpected(other)),
        }
    }

    async fn all(&self, key_path: &KeyPath, query: &Query, _opts: &StoreOptions) -> Result<Vec<SequenceEntry>> {
        match self.request(Operation::All { key_path: key_path.clone(), query: query.clone() }).await? {
            Reply::Entries(entries) => Ok(entries),
            other => Err(unexpected(other)),
        }
    }

    async fn next(&self, key_path: &KeyPath, id: Option<&str>, _opts: &StoreOptions) -> Result<Option<SequenceEntry>> {
        let op = Operation::Next { key_path: key_path.clone(), id: id.map(str::to_string) };
        match self.request(op).await? {
            Reply::Entry(entry) => Ok(entry),
            other => Err(unexpected(other)),
        }
    }

    async fn insert_before(
        &self,
        key_path: &KeyPath,
        ref_id: Option<&str>,
        item_key_path: &KeyPath,
        _opts: &StoreOptions,
    ) -> Result<InsertedItem> {
        let op = Operation::InsertBefore {
            key_path: key_path.clone(),
            ref_id: ref_id.map(str::to_string),
            item_key_path: item_key_path.clone(),
        };
        match self.request(op).await? {
            Reply::Inserted(item) => Ok(item),
            other => Err(unexpected(other)),
        }
    }

    async fn delete_item(&self, key_path: &KeyPath, id: &str, _opts: &StoreOptions) -> Result<()> {
        match self.request(Operation::DeleteItem { key_path: key_path.clone(), id: id.to_string() }).await? {
            Reply::Unit => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait]
impl Transport for SocketClient {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn observe(&self, key_path: &KeyPath) -> Result<()> {
        let key_path = key_path.clone();
        self.roundtrip(|req_id| ClientFrame::Observe { req_id, key_path }).await.map(|_| ())
    }

    async fn unobserve(&self, key_path: &KeyPath) -> Result<()> {
        let key_path = key_path.clone();
        self.roundtrip(|req_id| ClientFrame::Unobserve { req_id, key_path }).await.map(|_| ())
    }

    fn take_event_rx(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        lock(&self.event_rx).take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.server_url, "ws://127.0.0.1:9090");
        assert_eq!(config.request_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_requests_fail_fast_while_disconnected() {
        let client = SocketClient::new(ClientConfig::for_testing("ws://127.0.0.1:1", "alice"));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        let err = client.fetch(&KeyPath::parse("animals/1"), &StoreOptions::default()).await.unwrap_err();
        assert!(err.is_transient());
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_is_a_network_error() {
        let client = SocketClient::new(ClientConfig::for_testing("ws://127.0.0.1:1", "alice"));
        assert!(matches!(client.connect().await, Err(SyncError::Network(_))));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(!client.is_connected());
    }
}
