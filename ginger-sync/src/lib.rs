//! # ginger-sync: offline-first sync for ginger documents
//!
//! Client queue and cache, the server that owns the authoritative store,
//! and the relay that pushes changes to observing clients.
//!
//! ## Architecture
//!
//! ```text
//!  client                                        server
//! ┌────────────────┐                          ┌─────────────────┐
//! │ Replica        │                          │ Server          │
//! │  └ Collection/ │   MutationRecord         │  RightsGate     │
//! │    Sequence    │ ──► MutationQueue ─────► │  RemoteStore    │
//! └───────▲────────┘     (journal, cache)     │  SyncHub ──┐    │
//!         │                                   └────────────┼────┘
//!         │  push (nosync)                                 │ RelayBus
//! ┌───────┴────────┐        Transport          ┌───────────▼────┐
//! │ SyncManager    │ ◄───────────────────────  │ rooms → outbox │
//! └────────────────┘   WebSocket / loopback    └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`storage`] : key-value backends (memory, RocksDB column families)
//! - [`cache`] : size-bounded LRU cache over a backend
//! - [`store`] : the remote store contract plus memory and RocksDB stores
//! - [`queue`] : durable mutation queue with id rewriting and replay
//! - [`rights`] : authorization gate and rule-based implementation
//! - [`protocol`] : relay payloads and JSON socket frames
//! - [`hub`] : room-based relay with echo suppression
//! - [`server`] : request orchestration and the WebSocket server
//! - [`client`] : WebSocket transport
//! - [`loopback`] : in-process transport for tests and embedding
//! - [`manager`] : observation counts and push dispatch on the client
//! - [`context`] : per-client wiring and the shared document registry
//! - [`replica`] : document, collection and sequence bindings

pub mod cache;
pub mod client;
pub mod context;
pub mod hub;
pub mod loopback;
pub mod manager;
pub mod protocol;
pub mod queue;
pub mod replica;
pub mod rights;
pub mod server;
pub mod storage;
pub mod store;

pub use cache::{CacheConfig, LocalCache};
pub use client::{ClientConfig, ConnectionState, SocketClient, Transport, TransportEvent};
pub use context::SyncContext;
pub use hub::{BusMessage, HubConfig, HubStats, LocalBus, RelayBus, RoomManager, SyncHub};
pub use loopback::LoopbackTransport;
pub use manager::{PushTarget, SyncManager, TargetId};
pub use protocol::{ClientFrame, Notification, Operation, PushEvent, RelayMessage, Reply, ServerFrame};
pub use queue::{MutationQueue, QueueConfig, QueueEntry, QueueEvent, Snapshot};
pub use replica::{CollectionReplica, DocumentReplica, SequenceReplica};
pub use rights::{AllowAll, KeyPathPattern, Predicate, Right, RightsGate, RightsRule, RuleGate};
pub use server::{Caller, RightsPolicy, Server, ServerConfig, ServerStats, SocketServer};
pub use storage::{Batch, KvBackend, MemoryBackend, RocksBackend, RocksDb, StoreConfig};
pub use store::{InsertedItem, MemoryStore, Query, RemoteStore, RocksStore, SequenceEntry, StoreOptions};
