//! Durable FIFO of client mutations.
//!
//! ```text
//!  replica ──add()──► [journal] ──► VecDeque<QueueEntry> ──exec()──► RemoteStore
//!                        │                                   │
//!                        └── LocalCache (optimistic)         ├─ ok        → pop, fix ids, `delivered:`
//!                                                            ├─ network   → stay at head, stall
//!                                                            ├─ permanent → dead letter, `rejected:`
//!                                                            └─ other     → retry, dead letter after
//!                                                                           `max_attempts`
//! ```
//!
//! Delivery is strictly in order with at most one record in flight. When a
//! create or sequence insert succeeds, every later record that mentions the
//! temporary id is rewritten to the server's id before it is sent.
//!
//! Reads (`fetch`, `find`, `all`, `next`) go to the server first and fall
//! back to the cache when the network is unavailable. A successful `find` or
//! `all` refreshes the cache and emits `resync:<room>`.
//!
//! Events (see [`QueueEvent`]): `id:`, `delivered:`, `rejected:`,
//! `stalled:`, `synced:`, `resync:<room>`.

pub mod journal;
mod offline;

pub use journal::{JournalEntry, QueueJournal};

use crate::cache::LocalCache;
use crate::store::{InsertedItem, Query, RemoteStore, SequenceEntry, StoreOptions};
use crate::storage::KvBackend;
use ginger_core::event::lock;
use ginger_core::{EventKey, Emitter, KeyPath, ListenerId, MutationRecord, MutationSink, Payload, Result, SyncError};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Deliveries of one record that may fail with an unclassified error
    /// before it is set aside.
    pub max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

impl QueueConfig {
    /// Config for testing (few attempts before a record is blocked).
    pub fn for_testing() -> Self {
        Self { max_attempts: 2 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub sequence: u64,
    pub record: MutationRecord,
    pub attempts: u32,
    pub in_flight: bool,
    pub last_error: Option<SyncError>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    Documents(Vec<Value>),
    Items(Vec<SequenceEntry>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    IdAssigned { old_id: String, new_id: String, key_path: KeyPath },
    Delivered { sequence: u64, record: MutationRecord },
    Rejected { sequence: u64, record: MutationRecord, error: SyncError },
    Stalled { sequence: u64, error: SyncError },
    Resync { key_path: KeyPath, snapshot: Snapshot },
    Synced,
}

enum Outcome {
    Done,
    Created { cid: String, id: String },
    Inserted { temp_id: String, item: InsertedItem },
}

pub struct MutationQueue {
    client_id: String,
    config: QueueConfig,
    cache: Arc<LocalCache>,
    remote: Arc<dyn RemoteStore>,
    journal: QueueJournal,
    entries: Mutex<VecDeque<QueueEntry>>,
    dead_letters: Mutex<Vec<QueueEntry>>,
    next_sequence: AtomicU64,
    exec_lock: tokio::sync::Mutex<()>,
    emitter: Emitter<QueueEvent>,
}

impl MutationQueue {
    /// Open the queue, replaying any records left in the journal.
    pub fn open(
        client_id: impl Into<String>,
        cache: Arc<LocalCache>,
        remote: Arc<dyn RemoteStore>,
        journal_backend: Arc<dyn KvBackend>,
        config: QueueConfig,
    ) -> Result<Self> {
        let journal = QueueJournal::new(journal_backend);
        let recovered = journal.recover()?;
        let next_sequence = recovered.last().map(|r| r.sequence + 1).unwrap_or(1);
        if !recovered.is_empty() {
            log::info!("recovered {} queued mutations", recovered.len());
        }
        let entries = recovered
            .into_iter()
            .map(|r| QueueEntry {
                sequence: r.sequence,
                record: r.record,
                attempts: r.attempts,
                in_flight: false,
                last_error: None,
            })
            .collect();
        Ok(Self {
            client_id: client_id.into(),
            config,
            cache,
            remote,
            journal,
            entries: Mutex::new(entries),
            dead_letters: Mutex::new(Vec::new()),
            next_sequence: AtomicU64::new(next_sequence),
            exec_lock: tokio::sync::Mutex::new(()),
            emitter: Emitter::new(),
        })
    }

    /// Client id stamped on records this queue sends.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Cache holding the optimistic copies of queued writes.
    pub fn cache(&self) -> &Arc<LocalCache> {
        &self.cache
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    /// Number of records waiting, including one in flight.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Snapshot of pending entries, head first.
    pub fn entries(&self) -> Vec<QueueEntry> {
        lock(&self.entries).iter().cloned().collect()
    }

    /// Records the server refused or that ran out of attempts.
    pub fn dead_letters(&self) -> Vec<QueueEntry> {
        lock(&self.dead_letters).clone()
    }

    /// Drop every pending entry and its journal frame.
    pub fn clear(&self) -> Result<()> {
        let drained: Vec<QueueEntry> = lock(&self.entries).drain(..).collect();
        for entry in drained {
            self.journal.remove(entry.sequence)?;
        }
        Ok(())
    }

    /// Persist `record` and append it. The journal write completes before
    /// this returns; the cache is updated optimistically.
    pub fn add(&self, record: MutationRecord) -> Result<u64> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        self.journal.write(sequence, 0, &record)?;
        if let Err(e) = offline::apply(&self.cache, &record) {
            log::warn!("optimistic cache update for {} {} failed: {}", record.verb(), record.key_path, e);
        }
        log::debug!("queued #{} {} {}", sequence, record.verb(), record.key_path);
        lock(&self.entries).push_back(QueueEntry {
            sequence,
            record,
            attempts: 0,
            in_flight: false,
            last_error: None,
        });
        Ok(sequence)
    }

    /// Deliver queued records in order until the queue is empty or a
    /// delivery stalls. Returns how many were delivered. A call made while a
    /// drain is already running returns `Ok(0)` immediately; the running
    /// drain picks up whatever was added.
    pub async fn exec(&self) -> Result<usize> {
        let Ok(_guard) = self.exec_lock.try_lock() else {
            return Ok(0);
        };
        let mut delivered = 0;
        loop {
            let head = {
                let mut entries = lock(&self.entries);
                match entries.front_mut() {
                    Some(entry) => {
                        entry.in_flight = true;
                        entry.clone()
                    }
                    None => break,
                }
            };

            match self.deliver(&head.record).await {
                Ok(outcome) => {
                    self.complete(&head, outcome)?;
                    delivered += 1;
                }
                Err(error) if error.is_transient() => {
                    self.record_failure(head.sequence, &error)?;
                    log::info!("queue stalled at #{}: {}", head.sequence, error);
                    self.emitter.emit("stalled:", &QueueEvent::Stalled { sequence: head.sequence, error: error.clone() });
                    return Err(error);
                }
                Err(error) if error.is_permanent() => {
                    self.reject(head, error)?;
                }
                Err(error) => {
                    let attempts = self.record_failure(head.sequence, &error)?;
                    if attempts >= self.config.max_attempts {
                        let blocked = SyncError::QueueBlocked {
                            sequence: head.sequence,
                            reason: error.to_string(),
                        };
                        self.reject(head, blocked)?;
                    } else {
                        log::warn!("delivery of #{} failed ({}/{}): {}", head.sequence, attempts, self.config.max_attempts, error);
                        self.emitter.emit("stalled:", &QueueEvent::Stalled { sequence: head.sequence, error: error.clone() });
                        return Err(error);
                    }
                }
            }
        }
        if delivered > 0 {
            log::debug!("queue drained after {} deliveries", delivered);
        }
        self.emitter.emit("synced:", &QueueEvent::Synced);
        Ok(delivered)
    }

    async fn deliver(&self, record: &MutationRecord) -> Result<Outcome> {
        let opts = StoreOptions::default();
        let kp = &record.key_path;
        let items_kp = || {
            record
                .items_key_path
                .as_ref()
                .ok_or_else(|| SyncError::Protocol(format!("{} on {} without itemsKeyPath", record.verb(), kp)))
        };
        match &record.payload {
            Payload::Create { cid, doc } => {
                let id = self.remote.create(kp, doc.clone(), &opts).await?;
                Ok(Outcome::Created { cid: cid.clone(), id })
            }
            Payload::Put { doc } => self.remote.put(kp, doc.clone(), &opts).await.map(|_| Outcome::Done),
            Payload::Del => self.remote.del(kp, &opts).await.map(|_| Outcome::Done),
            Payload::Add { item_ids } => self.remote.add(kp, items_kp()?, item_ids, &opts).await.map(|_| Outcome::Done),
            Payload::Remove { item_ids } => {
                self.remote.remove(kp, items_kp()?, item_ids, &opts).await.map(|_| Outcome::Done)
            }
            Payload::InsertBefore { ref_id, item_key_path, item_id } => {
                let item = self.remote.insert_before(kp, ref_id.as_deref(), item_key_path, &opts).await?;
                Ok(Outcome::Inserted { temp_id: item_id.clone(), item })
            }
            Payload::DeleteItem { id } => self.remote.delete_item(kp, id, &opts).await.map(|_| Outcome::Done),
        }
    }

    /// Pop `head` after a successful delivery and propagate server ids.
    fn complete(&self, head: &QueueEntry, outcome: Outcome) -> Result<()> {
        self.pop_head(head.sequence)?;
        match outcome {
            Outcome::Done => {}
            Outcome::Created { cid, id } => {
                if let Err(e) = offline::promote_doc(&self.cache, &head.record.key_path, &cid, &id) {
                    log::warn!("cache promotion of {} failed: {}", cid, e);
                }
                self.fix_queue(&cid, &id)?;
                self.emitter.emit(
                    "id:",
                    &QueueEvent::IdAssigned { old_id: cid, new_id: id.clone(), key_path: head.record.key_path.child(id) },
                );
            }
            Outcome::Inserted { temp_id, item } => {
                self.fix_queue(&temp_id, &item.id)?;
                self.emitter.emit(
                    "id:",
                    &QueueEvent::IdAssigned {
                        old_id: temp_id,
                        new_id: item.id,
                        key_path: head.record.key_path.clone(),
                    },
                );
            }
        }
        log::trace!("delivered #{} {} {}", head.sequence, head.record.verb(), head.record.key_path);
        self.emitter.emit(
            "delivered:",
            &QueueEvent::Delivered { sequence: head.sequence, record: head.record.clone() },
        );
        Ok(())
    }

    /// Drop a delivered head, journal frame first. If the frame cannot be
    /// removed the entry stays at the head and is delivered again.
    fn pop_head(&self, sequence: u64) -> Result<()> {
        if let Err(e) = self.journal.remove(sequence) {
            if let Some(entry) = lock(&self.entries).iter_mut().find(|e| e.sequence == sequence) {
                entry.in_flight = false;
            }
            log::error!("journal removal of #{} failed: {}", sequence, e);
            return Err(e);
        }
        let mut entries = lock(&self.entries);
        if entries.front().map(|e| e.sequence) == Some(sequence) {
            entries.pop_front();
        }
        Ok(())
    }

    fn record_failure(&self, sequence: u64, error: &SyncError) -> Result<u32> {
        let (attempts, record) = {
            let mut entries = lock(&self.entries);
            let Some(entry) = entries.iter_mut().find(|e| e.sequence == sequence) else {
                return Ok(0);
            };
            entry.in_flight = false;
            entry.attempts += 1;
            entry.last_error = Some(error.clone());
            (entry.attempts, entry.record.clone())
        };
        self.journal.write(sequence, attempts, &record)?;
        Ok(attempts)
    }

    fn reject(&self, mut head: QueueEntry, error: SyncError) -> Result<()> {
        self.pop_head(head.sequence)?;
        log::warn!("rejected #{} {} {}: {}", head.sequence, head.record.verb(), head.record.key_path, error);
        head.in_flight = false;
        head.last_error = Some(error.clone());
        lock(&self.dead_letters).push(head.clone());
        self.emitter.emit(
            "rejected:",
            &QueueEvent::Rejected { sequence: head.sequence, record: head.record, error },
        );
        Ok(())
    }

    /// Rewrite `old` to `new` in every queued record and the cached lists.
    /// Returns the number of records changed.
    pub fn fix_queue(&self, old: &str, new: &str) -> Result<usize> {
        let rewritten: Vec<(u64, u32, MutationRecord)> = {
            let mut entries = lock(&self.entries);
            entries
                .iter_mut()
                .filter_map(|e| e.record.rewrite_id(old, new).then(|| (e.sequence, e.attempts, e.record.clone())))
                .collect()
        };
        for (sequence, attempts, record) in &rewritten {
            self.journal.write(*sequence, *attempts, record)?;
        }
        if let Err(e) = offline::rewrite_lists(&self.cache, old, new) {
            log::warn!("cache id rewrite {} -> {} failed: {}", old, new, e);
        }
        if !rewritten.is_empty() {
            log::debug!("rewrote {} queued records {} -> {}", rewritten.len(), old, new);
        }
        Ok(rewritten.len())
    }

    /// Read a document from the server and cache it. Falls back to the cached
    /// copy when the server is unreachable.
    pub async fn fetch(&self, key_path: &KeyPath) -> Result<Value> {
        match self.remote.fetch(key_path, &StoreOptions::default()).await {
            Ok(doc) => {
                if let Err(e) = offline::store_doc(&self.cache, key_path, &doc) {
                    log::debug!("not caching {}: {}", key_path, e);
                }
                Ok(doc)
            }
            Err(e) if e.is_transient() => offline::load_doc(&self.cache, key_path).map_err(|_| e),
            Err(e) => Err(e),
        }
    }

    /// Members of a collection whose items live under `items_key_path`.
    /// Only an unfiltered read is cached and announced as `resync:<room>`.
    pub async fn find(&self, key_path: &KeyPath, items_key_path: &KeyPath, query: &Query) -> Result<Vec<Value>> {
        match self.remote.find(key_path, query, &StoreOptions::default()).await {
            Ok(docs) => {
                // A filtered result is not the whole membership.
                if query.is_empty() {
                    if let Err(e) = offline::store_collection(&self.cache, key_path, items_key_path, &docs) {
                        log::debug!("not caching {}: {}", key_path, e);
                    }
                    self.emitter.emit(
                        EventKey::namespaced("resync", key_path.room_key()),
                        &QueueEvent::Resync { key_path: key_path.clone(), snapshot: Snapshot::Documents(docs.clone()) },
                    );
                }
                Ok(docs)
            }
            Err(e) if e.is_transient() => offline::load_collection(&self.cache, key_path, query).map_err(|_| e),
            Err(e) => Err(e),
        }
    }

    /// Items of a sequence in server order. Only an unfiltered read is
    /// cached and announced as `resync:<room>`.
    pub async fn all(&self, key_path: &KeyPath, query: &Query) -> Result<Vec<SequenceEntry>> {
        match self.remote.all(key_path, query, &StoreOptions::default()).await {
            Ok(entries) => {
                if query.is_empty() {
                    if let Err(e) = offline::store_sequence(&self.cache, key_path, &entries) {
                        log::debug!("not caching {}: {}", key_path, e);
                    }
                    self.emitter.emit(
                        EventKey::namespaced("resync", key_path.room_key()),
                        &QueueEvent::Resync { key_path: key_path.clone(), snapshot: Snapshot::Items(entries.clone()) },
                    );
                }
                Ok(entries)
            }
            Err(e) if e.is_transient() => offline::load_sequence(&self.cache, key_path, query).map_err(|_| e),
            Err(e) => Err(e),
        }
    }

    /// The item after `id` (or the first one), remote first, cache when offline.
    pub async fn next(&self, key_path: &KeyPath, id: Option<&str>) -> Result<Option<SequenceEntry>> {
        match self.remote.next(key_path, id, &StoreOptions::default()).await {
            Ok(entry) => Ok(entry),
            Err(e) if e.is_transient() => {
                let items = offline::load_sequence(&self.cache, key_path, &Query::new()).map_err(|_| e)?;
                let start = match id {
                    None => 0,
                    Some(id) => match items.iter().position(|i| i.id == id) {
                        Some(at) => at + 1,
                        None => return Err(SyncError::NotFound(format!("item {} in {}", id, key_path))),
                    },
                };
                Ok(items.into_iter().nth(start))
            }
            Err(e) => Err(e),
        }
    }

    /// Listen for queue events (`id:`, `delivered:`, `rejected:`, `stalled:`,
    /// `synced:` and `resync:<room>`).
    pub fn on<F>(&self, key: impl Into<EventKey>, handler: F) -> ListenerId
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.emitter.on(key, handler)
    }

    /// Remove a listener added with [`MutationQueue::on`].
    pub fn off(&self, id: ListenerId) -> bool {
        self.emitter.off(id)
    }
}

impl MutationSink for MutationQueue {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn submit(&self, record: MutationRecord) -> Result<u64> {
        self.add(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::storage::MemoryBackend;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    /// Store wrapper that can be switched offline or made to fail.
    struct Flaky {
        inner: MemoryStore,
        online: AtomicBool,
        fail_puts: Mutex<Option<SyncError>>,
    }

    impl Flaky {
        fn new() -> Self {
            Self { inner: MemoryStore::new(), online: AtomicBool::new(true), fail_puts: Mutex::new(None) }
        }

        fn check(&self) -> Result<()> {
            if self.online.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(SyncError::Network("offline".into()))
            }
        }
    }

    #[async_trait]
    impl RemoteStore for Flaky {
        async fn create(&self, kp: &KeyPath, doc: Value, o: &StoreOptions) -> Result<String> {
            self.check()?;
            self.inner.create(kp, doc, o).await
        }
        async fn put(&self, kp: &KeyPath, doc: Value, o: &StoreOptions) -> Result<()> {
            self.check()?;
            if let Some(e) = lock(&self.fail_puts).clone() {
                return Err(e);
            }
            self.inner.put(kp, doc, o).await
        }
        async fn fetch(&self, kp: &KeyPath, o: &StoreOptions) -> Result<Value> {
            self.check()?;
            self.inner.fetch(kp, o).await
        }
        async fn del(&self, kp: &KeyPath, o: &StoreOptions) -> Result<()> {
            self.check()?;
            self.inner.del(kp, o).await
        }
        async fn add(&self, kp: &KeyPath, ikp: &KeyPath, ids: &[String], o: &StoreOptions) -> Result<()> {
            self.check()?;
            self.inner.add(kp, ikp, ids, o).await
        }
        async fn remove(&self, kp: &KeyPath, ikp: &KeyPath, ids: &[String], o: &StoreOptions) -> Result<()> {
            self.check()?;
            self.inner.remove(kp, ikp, ids, o).await
        }
        async fn find(&self, kp: &KeyPath, q: &Query, o: &StoreOptions) -> Result<Vec<Value>> {
            self.check()?;
            self.inner.find(kp, q, o).await
        }
        async fn all(&self, kp: &KeyPath, q: &Query, o: &StoreOptions) -> Result<Vec<SequenceEntry>> {
            self.check()?;
            self.inner.all(kp, q, o).await
        }
        async fn next(&self, kp: &KeyPath, id: Option<&str>, o: &StoreOptions) -> Result<Option<SequenceEntry>> {
            self.check()?;
            self.inner.next(kp, id, o).await
        }
        async fn insert_before(&self, kp: &KeyPath, r: Option<&str>, ikp: &KeyPath, o: &StoreOptions) -> Result<InsertedItem> {
            self.check()?;
            self.inner.insert_before(kp, r, ikp, o).await
        }
        async fn delete_item(&self, kp: &KeyPath, id: &str, o: &StoreOptions) -> Result<()> {
            self.check()?;
            self.inner.delete_item(kp, id, o).await
        }
    }

    /// Journal backend whose deletes can be made to fail.
    struct StickyJournal {
        inner: MemoryBackend,
        fail_deletes: AtomicBool,
    }

    impl KvBackend for StickyJournal {
        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
            self.inner.get(key)
        }
        fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
            self.inner.put(key, value)
        }
        fn delete(&self, key: &[u8]) -> Result<()> {
            if self.fail_deletes.load(Ordering::SeqCst) {
                return Err(SyncError::Storage("journal delete failed".into()));
            }
            self.inner.delete(key)
        }
        fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
            self.inner.scan_prefix(prefix)
        }
        fn apply(&self, batch: crate::storage::Batch) -> Result<()> {
            self.inner.apply(batch)
        }
    }

    fn queue_with(remote: Arc<Flaky>, journal: Arc<dyn KvBackend>) -> MutationQueue {
        let cache = Arc::new(LocalCache::open(Arc::new(MemoryBackend::new()), CacheConfig::default()).unwrap());
        MutationQueue::open("c1", cache, remote, journal, QueueConfig::for_testing()).unwrap()
    }

    fn animals() -> KeyPath {
        KeyPath::from(["animals"])
    }

    #[tokio::test]
    async fn test_create_then_put_rewrites_temporary_id() {
        let remote = Arc::new(Flaky::new());
        let queue = queue_with(remote.clone(), Arc::new(MemoryBackend::new()));
        let assigned = Arc::new(Mutex::new(Vec::new()));
        let a = Arc::clone(&assigned);
        queue.on("id:", move |e| {
            if let QueueEvent::IdAssigned { old_id, new_id, .. } = e {
                lock(&a).push((old_id.clone(), new_id.clone()));
            }
        });

        queue.add(MutationRecord::create(animals(), "cid1", json!({"legs": 4}), "c1")).unwrap();
        queue.add(MutationRecord::put(animals().child("cid1"), json!({"legs": 8}), "c1")).unwrap();
        assert_eq!(queue.exec().await.unwrap(), 2);
        assert!(queue.is_empty());

        let (old, new) = lock(&assigned)[0].clone();
        assert_eq!(old, "cid1");
        let doc = remote.inner.fetch(&animals().child(new), &StoreOptions::default()).await.unwrap();
        assert_eq!(doc["legs"], 8);
    }

    #[tokio::test]
    async fn test_network_failure_stalls_without_loss() {
        let remote = Arc::new(Flaky::new());
        remote.online.store(false, Ordering::SeqCst);
        let queue = queue_with(remote.clone(), Arc::new(MemoryBackend::new()));

        queue.add(MutationRecord::create(animals(), "cid1", json!({}), "c1")).unwrap();
        queue.add(MutationRecord::create(animals(), "cid2", json!({}), "c1")).unwrap();
        assert!(matches!(queue.exec().await, Err(SyncError::Network(_))));
        assert!(matches!(queue.exec().await, Err(SyncError::Network(_))));
        assert_eq!(queue.len(), 2);
        assert!(queue.dead_letters().is_empty());
        let head = &queue.entries()[0];
        assert_eq!(head.attempts, 2);
        assert!(!head.in_flight);

        remote.online.store(true, Ordering::SeqCst);
        assert_eq!(queue.exec().await.unwrap(), 2);
        assert_eq!(remote.inner.document_count(), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_moves_to_dead_letters() {
        let remote = Arc::new(Flaky::new());
        let queue = queue_with(remote.clone(), Arc::new(MemoryBackend::new()));
        let rejected = Arc::new(Mutex::new(0));
        let r = Arc::clone(&rejected);
        queue.on("rejected:", move |_| *lock(&r) += 1);

        queue.add(MutationRecord::put(animals().child("missing"), json!({"x": 1}), "c1")).unwrap();
        queue.add(MutationRecord::create(animals(), "cid1", json!({}), "c1")).unwrap();
        assert_eq!(queue.exec().await.unwrap(), 1);
        assert_eq!(*lock(&rejected), 1);
        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert!(matches!(dead[0].last_error, Some(SyncError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_unclassified_error_blocks_after_max_attempts() {
        let remote = Arc::new(Flaky::new());
        let queue = queue_with(remote.clone(), Arc::new(MemoryBackend::new()));
        *lock(&remote.fail_puts) = Some(SyncError::Storage("disk".into()));

        queue.add(MutationRecord::put(animals().child("x"), json!({}), "c1")).unwrap();
        assert!(matches!(queue.exec().await, Err(SyncError::Storage(_))));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.exec().await.unwrap(), 0);
        assert!(queue.is_empty());
        assert!(matches!(queue.dead_letters()[0].last_error, Some(SyncError::QueueBlocked { .. })));
    }

    #[tokio::test]
    async fn test_failed_journal_removal_keeps_entry_queued() {
        let remote = Arc::new(Flaky::new());
        let journal = Arc::new(StickyJournal { inner: MemoryBackend::new(), fail_deletes: AtomicBool::new(true) });
        let queue = queue_with(remote.clone(), journal.clone());

        queue.add(MutationRecord::create(animals(), "cid1", json!({"n": 1}), "c1")).unwrap();
        assert!(matches!(queue.exec().await, Err(SyncError::Storage(_))));
        assert_eq!(queue.len(), 1);
        assert!(!queue.entries()[0].in_flight);
        assert_eq!(journal.scan_prefix(b"q/").unwrap().len(), 1);

        journal.fail_deletes.store(false, Ordering::SeqCst);
        assert_eq!(queue.exec().await.unwrap(), 1);
        assert!(queue.is_empty());
        assert!(journal.scan_prefix(b"q/").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_journal_survives_restart() {
        let remote = Arc::new(Flaky::new());
        remote.online.store(false, Ordering::SeqCst);
        let journal: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new());
        {
            let queue = queue_with(remote.clone(), Arc::clone(&journal));
            queue.add(MutationRecord::create(animals(), "cid1", json!({"n": 1}), "c1")).unwrap();
            queue.add(MutationRecord::create(animals(), "cid2", json!({"n": 2}), "c1")).unwrap();
        }
        remote.online.store(true, Ordering::SeqCst);
        let queue = queue_with(remote.clone(), journal);
        assert_eq!(queue.len(), 2);
        let next = queue.add(MutationRecord::create(animals(), "cid3", json!({"n": 3}), "c1")).unwrap();
        assert_eq!(next, 3);
        assert_eq!(queue.exec().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_reads_fall_back_to_cache_offline() {
        let remote = Arc::new(Flaky::new());
        let queue = queue_with(remote.clone(), Arc::new(MemoryBackend::new()));
        let zoo = KeyPath::from(["zoo", "1", "animals"]);
        let id = remote.inner.create(&animals(), json!({"name": "ant"}), &StoreOptions::default()).await.unwrap();
        remote.inner.add(&zoo, &animals(), &[id.clone()], &StoreOptions::default()).await.unwrap();

        let online = queue.find(&zoo, &animals(), &Query::new()).await.unwrap();
        remote.online.store(false, Ordering::SeqCst);
        let offline = queue.find(&zoo, &animals(), &Query::new()).await.unwrap();
        assert_eq!(online, offline);
        assert_eq!(queue.fetch(&animals().child(id)).await.unwrap()["name"], "ant");
        assert!(matches!(queue.fetch(&animals().child("zzz")).await, Err(SyncError::Network(_))));
    }

    #[tokio::test]
    async fn test_insert_before_rewrites_later_references() {
        let remote = Arc::new(Flaky::new());
        let queue = queue_with(remote.clone(), Arc::new(MemoryBackend::new()));
        let parade = KeyPath::from(["parade", "1", "animals"]);
        let a = remote.inner.create(&animals(), json!({"name": "a"}), &StoreOptions::default()).await.unwrap();
        let b = remote.inner.create(&animals(), json!({"name": "b"}), &StoreOptions::default()).await.unwrap();

        queue.add(MutationRecord::insert_before(parade.clone(), None, animals().child(a), "tmp-a", "c1")).unwrap();
        queue.add(MutationRecord::insert_before(parade.clone(), Some("tmp-a".into()), animals().child(b), "tmp-b", "c1")).unwrap();
        assert_eq!(queue.exec().await.unwrap(), 2);

        let names: Vec<Value> = remote
            .inner
            .all(&parade, &Query::new(), &StoreOptions::default())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.doc["name"].clone())
            .collect();
        assert_eq!(names, vec![json!("b"), json!("a")]);
    }
}
