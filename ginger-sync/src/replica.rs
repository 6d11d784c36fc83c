//! Bindings between the core models and a [`SyncContext`].
//!
//! A replica owns the listeners that turn local changes into queued
//! mutations and applies server pushes with `nosync`, so remote changes
//! never bounce back as new mutations.
//!
//! | replica             | local → queue              | push → model                    |
//! |---------------------|----------------------------|---------------------------------|
//! | [`DocumentReplica`]   | `changed:` put, `deleted:` del | `update` set, `delete` mark deleted |
//! | [`CollectionReplica`] | add / remove via the sink  | `add` fetch + apply, `remove`   |
//! | [`SequenceReplica`]   | insertBefore / deleteItem  | `insertBefore`, `deleteItem`    |
//!
//! Collections and sequences also follow `resync:<room>` events from the
//! queue, so any successful read of their key path refreshes them.

use crate::context::SyncContext;
use crate::manager::{PushTarget, TargetId};
use crate::protocol::{Notification, PushEvent};
use crate::queue::{MutationQueue, QueueEvent, Snapshot};
use crate::store::{Query, SequenceEntry};
use async_trait::async_trait;
use ginger_core::event::lock;
use ginger_core::{
    fields_of, Collection, CollectionEvent, DocumentEvent, DocumentRef, EventKey, KeyPath, ListenerId, MutationRecord,
    MutationSink, Payload, Result, Sequence, SequenceEvent, SetOptions, SyncError,
};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

fn sink(queue: &Arc<MutationQueue>) -> Arc<dyn MutationSink> {
    Arc::clone(queue) as Arc<dyn MutationSink>
}

fn release(doc: &DocumentRef) {
    if let Err(e) = doc.release() {
        log::warn!("{}", e);
    }
}

/// Bookkeeping shared by the three replicas.
#[derive(Default)]
struct Binding {
    /// `resync:` listener, kept for the replica's whole life.
    resync: Option<ListenerId>,
    queue_listeners: Vec<ListenerId>,
    model_listeners: Vec<ListenerId>,
    target: Option<TargetId>,
    observed: Option<KeyPath>,
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

pub struct DocumentReplica {
    ctx: Arc<SyncContext>,
    doc: DocumentRef,
    binding: Mutex<Binding>,
    this: Weak<DocumentReplica>,
}

impl DocumentReplica {
    /// Bind `doc`. The replica holds its own reference until dropped.
    pub fn new(ctx: &Arc<SyncContext>, doc: &DocumentRef) -> Arc<Self> {
        doc.retain();
        ctx.register(doc);
        Arc::new_cyclic(|this| Self {
            ctx: Arc::clone(ctx),
            doc: Arc::clone(doc),
            binding: Mutex::new(Binding::default()),
            this: this.clone(),
        })
    }

    /// Fetch `key_path` and bind the result.
    pub async fn load(ctx: &Arc<SyncContext>, key_path: &KeyPath) -> Result<Arc<Self>> {
        let doc = ctx.fetch_document(key_path).await?;
        let replica = Self::new(ctx, &doc);
        release(&doc);
        Ok(replica)
    }

    /// The mirrored document.
    pub fn doc(&self) -> &DocumentRef {
        &self.doc
    }

    pub fn is_kept_synced(&self) -> bool {
        !lock(&self.binding).model_listeners.is_empty()
    }

    /// Queue the document's creation if it was never persisted, turn later
    /// local changes into mutations and observe the server copy once it has
    /// an id.
    pub async fn keep_synced(&self) -> Result<()> {
        if self.is_kept_synced() {
            return Ok(());
        }
        let queue = self.ctx.queue();
        if !self.doc.is_persisted() && self.doc.mark_queued() {
            let bucket = KeyPath::new([self.doc.bucket()]);
            queue.add(MutationRecord::create(bucket, self.doc.cid(), self.doc.to_value(), queue.client_id()))?;
        }

        let changed = {
            let queue = Arc::clone(queue);
            let doc = Arc::downgrade(&self.doc);
            self.doc.on("changed:", move |event| {
                let (Some(doc), DocumentEvent::Changed { fields, nosync: false }) = (doc.upgrade(), event) else {
                    return;
                };
                let record = MutationRecord::put(doc.key_path(), Value::Object(fields.clone()), queue.client_id());
                if let Err(e) = queue.add(record) {
                    log::error!("failed to queue put of {}: {}", doc.key_path(), e);
                }
            })
        };
        let deleted = {
            let queue = Arc::clone(queue);
            let doc = Arc::downgrade(&self.doc);
            self.doc.on("deleted:", move |event| {
                let (Some(doc), DocumentEvent::Deleted { nosync: false }) = (doc.upgrade(), event) else {
                    return;
                };
                if let Err(e) = queue.add(MutationRecord::del(doc.key_path(), queue.client_id())) {
                    log::error!("failed to queue delete of {}: {}", doc.key_path(), e);
                }
            })
        };
        let assigned = {
            let this = self.this.clone();
            self.doc.on("id:", move |_| {
                let Some(replica) = this.upgrade() else {
                    return;
                };
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            if let Err(e) = replica.observe().await {
                                log::warn!("observe {} failed: {}", replica.doc.key_path(), e);
                            }
                        });
                    }
                    Err(_) => log::warn!("no runtime to observe {}", replica.doc.key_path()),
                }
            })
        };
        lock(&self.binding).model_listeners.extend([changed, deleted, assigned]);

        if self.doc.is_persisted() {
            self.observe().await?;
        }
        Ok(())
    }

    async fn observe(&self) -> Result<()> {
        let key_path = self.doc.key_path();
        {
            let mut binding = lock(&self.binding);
            if binding.observed.is_some() {
                return Ok(());
            }
            binding.observed = Some(key_path.clone());
            let target: Weak<dyn PushTarget> = self.this.clone();
            binding.target = Some(self.ctx.manager().register(&key_path, target));
        }
        self.ctx.manager().observe(&key_path).await
    }

    /// Stop producing mutations and stop observing.
    pub async fn end_sync(&self) -> Result<()> {
        let binding = std::mem::take(&mut *lock(&self.binding));
        for id in binding.model_listeners {
            self.doc.off(id);
        }
        if let Some(target) = binding.target {
            self.ctx.manager().deregister(target);
        }
        match binding.observed {
            Some(key_path) => self.ctx.manager().unobserve(&key_path).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PushTarget for DocumentReplica {
    async fn apply_push(&self, event: &PushEvent) {
        match &event.notification {
            Notification::Update { doc } => {
                self.doc.set(fields_of(doc.clone()), SetOptions::nosync());
            }
            Notification::Delete => self.doc.mark_deleted(SetOptions::nosync()),
            other => log::trace!("document {} ignores {}", event.key_path, other.name()),
        }
    }

    async fn resync(&self) -> Result<()> {
        if !self.doc.is_persisted() {
            return Ok(());
        }
        match self.ctx.queue().fetch(&self.doc.key_path()).await {
            Ok(value) => {
                self.doc.set(fields_of(value), SetOptions::nosync());
                Ok(())
            }
            Err(SyncError::NotFound(_)) => {
                self.doc.mark_deleted(SetOptions::nosync());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for DocumentReplica {
    fn drop(&mut self) {
        let binding = std::mem::take(&mut *lock(&self.binding));
        for id in binding.model_listeners {
            self.doc.off(id);
        }
        if let Some(target) = binding.target {
            self.ctx.manager().deregister(target);
        }
        release(&self.doc);
    }
}

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

pub struct CollectionReplica {
    ctx: Arc<SyncContext>,
    collection: Arc<Collection>,
    binding: Mutex<Binding>,
    /// Bumped by every applied `resync:` event.
    generation: Arc<AtomicU64>,
    this: Weak<CollectionReplica>,
}

impl CollectionReplica {
    /// An empty replica of the collection at `key_path` whose members live
    /// in `items_bucket`. Follows `resync:` events from the start.
    pub fn new(ctx: &Arc<SyncContext>, key_path: KeyPath, items_bucket: impl Into<String>) -> Arc<Self> {
        let collection = Collection::empty(key_path, items_bucket);
        let replica = Arc::new_cyclic(|this| Self {
            ctx: Arc::clone(ctx),
            collection,
            binding: Mutex::new(Binding::default()),
            generation: Arc::new(AtomicU64::new(0)),
            this: this.clone(),
        });
        replica.follow_resync();
        replica
    }

    /// Build the replica and fill it from the server (or the cache when
    /// offline).
    pub async fn load(ctx: &Arc<SyncContext>, key_path: KeyPath, items_bucket: impl Into<String>) -> Result<Arc<Self>> {
        let replica = Self::new(ctx, key_path, items_bucket);
        replica.refresh().await?;
        Ok(replica)
    }

    pub fn collection(&self) -> &Arc<Collection> {
        &self.collection
    }

    pub fn key_path(&self) -> &KeyPath {
        self.collection.key_path()
    }

    fn follow_resync(&self) {
        let ctx = Arc::downgrade(&self.ctx);
        let collection = Arc::downgrade(&self.collection);
        let generation = Arc::clone(&self.generation);
        let key = EventKey::namespaced("resync", self.key_path().room_key());
        let id = self.ctx.queue().on(key, move |event| {
            let (Some(ctx), Some(collection), QueueEvent::Resync { snapshot: Snapshot::Documents(docs), .. }) =
                (ctx.upgrade(), collection.upgrade(), event)
            else {
                return;
            };
            apply_documents(&ctx, &collection, docs);
            generation.fetch_add(1, Ordering::SeqCst);
        });
        lock(&self.binding).resync = Some(id);
    }

    /// Re-read the member list. A remote answer arrives through the
    /// `resync:` listener; a cached one is applied here.
    pub async fn refresh(&self) -> Result<()> {
        let before = self.generation.load(Ordering::SeqCst);
        let items_key_path = self.collection.items_key_path().clone();
        let docs = self.ctx.queue().find(self.key_path(), &items_key_path, &Query::new()).await?;
        if self.generation.load(Ordering::SeqCst) == before {
            apply_documents(&self.ctx, &self.collection, &docs);
        }
        Ok(())
    }

    /// Send local adds and removes to the queue and follow server pushes.
    pub async fn keep_synced(&self) -> Result<()> {
        if self.collection.is_kept_synced() {
            return Ok(());
        }
        let queue = self.ctx.queue();
        self.collection.keep_synced(sink(queue));

        let added = {
            let ctx = Arc::downgrade(&self.ctx);
            self.collection.on("added:", move |event| {
                if let (Some(ctx), CollectionEvent::Added { doc, .. }) = (ctx.upgrade(), event) {
                    ctx.register(doc);
                }
            })
        };
        let delivered = {
            let collection = Arc::downgrade(&self.collection);
            let key_path = self.key_path().clone();
            queue.on("delivered:", move |event| {
                let (Some(collection), QueueEvent::Delivered { record, .. }) = (collection.upgrade(), event) else {
                    return;
                };
                if let (true, Payload::Add { item_ids }) = (record.key_path == key_path, &record.payload) {
                    for id in item_ids {
                        collection.acknowledge(id);
                    }
                }
            })
        };
        {
            let mut binding = lock(&self.binding);
            binding.model_listeners.push(added);
            binding.queue_listeners.push(delivered);
            binding.observed = Some(self.key_path().clone());
            let target: Weak<dyn PushTarget> = self.this.clone();
            binding.target = Some(self.ctx.manager().register(self.key_path(), target));
        }
        self.ctx.manager().observe(self.key_path()).await
    }

    /// Stop queueing adds and removes and stop following pushes.
    pub async fn end_sync(&self) -> Result<()> {
        self.collection.end_sync();
        let (model, queue, target, observed) = {
            let mut binding = lock(&self.binding);
            (
                std::mem::take(&mut binding.model_listeners),
                std::mem::take(&mut binding.queue_listeners),
                binding.target.take(),
                binding.observed.take(),
            )
        };
        for id in model {
            self.collection.off(id);
        }
        for id in queue {
            self.ctx.queue().off(id);
        }
        if let Some(target) = target {
            self.ctx.manager().deregister(target);
        }
        match observed {
            Some(key_path) => self.ctx.manager().unobserve(&key_path).await,
            None => Ok(()),
        }
    }
}

fn apply_documents(ctx: &SyncContext, collection: &Collection, docs: &[Value]) {
    let bucket = collection.items_key_path().bucket().unwrap_or_default().to_string();
    let mut remote = Vec::with_capacity(docs.len());
    for value in docs {
        match ctx.document(&bucket, value) {
            Ok(doc) => remote.push(doc),
            Err(e) => log::warn!("skipping member of {}: {}", collection.key_path(), e),
        }
    }
    collection.resync(remote);
}

#[async_trait]
impl PushTarget for CollectionReplica {
    async fn apply_push(&self, event: &PushEvent) {
        match &event.notification {
            Notification::Add { items_key_path, item_ids } => {
                let mut docs = Vec::new();
                for id in item_ids.iter().filter(|id| !self.collection.contains(id)) {
                    match self.ctx.fetch_document(&items_key_path.child(id.clone())).await {
                        Ok(doc) => docs.push(doc),
                        Err(e) => log::warn!("cannot fetch {} added to {}: {}", id, event.key_path, e),
                    }
                }
                self.collection.apply_add(docs);
            }
            Notification::Remove { item_ids, .. } => {
                self.collection.apply_remove(item_ids);
            }
            other => log::trace!("collection {} ignores {}", event.key_path, other.name()),
        }
    }

    async fn resync(&self) -> Result<()> {
        self.refresh().await
    }
}

impl Drop for CollectionReplica {
    fn drop(&mut self) {
        let binding = std::mem::take(&mut *lock(&self.binding));
        for id in binding.model_listeners {
            self.collection.off(id);
        }
        for id in binding.queue_listeners.into_iter().chain(binding.resync) {
            self.ctx.queue().off(id);
        }
        if let Some(target) = binding.target {
            self.ctx.manager().deregister(target);
        }
    }
}

// ---------------------------------------------------------------------------
// Sequences
// ---------------------------------------------------------------------------

pub struct SequenceReplica {
    ctx: Arc<SyncContext>,
    sequence: Arc<Sequence>,
    binding: Mutex<Binding>,
    generation: Arc<AtomicU64>,
    this: Weak<SequenceReplica>,
}

impl SequenceReplica {
    /// Replica of an empty local sequence at `key_path`.
    pub fn new(ctx: &Arc<SyncContext>, key_path: KeyPath) -> Arc<Self> {
        let replica = Arc::new_cyclic(|this| Self {
            ctx: Arc::clone(ctx),
            sequence: Sequence::empty(key_path),
            binding: Mutex::new(Binding::default()),
            generation: Arc::new(AtomicU64::new(0)),
            this: this.clone(),
        });
        replica.follow_resync();
        replica
    }

    /// Replica filled from the server (or the cache when offline).
    pub async fn load(ctx: &Arc<SyncContext>, key_path: KeyPath) -> Result<Arc<Self>> {
        let replica = Self::new(ctx, key_path);
        replica.refresh().await?;
        Ok(replica)
    }

    pub fn sequence(&self) -> &Arc<Sequence> {
        &self.sequence
    }

    pub fn key_path(&self) -> &KeyPath {
        self.sequence.key_path()
    }

    fn follow_resync(&self) {
        let ctx = Arc::downgrade(&self.ctx);
        let sequence = Arc::downgrade(&self.sequence);
        let generation = Arc::clone(&self.generation);
        let key = EventKey::namespaced("resync", self.key_path().room_key());
        let id = self.ctx.queue().on(key, move |event| {
            let (Some(ctx), Some(sequence), QueueEvent::Resync { snapshot: Snapshot::Items(entries), .. }) =
                (ctx.upgrade(), sequence.upgrade(), event)
            else {
                return;
            };
            apply_entries(&ctx, &sequence, entries);
            generation.fetch_add(1, Ordering::SeqCst);
        });
        lock(&self.binding).resync = Some(id);
    }

    /// Reconcile with the server's list, keeping pending local items.
    pub async fn refresh(&self) -> Result<()> {
        let before = self.generation.load(Ordering::SeqCst);
        let entries = self.ctx.queue().all(self.key_path(), &Query::new()).await?;
        if self.generation.load(Ordering::SeqCst) == before {
            apply_entries(&self.ctx, &self.sequence, &entries);
        }
        Ok(())
    }

    /// Send local inserts and deletions to the queue and follow server pushes.
    pub async fn keep_synced(&self) -> Result<()> {
        if self.sequence.is_kept_synced() {
            return Ok(());
        }
        let queue = self.ctx.queue();
        self.sequence.keep_synced(sink(queue));

        let inserted = {
            let ctx = Arc::downgrade(&self.ctx);
            self.sequence.on("insertedBefore:", move |event| {
                if let (Some(ctx), SequenceEvent::InsertedBefore { item, .. }) = (ctx.upgrade(), event) {
                    ctx.register(&item.doc);
                }
            })
        };
        let assigned = {
            let sequence = Arc::downgrade(&self.sequence);
            let key_path = self.key_path().clone();
            queue.on("id:", move |event| {
                let (Some(sequence), QueueEvent::IdAssigned { old_id, new_id, key_path: at }) =
                    (sequence.upgrade(), event)
                else {
                    return;
                };
                if *at == key_path {
                    sequence.acknowledge(old_id, new_id);
                }
            })
        };
        {
            let mut binding = lock(&self.binding);
            binding.model_listeners.push(inserted);
            binding.queue_listeners.push(assigned);
            binding.observed = Some(self.key_path().clone());
            let target: Weak<dyn PushTarget> = self.this.clone();
            binding.target = Some(self.ctx.manager().register(self.key_path(), target));
        }
        self.ctx.manager().observe(self.key_path()).await
    }

    /// Stop queueing inserts and deletions and stop following pushes.
    pub async fn end_sync(&self) -> Result<()> {
        self.sequence.end_sync();
        let (model, queue, target, observed) = {
            let mut binding = lock(&self.binding);
            (
                std::mem::take(&mut binding.model_listeners),
                std::mem::take(&mut binding.queue_listeners),
                binding.target.take(),
                binding.observed.take(),
            )
        };
        for id in model {
            self.sequence.off(id);
        }
        for id in queue {
            self.ctx.queue().off(id);
        }
        if let Some(target) = target {
            self.ctx.manager().deregister(target);
        }
        match observed {
            Some(key_path) => self.ctx.manager().unobserve(&key_path).await,
            None => Ok(()),
        }
    }
}

fn apply_entries(ctx: &SyncContext, sequence: &Sequence, entries: &[SequenceEntry]) {
    let mut remote = Vec::with_capacity(entries.len());
    for entry in entries {
        let bucket = entry.key_path.bucket().unwrap_or_default();
        match ctx.document(bucket, &entry.doc) {
            Ok(doc) => remote.push((entry.id.clone(), doc)),
            Err(e) => log::warn!("skipping item {} of {}: {}", entry.id, sequence.key_path(), e),
        }
    }
    sequence.resync(remote);
}

#[async_trait]
impl PushTarget for SequenceReplica {
    async fn apply_push(&self, event: &PushEvent) {
        match &event.notification {
            Notification::InsertBefore { id, item_key_path, ref_id } => {
                if self.sequence.contains(id) {
                    return;
                }
                let doc = match self.ctx.fetch_document(item_key_path).await {
                    Ok(doc) => doc,
                    Err(e) => {
                        log::warn!("cannot fetch {} inserted into {}: {}", item_key_path, event.key_path, e);
                        return;
                    }
                };
                match self.sequence.insert_remote(ref_id.as_deref(), id, doc) {
                    Ok(()) => {}
                    Err(SyncError::DuplicateInsert { .. }) => {}
                    Err(e @ SyncError::InvalidReference { .. }) => {
                        log::info!("{}; resyncing", e);
                        if let Err(e) = self.refresh().await {
                            log::warn!("resync of {} failed: {}", event.key_path, e);
                        }
                    }
                    Err(e) => log::warn!("insert into {} failed: {}", event.key_path, e),
                }
            }
            Notification::DeleteItem { id } => {
                if self.sequence.contains(id) {
                    if let Err(e) = self.sequence.delete_item(id, SetOptions::nosync()) {
                        log::warn!("{}", e);
                    }
                }
            }
            other => log::trace!("sequence {} ignores {}", event.key_path, other.name()),
        }
    }

    async fn resync(&self) -> Result<()> {
        self.refresh().await
    }
}

impl Drop for SequenceReplica {
    fn drop(&mut self) {
        let binding = std::mem::take(&mut *lock(&self.binding));
        for id in binding.model_listeners {
            self.sequence.off(id);
        }
        for id in binding.queue_listeners.into_iter().chain(binding.resync) {
            self.ctx.queue().off(id);
        }
        if let Some(target) = binding.target {
            self.ctx.manager().deregister(target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{HubConfig, SyncHub};
    use crate::loopback::LoopbackTransport;
    use crate::rights::AllowAll;
    use crate::server::Server;
    use crate::store::{MemoryStore, RemoteStore};
    use ginger_core::Document;
    use serde_json::json;

    fn server() -> Arc<Server> {
        let hub = SyncHub::local(HubConfig::for_testing(), None);
        Arc::new(Server::new(Arc::new(MemoryStore::new()), Arc::new(AllowAll), Some(hub)))
    }

    async fn client(server: &Arc<Server>, user: &str) -> Arc<SyncContext> {
        SyncContext::in_memory(LoopbackTransport::connect(Arc::clone(server), user).await).unwrap()
    }

    #[tokio::test]
    async fn test_document_keep_synced_creates_and_puts() {
        let server = server();
        let ctx = client(&server, "alice").await;
        let doc = Document::create("animals", fields_of(json!({"name": "gorilla"})));
        let replica = DocumentReplica::new(&ctx, &doc);
        replica.keep_synced().await.unwrap();
        doc.set_field("legs", json!(8), SetOptions::default());
        assert_eq!(ctx.queue().len(), 2);

        assert_eq!(ctx.sync().await.unwrap(), 2);
        let kp = doc.key_path();
        assert!(doc.is_persisted());
        let stored = server.store().fetch(&kp, &Default::default()).await.unwrap();
        assert_eq!(stored["legs"], json!(8));
        assert_eq!(stored["name"], json!("gorilla"));
    }

    #[tokio::test]
    async fn test_remote_changes_apply_without_requeueing() {
        let server = server();
        let ctx = client(&server, "alice").await;
        let doc = Document::from_persisted("animals", &json!({"_id": "1", "legs": 4})).unwrap();
        let replica = DocumentReplica::new(&ctx, &doc);
        replica.keep_synced().await.unwrap();

        let push = PushEvent { key_path: doc.key_path(), notification: Notification::Update { doc: json!({"legs": 6}) } };
        replica.apply_push(&push).await;
        assert_eq!(doc.get("legs"), Some(json!(6)));
        assert!(ctx.queue().is_empty());
    }

    #[tokio::test]
    async fn test_collection_add_acknowledged_after_delivery() {
        let server = server();
        let ctx = client(&server, "alice").await;
        let zoo = CollectionReplica::load(&ctx, KeyPath::from(["zoo", "1", "animals"]), "animals").await.unwrap();
        zoo.keep_synced().await.unwrap();

        let emu = Document::create("animals", fields_of(json!({"name": "emu"})));
        zoo.collection().add(&[Arc::clone(&emu)], SetOptions::default()).unwrap();
        assert!(zoo.collection().is_pending(emu.cid()));

        ctx.sync().await.unwrap();
        let id = emu.id().unwrap();
        assert!(!zoo.collection().is_pending(&id));
        let members = server.store().find(zoo.key_path(), &Query::new(), &Default::default()).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0]["_id"], json!(id));
    }

    #[tokio::test]
    async fn test_sequence_insert_gets_server_item_id() {
        let server = server();
        let ctx = client(&server, "alice").await;
        let parade = SequenceReplica::load(&ctx, KeyPath::from(["parade", "1", "animals"])).await.unwrap();
        parade.keep_synced().await.unwrap();

        let tiger = Document::create("animals", fields_of(json!({"name": "tiger"})));
        let temp = parade.sequence().push(&tiger, SetOptions::default()).unwrap();
        ctx.sync().await.unwrap();

        let ids = parade.sequence().ids();
        assert_eq!(ids.len(), 1);
        assert_ne!(ids[0], temp);
        assert!(!parade.sequence().first().unwrap().pending);

        let remote = server.store().all(parade.key_path(), &Query::new(), &Default::default()).await.unwrap();
        assert_eq!(remote[0].id, ids[0]);
        assert_eq!(remote[0].key_path, tiger.key_path());
    }
}
