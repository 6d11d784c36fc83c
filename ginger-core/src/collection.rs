//! Unordered document collections.
//!
//! A collection retains every item it holds and releases it on removal or
//! when the collection itself is dropped. While kept synced, local `add` and
//! `remove` calls produce mutation records through the attached sink; calls
//! made with `nosync` (remote application, resync) never do.

use crate::document::{DocumentEvent, DocumentRef, Fields, SetOptions};
use crate::error::Result;
use crate::event::{lock, EventKey, Emitter, ListenerId};
use crate::keypath::KeyPath;
use crate::mutation::{MutationRecord, MutationSink};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};

#[derive(Debug, Clone)]
pub enum CollectionEvent {
    Added { doc: DocumentRef, nosync: bool },
    Removed { doc: DocumentRef, nosync: bool },
    Updated { doc: DocumentRef, fields: Fields },
    Resynced,
}

struct Entry {
    doc: DocumentRef,
    listeners: Vec<ListenerId>,
    /// Added locally and not yet acknowledged by the server.
    pending: bool,
}

pub struct Collection {
    key_path: KeyPath,
    items_key_path: KeyPath,
    entries: Mutex<Vec<Entry>>,
    sink: Mutex<Option<Arc<dyn MutationSink>>>,
    emitter: Emitter<CollectionEvent>,
    this: Weak<Collection>,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("key_path", &self.key_path)
            .field("len", &self.len())
            .finish()
    }
}

impl Collection {
    /// An empty collection at `key_path` whose items live in `items_bucket`.
    pub fn empty(key_path: KeyPath, items_bucket: impl Into<String>) -> Arc<Self> {
        let items_key_path = KeyPath::new([items_bucket.into()]);
        Arc::new_cyclic(|this| Self {
            key_path,
            items_key_path,
            entries: Mutex::new(Vec::new()),
            sink: Mutex::new(None),
            emitter: Emitter::new(),
            this: this.clone(),
        })
    }

    /// A collection holding `docs`. Each document is retained; the caller
    /// keeps its own references.
    pub fn from_docs(key_path: KeyPath, items_bucket: impl Into<String>, docs: &[DocumentRef]) -> Arc<Self> {
        let collection = Self::empty(key_path, items_bucket);
        collection.insert_entries(docs.to_vec(), true, SetOptions::nosync());
        collection
    }

    /// A collection that takes ownership of freshly built documents.
    pub fn from_items(key_path: KeyPath, items_bucket: impl Into<String>, docs: Vec<DocumentRef>) -> Arc<Self> {
        let collection = Self::empty(key_path, items_bucket);
        collection.insert_entries(docs, false, SetOptions::nosync());
        collection
    }

    pub fn key_path(&self) -> &KeyPath {
        &self.key_path
    }

    pub fn items_key_path(&self) -> &KeyPath {
        &self.items_key_path
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    pub fn items(&self) -> Vec<DocumentRef> {
        lock(&self.entries).iter().map(|e| Arc::clone(&e.doc)).collect()
    }

    pub fn ids(&self) -> Vec<String> {
        lock(&self.entries).iter().map(|e| e.doc.ident()).collect()
    }

    pub fn find_by_id(&self, id: &str) -> Option<DocumentRef> {
        lock(&self.entries).iter().find(|e| e.doc.matches(id)).map(|e| Arc::clone(&e.doc))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.find_by_id(id).is_some()
    }

    /// Whether `id` was added locally and the server has not acknowledged it yet.
    pub fn is_pending(&self, id: &str) -> bool {
        lock(&self.entries).iter().any(|e| e.pending && e.doc.matches(id))
    }

    /// Attach the sink that receives local mutations from now on.
    pub fn keep_synced(&self, sink: Arc<dyn MutationSink>) {
        *lock(&self.sink) = Some(sink);
    }

    pub fn end_sync(&self) {
        *lock(&self.sink) = None;
    }

    pub fn is_kept_synced(&self) -> bool {
        lock(&self.sink).is_some()
    }

    fn active_sink(&self, opts: SetOptions) -> Option<Arc<dyn MutationSink>> {
        if opts.nosync {
            None
        } else {
            lock(&self.sink).clone()
        }
    }

    /// Add documents not already present. Returns how many were added.
    pub fn add(&self, docs: &[DocumentRef], opts: SetOptions) -> Result<usize> {
        let fresh: Vec<DocumentRef> = {
            let entries = lock(&self.entries);
            let mut seen = HashSet::new();
            docs.iter()
                .filter(|d| !entries.iter().any(|e| Arc::ptr_eq(&e.doc, d) || e.doc.matches(&d.ident())))
                .filter(|d| seen.insert(d.cid().to_string()))
                .cloned()
                .collect()
        };
        if fresh.is_empty() {
            return Ok(0);
        }
        if let Some(sink) = self.active_sink(opts) {
            for doc in fresh.iter().filter(|d| !d.is_persisted()) {
                if doc.mark_queued() {
                    let create = MutationRecord::create(
                        KeyPath::new([doc.bucket()]),
                        doc.cid(),
                        doc.to_value(),
                        sink.client_id(),
                    );
                    sink.submit(create)?;
                }
            }
            let ids = fresh.iter().map(|d| d.ident()).collect();
            sink.submit(MutationRecord::add(
                self.key_path.clone(),
                self.items_key_path.clone(),
                ids,
                sink.client_id(),
            ))?;
        }
        let count = fresh.len();
        self.insert_entries(fresh, true, opts);
        Ok(count)
    }

    /// Remove documents by id. Unknown ids are ignored.
    pub fn remove(&self, ids: &[String], opts: SetOptions) -> Result<Vec<DocumentRef>> {
        let present: Vec<String> = {
            let entries = lock(&self.entries);
            ids.iter()
                .filter_map(|id| entries.iter().find(|e| e.doc.matches(id)).map(|e| e.doc.ident()))
                .collect()
        };
        if present.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(sink) = self.active_sink(opts) {
            sink.submit(MutationRecord::remove(
                self.key_path.clone(),
                self.items_key_path.clone(),
                present.clone(),
                sink.client_id(),
            ))?;
        }
        Ok(self.remove_entries(&present, opts))
    }

    /// Apply a remote `add`. Takes ownership of `docs`.
    pub fn apply_add(&self, docs: Vec<DocumentRef>) -> usize {
        let (fresh, known): (Vec<_>, Vec<_>) = {
            let entries = lock(&self.entries);
            docs.into_iter().partition(|d| !entries.iter().any(|e| e.doc.matches(&d.ident())))
        };
        // Echoes of our own pending adds clear the pending flag.
        for doc in known {
            self.acknowledge(&doc.ident());
            release(&doc);
        }
        let count = fresh.len();
        self.insert_entries(fresh, false, SetOptions::nosync());
        count
    }

    /// Remove members on behalf of the server, without producing mutations.
    pub fn apply_remove(&self, ids: &[String]) -> Vec<DocumentRef> {
        self.remove_entries(ids, SetOptions::nosync())
    }

    /// Clear the pending flag once the server has accepted an add.
    pub fn acknowledge(&self, id: &str) {
        for entry in lock(&self.entries).iter_mut().filter(|e| e.doc.matches(id)) {
            entry.pending = false;
        }
    }

    /// Replace local contents with the server's view, keeping items that are
    /// still pending. Takes ownership of `remote`.
    pub fn resync(&self, remote: Vec<DocumentRef>) {
        let remote_ids: HashSet<String> = remote.iter().map(|d| d.ident()).collect();
        let stale: Vec<String> = lock(&self.entries)
            .iter()
            .filter(|e| !e.pending && !remote_ids.contains(&e.doc.ident()))
            .map(|e| e.doc.ident())
            .collect();
        self.remove_entries(&stale, SetOptions::nosync());

        let mut fresh = Vec::new();
        for doc in remote {
            match self.find_by_id(&doc.ident()) {
                Some(local) => {
                    local.set(doc.fields(), SetOptions::nosync());
                    self.acknowledge(&doc.ident());
                    release(&doc);
                }
                None => fresh.push(doc),
            }
        }
        self.insert_entries(fresh, false, SetOptions::nosync());
        self.emitter.emit("resynced:", &CollectionEvent::Resynced);
    }

    fn insert_entries(&self, docs: Vec<DocumentRef>, retain: bool, opts: SetOptions) {
        let pending = !opts.nosync && self.is_kept_synced();
        for doc in &docs {
            if retain {
                doc.retain();
            }
            let listeners = self.watch(doc);
            lock(&self.entries).push(Entry { doc: Arc::clone(doc), listeners, pending });
        }
        for doc in docs {
            self.emitter.emit("added:", &CollectionEvent::Added { doc, nosync: opts.nosync });
        }
    }

    fn remove_entries(&self, ids: &[String], opts: SetOptions) -> Vec<DocumentRef> {
        let removed: Vec<Entry> = {
            let mut entries = lock(&self.entries);
            let mut removed = Vec::new();
            entries.retain_mut(|e| {
                if ids.iter().any(|id| e.doc.matches(id)) {
                    removed.push(Entry {
                        doc: Arc::clone(&e.doc),
                        listeners: std::mem::take(&mut e.listeners),
                        pending: e.pending,
                    });
                    false
                } else {
                    true
                }
            });
            removed
        };
        let mut docs = Vec::with_capacity(removed.len());
        for entry in removed {
            for id in entry.listeners {
                entry.doc.off(id);
            }
            release(&entry.doc);
            self.emitter.emit(
                "removed:",
                &CollectionEvent::Removed { doc: Arc::clone(&entry.doc), nosync: opts.nosync },
            );
            docs.push(entry.doc);
        }
        docs
    }

    fn watch(&self, doc: &DocumentRef) -> Vec<ListenerId> {
        let this = self.this.clone();
        let weak_doc = Arc::downgrade(doc);
        let changed = doc.on("changed:", move |event| {
            if let (Some(collection), Some(doc), DocumentEvent::Changed { fields, .. }) =
                (this.upgrade(), weak_doc.upgrade(), event)
            {
                collection
                    .emitter
                    .emit("updated:", &CollectionEvent::Updated { doc, fields: fields.clone() });
            }
        });
        let this = self.this.clone();
        let weak_doc = Arc::downgrade(doc);
        let deleted = doc.on("deleted:", move |event| {
            if let (Some(collection), Some(doc), DocumentEvent::Deleted { nosync }) =
                (this.upgrade(), weak_doc.upgrade(), event)
            {
                let opts = SetOptions { nosync: *nosync };
                if let Err(e) = collection.remove(&[doc.ident()], opts) {
                    log::warn!("failed to drop deleted item {} from {}: {}", doc.ident(), collection.key_path, e);
                }
            }
        });
        vec![changed, deleted]
    }

    pub fn on<F>(&self, key: impl Into<EventKey>, handler: F) -> ListenerId
    where
        F: Fn(&CollectionEvent) + Send + Sync + 'static,
    {
        self.emitter.on(key, handler)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.emitter.off(id)
    }
}

impl Drop for Collection {
    fn drop(&mut self) {
        let entries = std::mem::take(&mut *lock(&self.entries));
        for entry in entries {
            for id in entry.listeners {
                entry.doc.off(id);
            }
            release(&entry.doc);
        }
    }
}

fn release(doc: &DocumentRef) {
    if let Err(e) = doc.release() {
        log::warn!("{}", e);
    }
}
