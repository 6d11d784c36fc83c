//! Ordered sequences of documents addressed by stable item ids.
//!
//! Items form a doubly linked list keyed by item id, so positions are always
//! expressed relative to another item and never as an index:
//!
//! ```text
//!  head ─► [i1 tiger] ◄──► [i2 mouse] ◄──► [i3 dog] ◄─ tail
//! ```
//!
//! A locally inserted item gets a temporary id and stays `pending` until the
//! server acknowledges it with a real id via [`Sequence::acknowledge`].
//! Pending items are never removed by [`Sequence::resync`].

use crate::document::{DocumentEvent, DocumentRef, Fields, SetOptions};
use crate::error::{Result, SyncError};
use crate::event::{lock, EventKey, Emitter, ListenerId};
use crate::keypath::KeyPath;
use crate::mutation::{MutationRecord, MutationSink};
use crate::reconcile;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SequenceItem {
    pub id: String,
    pub doc: DocumentRef,
    pub pending: bool,
}

#[derive(Debug, Clone)]
pub enum SequenceEvent {
    InsertedBefore { item: SequenceItem, ref_id: Option<String>, nosync: bool },
    Deleted { item: SequenceItem, nosync: bool },
    Updated { doc: DocumentRef, fields: Fields },
    IdAssigned { old_id: String, new_id: String },
    Resynced,
}

struct Node {
    item: SequenceItem,
    prev: Option<String>,
    next: Option<String>,
    listeners: Vec<ListenerId>,
}

#[derive(Default)]
struct Links {
    nodes: HashMap<String, Node>,
    head: Option<String>,
    tail: Option<String>,
}

impl Links {
    fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    fn set_next(&mut self, at: Option<&String>, next: Option<String>) {
        match at {
            Some(id) => {
                if let Some(node) = self.nodes.get_mut(id) {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
    }

    fn set_prev(&mut self, at: Option<&String>, prev: Option<String>) {
        match at {
            Some(id) => {
                if let Some(node) = self.nodes.get_mut(id) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }

    /// Link `node` in front of `before`, or at the tail when `before` is
    /// `None` or unknown.
    fn link_before(&mut self, mut node: Node, before: Option<&str>) {
        let id = node.item.id.clone();
        let (prev, next) = match before.and_then(|b| self.nodes.get(b).map(|n| (n.prev.clone(), b))) {
            Some((prev, b)) => (prev, Some(b.to_string())),
            None => (self.tail.clone(), None),
        };
        self.set_next(prev.as_ref(), Some(id.clone()));
        self.set_prev(next.as_ref(), Some(id.clone()));
        node.prev = prev;
        node.next = next;
        self.nodes.insert(id, node);
    }

    fn unlink(&mut self, id: &str) -> Option<Node> {
        let node = self.nodes.remove(id)?;
        self.set_next(node.prev.as_ref(), node.next.clone());
        self.set_prev(node.next.as_ref(), node.prev.clone());
        Some(node)
    }

    fn rename(&mut self, old: &str, new: &str) -> bool {
        let Some(mut node) = self.nodes.remove(old) else {
            return false;
        };
        node.item.id = new.to_string();
        self.set_next(node.prev.as_ref(), Some(new.to_string()));
        self.set_prev(node.next.as_ref(), Some(new.to_string()));
        self.nodes.insert(new.to_string(), node);
        true
    }

    fn ordered(&self) -> Vec<&Node> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut cursor = self.head.as_ref();
        while let Some(node) = cursor.and_then(|id| self.nodes.get(id)) {
            out.push(node);
            cursor = node.next.as_ref();
        }
        out
    }
}

pub struct Sequence {
    key_path: KeyPath,
    links: Mutex<Links>,
    sink: Mutex<Option<Arc<dyn MutationSink>>>,
    emitter: Emitter<SequenceEvent>,
    this: Weak<Sequence>,
}

impl std::fmt::Debug for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequence")
            .field("key_path", &self.key_path)
            .field("ids", &self.ids())
            .finish()
    }
}

impl Sequence {
    /// Empty sequence at `key_path`.
    pub fn empty(key_path: KeyPath) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            key_path,
            links: Mutex::new(Links::default()),
            sink: Mutex::new(None),
            emitter: Emitter::new(),
            this: this.clone(),
        })
    }

    /// A sequence built from server items, taking ownership of their documents.
    pub fn from_items(key_path: KeyPath, items: Vec<(String, DocumentRef)>) -> Arc<Self> {
        let sequence = Self::empty(key_path);
        for (id, doc) in items {
            sequence.link(id, doc, None, false);
        }
        sequence
    }

    pub fn key_path(&self) -> &KeyPath {
        &self.key_path
    }

    pub fn len(&self) -> usize {
        lock(&self.links).nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.links).nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        lock(&self.links).contains(id)
    }

    pub fn get(&self, id: &str) -> Option<SequenceItem> {
        lock(&self.links).nodes.get(id).map(|n| n.item.clone())
    }

    pub fn items(&self) -> Vec<SequenceItem> {
        lock(&self.links).ordered().into_iter().map(|n| n.item.clone()).collect()
    }

    pub fn ids(&self) -> Vec<String> {
        lock(&self.links).ordered().into_iter().map(|n| n.item.id.clone()).collect()
    }

    pub fn docs(&self) -> Vec<DocumentRef> {
        lock(&self.links).ordered().into_iter().map(|n| Arc::clone(&n.item.doc)).collect()
    }

    pub fn first(&self) -> Option<SequenceItem> {
        let links = lock(&self.links);
        links.head.as_ref().and_then(|id| links.nodes.get(id)).map(|n| n.item.clone())
    }

    pub fn last(&self) -> Option<SequenceItem> {
        let links = lock(&self.links);
        links.tail.as_ref().and_then(|id| links.nodes.get(id)).map(|n| n.item.clone())
    }

    /// The item after `id`, or the first item when `id` is `None`.
    pub fn next(&self, id: Option<&str>) -> Option<SequenceItem> {
        let links = lock(&self.links);
        let next = match id {
            None => links.head.as_ref(),
            Some(id) => links.nodes.get(id)?.next.as_ref(),
        };
        next.and_then(|n| links.nodes.get(n)).map(|n| n.item.clone())
    }

    /// The item before `id`.
    pub fn prev(&self, id: &str) -> Option<SequenceItem> {
        let links = lock(&self.links);
        links
            .nodes
            .get(id)?
            .prev
            .as_ref()
            .and_then(|p| links.nodes.get(p))
            .map(|n| n.item.clone())
    }

    /// Start sending local inserts and deletions to `sink`.
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

    /// Insert `doc` in front of `ref_id`; `None` appends. Returns the new
    /// item's id. An unknown reference fails without changing anything.
    pub fn insert_before(&self, ref_id: Option<&str>, doc: &DocumentRef, opts: SetOptions) -> Result<String> {
        self.check_reference(ref_id)?;
        let item_id = Uuid::new_v4().simple().to_string();
        if let Some(sink) = self.active_sink(opts) {
            if !doc.is_persisted() && doc.mark_queued() {
                sink.submit(MutationRecord::create(
                    KeyPath::new([doc.bucket()]),
                    doc.cid(),
                    doc.to_value(),
                    sink.client_id(),
                ))?;
            }
            sink.submit(MutationRecord::insert_before(
                self.key_path.clone(),
                ref_id.map(str::to_string),
                doc.key_path(),
                item_id.clone(),
                sink.client_id(),
            ))?;
        }
        doc.retain();
        let item = self.link(item_id.clone(), Arc::clone(doc), ref_id, !opts.nosync);
        self.emitter.emit(
            "insertedBefore:",
            &SequenceEvent::InsertedBefore { item, ref_id: ref_id.map(str::to_string), nosync: opts.nosync },
        );
        Ok(item_id)
    }

    /// Append `doc`. Returns the new item id.
    pub fn push(&self, doc: &DocumentRef, opts: SetOptions) -> Result<String> {
        self.insert_before(None, doc, opts)
    }

    /// Prepend `doc`. Returns the new item id.
    pub fn unshift(&self, doc: &DocumentRef, opts: SetOptions) -> Result<String> {
        let first = self.first().map(|item| item.id);
        self.insert_before(first.as_deref(), doc, opts)
    }

    /// Apply a server-side insertion with a known item id. Takes ownership of `doc`.
    pub fn insert_remote(&self, ref_id: Option<&str>, item_id: &str, doc: DocumentRef) -> Result<()> {
        if self.contains(item_id) {
            release(&doc);
            return Err(SyncError::DuplicateInsert { key_path: self.key_path.clone(), id: item_id.to_string() });
        }
        if let Err(e) = self.check_reference(ref_id) {
            release(&doc);
            return Err(e);
        }
        let item = self.link(item_id.to_string(), doc, ref_id, false);
        self.emitter.emit(
            "insertedBefore:",
            &SequenceEvent::InsertedBefore { item, ref_id: ref_id.map(str::to_string), nosync: true },
        );
        Ok(())
    }

    /// Remove item `id` and release its document.
    pub fn delete_item(&self, id: &str, opts: SetOptions) -> Result<SequenceItem> {
        if !self.contains(id) {
            return Err(SyncError::NotFound(format!("item {} in {}", id, self.key_path)));
        }
        if let Some(sink) = self.active_sink(opts) {
            sink.submit(MutationRecord::delete_item(self.key_path.clone(), id, sink.client_id()))?;
        }
        self.unlink(id, opts)
            .ok_or_else(|| SyncError::NotFound(format!("item {} in {}", id, self.key_path)))
    }

    /// Swap a pending item's temporary id for the server's. If the server's
    /// copy already arrived through a notification, the pending duplicate is
    /// dropped instead.
    pub fn acknowledge(&self, temp_id: &str, id: &str) -> bool {
        let duplicate = {
            let mut links = lock(&self.links);
            if !links.contains(temp_id) {
                return false;
            }
            if links.contains(id) {
                true
            } else {
                links.rename(temp_id, id);
                if let Some(node) = links.nodes.get_mut(id) {
                    node.item.pending = false;
                }
                false
            }
        };
        if duplicate {
            self.unlink(temp_id, SetOptions::nosync());
        }
        self.emitter.emit(
            "id:",
            &SequenceEvent::IdAssigned { old_id: temp_id.to_string(), new_id: id.to_string() },
        );
        true
    }

    /// Make non-pending items match the server's list. Takes ownership of the
    /// remote documents. Emits a single `resynced:` event.
    pub fn resync(&self, remote: Vec<(String, DocumentRef)>) {
        let local: Vec<(String, bool)> = lock(&self.links)
            .ordered()
            .into_iter()
            .map(|n| (n.item.id.clone(), n.item.pending))
            .collect();
        let remote_ids: Vec<String> = remote.iter().map(|(id, _)| id.clone()).collect();
        let plan = reconcile::plan(&local, &remote_ids);

        for id in &plan.removals {
            self.unlink(id, SetOptions::nosync());
        }

        let mut incoming: HashMap<String, DocumentRef> = HashMap::new();
        for (id, doc) in remote {
            match self.get(&id) {
                Some(existing) => {
                    existing.doc.set(doc.fields(), SetOptions::nosync());
                    release(&doc);
                }
                None => {
                    incoming.insert(id, doc);
                }
            }
        }

        for insertion in plan.insertions {
            if let Some(doc) = incoming.remove(&insertion.id) {
                let item = self.link(insertion.id, doc, insertion.before.as_deref(), false);
                self.emitter.emit(
                    "insertedBefore:",
                    &SequenceEvent::InsertedBefore { item, ref_id: insertion.before, nosync: true },
                );
            }
        }
        for doc in incoming.into_values() {
            release(&doc);
        }
        self.emitter.emit("resynced:", &SequenceEvent::Resynced);
    }

    fn check_reference(&self, ref_id: Option<&str>) -> Result<()> {
        match ref_id {
            Some(r) if !self.contains(r) => Err(SyncError::InvalidReference {
                key_path: self.key_path.clone(),
                ref_id: r.to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn link(&self, id: String, doc: DocumentRef, before: Option<&str>, pending: bool) -> SequenceItem {
        let item = SequenceItem { id, doc, pending };
        let listeners = self.watch(&item.doc);
        lock(&self.links).link_before(
            Node { item: item.clone(), prev: None, next: None, listeners },
            before,
        );
        item
    }

    fn unlink(&self, id: &str, opts: SetOptions) -> Option<SequenceItem> {
        let node = lock(&self.links).unlink(id)?;
        for listener in node.listeners {
            node.item.doc.off(listener);
        }
        release(&node.item.doc);
        self.emitter.emit(
            "deleted:",
            &SequenceEvent::Deleted { item: node.item.clone(), nosync: opts.nosync },
        );
        Some(node.item)
    }

    fn watch(&self, doc: &DocumentRef) -> Vec<ListenerId> {
        let this = self.this.clone();
        let weak_doc = Arc::downgrade(doc);
        let changed = doc.on("changed:", move |event| {
            if let (Some(sequence), Some(doc), DocumentEvent::Changed { fields, .. }) =
                (this.upgrade(), weak_doc.upgrade(), event)
            {
                sequence.emitter.emit("updated:", &SequenceEvent::Updated { doc, fields: fields.clone() });
            }
        });
        let this = self.this.clone();
        let weak_doc = Arc::downgrade(doc);
        let deleted = doc.on("deleted:", move |event| {
            let (Some(sequence), Some(doc), DocumentEvent::Deleted { nosync }) =
                (this.upgrade(), weak_doc.upgrade(), event)
            else {
                return;
            };
            let ids: Vec<String> = sequence
                .items()
                .into_iter()
                .filter(|item| Arc::ptr_eq(&item.doc, &doc))
                .map(|item| item.id)
                .collect();
            for id in ids {
                if let Err(e) = sequence.delete_item(&id, SetOptions { nosync: *nosync }) {
                    log::warn!("failed to drop deleted item {} from {}: {}", id, sequence.key_path, e);
                }
            }
        });
        vec![changed, deleted]
    }

    pub fn on<F>(&self, key: impl Into<EventKey>, handler: F) -> ListenerId
    where
        F: Fn(&SequenceEvent) + Send + Sync + 'static,
    {
        self.emitter.on(key, handler)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.emitter.off(id)
    }
}

impl Drop for Sequence {
    fn drop(&mut self) {
        let links = std::mem::take(&mut *lock(&self.links));
        for node in links.nodes.into_values() {
            for listener in node.listeners {
                node.item.doc.off(listener);
            }
            release(&node.item.doc);
        }
    }
}

fn release(doc: &DocumentRef) {
    if let Err(e) = doc.release() {
        log::warn!("{}", e);
    }
}
