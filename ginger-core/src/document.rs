//! Observable, reference-counted documents.
//!
//! A document starts life with a client id (`cid`). Once the server accepts
//! its creation it also carries a server id; that transition happens exactly
//! once and is announced with an `id:` event.
//!
//! Containers call [`Document::retain`] when they take an item and
//! [`Document::release`] when they drop it. The release that brings the count
//! to zero tears the document down: a `destroy:` event fires and every
//! listener is removed. Releasing past zero is an error, never a silent no-op.
//!
//! Events:
//!
//! | key               | when                                   |
//! |-------------------|----------------------------------------|
//! | `changed:`        | at least one field value changed       |
//! | `changed:<field>` | that field's value changed             |
//! | `id:`             | the server id was assigned             |
//! | `deleted:`        | the document was deleted               |
//! | `destroy:`        | the last reference was released        |

use crate::error::{Result, SyncError};
use crate::event::{lock, EventKey, Emitter, ListenerId};
use crate::keypath::KeyPath;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub type Fields = Map<String, Value>;
pub type DocumentRef = Arc<Document>;

/// Reserved field carrying the server id in stored documents.
pub const ID_FIELD: &str = "_id";

/// Options accepted by every mutating call on the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Apply locally without producing a mutation record.
    pub nosync: bool,
}

impl SetOptions {
    /// Options for changes that came from the server and must not be re-sent.
    pub fn nosync() -> Self {
        Self { nosync: true }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DocumentEvent {
    Changed { fields: Fields, nosync: bool },
    Field { name: String, value: Value },
    IdAssigned { cid: String, id: String },
    Deleted { nosync: bool },
    Destroyed,
}

#[derive(Debug, Default)]
struct DocumentState {
    id: Option<String>,
    fields: Fields,
    queued: bool,
    deleted: bool,
}

#[derive(Debug)]
pub struct Document {
    cid: String,
    bucket: String,
    state: Mutex<DocumentState>,
    ref_count: AtomicUsize,
    destroyed: AtomicBool,
    emitter: Emitter<DocumentEvent>,
}

impl Document {
    /// A new, not yet persisted document. The caller holds one reference.
    pub fn create(bucket: impl Into<String>, fields: Fields) -> DocumentRef {
        Arc::new(Self::build(bucket.into(), None, fields))
    }

    /// A document already known to the server. `_id` in `doc` is the server id.
    pub fn from_persisted(bucket: impl Into<String>, doc: &Value) -> Result<DocumentRef> {
        let mut fields = doc
            .as_object()
            .cloned()
            .ok_or_else(|| SyncError::Serialization(format!("document must be an object: {}", doc)))?;
        let id = match fields.remove(ID_FIELD) {
            Some(Value::String(id)) => id,
            Some(other) => other.to_string(),
            None => return Err(SyncError::Serialization("persisted document without _id".into())),
        };
        Ok(Arc::new(Self::build(bucket.into(), Some(id), fields)))
    }

    fn build(bucket: String, id: Option<String>, mut fields: Fields) -> Self {
        fields.remove(ID_FIELD);
        let queued = id.is_some();
        Self {
            cid: Uuid::new_v4().simple().to_string(),
            bucket,
            state: Mutex::new(DocumentState { id, fields, queued, deleted: false }),
            ref_count: AtomicUsize::new(1),
            destroyed: AtomicBool::new(false),
            emitter: Emitter::new(),
        }
    }

    /// Client id, stable for the life of this instance.
    pub fn cid(&self) -> &str {
        &self.cid
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Server id, once the creation was acknowledged.
    pub fn id(&self) -> Option<String> {
        lock(&self.state).id.clone()
    }

    /// Server id if assigned, otherwise the client id.
    pub fn ident(&self) -> String {
        self.id().unwrap_or_else(|| self.cid.clone())
    }

    /// True for either of this document's ids.
    pub fn matches(&self, id: &str) -> bool {
        self.cid == id || lock(&self.state).id.as_deref() == Some(id)
    }

    /// `bucket/id`, or `bucket/cid` before the server assigned an id.
    pub fn key_path(&self) -> KeyPath {
        KeyPath::new([self.bucket.clone(), self.ident()])
    }

    pub fn is_persisted(&self) -> bool {
        lock(&self.state).id.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        lock(&self.state).deleted
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        lock(&self.state).fields.get(name).cloned()
    }

    pub fn fields(&self) -> Fields {
        lock(&self.state).fields.clone()
    }

    /// Fields plus `_id` when persisted.
    pub fn to_value(&self) -> Value {
        let state = lock(&self.state);
        let mut doc = state.fields.clone();
        if let Some(id) = &state.id {
            doc.insert(ID_FIELD.to_string(), Value::String(id.clone()));
        }
        Value::Object(doc)
    }

    /// Merge `fields` into the document. Emits `changed:` only when some value
    /// actually differs. Returns whether anything changed.
    pub fn set(&self, fields: Fields, opts: SetOptions) -> bool {
        let changed: Fields = {
            let mut state = lock(&self.state);
            let mut changed = Fields::new();
            for (name, value) in fields {
                if name == ID_FIELD || state.fields.get(&name) == Some(&value) {
                    continue;
                }
                state.fields.insert(name.clone(), value.clone());
                changed.insert(name, value);
            }
            changed
        };
        if changed.is_empty() {
            return false;
        }
        for (name, value) in &changed {
            self.emitter.emit(
                EventKey::namespaced("changed", name.as_str()),
                &DocumentEvent::Field { name: name.clone(), value: value.clone() },
            );
        }
        self.emitter.emit("changed:", &DocumentEvent::Changed { fields: changed, nosync: opts.nosync });
        true
    }

    /// Set one field. Returns false when the value was unchanged.
    pub fn set_field(&self, name: impl Into<String>, value: Value, opts: SetOptions) -> bool {
        let mut fields = Fields::new();
        fields.insert(name.into(), value);
        self.set(fields, opts)
    }

    /// Record the server id. Succeeds once; repeating the same id is a no-op
    /// returning false, a different id is an error.
    pub fn assign_id(&self, id: &str) -> Result<bool> {
        {
            let mut state = lock(&self.state);
            match &state.id {
                Some(existing) if existing == id => return Ok(false),
                Some(existing) => {
                    return Err(SyncError::AlreadyPersisted { cid: self.cid.clone(), id: existing.clone() })
                }
                None => {
                    state.id = Some(id.to_string());
                    state.queued = true;
                }
            }
        }
        self.emitter.emit("id:", &DocumentEvent::IdAssigned { cid: self.cid.clone(), id: id.to_string() });
        Ok(true)
    }

    /// Claim the right to enqueue this document's creation. Returns true for
    /// the first caller only.
    pub fn mark_queued(&self) -> bool {
        let mut state = lock(&self.state);
        !std::mem::replace(&mut state.queued, true)
    }

    /// Flag the document deleted and emit `deleted:`.
    pub fn mark_deleted(&self, opts: SetOptions) {
        {
            let mut state = lock(&self.state);
            if state.deleted {
                return;
            }
            state.deleted = true;
        }
        self.emitter.emit("deleted:", &DocumentEvent::Deleted { nosync: opts.nosync });
    }

    /// Take one more reference. Returns the new count.
    pub fn retain(&self) -> usize {
        self.ref_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Drop one reference. Returns true when this call destroyed the document.
    pub fn release(&self) -> Result<bool> {
        let previous = self
            .ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map_err(|_| SyncError::DoubleRelease { cid: self.cid.clone() })?;
        if previous == 1 {
            self.destroy();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.emitter.emit("destroy:", &DocumentEvent::Destroyed);
        self.emitter.clear();
    }

    /// Listen for `changed:`, `id:`, `deleted:` and `destroy:`.
    pub fn on<F>(&self, key: impl Into<EventKey>, handler: F) -> ListenerId
    where
        F: Fn(&DocumentEvent) + Send + Sync + 'static,
    {
        self.emitter.on(key, handler)
    }

    pub fn once<F>(&self, key: impl Into<EventKey>, handler: F) -> ListenerId
    where
        F: Fn(&DocumentEvent) + Send + Sync + 'static,
    {
        self.emitter.once(key, handler)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.emitter.off(id)
    }

    pub fn emit(&self, key: impl Into<EventKey>, event: &DocumentEvent) -> usize {
        self.emitter.emit(key, event)
    }
}

/// Build a field map from a JSON object literal. Non-objects yield no fields.
pub fn fields_of(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        _ => Fields::new(),
    }
}
