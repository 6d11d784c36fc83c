//! In-memory remote store.

use super::{matches_query, merge, new_id, with_id, without_id, InsertedItem, Query, RemoteStore, SequenceEntry, StoreOptions};
use async_trait::async_trait;
use ginger_core::event::lock;
use ginger_core::{KeyPath, Result, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StoredItem {
    pub id: String,
    pub key_path: KeyPath,
}

#[derive(Debug, Default)]
struct Inner {
    docs: HashMap<KeyPath, Value>,
    collections: HashMap<KeyPath, Vec<KeyPath>>,
    sequences: HashMap<KeyPath, Vec<StoredItem>>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents.
    pub fn document_count(&self) -> usize {
        lock(&self.inner).docs.len()
    }
}

pub(crate) fn not_found(what: &str, key_path: &KeyPath) -> SyncError {
    SyncError::NotFound(format!("{} {}", what, key_path))
}

/// Position of `ref_id` in `items`, or an error naming the sequence.
pub(crate) fn reference_position(items: &[StoredItem], key_path: &KeyPath, ref_id: Option<&str>) -> Result<Option<usize>> {
    match ref_id {
        None => Ok(None),
        Some(r) => items
            .iter()
            .position(|i| i.id == r)
            .map(Some)
            .ok_or_else(|| SyncError::InvalidReference { key_path: key_path.clone(), ref_id: r.to_string() }),
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn create(&self, key_path: &KeyPath, doc: Value, _opts: &StoreOptions) -> Result<String> {
        let doc = without_id(doc)?;
        let id = new_id();
        lock(&self.inner).docs.insert(key_path.child(id.clone()), doc);
        Ok(id)
    }

    async fn put(&self, key_path: &KeyPath, doc: Value, _opts: &StoreOptions) -> Result<()> {
        let patch = without_id(doc)?;
        let mut inner = lock(&self.inner);
        let stored = inner.docs.get_mut(key_path).ok_or_else(|| not_found("document", key_path))?;
        merge(stored, patch);
        Ok(())
    }

    async fn fetch(&self, key_path: &KeyPath, _opts: &StoreOptions) -> Result<Value> {
        let inner = lock(&self.inner);
        let doc = inner.docs.get(key_path).ok_or_else(|| not_found("document", key_path))?;
        Ok(with_id(doc.clone(), key_path.last().unwrap_or_default()))
    }

    async fn del(&self, key_path: &KeyPath, _opts: &StoreOptions) -> Result<()> {
        lock(&self.inner).docs.remove(key_path);
        Ok(())
    }

    async fn add(&self, key_path: &KeyPath, items_key_path: &KeyPath, item_ids: &[String], _opts: &StoreOptions) -> Result<()> {
        let mut inner = lock(&self.inner);
        let members = inner.collections.entry(key_path.clone()).or_default();
        for id in item_ids {
            let member = items_key_path.child(id.clone());
            if !members.contains(&member) {
                members.push(member);
            }
        }
        Ok(())
    }

    async fn remove(&self, key_path: &KeyPath, items_key_path: &KeyPath, item_ids: &[String], _opts: &StoreOptions) -> Result<()> {
        let mut inner = lock(&self.inner);
        if let Some(members) = inner.collections.get_mut(key_path) {
            members.retain(|m| !(m.parent().as_ref() == Some(items_key_path) && item_ids.iter().any(|id| m.last() == Some(id.as_str()))));
        }
        Ok(())
    }

    async fn find(&self, key_path: &KeyPath, query: &Query, _opts: &StoreOptions) -> Result<Vec<Value>> {
        let inner = lock(&self.inner);
        let Some(members) = inner.collections.get(key_path) else {
            return Ok(Vec::new());
        };
        Ok(members
            .iter()
            .filter_map(|m| inner.docs.get(m).map(|d| with_id(d.clone(), m.last().unwrap_or_default())))
            .filter(|d| matches_query(d, query))
            .collect())
    }

    async fn all(&self, key_path: &KeyPath, query: &Query, _opts: &StoreOptions) -> Result<Vec<SequenceEntry>> {
        let inner = lock(&self.inner);
        let Some(items) = inner.sequences.get(key_path) else {
            return Ok(Vec::new());
        };
        Ok(items
            .iter()
            .filter_map(|item| {
                inner.docs.get(&item.key_path).map(|d| SequenceEntry {
                    id: item.id.clone(),
                    key_path: item.key_path.clone(),
                    doc: with_id(d.clone(), item.key_path.last().unwrap_or_default()),
                })
            })
            .filter(|e| matches_query(&e.doc, query))
            .collect())
    }

    async fn next(&self, key_path: &KeyPath, id: Option<&str>, _opts: &StoreOptions) -> Result<Option<SequenceEntry>> {
        let inner = lock(&self.inner);
        let items = inner.sequences.get(key_path).map(Vec::as_slice).unwrap_or_default();
        let start = match id {
            None => 0,
            Some(id) => {
                items
                    .iter()
                    .position(|i| i.id == id)
                    .ok_or_else(|| not_found("item", &key_path.child(id)))?
                    + 1
            }
        };
        // Items whose document is gone are skipped, as in `all`.
        Ok(items.iter().skip(start).find_map(|item| {
            inner.docs.get(&item.key_path).map(|d| SequenceEntry {
                id: item.id.clone(),
                key_path: item.key_path.clone(),
                doc: with_id(d.clone(), item.key_path.last().unwrap_or_default()),
            })
        }))
    }

    async fn insert_before(&self, key_path: &KeyPath, ref_id: Option<&str>, item_key_path: &KeyPath, _opts: &StoreOptions) -> Result<InsertedItem> {
        let mut inner = lock(&self.inner);
        let existing = inner.sequences.get(key_path).map(Vec::as_slice).unwrap_or_default();
        let position = reference_position(existing, key_path, ref_id)?;
        let items = inner.sequences.entry(key_path.clone()).or_default();
        let id = new_id();
        let item = StoredItem { id: id.clone(), key_path: item_key_path.clone() };
        match position {
            Some(at) => items.insert(at, item),
            None => items.push(item),
        }
        Ok(InsertedItem { id, ref_id: ref_id.map(str::to_string) })
    }

    async fn delete_item(&self, key_path: &KeyPath, id: &str, _opts: &StoreOptions) -> Result<()> {
        let mut inner = lock(&self.inner);
        let items = inner
            .sequences
            .get_mut(key_path)
            .ok_or_else(|| not_found("item", &key_path.child(id)))?;
        let at = items
            .iter()
            .position(|i| i.id == id)
            .ok_or_else(|| not_found("item", &key_path.child(id)))?;
        items.remove(at);
        Ok(())
    }
}
