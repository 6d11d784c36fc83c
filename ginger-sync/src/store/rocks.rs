//! RocksDB-backed remote store.
//!
//! ```text
//!  documents   : keyPath(json) ─► lz4(json document)
//!  collections : keyPath(json) ─► json [memberKeyPath, ...]
//!  sequences   : keyPath(json) ─► json [{id, keyPath}, ...]
//! ```
//!
//! Read-modify-write verbs hold a store-wide write lock so concurrent
//! connections cannot interleave updates to the same list.

use super::memory::{not_found, reference_position, StoredItem};
use super::{matches_query, merge, new_id, with_id, without_id, InsertedItem, Query, RemoteStore, SequenceEntry, StoreOptions};
use crate::storage::rocks::{CF_COLLECTIONS, CF_DOCUMENTS, CF_SEQUENCES};
use crate::storage::{KvBackend, RocksBackend, RocksDb};
use async_trait::async_trait;
use ginger_core::event::lock;
use ginger_core::{KeyPath, Result, SyncError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};

pub struct RocksStore {
    documents: RocksBackend,
    collections: RocksBackend,
    sequences: RocksBackend,
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Store over the documents, collections and sequences column families of `db`.
    pub fn new(db: &Arc<RocksDb>) -> Self {
        Self {
            documents: db.partition(CF_DOCUMENTS),
            collections: db.partition(CF_COLLECTIONS),
            sequences: db.partition(CF_SEQUENCES),
            write_lock: Mutex::new(()),
        }
    }

    fn load_doc(&self, key_path: &KeyPath) -> Result<Option<Value>> {
        match self.documents.get(&key_bytes(key_path)?)? {
            Some(compressed) => {
                let bytes = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| SyncError::Storage(format!("decompression failed: {e}")))?;
                Ok(Some(serde_json::from_slice(&bytes)?))
            }
            None => Ok(None),
        }
    }

    fn save_doc(&self, key_path: &KeyPath, doc: &Value) -> Result<()> {
        let bytes = serde_json::to_vec(doc)?;
        let compressed = lz4_flex::compress_prepend_size(&bytes);
        self.documents.put(&key_bytes(key_path)?, &compressed)
    }

    fn doc_with_id(&self, key_path: &KeyPath) -> Result<Option<Value>> {
        Ok(self
            .load_doc(key_path)?
            .map(|d| with_id(d, key_path.last().unwrap_or_default())))
    }

    fn load_items(&self, key_path: &KeyPath) -> Result<Vec<StoredItem>> {
        load_list(&self.sequences, key_path)
    }

    fn entry(&self, item: &StoredItem) -> Result<Option<SequenceEntry>> {
        Ok(self.doc_with_id(&item.key_path)?.map(|doc| SequenceEntry {
            id: item.id.clone(),
            key_path: item.key_path.clone(),
            doc,
        }))
    }
}

fn key_bytes(key_path: &KeyPath) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(key_path)?)
}

fn load_list<T: DeserializeOwned>(backend: &RocksBackend, key_path: &KeyPath) -> Result<Vec<T>> {
    match backend.get(&key_bytes(key_path)?)? {
        Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
        None => Ok(Vec::new()),
    }
}

fn save_list<T: Serialize>(backend: &RocksBackend, key_path: &KeyPath, list: &[T]) -> Result<()> {
    backend.put(&key_bytes(key_path)?, &serde_json::to_vec(list)?)
}

#[async_trait]
impl RemoteStore for RocksStore {
    async fn create(&self, key_path: &KeyPath, doc: Value, _opts: &StoreOptions) -> Result<String> {
        let doc = without_id(doc)?;
        let id = new_id();
        self.save_doc(&key_path.child(id.clone()), &doc)?;
        log::debug!("created {}/{}", key_path, id);
        Ok(id)
    }

    async fn put(&self, key_path: &KeyPath, doc: Value, _opts: &StoreOptions) -> Result<()> {
        let patch = without_id(doc)?;
        let _guard = lock(&self.write_lock);
        let mut stored = self.load_doc(key_path)?.ok_or_else(|| not_found("document", key_path))?;
        merge(&mut stored, patch);
        self.save_doc(key_path, &stored)
    }

    async fn fetch(&self, key_path: &KeyPath, _opts: &StoreOptions) -> Result<Value> {
        self.doc_with_id(key_path)?.ok_or_else(|| not_found("document", key_path))
    }

    async fn del(&self, key_path: &KeyPath, _opts: &StoreOptions) -> Result<()> {
        self.documents.delete(&key_bytes(key_path)?)
    }

    async fn add(&self, key_path: &KeyPath, items_key_path: &KeyPath, item_ids: &[String], _opts: &StoreOptions) -> Result<()> {
        let _guard = lock(&self.write_lock);
        let mut members: Vec<KeyPath> = load_list(&self.collections, key_path)?;
        for id in item_ids {
            let member = items_key_path.child(id.clone());
            if !members.contains(&member) {
                members.push(member);
            }
        }
        save_list(&self.collections, key_path, &members)
    }

    async fn remove(&self, key_path: &KeyPath, items_key_path: &KeyPath, item_ids: &[String], _opts: &StoreOptions) -> Result<()> {
        let _guard = lock(&self.write_lock);
        let mut members: Vec<KeyPath> = load_list(&self.collections, key_path)?;
        members.retain(|m| {
            !(m.parent().as_ref() == Some(items_key_path) && item_ids.iter().any(|id| m.last() == Some(id.as_str())))
        });
        save_list(&self.collections, key_path, &members)
    }

    async fn find(&self, key_path: &KeyPath, query: &Query, _opts: &StoreOptions) -> Result<Vec<Value>> {
        let members: Vec<KeyPath> = load_list(&self.collections, key_path)?;
        let mut docs = Vec::with_capacity(members.len());
        for member in &members {
            if let Some(doc) = self.doc_with_id(member)? {
                if matches_query(&doc, query) {
                    docs.push(doc);
                }
            }
        }
        Ok(docs)
    }

    async fn all(&self, key_path: &KeyPath, query: &Query, _opts: &StoreOptions) -> Result<Vec<SequenceEntry>> {
        let mut entries = Vec::new();
        for item in self.load_items(key_path)? {
            if let Some(entry) = self.entry(&item)? {
                if matches_query(&entry.doc, query) {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }

    async fn next(&self, key_path: &KeyPath, id: Option<&str>, _opts: &StoreOptions) -> Result<Option<SequenceEntry>> {
        let items = self.load_items(key_path)?;
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
        for item in items.iter().skip(start) {
            if let Some(entry) = self.entry(item)? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    async fn insert_before(&self, key_path: &KeyPath, ref_id: Option<&str>, item_key_path: &KeyPath, _opts: &StoreOptions) -> Result<InsertedItem> {
        let _guard = lock(&self.write_lock);
        let mut items = self.load_items(key_path)?;
        let position = reference_position(&items, key_path, ref_id)?;
        let id = new_id();
        let item = StoredItem { id: id.clone(), key_path: item_key_path.clone() };
        match position {
            Some(at) => items.insert(at, item),
            None => items.push(item),
        }
        save_list(&self.sequences, key_path, &items)?;
        Ok(InsertedItem { id, ref_id: ref_id.map(str::to_string) })
    }

    async fn delete_item(&self, key_path: &KeyPath, id: &str, _opts: &StoreOptions) -> Result<()> {
        let _guard = lock(&self.write_lock);
        let mut items = self.load_items(key_path)?;
        let at = items
            .iter()
            .position(|i| i.id == id)
            .ok_or_else(|| not_found("item", &key_path.child(id)))?;
        items.remove(at);
        save_list(&self.sequences, key_path, &items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreConfig;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_documents_survive_reopen() {
        let dir = tempdir().unwrap();
        let animals = KeyPath::from(["animals"]);
        let opts = StoreOptions::default();
        let id = {
            let db = RocksDb::open(StoreConfig::for_testing(dir.path())).unwrap();
            let store = RocksStore::new(&db);
            let id = store.create(&animals, json!({"name": "tiger", "legs": 4}), &opts).await.unwrap();
            store.put(&animals.child(id.clone()), json!({"legs": 3}), &opts).await.unwrap();
            id
        };

        let db = RocksDb::open(StoreConfig::for_testing(dir.path())).unwrap();
        let store = RocksStore::new(&db);
        let doc = store.fetch(&animals.child(id.clone()), &opts).await.unwrap();
        assert_eq!(doc, json!({"_id": id, "name": "tiger", "legs": 3}));
    }

    #[tokio::test]
    async fn test_sequence_and_collection() {
        let dir = tempdir().unwrap();
        let db = RocksDb::open(StoreConfig::for_testing(dir.path())).unwrap();
        let store = RocksStore::new(&db);
        let opts = StoreOptions::default();
        let animals = KeyPath::from(["animals"]);
        let parade = KeyPath::from(["parade", "1", "animals"]);
        let zoo = KeyPath::from(["zoo", "1", "animals"]);

        let a = store.create(&animals, json!({"name": "a"}), &opts).await.unwrap();
        let b = store.create(&animals, json!({"name": "b"}), &opts).await.unwrap();

        store.add(&zoo, &animals, &[a.clone(), b.clone()], &opts).await.unwrap();
        store.remove(&zoo, &animals, &[a.clone()], &opts).await.unwrap();
        let found = store.find(&zoo, &Query::new(), &opts).await.unwrap();
        assert_eq!(found, vec![json!({"_id": b, "name": "b"})]);

        let first = store.insert_before(&parade, None, &animals.child(a.clone()), &opts).await.unwrap();
        store.insert_before(&parade, None, &animals.child(b.clone()), &opts).await.unwrap();
        let names: Vec<Value> = store
            .all(&parade, &Query::new(), &opts)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.doc["name"].clone())
            .collect();
        assert_eq!(names, vec![json!("a"), json!("b")]);

        store.delete_item(&parade, &first.id, &opts).await.unwrap();
        assert_eq!(store.all(&parade, &Query::new(), &opts).await.unwrap().len(), 1);
        assert!(store.insert_before(&parade, Some(&first.id), &animals.child(a), &opts).await.is_err());
    }
}
