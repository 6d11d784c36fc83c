//! The remote store contract.
//!
//! Eleven verbs cover documents, collections and sequences. The server
//! implements them over a durable store; the client reaches them through a
//! transport. Documents travel as JSON objects carrying their id in `_id`.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::RocksStore;

use async_trait::async_trait;
use ginger_core::{KeyPath, Result, SyncError, ID_FIELD};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field equality filter applied by `find` and `all`. Empty matches everything.
pub type Query = Map<String, Value>;

/// Caller-supplied options. Unused fields are ignored by stores.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreOptions {
    #[serde(default)]
    pub nosync: bool,
}

/// One sequence item as the server sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceEntry {
    pub id: String,
    pub key_path: KeyPath,
    pub doc: Value,
}

/// Result of `insert_before`: the server's id for the new item and the
/// reference it was inserted in front of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertedItem {
    pub id: String,
    pub ref_id: Option<String>,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create a document in the bucket at `key_path`. Returns its new id.
    async fn create(&self, key_path: &KeyPath, doc: Value, opts: &StoreOptions) -> Result<String>;

    async fn put(&self, key_path: &KeyPath, doc: Value, opts: &StoreOptions) -> Result<()>;

    async fn fetch(&self, key_path: &KeyPath, opts: &StoreOptions) -> Result<Value>;

    async fn del(&self, key_path: &KeyPath, opts: &StoreOptions) -> Result<()>;

    async fn add(
        &self,
        key_path: &KeyPath,
        items_key_path: &KeyPath,
        item_ids: &[String],
        opts: &StoreOptions,
    ) -> Result<()>;

    async fn remove(
        &self,
        key_path: &KeyPath,
        items_key_path: &KeyPath,
        item_ids: &[String],
        opts: &StoreOptions,
    ) -> Result<()>;

    /// Members of the collection at `key_path`, in insertion order.
    async fn find(&self, key_path: &KeyPath, query: &Query, opts: &StoreOptions) -> Result<Vec<Value>>;

    /// Items of the sequence at `key_path`, in order.
    async fn all(&self, key_path: &KeyPath, query: &Query, opts: &StoreOptions) -> Result<Vec<SequenceEntry>>;

    /// The item after `id`, or the first item when `id` is `None`.
    async fn next(&self, key_path: &KeyPath, id: Option<&str>, opts: &StoreOptions) -> Result<Option<SequenceEntry>>;

    /// Insert `item_key_path` in front of `ref_id`; `None` appends.
    async fn insert_before(
        &self,
        key_path: &KeyPath,
        ref_id: Option<&str>,
        item_key_path: &KeyPath,
        opts: &StoreOptions,
    ) -> Result<InsertedItem>;

    async fn delete_item(&self, key_path: &KeyPath, id: &str, opts: &StoreOptions) -> Result<()>;
}

/// True when every field in `query` equals the document's.
pub fn matches_query(doc: &Value, query: &Query) -> bool {
    query.iter().all(|(k, v)| doc.get(k) == Some(v))
}

/// Attach `_id` to a stored document.
pub(crate) fn with_id(mut doc: Value, id: &str) -> Value {
    if let Value::Object(map) = &mut doc {
        map.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    }
    doc
}

/// Strip `_id` before storing; the id lives in the key path.
pub(crate) fn without_id(mut doc: Value) -> Result<Value> {
    match &mut doc {
        Value::Object(map) => {
            map.remove(ID_FIELD);
            Ok(doc)
        }
        other => Err(SyncError::Serialization(format!("document must be an object: {}", other))),
    }
}

/// Shallow merge of `patch` into `base`.
pub(crate) fn merge(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (k, v) in patch {
                base.insert(k, v);
            }
        }
        (base, patch) => *base = patch,
    }
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_matches_query() {
        let doc = json!({"name": "tiger", "legs": 4});
        let mut query = Query::new();
        assert!(matches_query(&doc, &query));
        query.insert("legs".into(), json!(4));
        assert!(matches_query(&doc, &query));
        query.insert("name".into(), json!("mouse"));
        assert!(!matches_query(&doc, &query));
    }

    #[test]
    fn test_merge_and_ids() {
        let mut base = json!({"a": 1, "b": 2});
        merge(&mut base, json!({"b": 3, "c": 4}));
        assert_eq!(base, json!({"a": 1, "b": 3, "c": 4}));
        assert_eq!(with_id(json!({}), "x"), json!({"_id": "x"}));
        assert_eq!(without_id(json!({"_id": "x", "a": 1})).unwrap(), json!({"a": 1}));
        assert!(without_id(json!(3)).is_err());
    }
}
