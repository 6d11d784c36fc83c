//! Mutation records: the unit the client queue persists and replays.

use crate::error::Result;
use crate::keypath::KeyPath;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Verb {
    Create,
    Put,
    Del,
    Add,
    Remove,
    InsertBefore,
    DeleteItem,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Create => "create",
            Verb::Put => "put",
            Verb::Del => "del",
            Verb::Add => "add",
            Verb::Remove => "remove",
            Verb::InsertBefore => "insertBefore",
            Verb::DeleteItem => "deleteItem",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verb-specific arguments. Serialized with a `verb` tag alongside the
/// record's key paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Payload {
    /// `cid` is the client-side id the document carries until the server
    /// assigns a real one.
    Create { cid: String, doc: Value },
    Put { doc: Value },
    Del,
    Add { item_ids: Vec<String> },
    Remove { item_ids: Vec<String> },
    /// `item_id` is the pending local item id, replaced by the server's.
    InsertBefore {
        ref_id: Option<String>,
        item_key_path: KeyPath,
        item_id: String,
    },
    DeleteItem { id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRecord {
    pub key_path: KeyPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_key_path: Option<KeyPath>,
    #[serde(flatten)]
    pub payload: Payload,
    pub client_id: String,
}

impl MutationRecord {
    /// Create `doc` in the bucket at `key_path`. `cid` is rewritten to the
    /// server id in later records once this one is delivered.
    pub fn create(key_path: KeyPath, cid: impl Into<String>, doc: Value, client_id: &str) -> Self {
        Self::build(key_path, None, Payload::Create { cid: cid.into(), doc }, client_id)
    }

    pub fn put(key_path: KeyPath, doc: Value, client_id: &str) -> Self {
        Self::build(key_path, None, Payload::Put { doc }, client_id)
    }

    pub fn del(key_path: KeyPath, client_id: &str) -> Self {
        Self::build(key_path, None, Payload::Del, client_id)
    }

    pub fn add(key_path: KeyPath, items_key_path: KeyPath, item_ids: Vec<String>, client_id: &str) -> Self {
        Self::build(key_path, Some(items_key_path), Payload::Add { item_ids }, client_id)
    }

    pub fn remove(key_path: KeyPath, items_key_path: KeyPath, item_ids: Vec<String>, client_id: &str) -> Self {
        Self::build(key_path, Some(items_key_path), Payload::Remove { item_ids }, client_id)
    }

    /// Insert `item_key_path` before `ref_id` (append when `None`). `item_id` is
    /// the temporary item id until the server assigns one.
    pub fn insert_before(
        key_path: KeyPath,
        ref_id: Option<String>,
        item_key_path: KeyPath,
        item_id: impl Into<String>,
        client_id: &str,
    ) -> Self {
        let payload = Payload::InsertBefore { ref_id, item_key_path, item_id: item_id.into() };
        Self::build(key_path, None, payload, client_id)
    }

    pub fn delete_item(key_path: KeyPath, id: impl Into<String>, client_id: &str) -> Self {
        Self::build(key_path, None, Payload::DeleteItem { id: id.into() }, client_id)
    }

    fn build(key_path: KeyPath, items_key_path: Option<KeyPath>, payload: Payload, client_id: &str) -> Self {
        Self { key_path, items_key_path, payload, client_id: client_id.to_string() }
    }

    /// Verb of the payload.
    pub fn verb(&self) -> Verb {
        match self.payload {
            Payload::Create { .. } => Verb::Create,
            Payload::Put { .. } => Verb::Put,
            Payload::Del => Verb::Del,
            Payload::Add { .. } => Verb::Add,
            Payload::Remove { .. } => Verb::Remove,
            Payload::InsertBefore { .. } => Verb::InsertBefore,
            Payload::DeleteItem { .. } => Verb::DeleteItem,
        }
    }

    /// Temporary id that the server replaces when this record is delivered.
    pub fn temporary_id(&self) -> Option<&str> {
        match &self.payload {
            Payload::Create { cid, .. } => Some(cid),
            Payload::InsertBefore { item_id, .. } => Some(item_id),
            _ => None,
        }
    }

    /// Replace every occurrence of `old` with `new` in key paths, item ids
    /// and references. Returns true if the record changed.
    pub fn rewrite_id(&mut self, old: &str, new: &str) -> bool {
        let mut changed = self.key_path.rewrite_segment(old, new);
        if let Some(kp) = self.items_key_path.as_mut() {
            changed |= kp.rewrite_segment(old, new);
        }
        let swap = |id: &mut String| {
            if id == old {
                *id = new.to_string();
                true
            } else {
                false
            }
        };
        match &mut self.payload {
            Payload::Add { item_ids } | Payload::Remove { item_ids } => {
                for id in item_ids.iter_mut() {
                    changed |= swap(id);
                }
            }
            Payload::InsertBefore { ref_id, item_key_path, item_id } => {
                if let Some(r) = ref_id.as_mut() {
                    changed |= swap(r);
                }
                changed |= item_key_path.rewrite_segment(old, new);
                changed |= swap(item_id);
            }
            Payload::DeleteItem { id } => changed |= swap(id),
            Payload::Create { .. } | Payload::Put { .. } | Payload::Del => {}
        }
        changed
    }
}

/// Destination for locally originated mutations. The client queue is the
/// production implementation.
pub trait MutationSink: Send + Sync {
    fn client_id(&self) -> &str;

    /// Persist the record for later delivery. Returns its queue sequence.
    fn submit(&self, record: MutationRecord) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let record = MutationRecord::add(
            KeyPath::from(["zoo", "1", "animals"]),
            KeyPath::from(["animals"]),
            vec!["a".into()],
            "c1",
        );
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value,
            json!({
                "keyPath": ["zoo", "1", "animals"],
                "itemsKeyPath": ["animals"],
                "verb": "add",
                "itemIds": ["a"],
                "clientId": "c1",
            })
        );
        let back: MutationRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.verb(), Verb::Add);
    }

    #[test]
    fn test_rewrite_insert_before() {
        let mut record = MutationRecord::insert_before(
            KeyPath::from(["parade", "cid-p", "animals"]),
            Some("cid-item".into()),
            KeyPath::from(["animals", "cid-a"]),
            "cid-new",
            "c1",
        );
        assert!(record.rewrite_id("cid-p", "p1"));
        assert!(record.rewrite_id("cid-item", "i1"));
        assert!(record.rewrite_id("cid-a", "a1"));
        assert!(!record.rewrite_id("zzz", "yyy"));

        assert_eq!(record.key_path, KeyPath::from(["parade", "p1", "animals"]));
        match &record.payload {
            Payload::InsertBefore { ref_id, item_key_path, item_id } => {
                assert_eq!(ref_id.as_deref(), Some("i1"));
                assert_eq!(item_key_path, &KeyPath::from(["animals", "a1"]));
                assert_eq!(item_id, "cid-new");
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_del_roundtrip_keeps_unit_payload() {
        let record = MutationRecord::del(KeyPath::from(["animals", "1"]), "c1");
        let text = serde_json::to_string(&record).unwrap();
        let back: MutationRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back.payload, Payload::Del);
        assert_eq!(back.temporary_id(), None);
    }
}
