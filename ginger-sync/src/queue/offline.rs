//! Projections of server state kept in the local cache.
//!
//! | cache key        | value                              |
//! |------------------|------------------------------------|
//! | `doc:<room>`     | document JSON with `_id`           |
//! | `col:<room>`     | `[memberKeyPath, ...]`             |
//! | `seq:<room>`     | `[{id, keyPath}, ...]`             |
//!
//! Queued mutations are applied here optimistically so offline reads see
//! local writes.

use crate::cache::LocalCache;
use crate::store::memory::StoredItem;
use crate::store::{matches_query, merge, with_id, Query, SequenceEntry};
use ginger_core::{KeyPath, MutationRecord, Payload, Result, SyncError};
use serde_json::Value;

fn doc_key(key_path: &KeyPath) -> String {
    format!("doc:{}", key_path.room_key())
}

fn collection_key(key_path: &KeyPath) -> String {
    format!("col:{}", key_path.room_key())
}

fn sequence_key(key_path: &KeyPath) -> String {
    format!("seq:{}", key_path.room_key())
}

fn load_or_default<T: serde::de::DeserializeOwned + Default>(cache: &LocalCache, key: &str) -> Result<T> {
    match cache.get_json(key) {
        Ok(v) => Ok(v),
        Err(SyncError::NotFound(_)) => Ok(T::default()),
        Err(e) => Err(e),
    }
}

pub(crate) fn store_doc(cache: &LocalCache, key_path: &KeyPath, doc: &Value) -> Result<()> {
    cache.set_json(&doc_key(key_path), doc)
}

pub(crate) fn load_doc(cache: &LocalCache, key_path: &KeyPath) -> Result<Value> {
    cache.get_json(&doc_key(key_path))
}

pub(crate) fn store_collection(cache: &LocalCache, key_path: &KeyPath, items_key_path: &KeyPath, docs: &[Value]) -> Result<()> {
    let mut members = Vec::with_capacity(docs.len());
    for doc in docs {
        if let Some(id) = doc.get(ginger_core::ID_FIELD).and_then(Value::as_str) {
            let member = items_key_path.child(id);
            store_doc(cache, &member, doc)?;
            members.push(member);
        }
    }
    cache.set_json(&collection_key(key_path), &members)
}

pub(crate) fn load_collection(cache: &LocalCache, key_path: &KeyPath, query: &Query) -> Result<Vec<Value>> {
    let members: Vec<KeyPath> = cache.get_json(&collection_key(key_path))?;
    Ok(members
        .iter()
        .filter_map(|m| load_doc(cache, m).ok())
        .filter(|d| matches_query(d, query))
        .collect())
}

pub(crate) fn store_sequence(cache: &LocalCache, key_path: &KeyPath, entries: &[SequenceEntry]) -> Result<()> {
    let mut items = Vec::with_capacity(entries.len());
    for entry in entries {
        store_doc(cache, &entry.key_path, &entry.doc)?;
        items.push(StoredItem { id: entry.id.clone(), key_path: entry.key_path.clone() });
    }
    cache.set_json(&sequence_key(key_path), &items)
}

pub(crate) fn load_sequence(cache: &LocalCache, key_path: &KeyPath, query: &Query) -> Result<Vec<SequenceEntry>> {
    let items: Vec<StoredItem> = cache.get_json(&sequence_key(key_path))?;
    Ok(items
        .into_iter()
        .filter_map(|item| {
            load_doc(cache, &item.key_path).ok().map(|doc| SequenceEntry {
                id: item.id,
                key_path: item.key_path,
                doc,
            })
        })
        .filter(|e| matches_query(&e.doc, query))
        .collect())
}

/// Reflect a queued mutation in the cache before the server has seen it.
pub(crate) fn apply(cache: &LocalCache, record: &MutationRecord) -> Result<()> {
    let kp = &record.key_path;
    match &record.payload {
        Payload::Create { cid, doc } => store_doc(cache, &kp.child(cid.clone()), &with_id(doc.clone(), cid)),
        Payload::Put { doc } => {
            let mut current: Value = match load_doc(cache, kp) {
                Ok(v) => v,
                Err(SyncError::NotFound(_)) => with_id(Value::Object(Default::default()), kp.last().unwrap_or_default()),
                Err(e) => return Err(e),
            };
            merge(&mut current, doc.clone());
            store_doc(cache, kp, &current)
        }
        Payload::Del => cache.remove(&doc_key(kp)).map(|_| ()),
        Payload::Add { item_ids } => {
            let items_kp = record.items_key_path.clone().unwrap_or_default();
            let mut members: Vec<KeyPath> = load_or_default(cache, &collection_key(kp))?;
            for id in item_ids {
                let member = items_kp.child(id.clone());
                if !members.contains(&member) {
                    members.push(member);
                }
            }
            cache.set_json(&collection_key(kp), &members)
        }
        Payload::Remove { item_ids } => {
            let mut members: Vec<KeyPath> = load_or_default(cache, &collection_key(kp))?;
            members.retain(|m| !item_ids.iter().any(|id| m.last() == Some(id.as_str())));
            cache.set_json(&collection_key(kp), &members)
        }
        Payload::InsertBefore { ref_id, item_key_path, item_id } => {
            let mut items: Vec<StoredItem> = load_or_default(cache, &sequence_key(kp))?;
            let item = StoredItem { id: item_id.clone(), key_path: item_key_path.clone() };
            match ref_id.as_ref().and_then(|r| items.iter().position(|i| &i.id == r)) {
                Some(at) => items.insert(at, item),
                None => items.push(item),
            }
            cache.set_json(&sequence_key(kp), &items)
        }
        Payload::DeleteItem { id } => {
            let mut items: Vec<StoredItem> = load_or_default(cache, &sequence_key(kp))?;
            items.retain(|i| &i.id != id);
            cache.set_json(&sequence_key(kp), &items)
        }
    }
}

/// Move the cached document created under `cid` to its server id.
pub(crate) fn promote_doc(cache: &LocalCache, bucket: &KeyPath, cid: &str, id: &str) -> Result<()> {
    let from = bucket.child(cid);
    match load_doc(cache, &from) {
        Ok(doc) => {
            cache.remove(&doc_key(&from))?;
            store_doc(cache, &bucket.child(id), &with_id(doc, id))
        }
        Err(SyncError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Replace `old` with `new` in every cached collection and sequence list.
pub(crate) fn rewrite_lists(cache: &LocalCache, old: &str, new: &str) -> Result<()> {
    for key in cache.keys_with_prefix("col:")? {
        let mut members: Vec<KeyPath> = load_or_default(cache, &key)?;
        let mut changed = false;
        for member in members.iter_mut() {
            changed |= member.rewrite_segment(old, new);
        }
        if changed {
            cache.set_json(&key, &members)?;
        }
    }
    for key in cache.keys_with_prefix("seq:")? {
        let mut items: Vec<StoredItem> = load_or_default(cache, &key)?;
        let mut changed = false;
        for item in items.iter_mut() {
            if item.id == old {
                item.id = new.to_string();
                changed = true;
            }
            changed |= item.key_path.rewrite_segment(old, new);
        }
        if changed {
            cache.set_json(&key, &items)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::storage::MemoryBackend;
    use serde_json::json;
    use std::sync::Arc;

    fn cache() -> LocalCache {
        LocalCache::open(Arc::new(MemoryBackend::new()), CacheConfig::default()).unwrap()
    }

    #[test]
    fn test_optimistic_collection_updates() {
        let cache = cache();
        let animals = KeyPath::from(["animals"]);
        let zoo = KeyPath::from(["zoo", "1", "animals"]);
        store_collection(&cache, &zoo, &animals, &[json!({"_id": "a", "name": "ant"})]).unwrap();

        apply(&cache, &MutationRecord::create(animals.clone(), "cid1", json!({"name": "bee"}), "c1")).unwrap();
        apply(&cache, &MutationRecord::add(zoo.clone(), animals.clone(), vec!["cid1".into()], "c1")).unwrap();
        let names: Vec<Value> = load_collection(&cache, &zoo, &Query::new())
            .unwrap()
            .into_iter()
            .map(|d| d["name"].clone())
            .collect();
        assert_eq!(names, vec![json!("ant"), json!("bee")]);

        promote_doc(&cache, &animals, "cid1", "b1").unwrap();
        rewrite_lists(&cache, "cid1", "b1").unwrap();
        let docs = load_collection(&cache, &zoo, &Query::new()).unwrap();
        assert_eq!(docs[1], json!({"_id": "b1", "name": "bee"}));
    }

    #[test]
    fn test_optimistic_sequence_updates() {
        let cache = cache();
        let animals = KeyPath::from(["animals"]);
        let parade = KeyPath::from(["parade", "1", "animals"]);
        store_doc(&cache, &animals.child("t"), &json!({"_id": "t"})).unwrap();
        store_doc(&cache, &animals.child("d"), &json!({"_id": "d"})).unwrap();

        apply(&cache, &MutationRecord::insert_before(parade.clone(), None, animals.child("t"), "i1", "c1")).unwrap();
        apply(&cache, &MutationRecord::insert_before(parade.clone(), Some("i1".into()), animals.child("d"), "i2", "c1")).unwrap();
        let ids: Vec<String> = load_sequence(&cache, &parade, &Query::new()).unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["i2", "i1"]);

        apply(&cache, &MutationRecord::delete_item(parade.clone(), "i2", "c1")).unwrap();
        assert_eq!(load_sequence(&cache, &parade, &Query::new()).unwrap().len(), 1);
    }

    #[test]
    fn test_put_merges_into_cached_doc() {
        let cache = cache();
        let kp = KeyPath::from(["animals", "t"]);
        store_doc(&cache, &kp, &json!({"_id": "t", "legs": 4, "name": "tiger"})).unwrap();
        apply(&cache, &MutationRecord::put(kp.clone(), json!({"legs": 3}), "c1")).unwrap();
        assert_eq!(load_doc(&cache, &kp).unwrap(), json!({"_id": "t", "legs": 3, "name": "tiger"}));
        apply(&cache, &MutationRecord::del(kp.clone(), "c1")).unwrap();
        assert!(load_doc(&cache, &kp).is_err());
    }
}
