//! Bounded LRU cache over a durable key-value backend.
//!
//! ```text
//!   stored key:  c/<key>|<timestamp, 20 digits>
//!
//!   get(k)  ──► find c/k|* ──► rewrite under a fresh timestamp ──► value
//!   set(k)  ──► drop old c/k|* ──► evict oldest until it fits ──► put
//! ```
//!
//! The size of an entry is `key.len() + value.len()`. The sum over all live
//! entries never exceeds [`CacheConfig::max_size`]; a single entry larger than
//! that is rejected outright.

use crate::storage::{Batch, KvBackend};
use ginger_core::event::lock;
use ginger_core::{Result, SyncError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

const PREFIX: &str = "c/";

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Upper bound on the summed size of all entries, in bytes.
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_size: 5 * 1024 * 1024 }
    }
}

impl CacheConfig {
    /// Config for testing (1 KiB, so eviction is easy to trigger).
    pub fn for_testing() -> Self {
        Self { max_size: 1024 }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    size: usize,
    clock: u64,
}

pub struct LocalCache {
    backend: Arc<dyn KvBackend>,
    config: CacheConfig,
    state: Mutex<CacheState>,
}

struct Located {
    raw_key: Vec<u8>,
    value: Vec<u8>,
}

impl LocalCache {
    /// Open over `backend`, recovering size accounting from existing entries.
    pub fn open(backend: Arc<dyn KvBackend>, config: CacheConfig) -> Result<Self> {
        let mut state = CacheState::default();
        for (raw, value) in backend.scan_prefix(PREFIX.as_bytes())? {
            if let Some((key, ts)) = parse_key(&raw) {
                state.size += key.len() + value.len();
                state.clock = state.clock.max(ts);
            }
        }
        log::debug!("cache opened with {} bytes in use", state.size);
        Ok(Self { backend, config, state: Mutex::new(state) })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Bytes currently accounted to live entries.
    pub fn size(&self) -> usize {
        lock(&self.state).size
    }

    /// Number of live entries.
    pub fn len(&self) -> Result<usize> {
        Ok(self.backend.scan_prefix(PREFIX.as_bytes())?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Read `key` and mark it most recently used.
    pub fn get(&self, key: &str) -> Result<Vec<u8>> {
        let mut state = lock(&self.state);
        let found = self
            .locate(key)?
            .ok_or_else(|| SyncError::NotFound(format!("cache key {}", key)))?;
        let ts = tick(&mut state);
        let mut batch = Batch::new();
        batch.delete(found.raw_key).put(entry_key(key, ts), found.value.clone());
        self.backend.apply(batch)?;
        Ok(found.value)
    }

    /// Whether `key` is cached. Does not touch its timestamp.
    pub fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.locate(key)?.is_some())
    }

    /// Store `value` under `key`, evicting least recently used entries as
    /// needed.
    pub fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let size = key.len() + value.len();
        if size > self.config.max_size {
            return Err(SyncError::EntryTooLarge { size, max: self.config.max_size });
        }
        let mut state = lock(&self.state);
        if let Some(old) = self.locate(key)? {
            self.backend.delete(&old.raw_key)?;
            state.size -= key.len() + old.value.len();
        }
        if state.size + size > self.config.max_size {
            self.evict(&mut state, size)?;
        }
        let ts = tick(&mut state);
        self.backend.put(&entry_key(key, ts), value)?;
        state.size += size;
        Ok(())
    }

    /// Drop `key`. Returns false if it was not cached.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let mut state = lock(&self.state);
        match self.locate(key)? {
            Some(old) => {
                self.backend.delete(&old.raw_key)?;
                state.size -= key.len() + old.value.len();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Live keys starting with `prefix`, without touching recency.
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let scan = format!("{PREFIX}{prefix}");
        Ok(self
            .backend
            .scan_prefix(scan.as_bytes())?
            .iter()
            .filter_map(|(raw, _)| parse_key(raw).map(|(k, _)| k))
            .collect())
    }

    /// Drop every entry and reset the size to zero.
    pub fn clear(&self) -> Result<()> {
        let mut state = lock(&self.state);
        let mut batch = Batch::new();
        for (raw, _) in self.backend.scan_prefix(PREFIX.as_bytes())? {
            batch.delete(raw);
        }
        self.backend.apply(batch)?;
        state.size = 0;
        Ok(())
    }

    /// [`LocalCache::get`] decoding the value as JSON.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let bytes = self.get(key)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// [`LocalCache::set`] storing the value as JSON.
    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, &bytes)
    }

    fn locate(&self, key: &str) -> Result<Option<Located>> {
        let scan = format!("{PREFIX}{key}|");
        Ok(self
            .backend
            .scan_prefix(scan.as_bytes())?
            .into_iter()
            .filter_map(|(raw, value)| match parse_key(&raw) {
                Some((k, ts)) if k == key => Some((ts, Located { raw_key: raw, value })),
                _ => None,
            })
            .max_by_key(|(ts, _)| *ts)
            .map(|(_, located)| located))
    }

    /// Drop oldest entries until `incoming` more bytes fit.
    fn evict(&self, state: &mut CacheState, incoming: usize) -> Result<()> {
        let mut entries: Vec<(u64, String, Vec<u8>, usize)> = self
            .backend
            .scan_prefix(PREFIX.as_bytes())?
            .into_iter()
            .filter_map(|(raw, value)| {
                parse_key(&raw).map(|(key, ts)| {
                    let size = key.len() + value.len();
                    (ts, key, raw, size)
                })
            })
            .collect();
        entries.sort_by_key(|(ts, ..)| *ts);

        let mut batch = Batch::new();
        let mut evicted = 0;
        for (_, key, raw, size) in entries {
            if state.size + incoming <= self.config.max_size {
                break;
            }
            log::trace!("evicting cache entry {}", key);
            batch.delete(raw);
            state.size -= size;
            evicted += 1;
        }
        self.backend.apply(batch)?;
        log::debug!("evicted {} cache entries", evicted);
        Ok(())
    }
}

fn tick(state: &mut CacheState) -> u64 {
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    state.clock = now.max(state.clock + 1);
    state.clock
}

fn entry_key(key: &str, ts: u64) -> Vec<u8> {
    format!("{PREFIX}{key}|{ts:020}").into_bytes()
}

fn parse_key(raw: &[u8]) -> Option<(String, u64)> {
    let text = std::str::from_utf8(raw).ok()?.strip_prefix(PREFIX)?;
    let (key, ts) = text.rsplit_once('|')?;
    Some((key.to_string(), ts.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn cache(max_size: usize) -> LocalCache {
        LocalCache::open(Arc::new(MemoryBackend::new()), CacheConfig { max_size }).unwrap()
    }

    #[test]
    fn test_set_get_remove() {
        let c = cache(1024);
        c.set("a", b"hello").unwrap();
        assert_eq!(c.get("a").unwrap(), b"hello".to_vec());
        assert_eq!(c.size(), 6);
        assert!(c.remove("a").unwrap());
        assert!(!c.remove("a").unwrap());
        assert!(matches!(c.get("a"), Err(SyncError::NotFound(_))));
        assert_eq!(c.size(), 0);
    }

    #[test]
    fn test_overwrite_accounts_once() {
        let c = cache(1024);
        c.set("a", b"12345").unwrap();
        c.set("a", b"12").unwrap();
        assert_eq!(c.size(), 3);
        assert_eq!(c.len().unwrap(), 1);
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let c = cache(8);
        let err = c.set("key", b"123456").unwrap_err();
        assert_eq!(err, SyncError::EntryTooLarge { size: 9, max: 8 });
        assert_eq!(c.size(), 0);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        // Each entry is 1 + 3 = 4 bytes; three fit in 12.
        let c = cache(12);
        c.set("a", b"aaa").unwrap();
        c.set("b", b"bbb").unwrap();
        c.set("c", b"ccc").unwrap();
        c.get("a").unwrap();
        c.set("d", b"ddd").unwrap();

        assert!(c.contains("a").unwrap());
        assert!(!c.contains("b").unwrap());
        assert!(c.contains("c").unwrap());
        assert!(c.contains("d").unwrap());
        assert!(c.size() <= 12);
    }

    #[test]
    fn test_size_bound_holds_under_churn() {
        let c = cache(64);
        for i in 0..200 {
            let key = format!("k{}", i % 17);
            let value = vec![b'x'; i % 23];
            c.set(&key, &value).unwrap();
            assert!(c.size() <= 64);
        }
    }

    #[test]
    fn test_keys_with_separator_do_not_collide() {
        let c = cache(1024);
        c.set("doc:a", b"1").unwrap();
        c.set("doc:a|b", b"2").unwrap();
        assert_eq!(c.get("doc:a").unwrap(), b"1".to_vec());
        assert_eq!(c.get("doc:a|b").unwrap(), b"2".to_vec());
        let mut keys = c.keys_with_prefix("doc:").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["doc:a", "doc:a|b"]);
    }

    #[test]
    fn test_reopen_recovers_size() {
        let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new());
        {
            let c = LocalCache::open(Arc::clone(&backend), CacheConfig::default()).unwrap();
            c.set("a", b"abc").unwrap();
        }
        let c = LocalCache::open(backend, CacheConfig::default()).unwrap();
        assert_eq!(c.size(), 4);
        assert!(c.get_json::<serde_json::Value>("a").is_err());
        c.set_json("j", &serde_json::json!({"x": 1})).unwrap();
        assert_eq!(c.get_json::<serde_json::Value>("j").unwrap()["x"], 1);
    }
}
