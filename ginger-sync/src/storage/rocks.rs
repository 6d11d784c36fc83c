//! RocksDB-backed storage shared by the client and server halves.
//!
//! Column families:
//! - `cache`       : client LRU cache entries
//! - `queue`       : client mutation journal (bincode frames)
//! - `rights`      : ownership records kept by the rule-based rights gate
//! - `documents`   : server documents (LZ4-compressed JSON)
//! - `collections` : server collection membership (JSON)
//! - `sequences`   : server sequence items (JSON)
//!
//! A [`RocksDb`] is opened once; each consumer takes a [`RocksBackend`] bound
//! to one column family.

use super::{Batch, BatchOp, KvBackend};
use ginger_core::{Result, SyncError};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::PathBuf;
use std::sync::Arc;

pub const CF_CACHE: &str = "cache";
pub const CF_QUEUE: &str = "queue";
pub const CF_RIGHTS: &str = "rights";
pub const CF_DOCUMENTS: &str = "documents";
pub const CF_COLLECTIONS: &str = "collections";
pub const CF_SEQUENCES: &str = "sequences";

const COLUMN_FAMILIES: &[&str] = &[CF_CACHE, CF_QUEUE, CF_RIGHTS, CF_DOCUMENTS, CF_COLLECTIONS, CF_SEQUENCES];

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    pub bloom_filter_bits: i32,
    /// fsync on every write. The queue journal relies on this for crash safety.
    pub sync_writes: bool,
    pub max_open_files: i32,
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ginger_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config for testing (small block cache, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

pub struct RocksDb {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksDb {
    /// Open (creating if needed) the database and every column family.
    pub fn open(config: StoreConfig) -> Result<Arc<Self>> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, descriptors)
            .map_err(storage_error)?;
        log::info!("opened store at {}", config.path.display());
        Ok(Arc::new(Self { db, config }))
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Already LZ4 framed by the store.
            CF_DOCUMENTS => opts.set_compression_type(DBCompressionType::None),
            CF_QUEUE => {
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        opts
    }

    /// A backend bound to one column family.
    pub fn partition(self: &Arc<Self>, column_family: &'static str) -> RocksBackend {
        RocksBackend { db: Arc::clone(self), cf: column_family }
    }

    /// Directory the database was opened from.
    pub fn path(&self) -> &std::path::Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| SyncError::Storage(format!("column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }
}

#[derive(Clone)]
pub struct RocksBackend {
    db: Arc<RocksDb>,
    cf: &'static str,
}

impl KvBackend for RocksBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.db.cf(self.cf)?;
        self.db.db.get_cf(cf, key).map_err(storage_error)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let cf = self.db.cf(self.cf)?;
        self.db
            .db
            .put_cf_opt(cf, key, value, &self.db.write_options())
            .map_err(storage_error)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let cf = self.db.cf(self.cf)?;
        self.db
            .db
            .delete_cf_opt(cf, key, &self.db.write_options())
            .map_err(storage_error)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.db.cf(self.cf)?;
        let mut out = Vec::new();
        for item in self.db.db.iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward)) {
            let (key, value) = item.map_err(storage_error)?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    fn apply(&self, batch: Batch) -> Result<()> {
        let cf = self.db.cf(self.cf)?;
        let mut wb = WriteBatch::default();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put(k, v) => wb.put_cf(cf, k, v),
                BatchOp::Delete(k) => wb.delete_cf(cf, k),
            }
        }
        self.db.db.write_opt(wb, &self.db.write_options()).map_err(storage_error)
    }
}

pub(crate) fn storage_error(e: rocksdb::Error) -> SyncError {
    SyncError::Storage(e.to_string())
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partitions_are_isolated() {
        let dir = tempdir().unwrap();
        let db = RocksDb::open(StoreConfig::for_testing(dir.path())).unwrap();
        let cache = db.partition(CF_CACHE);
        let queue = db.partition(CF_QUEUE);

        cache.put(b"k", b"cache").unwrap();
        queue.put(b"k", b"queue").unwrap();
        assert_eq!(cache.get(b"k").unwrap(), Some(b"cache".to_vec()));
        assert_eq!(queue.get(b"k").unwrap(), Some(b"queue".to_vec()));
    }

    #[test]
    fn test_scan_prefix_and_batch() {
        let dir = tempdir().unwrap();
        let db = RocksDb::open(StoreConfig::for_testing(dir.path())).unwrap();
        let backend = db.partition(CF_CACHE);
        backend.put(b"p/1", b"a").unwrap();
        backend.put(b"p/2", b"b").unwrap();
        backend.put(b"q/1", b"c").unwrap();

        let mut batch = Batch::new();
        batch.delete(b"p/1".to_vec()).put(b"p/3".to_vec(), b"d".to_vec());
        backend.apply(batch).unwrap();

        let keys: Vec<Vec<u8>> = backend.scan_prefix(b"p/").unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"p/2".to_vec(), b"p/3".to_vec()]);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempdir().unwrap();
        {
            let db = RocksDb::open(StoreConfig::for_testing(dir.path())).unwrap();
            db.partition(CF_QUEUE).put(b"q/1", b"entry").unwrap();
        }
        let db = RocksDb::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(db.partition(CF_QUEUE).get(b"q/1").unwrap(), Some(b"entry".to_vec()));
    }
}
