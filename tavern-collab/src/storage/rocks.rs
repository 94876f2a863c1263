//! RocksDB-backed local store.
//!
//! One column family, `local`, holds each value exactly as handed in (the
//! backpack's JSON array). RocksDB compresses its blocks with LZ4.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded, WriteOptions,
};
use std::path::{Path, PathBuf};

use super::{LocalStore, StorageError};

const CF_LOCAL: &str = "local";

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory
    pub path: PathBuf,
    /// Block cache size in bytes (default: 8MB)
    pub block_cache_size: usize,
    /// fsync on every write (default: true, the backpack is small)
    pub sync_writes: bool,
    /// Max open files (default: 64)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tavern_data"),
            block_cache_size: 8 * 1024 * 1024,
            sync_writes: true,
            max_open_files: 64,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small cache, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 1024 * 1024,
            sync_writes: false,
            max_open_files: 16,
        }
    }
}

pub struct RocksLocalStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksLocalStore {
    /// Open or create the database and its column families.
    pub fn open(config: StoreConfig) -> Result<Self, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(2);

        let cf_descriptors = vec![ColumnFamilyDescriptor::new(
            CF_LOCAL,
            Self::cf_options(&config),
        )];

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::debug!("Local store opened at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_compression_type(DBCompressionType::Lz4);
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(CF_LOCAL)
            .ok_or_else(|| StorageError::Database(format!("Column family '{CF_LOCAL}' not found")))
    }
}

impl LocalStore for RocksLocalStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get_cf(self.cf()?, key.as_bytes())?)
    }

    fn store(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(self.cf()?, key.as_bytes(), value, &write_opts)?;
        Ok(())
    }
}
