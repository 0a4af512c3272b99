//! RocksDB-backed archive for resources evicted after inactivity.
//!
//! Column families:
//! - `resources`: bincode-encoded resource snapshots, LZ4 compressed
//! - `metadata` : archive bookkeeping per resource (sizes, archived_at)
//!
//! Resources are never hard-deleted: when a resource goes idle the store
//! copy is written here, and a later `get_or_create_resource` restores it.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::clock::now_millis;

const CF_RESOURCES: &str = "resources";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_RESOURCES, CF_METADATA];

/// Archive errors.
#[derive(Debug, Clone, Error)]
pub enum ArchiveError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for ArchiveError {
    fn from(e: rocksdb::Error) -> Self {
        ArchiveError::Database(e.to_string())
    }
}

/// Archive configuration.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    pub path: PathBuf,
    /// Block cache size in bytes
    pub block_cache_size: usize,
    /// fsync every write
    pub sync_writes: bool,
}

impl ArchiveConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 32 * 1024 * 1024,
            sync_writes: false,
        }
    }
}

/// Bookkeeping stored next to each archived resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub key: String,
    pub raw_size: u64,
    pub compressed_size: u64,
    /// Milliseconds since the Unix epoch
    pub archived_at: u64,
}

/// Durable archive of evicted resources.
pub struct ResourceArchive {
    db: DBWithThreadMode<SingleThreaded>,
    config: ArchiveConfig,
}

impl ResourceArchive {
    /// Open (or create) the archive at the configured path.
    pub fn open(config: ArchiveConfig) -> Result<Self, ArchiveError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &ArchiveConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            // Values are already LZ4 compressed
            CF_RESOURCES => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, ArchiveError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| ArchiveError::Database(format!("Column family '{name}' not found")))
    }

    /// Archive a value under `key`, replacing any previous snapshot.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<ArchiveMetadata, ArchiveError> {
        let cf_resources = self.cf(CF_RESOURCES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let raw = bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map_err(|e| ArchiveError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&raw);

        let meta = ArchiveMetadata {
            key: key.to_string(),
            raw_size: raw.len() as u64,
            compressed_size: compressed.len() as u64,
            archived_at: now_millis(),
        };
        let meta_bytes = bincode::serde::encode_to_vec(&meta, bincode::config::standard())
            .map_err(|e| ArchiveError::Serialization(e.to_string()))?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_resources, key.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, key.as_bytes(), &meta_bytes);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    /// Load the archived value for `key`, if any.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ArchiveError> {
        let cf = self.cf(CF_RESOURCES)?;
        let Some(compressed) = self.db.get_cf(&cf, key.as_bytes())? else {
            return Ok(None);
        };
        let raw = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| ArchiveError::Compression(e.to_string()))?;
        let (value, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| ArchiveError::Deserialization(e.to_string()))?;
        Ok(Some(value))
    }

    pub fn metadata(&self, key: &str) -> Result<Option<ArchiveMetadata>, ArchiveError> {
        let cf = self.cf(CF_METADATA)?;
        let Some(bytes) = self.db.get_cf(&cf, key.as_bytes())? else {
            return Ok(None);
        };
        let (meta, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
            .map_err(|e| ArchiveError::Deserialization(e.to_string()))?;
        Ok(Some(meta))
    }

    /// Keys of every archived resource.
    pub fn keys(&self) -> Result<Vec<String>, ArchiveError> {
        let cf = self.cf(CF_METADATA)?;
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Snapshot {
        content: String,
        version: u64,
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ResourceArchive::open(ArchiveConfig::new(dir.path().join("db"))).unwrap();

        let snap = Snapshot {
            content: "hello world".repeat(100),
            version: 42,
        };
        let meta = archive.save("document:d1", &snap).unwrap();
        assert!(meta.compressed_size < meta.raw_size);

        let loaded: Snapshot = archive.load("document:d1").unwrap().unwrap();
        assert_eq!(loaded, snap);
        assert_eq!(archive.metadata("document:d1").unwrap().unwrap(), meta);
    }

    #[test]
    fn test_load_missing() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ResourceArchive::open(ArchiveConfig::new(dir.path().join("db"))).unwrap();
        let loaded: Option<Snapshot> = archive.load("nope").unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let archive = ResourceArchive::open(ArchiveConfig::new(&path)).unwrap();
            archive
                .save("code:p1", &Snapshot { content: "fn main() {}".into(), version: 3 })
                .unwrap();
        }
        let archive = ResourceArchive::open(ArchiveConfig::new(&path)).unwrap();
        assert_eq!(archive.keys().unwrap(), vec!["code:p1".to_string()]);
        let loaded: Snapshot = archive.load("code:p1").unwrap().unwrap();
        assert_eq!(loaded.version, 3);
    }
}
