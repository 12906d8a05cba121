//! RocksDB-backed story store for running without the blog API.
//!
//! Column families:
//! - `stories`  — stored markup (LZ4 compressed), keyed by story id
//! - `metadata` — bincode [`StoryMetadata`] (title, counts, timestamps)
//!
//! Both are written in one batch, so a story is never half-updated.
//!
//! RocksDB calls block, so the [`StoryStore`] impl runs them on tokio's
//! blocking pool against a shared handle.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, IteratorMode, Options,
    WriteBatch, WriteOptions, DB,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use super::{StoreError, StoryRecord, StoryStore, StoryUpdate};

const CF_STORIES: &str = "stories";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_STORIES, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("telemetry_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
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

/// Everything about a story except its markup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryMetadata {
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub word_count: u64,
    pub author_id: Option<String>,
    pub is_published: bool,
    /// Uncompressed content size in bytes
    pub content_size: u64,
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl StoryMetadata {
    fn new() -> Self {
        let now = now_secs();
        Self {
            title: None,
            subtitle: None,
            word_count: 0,
            author_id: None,
            is_published: false,
            content_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB-backed story store. Clones share one database.
#[derive(Clone)]
pub struct RocksStoryStore {
    db: Arc<DB>,
    config: StoreConfig,
}

impl RocksStoryStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("opened story store at {}", config.path.display());
        Ok(Self {
            db: Arc::new(db),
            config,
        })
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
            // content is already LZ4-framed by us
            CF_STORIES => opts.set_compression_type(DBCompressionType::None),
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }
        opts
    }

    /// Write a whole record (content and metadata) atomically.
    pub fn put_record(&self, id: &str, record: &StoryRecord) -> Result<StoryMetadata, StoreError> {
        let mut meta = self.load_metadata(id)?.unwrap_or_else(StoryMetadata::new);
        meta.title = record.title.clone();
        meta.subtitle = record.subtitle.clone();
        meta.word_count = record.word_count as u64;
        meta.author_id = record.author_id.clone();
        self.write(id, &record.content, meta)
    }

    fn write(&self, id: &str, content: &str, mut meta: StoryMetadata) -> Result<StoryMetadata, StoreError> {
        let compressed = lz4_flex::compress_prepend_size(content.as_bytes());
        meta.content_size = content.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_STORIES)?, id.as_bytes(), &compressed);
        batch.put_cf(self.cf(CF_METADATA)?, id.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(meta)
    }

    pub fn load_metadata(&self, id: &str) -> Result<Option<StoryMetadata>, StoreError> {
        match self.db.get_cf(self.cf(CF_METADATA)?, id.as_bytes())? {
            Some(bytes) => StoryMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn load_content(&self, id: &str) -> Result<Option<String>, StoreError> {
        let Some(compressed) = self.db.get_cf(self.cf(CF_STORIES)?, id.as_bytes())? else {
            return Ok(None);
        };
        let bytes = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    pub fn load(&self, id: &str) -> Result<Option<StoryRecord>, StoreError> {
        let Some(meta) = self.load_metadata(id)? else {
            return Ok(None);
        };
        let content = self.load_content(id)?.unwrap_or_default();
        Ok(Some(StoryRecord {
            content,
            title: meta.title,
            subtitle: meta.subtitle,
            word_count: meta.word_count as usize,
            author_id: meta.author_id,
        }))
    }

    /// Apply a partial update, creating the story if it does not exist.
    pub fn apply(&self, id: &str, update: &StoryUpdate) -> Result<StoryMetadata, StoreError> {
        let mut meta = self.load_metadata(id)?.unwrap_or_else(StoryMetadata::new);
        let content = match &update.content {
            Some(content) => content.clone(),
            None => self.load_content(id)?.unwrap_or_default(),
        };
        if let Some(title) = &update.title {
            meta.title = Some(title.clone());
        }
        if let Some(subtitle) = &update.subtitle {
            meta.subtitle = Some(subtitle.clone());
        }
        if let Some(word_count) = update.word_count {
            meta.word_count = word_count as u64;
        }
        if let Some(is_published) = update.is_published {
            meta.is_published = is_published;
        }
        self.write(id, &content, meta)
    }

    /// All story ids in the store.
    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(self.cf(CF_METADATA)?, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            ids.push(id);
        }
        Ok(ids)
    }

    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_STORIES)?, id.as_bytes());
        batch.delete_cf(self.cf(CF_METADATA)?, id.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }
}

/// Run a store call on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Database(format!("store task failed: {e}")))?
}

#[async_trait]
impl StoryStore for RocksStoryStore {
    async fn fetch(&self, id: &str) -> Result<Option<StoryRecord>, StoreError> {
        let store = self.clone();
        let id = id.to_owned();
        blocking(move || store.load(&id)).await
    }

    async fn push(&self, id: &str, update: StoryUpdate) -> Result<(), StoreError> {
        let store = self.clone();
        let key = id.to_owned();
        let meta = blocking(move || store.apply(&key, &update)).await?;
        log::debug!(
            "stored story {id}: {} → {} bytes",
            meta.content_size,
            meta.compressed_size
        );
        Ok(())
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
