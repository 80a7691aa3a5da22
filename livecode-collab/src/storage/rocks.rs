//! RocksDB-backed document store.
//!
//! Column families:
//! - `documents`: plain document text, LZ4 compressed (`lz4_flex`)
//! - `metadata`: [`DocumentMetadata`], bincode encoded
//!
//! Both are keyed by the UTF-8 bytes of the [`DocumentId`] and always written
//! together in one `WriteBatch`, so a document either exists in both or in
//! neither. The async [`DocumentStore`] impl runs each call on the blocking
//! pool.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;

use super::{Document, DocumentStore, StoreError};
use crate::protocol::DocumentId;

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every teardown write (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("livecode_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
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

    /// Small caches, no fsync.
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

/// Per-document bookkeeping stored next to the content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub language: String,
    /// Bumped on every content write.
    pub revision: u64,
    /// Uncompressed content size in bytes
    pub content_size: u64,
    /// Compressed content size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    /// Seconds since epoch
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(language: &str) -> Self {
        let now = now_secs();
        Self {
            language: language.to_string(),
            revision: 0,
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

struct Inner {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

/// RocksDB-backed document store. Clones share one database handle.
#[derive(Clone)]
pub struct RocksDocumentStore {
    inner: Arc<Inner>,
}

impl RocksDocumentStore {
    /// Open (or create) the database at `config.path`.
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

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened document store at {}", config.path.display());
        Ok(Self {
            inner: Arc::new(Inner { db, config }),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);

        // content is already LZ4 framed by us
        if name == CF_DOCUMENTS {
            opts.set_compression_type(DBCompressionType::None);
        } else {
            opts.set_compression_type(DBCompressionType::Lz4);
        }

        opts
    }

    // ─── Documents ────────────────────────────────────────────────────

    /// Create or replace a document, content and language together.
    pub fn put_document(&self, document: &Document) -> Result<DocumentMetadata, StoreError> {
        let mut meta = match self.read_metadata(&document.id)? {
            Some(meta) => meta,
            None => DocumentMetadata::new(&document.language),
        };
        meta.language = document.language.clone();
        self.write_content(&document.id, &document.content, meta)
    }

    /// Load a document, or `None` if it does not exist.
    pub fn load_document(&self, id: &DocumentId) -> Result<Option<Document>, StoreError> {
        let meta = match self.read_metadata(id)? {
            Some(meta) => meta,
            None => return Ok(None),
        };
        let cf = self.cf(CF_DOCUMENTS)?;
        let content = match self.inner.db.get_cf(cf, id.as_bytes())? {
            Some(compressed) => decompress(&compressed)?,
            None => String::new(),
        };
        Ok(Some(Document {
            id: id.clone(),
            content,
            language: meta.language,
        }))
    }

    /// Overwrite the content of an existing document.
    pub fn save_content(&self, id: &DocumentId, content: &str) -> Result<DocumentMetadata, StoreError> {
        let meta = self
            .read_metadata(id)?
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        self.write_content(id, content, meta)
    }

    pub fn document_exists(&self, id: &DocumentId) -> Result<bool, StoreError> {
        Ok(self.read_metadata(id)?.is_some())
    }

    pub fn load_metadata(&self, id: &DocumentId) -> Result<DocumentMetadata, StoreError> {
        self.read_metadata(id)?
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    /// All document ids, in key order.
    pub fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.inner.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Deserialization(format!("Invalid document key: {e}")))?;
            ids.push(DocumentId::new(id));
        }
        Ok(ids)
    }

    pub fn delete_document(&self, id: &DocumentId) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_docs, id.as_bytes());
        batch.delete_cf(cf_meta, id.as_bytes());
        self.inner.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.inner.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn write_content(
        &self,
        id: &DocumentId,
        content: &str,
        mut meta: DocumentMetadata,
    ) -> Result<DocumentMetadata, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(content.as_bytes());
        meta.revision += 1;
        meta.content_size = content.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_docs, id.as_bytes(), &compressed);
        batch.put_cf(cf_meta, id.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.inner.config.sync_writes);
        self.inner.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    fn read_metadata(&self, id: &DocumentId) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.inner.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(DocumentMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.inner
            .db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

#[async_trait]
impl DocumentStore for RocksDocumentStore {
    async fn load(&self, id: &DocumentId) -> Result<Option<Document>, StoreError> {
        let store = self.clone();
        let id = id.clone();
        tokio::task::spawn_blocking(move || store.load_document(&id))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
    }

    async fn save(&self, id: &DocumentId, content: &str) -> Result<(), StoreError> {
        let store = self.clone();
        let id = id.clone();
        let content = content.to_string();
        tokio::task::spawn_blocking(move || store.save_content(&id, &content).map(|_| ()))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
    }
}

impl std::fmt::Debug for RocksDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDocumentStore")
            .field("path", &self.inner.config.path)
            .finish()
    }
}

fn decompress(compressed: &[u8]) -> Result<String, StoreError> {
    let bytes = lz4_flex::decompress_size_prepended(compressed)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| StoreError::Deserialization(e.to_string()))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
