//! Durable document storage behind the session coordinator.
//!
//! ```text
//! ┌──────────────┐  load (room creation)   ┌─────────────────────┐
//! │ RoomRegistry │ ──────────────────────► │ dyn DocumentStore   │
//! │              │ ◄────────────────────── │                     │
//! └──────┬───────┘  save (room teardown)   └──────────┬──────────┘
//!        │                                            │
//!        │                              ┌─────────────┴─────────────┐
//!        │                              ▼                           ▼
//!        │                   MemoryDocumentStore          RocksDocumentStore
//!        │                   (tests, ephemeral)           CF "documents" (LZ4)
//!        │                                                CF "metadata"  (bincode)
//! ```
//!
//! A document is read once per room creation and written once per room
//! teardown. Nothing in between touches the store.

pub mod memory;
pub mod rocks;

use async_trait::async_trait;

use crate::protocol::DocumentId;

pub use memory::MemoryDocumentStore;
pub use rocks::{DocumentMetadata, RocksDocumentStore, StoreConfig};

/// Language recorded for documents created without one.
pub const DEFAULT_LANGUAGE: &str = "plaintext";

/// Durable form of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: DocumentId,
    pub content: String,
    pub language: String,
}

impl Document {
    pub fn new(id: impl Into<DocumentId>, content: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            language: language.into(),
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Document not found: {0}")]
    NotFound(DocumentId),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// The two calls the coordinator makes against durable storage.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document. `Ok(None)` means it does not exist.
    async fn load(&self, id: &DocumentId) -> Result<Option<Document>, StoreError>;

    /// Overwrite a document's content.
    ///
    /// Returns [`StoreError::NotFound`] if the document was deleted meanwhile.
    async fn save(&self, id: &DocumentId, content: &str) -> Result<(), StoreError>;
}
