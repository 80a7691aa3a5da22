//! In-process document store with counters and fault injection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{Document, DocumentStore, StoreError};
use crate::protocol::DocumentId;

/// `HashMap`-backed store. Used by tests and by `livecode-server` when no
/// storage path is configured.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: Mutex<HashMap<DocumentId, Document>>,
    latency: Option<Duration>,
    load_count: AtomicU64,
    save_count: AtomicU64,
    failing_loads: AtomicU32,
    failing_saves: AtomicU32,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `load`/`save` sleeps for `latency` before answering.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Create or replace a document.
    pub fn insert(&self, document: Document) {
        self.lock().insert(document.id.clone(), document);
    }

    pub fn remove(&self, id: &DocumentId) -> Option<Document> {
        self.lock().remove(id)
    }

    /// Current stored content, bypassing counters.
    pub fn content(&self, id: &DocumentId) -> Option<String> {
        self.lock().get(id).map(|doc| doc.content.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of `load` calls served so far.
    pub fn load_count(&self) -> u64 {
        self.load_count.load(Ordering::SeqCst)
    }

    /// Number of `save` calls received so far (failed ones included).
    pub fn save_count(&self) -> u64 {
        self.save_count.load(Ordering::SeqCst)
    }

    /// The next `n` loads fail with [`StoreError::Unavailable`].
    pub fn fail_next_loads(&self, n: u32) {
        self.failing_loads.store(n, Ordering::SeqCst);
    }

    /// The next `n` saves fail with [`StoreError::Unavailable`].
    pub fn fail_next_saves(&self, n: u32) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DocumentId, Document>> {
        self.documents.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn load(&self, id: &DocumentId) -> Result<Option<Document>, StoreError> {
        self.load_count.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if take_failure(&self.failing_loads) {
            return Err(StoreError::Unavailable("injected load failure".into()));
        }
        Ok(self.lock().get(id).cloned())
    }

    async fn save(&self, id: &DocumentId, content: &str) -> Result<(), StoreError> {
        self.save_count.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if take_failure(&self.failing_saves) {
            return Err(StoreError::Unavailable("injected save failure".into()));
        }
        match self.lock().get_mut(id) {
            Some(doc) => {
                doc.content = content.to_string();
                Ok(())
            }
            None => Err(StoreError::NotFound(id.clone())),
        }
    }
}
