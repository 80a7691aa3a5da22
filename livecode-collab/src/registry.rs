//! Document id → live [`Room`], with exactly-once creation and teardown.
//!
//! ```text
//!   get_or_create(d1) ──► rooms[d1]? ── yes ──► Arc<Room>        (no I/O)
//!          │                   │
//!          │                   no
//!          │                   ▼
//!          │           pending[d1]? ── yes ──► await the same Shared future
//!          │                   │
//!          │                   no ──► install Shared(load + build), await it
//!          ▼
//!   creation settles: pending[d1] removed, rooms[d1] inserted (on success)
//!
//!   retire(room)  (room mutex held, room empty)
//!          │
//!          ├─ save with timeout + retries ──► ok / deleted / parked
//!          └─ rooms[d1] removed, room marked closed
//! ```
//!
//! The tables sit behind a short-lived `std::sync::Mutex` that is never held
//! across an await. When both locks are needed the room mutex is taken
//! first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};

use crate::error::SessionError;
use crate::protocol::DocumentId;
use crate::replica::Replica;
use crate::room::{Room, RoomState};
use crate::session::{SessionConfig, SessionStats};
use crate::storage::{Document, DocumentStore, StoreError};

type Creation = Shared<BoxFuture<'static, Result<Arc<Room>, SessionError>>>;

/// Content that could not be saved at teardown, kept until it can be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParkedDocument {
    pub content: String,
    pub language: String,
}

/// How a teardown save ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Saved,
    /// The document was deleted while the room was live.
    Discarded,
    /// Every attempt failed; the content is parked in the registry.
    Parked,
}

#[derive(Default)]
struct Tables {
    rooms: HashMap<DocumentId, Arc<Room>>,
    pending: HashMap<DocumentId, Creation>,
    parked: HashMap<DocumentId, ParkedDocument>,
}

/// Owned room table. Cloning shares the same tables.
#[derive(Clone)]
pub struct RoomRegistry {
    tables: Arc<Mutex<Tables>>,
    store: Arc<dyn DocumentStore>,
    config: SessionConfig,
    stats: Arc<SessionStats>,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn DocumentStore>, config: SessionConfig, stats: Arc<SessionStats>) -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            store,
            config,
            stats,
        }
    }

    /// Return the live room for `id`, creating it if needed.
    ///
    /// Concurrent callers for the same absent id share one load.
    pub async fn get_or_create(&self, id: &DocumentId) -> Result<Arc<Room>, SessionError> {
        let creation = {
            let mut tables = self.tables();
            if let Some(room) = tables.rooms.get(id) {
                return Ok(room.clone());
            }
            match tables.pending.get(id) {
                Some(creation) => {
                    log::debug!("Joining in-flight creation of room {}", id);
                    creation.clone()
                }
                None => {
                    let parked = tables.parked.remove(id);
                    let creation = create_room(
                        self.tables.clone(),
                        self.store.clone(),
                        id.clone(),
                        parked,
                        self.config.load_timeout,
                        self.stats.clone(),
                    )
                    .boxed()
                    .shared();
                    tables.pending.insert(id.clone(), creation.clone());
                    creation
                }
            }
        };

        let result = creation.await;

        if let Some(room) = self.tables().rooms.get(id) {
            return Ok(room.clone());
        }
        result
    }

    /// Tear down an empty room: persist its content, then unregister it.
    ///
    /// Must be called with the room's mutex held (`state`), so no joiner can
    /// slip in between the save and the removal.
    pub async fn retire(&self, room: &Arc<Room>, state: &mut RoomState) -> PersistOutcome {
        state.close();
        let content = state.replica.content();
        let id = room.document_id();
        let outcome = self.persist(id, room.language(), content).await;

        let mut tables = self.tables();
        if tables.rooms.get(id).is_some_and(|r| Arc::ptr_eq(r, room)) {
            tables.rooms.remove(id);
        }
        log::info!("Room {} destroyed ({} rooms live)", id, tables.rooms.len());
        outcome
    }

    /// Save `content` with timeout and doubling backoff, parking it on give-up.
    pub async fn persist(&self, id: &DocumentId, language: &str, content: String) -> PersistOutcome {
        let attempts = self.config.save_attempts.max(1);
        let mut backoff = self.config.save_backoff;

        for attempt in 1..=attempts {
            match tokio::time::timeout(self.config.save_timeout, self.store.save(id, &content)).await {
                Ok(Ok(())) => {
                    self.stats.record_persisted();
                    log::info!("Persisted document {} ({} bytes)", id, content.len());
                    return PersistOutcome::Saved;
                }
                Ok(Err(StoreError::NotFound(_))) => {
                    log::warn!("Document {} was deleted during the session, discarding content", id);
                    return PersistOutcome::Discarded;
                }
                Ok(Err(e)) => {
                    log::error!("Saving document {} failed (attempt {}/{}): {}", id, attempt, attempts, e);
                }
                Err(_) => {
                    log::error!(
                        "Saving document {} timed out after {:?} (attempt {}/{})",
                        id,
                        self.config.save_timeout,
                        attempt,
                        attempts
                    );
                }
            }
            self.stats.record_persistence_failure();
            if attempt < attempts {
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
        }

        log::error!(
            "Giving up saving document {}; keeping {} bytes in memory for the next session",
            id,
            content.len()
        );
        self.tables().parked.insert(
            id.clone(),
            ParkedDocument {
                content,
                language: language.to_string(),
            },
        );
        PersistOutcome::Parked
    }

    /// Retry every parked document once. Returns how many are still parked.
    pub async fn retry_parked(&self) -> usize {
        let parked: Vec<(DocumentId, ParkedDocument)> = self.tables().parked.drain().collect();
        for (id, doc) in parked {
            self.persist(&id, &doc.language, doc.content).await;
        }
        self.tables().parked.len()
    }

    /// Live room for `id`, without creating one.
    pub fn get(&self, id: &DocumentId) -> Option<Arc<Room>> {
        self.tables().rooms.get(id).cloned()
    }

    /// Snapshot of all live rooms.
    pub fn rooms(&self) -> Vec<Arc<Room>> {
        self.tables().rooms.values().cloned().collect()
    }

    pub fn room_count(&self) -> usize {
        self.tables().rooms.len()
    }

    pub fn pending_count(&self) -> usize {
        self.tables().pending.len()
    }

    pub fn parked(&self, id: &DocumentId) -> Option<ParkedDocument> {
        self.tables().parked.get(id).cloned()
    }

    pub fn parked_count(&self) -> usize {
        self.tables().parked.len()
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        lock_tables(&self.tables)
    }
}

fn lock_tables(tables: &Mutex<Tables>) -> MutexGuard<'_, Tables> {
    tables.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn create_room(
    tables: Arc<Mutex<Tables>>,
    store: Arc<dyn DocumentStore>,
    id: DocumentId,
    parked: Option<ParkedDocument>,
    load_timeout: Duration,
    stats: Arc<SessionStats>,
) -> Result<Arc<Room>, SessionError> {
    let loaded = match parked {
        Some(parked) => {
            log::warn!("Seeding room {} from content that was never saved", id);
            Ok(Document {
                id: id.clone(),
                content: parked.content,
                language: parked.language,
            })
        }
        None => {
            stats.record_load();
            match tokio::time::timeout(load_timeout, store.load(&id)).await {
                Ok(Ok(Some(doc))) => Ok(doc),
                Ok(Ok(None)) => Err(SessionError::NotFound(id.clone())),
                Ok(Err(e)) => Err(SessionError::Store(e)),
                Err(_) => Err(SessionError::LoadTimeout(id.clone())),
            }
        }
    };

    let mut tables = lock_tables(&tables);
    tables.pending.remove(&id);

    let doc = match loaded {
        Ok(doc) => doc,
        Err(e) => {
            log::warn!("Could not create room {}: {}", id, e);
            return Err(e);
        }
    };

    if let Some(existing) = tables.rooms.get(&id) {
        return Ok(existing.clone());
    }

    let room = Arc::new(Room::new(id.clone(), doc.language, Replica::seeded(&doc.content)));
    tables.rooms.insert(id.clone(), room.clone());
    stats.record_room_created();
    log::info!("Room {} created ({} rooms live)", id, tables.rooms.len());
    Ok(room)
}
