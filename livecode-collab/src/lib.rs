//! # livecode-collab: collaborative session coordinator for live code editing
//!
//! Many editors work on one document at the same time and see each other's
//! cursors, while exactly one durable copy is kept in a document store.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐     WebSocket      ┌───────────────┐
//! │ SessionClient │ ◄────────────────► │ SessionServer │
//! │ (per editor)  │    Binary Proto    │ (transport)   │
//! └──────┬────────┘                    └──────┬────────┘
//!        │                                    │ Session per connection
//!        ▼                                    ▼
//! ┌───────────────┐                   ┌────────────────────┐
//! │ Replica (yrs) │                   │ SessionCoordinator │
//! │ Awareness     │                   └──────┬─────────────┘
//! └───────────────┘                          ▼
//!                                     ┌──────────────┐  load / save  ┌───────────────┐
//!                                     │ RoomRegistry │ ────────────► │ DocumentStore │
//!                                     └──────┬───────┘               └───────────────┘
//!                                            ▼
//!                                     Room { replica, awareness, members, host, mode }
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: bincode wire messages and identifiers
//! - [`replica`]: yrs-backed replicated text
//! - [`presence`]: awareness table (last-writer-wins per replica)
//! - [`broadcast`]: bounded per-connection outboxes
//! - [`room`]: one live session on one document
//! - [`registry`]: exactly-once room creation and teardown
//! - [`session`]: join / change / presence / mode / leave handlers
//! - [`storage`]: document store trait, in-memory and RocksDB backends
//! - [`server`]: WebSocket server
//! - [`client`]: WebSocket client binding a local replica

pub mod protocol;
pub mod replica;
pub mod presence;
pub mod broadcast;
pub mod error;
pub mod room;
pub mod registry;
pub mod session;
pub mod storage;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{
    ClientMessage, ConnectionId, DocumentId, ErrorCode, MemberInfo, Mode, ProtocolError, ReplicaId,
    ServerMessage,
};
pub use replica::{Replica, ReplicaError};
pub use presence::{AwarenessTable, CursorPosition, PresenceState, PresenceUpdate};
pub use broadcast::{FrameStats, Inbox, Outbox};
pub use error::SessionError;
pub use room::{Room, RoomState};
pub use registry::{PersistOutcome, RoomRegistry};
pub use session::{Identity, Session, SessionConfig, SessionCoordinator, SessionStatsSnapshot};
pub use storage::{
    Document, DocumentMetadata, DocumentStore, MemoryDocumentStore, RocksDocumentStore, StoreConfig,
    StoreError,
};
pub use server::{ServerConfig, ServerStats, SessionServer};
pub use client::{ConnectionState, SessionClient, SessionEvent};
