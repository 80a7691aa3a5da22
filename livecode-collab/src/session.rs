//! Session coordinator: turns per-connection events into room updates.
//!
//! ```text
//!   connection loop                     SessionCoordinator
//!   ───────────────                     ──────────────────
//!   open_session(identity) ───────────► Session + Inbox
//!   frame ─► ClientMessage ─► Session::handle()
//!                               │
//!        ┌──────────────┬───────┴──────┬──────────────┬──────────────┐
//!        ▼              ▼              ▼              ▼              ▼
//!      join          change        presence       set_mode        leave
//!   get_or_create   size/member/   size/member/   host only    remove member
//!   evict stale     lock checks    replica check  broadcast    host migration
//!   add member      apply + relay  LWW + relay    ModeChanged  retire if empty
//!   send RoomState
//! ```
//!
//! Every handler runs to completion while holding its room's mutex, so
//! membership, host, mode and awareness of a room change as one unit. Events
//! of one connection are handled in arrival order by its own loop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::broadcast::{FrameStats, Inbox, Outbox};
use crate::error::SessionError;
use crate::presence::PresenceUpdate;
use crate::protocol::{
    ClientMessage, ConnectionId, DocumentId, ErrorCode, MemberInfo, Mode, ReplicaId, ServerMessage,
};
use crate::registry::RoomRegistry;
use crate::room::{Departure, Member, Room, RoomState};
use crate::storage::DocumentStore;

/// Coordinator limits and timeouts.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Largest accepted change delta in bytes (default: 64KB)
    pub max_change_bytes: usize,
    /// Largest accepted presence payload in bytes (default: 16KB)
    pub max_presence_bytes: usize,
    /// Bound on the store load during room creation (default: 10s)
    pub load_timeout: Duration,
    /// Bound on each teardown save attempt (default: 10s)
    pub save_timeout: Duration,
    /// Save attempts before the content is parked (default: 3)
    pub save_attempts: u32,
    /// First retry delay, doubled after each failure (default: 200ms)
    pub save_backoff: Duration,
    /// Frames queued per connection before it is dropped as too slow (default: 256)
    pub outbox_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_change_bytes: 64 * 1024,
            max_presence_bytes: 16 * 1024,
            load_timeout: Duration::from_secs(10),
            save_timeout: Duration::from_secs(10),
            save_attempts: 3,
            save_backoff: Duration::from_millis(200),
            outbox_capacity: 256,
        }
    }
}

/// Who is on the other end of a connection. Trusted as given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
        }
    }
}

/// Coordinator counters. Lock-free, read via [`SessionStats::snapshot`].
#[derive(Debug, Default)]
pub struct SessionStats {
    rooms_created: AtomicU64,
    rooms_persisted: AtomicU64,
    loads: AtomicU64,
    persistence_failures: AtomicU64,
    changes_relayed: AtomicU64,
    changes_rejected: AtomicU64,
    presence_relayed: AtomicU64,
    presence_rejected: AtomicU64,
    frames: Arc<FrameStats>,
}

/// Point-in-time copy of [`SessionStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStatsSnapshot {
    pub rooms_created: u64,
    pub rooms_persisted: u64,
    pub loads: u64,
    pub persistence_failures: u64,
    pub changes_relayed: u64,
    pub changes_rejected: u64,
    pub presence_relayed: u64,
    pub presence_rejected: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
}

impl SessionStats {
    pub fn snapshot(&self) -> SessionStatsSnapshot {
        SessionStatsSnapshot {
            rooms_created: self.rooms_created.load(Ordering::Relaxed),
            rooms_persisted: self.rooms_persisted.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            changes_relayed: self.changes_relayed.load(Ordering::Relaxed),
            changes_rejected: self.changes_rejected.load(Ordering::Relaxed),
            presence_relayed: self.presence_relayed.load(Ordering::Relaxed),
            presence_rejected: self.presence_rejected.load(Ordering::Relaxed),
            frames_sent: self.frames.frames_sent(),
            frames_dropped: self.frames.frames_dropped(),
        }
    }

    pub fn frames(&self) -> &Arc<FrameStats> {
        &self.frames
    }

    pub(crate) fn record_room_created(&self) {
        self.rooms_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_persisted(&self) {
        self.rooms_persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_load(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_persistence_failure(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Entry point shared by all connections. Cloning shares the same rooms.
#[derive(Clone)]
pub struct SessionCoordinator {
    registry: RoomRegistry,
    config: SessionConfig,
    stats: Arc<SessionStats>,
    shutting_down: Arc<AtomicBool>,
}

impl SessionCoordinator {
    pub fn new(store: Arc<dyn DocumentStore>, config: SessionConfig) -> Self {
        let stats = Arc::new(SessionStats::default());
        Self {
            registry: RoomRegistry::new(store, config.clone(), stats.clone()),
            config,
            stats,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register a new connection. The [`Inbox`] carries every frame the
    /// coordinator wants written to it.
    pub fn open_session(&self, identity: Identity) -> (Session, Inbox) {
        let connection_id = ConnectionId::new();
        let (outbox, inbox) =
            Outbox::channel(connection_id, self.config.outbox_capacity, self.stats.frames.clone());
        log::debug!("Session {} opened for user {}", connection_id, identity.user_id);
        (
            Session {
                coordinator: self.clone(),
                identity,
                outbox,
                joined: None,
            },
            inbox,
        )
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn stats(&self) -> SessionStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Tear down every live room, persisting each, then retry parked content.
    ///
    /// Members receive a `Closing` error. Further joins are refused. Returns
    /// how many documents could still not be saved.
    pub async fn shutdown(&self) -> usize {
        self.shutting_down.store(true, Ordering::Release);
        let rooms = self.registry.rooms();
        log::info!("Shutting down {} live rooms", rooms.len());

        let closing = ServerMessage::error(ErrorCode::Closing, "Server is shutting down");
        for room in rooms {
            let mut state = room.lock().await;
            if state.is_closed() {
                continue;
            }
            for member in state.drain_members() {
                notify(&member.outbox, &closing);
            }
            self.registry.retire(&room, &mut state).await;
        }

        let unsaved = self.registry.retry_parked().await;
        if unsaved > 0 {
            log::error!("{} documents could not be saved before shutdown", unsaved);
        }
        unsaved
    }
}

struct Joined {
    room: Arc<Room>,
    replica_id: ReplicaId,
}

/// One connection's view of the coordinator.
///
/// A session is in at most one room at a time. Dropping it without calling
/// [`Session::leave`] leaves a ghost member behind; the connection loop always
/// leaves on exit.
pub struct Session {
    coordinator: SessionCoordinator,
    identity: Identity,
    outbox: Outbox,
    joined: Option<Joined>,
}

const JOIN_ATTEMPTS: usize = 3;

impl Session {
    pub fn connection_id(&self) -> ConnectionId {
        self.outbox.connection_id()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Document of the room this session believes it is in.
    pub fn document_id(&self) -> Option<&DocumentId> {
        self.joined.as_ref().map(|j| j.room.document_id())
    }

    /// Dispatch one inbound message.
    ///
    /// Errors the client should hear about are sent to it as
    /// `ServerMessage::Error`; the rest are only logged. Either way the
    /// error is returned for the caller's bookkeeping.
    pub async fn handle(&mut self, msg: ClientMessage) -> Result<(), SessionError> {
        let kind = msg.kind();
        let result = match msg {
            ClientMessage::Join {
                document_id,
                replica_id,
            } => self.join(document_id, replica_id).await,
            ClientMessage::Change(delta) => self.change(delta).await,
            ClientMessage::Presence(payload) => self.presence(payload).await,
            ClientMessage::SetMode(mode) => self.set_mode(mode).await,
            ClientMessage::Leave => self.leave().await,
            ClientMessage::Ping => {
                notify(&self.outbox, &ServerMessage::Pong);
                Ok(())
            }
        };

        if let Err(e) = &result {
            if e.is_reported() {
                notify(&self.outbox, &ServerMessage::error(e.code(), e.to_string()));
            } else {
                log::debug!("Dropped {} from {}: {}", kind, self.connection_id(), e);
            }
        }
        result
    }

    /// Enter the room of `document_id`, leaving any current room first.
    pub async fn join(&mut self, document_id: DocumentId, replica_id: ReplicaId) -> Result<(), SessionError> {
        if self.joined.is_some() {
            self.leave().await?;
        }

        for _ in 0..JOIN_ATTEMPTS {
            if self.coordinator.is_shutting_down() {
                return Err(SessionError::Closed);
            }
            let room = self.coordinator.registry.get_or_create(&document_id).await?;
            let mut state = room.lock().await;
            if state.is_closed() {
                // lost a race with teardown; the registry no longer has it
                drop(state);
                tokio::task::yield_now().await;
                continue;
            }
            if self.coordinator.is_shutting_down() {
                // shutdown began while the document was loading and may
                // already have passed over this room
                if state.is_empty() {
                    self.coordinator.registry.retire(&room, &mut state).await;
                }
                return Err(SessionError::Closed);
            }

            self.admit(&room, &mut state, replica_id)?;
            drop(state);
            self.joined = Some(Joined { room, replica_id });
            return Ok(());
        }

        Err(SessionError::Closed)
    }

    fn admit(&self, room: &Arc<Room>, state: &mut RoomState, replica_id: ReplicaId) -> Result<(), SessionError> {
        let connection_id = self.connection_id();

        // replica ids are merge identities and must be unique among members
        if let Some(holder) = state.member_for_replica(replica_id) {
            if holder.info.user_id != self.identity.user_id {
                return Err(SessionError::ReplicaInUse(replica_id));
            }
        }

        if let Some(stale) = state.member_for_user(&self.identity.user_id) {
            if let Some(departure) = state.remove_member(stale) {
                log::info!(
                    "Evicting stale session {} of user {} from room {}",
                    stale,
                    self.identity.user_id,
                    room.document_id()
                );
                notify(&departure.member.outbox, &ServerMessage::Evicted);
                announce_departure(state, &departure);
            }
        }

        state.add_member(Member {
            info: MemberInfo {
                connection_id,
                user_id: self.identity.user_id.clone(),
                username: self.identity.username.clone(),
                replica_id,
            },
            outbox: self.outbox.clone(),
        });
        let host = state.host().unwrap_or(connection_id);

        notify(
            &self.outbox,
            &ServerMessage::RoomState {
                document_id: room.document_id().clone(),
                language: room.language().to_string(),
                snapshot: state.replica.snapshot(),
                mode: state.mode(),
                members: state.members(),
                host,
                you: connection_id,
            },
        );
        broadcast(
            state,
            &ServerMessage::MembersChanged {
                members: state.members(),
                host,
            },
            Some(connection_id),
        );
        broadcast(state, &ServerMessage::RequestPresenceReplay, Some(connection_id));

        log::info!(
            "User {} joined room {} as {} ({} members)",
            self.identity.user_id,
            room.document_id(),
            connection_id,
            state.member_count()
        );
        Ok(())
    }

    /// Merge a delta into the room and relay it to everyone else.
    pub async fn change(&mut self, delta: Vec<u8>) -> Result<(), SessionError> {
        let stats = &self.coordinator.stats;
        let limit = self.coordinator.config.max_change_bytes;
        if delta.len() > limit {
            stats.changes_rejected.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "Dropping change of {} bytes from {} (limit {})",
                delta.len(),
                self.connection_id(),
                limit
            );
            return Err(SessionError::Oversize {
                kind: "change",
                size: delta.len(),
                limit,
            });
        }

        let connection_id = self.connection_id();
        let joined = self.joined.as_ref().ok_or(SessionError::NotMember)?;
        let state = joined.room.lock().await;

        let checked = if !state.is_member(connection_id) {
            Err(SessionError::NotMember)
        } else if state.mode() == Mode::Locked && !state.is_host(connection_id) {
            Err(SessionError::Forbidden("room is locked"))
        } else {
            state.replica.apply_remote_change(&delta).map_err(SessionError::from)
        };
        if let Err(e) = checked {
            stats.changes_rejected.fetch_add(1, Ordering::Relaxed);
            if matches!(e, SessionError::Malformed { .. }) {
                log::warn!("Malformed change from {}: {}", connection_id, e);
            }
            return Err(e);
        }

        let relayed = broadcast(&state, &ServerMessage::Change(delta), Some(connection_id));
        stats.changes_relayed.fetch_add(1, Ordering::Relaxed);
        log::trace!("Relayed change from {} to {} members", connection_id, relayed);
        Ok(())
    }

    /// Record the sender's presence and relay the raw bytes.
    pub async fn presence(&mut self, payload: Vec<u8>) -> Result<(), SessionError> {
        let stats = &self.coordinator.stats;
        let limit = self.coordinator.config.max_presence_bytes;
        if payload.len() > limit {
            stats.presence_rejected.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "Dropping presence of {} bytes from {} (limit {})",
                payload.len(),
                self.connection_id(),
                limit
            );
            return Err(SessionError::Oversize {
                kind: "presence",
                size: payload.len(),
                limit,
            });
        }

        let connection_id = self.connection_id();
        let joined = self.joined.as_ref().ok_or(SessionError::NotMember)?;
        let mut state = joined.room.lock().await;

        let replica_id = match state.member(connection_id) {
            Some(member) => member.replica_id(),
            None => {
                stats.presence_rejected.fetch_add(1, Ordering::Relaxed);
                return Err(SessionError::NotMember);
            }
        };
        let update = match PresenceUpdate::decode(&payload) {
            Ok(update) => update,
            Err(e) => {
                stats.presence_rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("Malformed presence from {}: {}", connection_id, e);
                return Err(SessionError::Malformed {
                    kind: "presence",
                    reason: e.to_string(),
                });
            }
        };
        if update.replica_id != replica_id {
            stats.presence_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(SessionError::Forbidden("presence for another replica"));
        }
        if !state.awareness.apply(&update) {
            log::trace!("Stale presence from {} (clock {})", connection_id, update.clock);
            return Ok(());
        }

        broadcast(&state, &ServerMessage::Presence(payload), Some(connection_id));
        stats.presence_relayed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Host-only: switch the room's edit mode.
    pub async fn set_mode(&mut self, mode: Mode) -> Result<(), SessionError> {
        let connection_id = self.connection_id();
        let joined = self.joined.as_ref().ok_or(SessionError::NotMember)?;
        let mut state = joined.room.lock().await;

        if !state.is_member(connection_id) {
            return Err(SessionError::NotMember);
        }
        if !state.is_host(connection_id) {
            return Err(SessionError::Forbidden("only the host can change the mode"));
        }

        state.set_mode(mode);
        broadcast(&state, &ServerMessage::ModeChanged(mode), None);
        log::info!("Room {} is now {}", joined.room.document_id(), mode);
        Ok(())
    }

    /// Leave the current room. A no-op if not in one.
    ///
    /// The last member out persists the document and destroys the room.
    pub async fn leave(&mut self) -> Result<(), SessionError> {
        let Some(joined) = self.joined.take() else {
            return Ok(());
        };
        let connection_id = self.connection_id();
        let mut state = joined.room.lock().await;

        let Some(departure) = state.remove_member(connection_id) else {
            return Ok(());
        };
        log::info!(
            "User {} left room {} ({} members remain)",
            self.identity.user_id,
            joined.room.document_id(),
            state.member_count()
        );

        if state.is_empty() {
            self.coordinator.registry.retire(&joined.room, &mut state).await;
        } else {
            announce_departure(&state, &departure);
        }
        Ok(())
    }

    /// Replica id used in the current room, if joined.
    pub fn replica_id(&self) -> Option<ReplicaId> {
        self.joined.as_ref().map(|j| j.replica_id)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connection_id", &self.connection_id())
            .field("user_id", &self.identity.user_id)
            .field("document_id", &self.document_id())
            .finish()
    }
}

/// Tell the remaining members who left, who hosts now and whose cursor to drop.
fn announce_departure(state: &RoomState, departure: &Departure) {
    if let Some(msg) = state.members_changed() {
        broadcast(state, &msg, None);
    }
    if let Some(host) = departure.new_host {
        broadcast(state, &ServerMessage::HostChanged { host }, None);
    }
    if departure.presence_removed {
        broadcast(
            state,
            &ServerMessage::PresenceRemoved {
                replica_id: departure.member.replica_id(),
            },
            None,
        );
    }
}

fn broadcast(state: &RoomState, msg: &ServerMessage, except: Option<ConnectionId>) -> usize {
    match state.broadcast(msg, except) {
        Ok(sent) => sent,
        Err(e) => {
            log::error!("Failed to encode broadcast: {}", e);
            0
        }
    }
}

fn notify(outbox: &Outbox, msg: &ServerMessage) {
    if let Err(e) = outbox.send(msg) {
        log::error!("Failed to encode message for {}: {}", outbox.connection_id(), e);
    }
}
