//! One live editing session on one document.
//!
//! ```text
//! Room ─┬─ document_id, language            immutable
//!       └─ Mutex<RoomState>
//!            ├─ replica      (yrs Doc, authoritative merge target)
//!            ├─ awareness    (replica_id → presence)
//!            ├─ members      (ConnectionId → Member, join order)
//!            ├─ host         (always a key of members while non-empty)
//!            ├─ mode         (open | locked)
//!            └─ closed       (set once, during teardown)
//! ```
//!
//! Membership, host, mode and awareness only change while the room mutex is
//! held, so every handler sees them as one consistent unit.

use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::{Mutex, MutexGuard};

use crate::broadcast::{Delivery, Outbox};
use crate::presence::AwarenessTable;
use crate::protocol::{ConnectionId, DocumentId, MemberInfo, Mode, ProtocolError, ReplicaId, ServerMessage};
use crate::replica::Replica;

/// A connection that has joined a room.
#[derive(Debug, Clone)]
pub struct Member {
    pub info: MemberInfo,
    pub outbox: Outbox,
}

impl Member {
    pub fn connection_id(&self) -> ConnectionId {
        self.info.connection_id
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.info.replica_id
    }
}

/// What changed when a member was removed.
#[derive(Debug)]
pub struct Departure {
    pub member: Member,
    /// New host, if the departing member was host and others remain.
    pub new_host: Option<ConnectionId>,
    /// Whether the departing replica's awareness entry was dropped.
    pub presence_removed: bool,
}

/// Mutable room state guarded by [`Room`]'s mutex.
#[derive(Debug)]
pub struct RoomState {
    pub replica: Replica,
    pub awareness: AwarenessTable,
    members: IndexMap<ConnectionId, Member>,
    host: Option<ConnectionId>,
    mode: Mode,
    closed: bool,
}

impl RoomState {
    pub fn new(replica: Replica) -> Self {
        Self {
            replica,
            awareness: AwarenessTable::new(),
            members: IndexMap::new(),
            host: None,
            mode: Mode::Open,
            closed: false,
        }
    }

    /// Add a member. Returns `true` if it became host.
    pub fn add_member(&mut self, member: Member) -> bool {
        let connection_id = member.connection_id();
        self.members.insert(connection_id, member);

        let host_valid = self
            .host
            .map(|host| self.members.contains_key(&host))
            .unwrap_or(false);
        if !host_valid {
            self.host = Some(connection_id);
            return true;
        }
        false
    }

    /// Remove a member, migrating host to the longest-tenured remaining
    /// member in the same step.
    pub fn remove_member(&mut self, connection_id: ConnectionId) -> Option<Departure> {
        let member = self.members.shift_remove(&connection_id)?;

        let replica_id = member.replica_id();
        let replica_still_present = self.members.values().any(|m| m.replica_id() == replica_id);
        let presence_removed = !replica_still_present && self.awareness.remove(replica_id).is_some();

        let mut new_host = None;
        if self.host == Some(connection_id) {
            self.host = self.members.keys().next().copied();
            new_host = self.host;
        }

        Some(Departure {
            member,
            new_host,
            presence_removed,
        })
    }

    pub fn member(&self, connection_id: ConnectionId) -> Option<&Member> {
        self.members.get(&connection_id)
    }

    /// Connection of the current member belonging to `user_id`, if any.
    pub fn member_for_user(&self, user_id: &str) -> Option<ConnectionId> {
        self.members
            .values()
            .find(|m| m.info.user_id == user_id)
            .map(|m| m.connection_id())
    }

    /// The member writing as `replica_id`, if any.
    pub fn member_for_replica(&self, replica_id: ReplicaId) -> Option<&Member> {
        self.members.values().find(|m| m.replica_id() == replica_id)
    }

    pub fn is_member(&self, connection_id: ConnectionId) -> bool {
        self.members.contains_key(&connection_id)
    }

    /// Membership in join order.
    pub fn members(&self) -> Vec<MemberInfo> {
        self.members.values().map(|m| m.info.clone()).collect()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn host(&self) -> Option<ConnectionId> {
        self.host
    }

    pub fn is_host(&self, connection_id: ConnectionId) -> bool {
        self.host == Some(connection_id)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Returns `true` if the mode actually changed.
    pub fn set_mode(&mut self, mode: Mode) -> bool {
        let changed = self.mode != mode;
        self.mode = mode;
        changed
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Mark the room as torn down. Joiners that raced in must retry.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Drop every member without ceremony (forced teardown).
    pub fn drain_members(&mut self) -> Vec<Member> {
        self.host = None;
        self.awareness.clear();
        self.members.drain(..).map(|(_, m)| m).collect()
    }

    /// Encode once, push to every member except `except`.
    ///
    /// Returns the number of members the frame was queued for.
    pub fn broadcast(
        &self,
        msg: &ServerMessage,
        except: Option<ConnectionId>,
    ) -> Result<usize, ProtocolError> {
        Ok(self.relay(Arc::new(msg.encode()?), except))
    }

    /// Push pre-encoded bytes to every member except `except`.
    pub fn relay(&self, frame: Arc<Vec<u8>>, except: Option<ConnectionId>) -> usize {
        self.members
            .values()
            .filter(|m| Some(m.connection_id()) != except)
            .filter(|m| m.outbox.push(frame.clone()) == Delivery::Queued)
            .count()
    }

    /// `MembersChanged` for the current membership, if there is a host.
    pub fn members_changed(&self) -> Option<ServerMessage> {
        self.host.map(|host| ServerMessage::MembersChanged {
            members: self.members(),
            host,
        })
    }
}

/// A live room. Created by the registry, shared by its members' sessions.
#[derive(Debug)]
pub struct Room {
    document_id: DocumentId,
    language: String,
    state: Mutex<RoomState>,
}

impl Room {
    pub fn new(document_id: DocumentId, language: String, replica: Replica) -> Self {
        Self {
            document_id,
            language,
            state: Mutex::new(RoomState::new(replica)),
        }
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub async fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().await
    }
}
