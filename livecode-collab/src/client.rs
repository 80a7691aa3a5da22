//! WebSocket session client: binds a local replica and awareness table to a
//! coordinator connection.
//!
//! Provides:
//! - Connection lifecycle (connect with identity headers, disconnect)
//! - Join/leave with a local [`Replica`] seeded from the room snapshot
//! - Local edits (`insert`/`remove`) applied locally and sent as changes
//! - Remote changes merged into the local replica
//! - Presence publishing, remote presence tracking and replay on request
//!
//! ```text
//!  app ─ insert()/remove() ─► Replica ─ delta ─► writer task ─► ws
//!  app ◄─ SessionEvent ◄───── reader task ◄──────────────────── ws
//!                                 │
//!                                 └─ RequestPresenceReplay ─► writer task
//! ```

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::presence::{color_for_replica, AwarenessTable, CursorPosition, PresenceState, PresenceUpdate};
use crate::protocol::{
    ClientMessage, ConnectionId, DocumentId, ErrorCode, MemberInfo, Mode, ProtocolError, ReplicaId,
    ServerMessage,
};
use crate::replica::Replica;
use crate::server::{USERNAME_HEADER, USER_ID_HEADER};
use crate::session::Identity;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the session client.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Room state received; the local replica now mirrors the room
    Joined {
        document_id: DocumentId,
        members: Vec<MemberInfo>,
        host: ConnectionId,
        mode: Mode,
    },
    /// A remote change was merged into the local replica
    RemoteChange,
    /// A remote replica's presence changed
    PresenceChanged(ReplicaId),
    /// A departed replica's presence was dropped
    PresenceRemoved(ReplicaId),
    MembersChanged {
        members: Vec<MemberInfo>,
        host: ConnectionId,
    },
    HostChanged(ConnectionId),
    ModeChanged(Mode),
    /// Another connection of the same user took our place in the room
    Evicted,
    Error {
        code: ErrorCode,
        message: String,
    },
    Pong,
}

#[derive(Debug, Default)]
struct RoomView {
    document_id: Option<DocumentId>,
    language: Option<String>,
    replica: Option<Replica>,
    awareness: AwarenessTable,
    members: Vec<MemberInfo>,
    host: Option<ConnectionId>,
    mode: Mode,
    me: Option<ConnectionId>,
    local_presence: Option<PresenceState>,
    presence_clock: u64,
    /// A rejoin is in flight; edits wait for the fresh room state.
    resyncing: bool,
}

impl RoomView {
    fn reset(&mut self) {
        self.document_id = None;
        self.language = None;
        self.replica = None;
        self.awareness.clear();
        self.members.clear();
        self.host = None;
        self.mode = Mode::Open;
        self.me = None;
        self.resyncing = false;
    }

    /// Locked room and we are not its host.
    fn read_only(&self) -> bool {
        self.mode == Mode::Locked && self.me.is_some() && self.me != self.host
    }

    /// The replica, if local edits are currently accepted by the room.
    fn writable_replica(&self) -> Result<&Replica, ProtocolError> {
        let replica = self.replica.as_ref().ok_or(ProtocolError::NotConnected)?;
        if self.read_only() || self.resyncing {
            return Err(ProtocolError::ReadOnly);
        }
        Ok(replica)
    }
}

/// The session client.
pub struct SessionClient {
    identity: Identity,
    replica_id: ReplicaId,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    view: Arc<Mutex<RoomView>>,
    outgoing_tx: Option<mpsc::Sender<Message>>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
    event_tx: mpsc::Sender<SessionEvent>,
}

impl SessionClient {
    /// Create a client that will write as `replica_id`.
    pub fn new(server_url: impl Into<String>, identity: Identity, replica_id: ReplicaId) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            identity,
            replica_id,
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            view: Arc::new(Mutex::new(RoomView::default())),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server, presenting the identity headers.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let mut request = self.server_url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(USER_ID_HEADER, header_value(&self.identity.user_id)?);
        headers.insert(USERNAME_HEADER, header_value(&self.identity.username)?);

        let (ws_stream, _) = match tokio_tungstenite::connect_async(request).await {
            Ok(connected) => connected,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.outgoing_tx = Some(out_tx.clone());
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SessionEvent::Connected).await;

        // Reader task: process incoming WebSocket messages
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let view = self.view.clone();
        let replica_id = self.replica_id;
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match ServerMessage::decode(&data) {
                        Ok(server_msg) => {
                            let (event, reply) = apply_server_message(&view, replica_id, server_msg).await;
                            if let Some(reply) = reply {
                                let _ = out_tx.send(reply).await;
                            }
                            if let Some(event) = event {
                                let _ = event_tx.send(event).await;
                            }
                        }
                        Err(e) => log::warn!("Undecodable frame from server: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            view.lock().await.reset();
            let _ = event_tx.send(SessionEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Ask to join the room of `document_id`. Completion arrives as
    /// [`SessionEvent::Joined`] or [`SessionEvent::Error`].
    pub async fn join(&self, document_id: impl Into<DocumentId>) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Join {
            document_id: document_id.into(),
            replica_id: self.replica_id,
        })
        .await
    }

    /// Insert text locally and send the resulting change.
    ///
    /// Fails with [`ProtocolError::ReadOnly`] without touching the replica
    /// while the host has locked the room.
    pub async fn insert(&self, index: u32, chunk: &str) -> Result<(), ProtocolError> {
        let delta = {
            let view = self.view.lock().await;
            view.writable_replica()?.insert(index, chunk)
        };
        self.send(&ClientMessage::Change(delta)).await
    }

    /// Remove text locally and send the resulting change.
    pub async fn remove(&self, index: u32, len: u32) -> Result<(), ProtocolError> {
        let delta = {
            let view = self.view.lock().await;
            view.writable_replica()?.remove(index, len)
        };
        self.send(&ClientMessage::Change(delta)).await
    }

    /// Send a raw change delta (already applied locally by the caller).
    pub async fn send_change(&self, delta: Vec<u8>) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Change(delta)).await
    }

    /// Publish our presence. It is re-sent whenever the room asks for a replay.
    pub async fn set_presence(&self, presence: PresenceState) -> Result<(), ProtocolError> {
        let payload = {
            let mut view = self.view.lock().await;
            view.presence_clock += 1;
            view.local_presence = Some(presence.clone());
            PresenceUpdate::new(self.replica_id, view.presence_clock, presence).encode()?
        };
        self.send(&ClientMessage::Presence(payload)).await
    }

    /// Presence carrying our username and the color derived from our replica id.
    pub fn presence_at(&self, cursor: Option<CursorPosition>) -> PresenceState {
        PresenceState {
            display_name: self.identity.username.clone(),
            color: color_for_replica(self.replica_id),
            cursor,
        }
    }

    /// Host only; the server ignores it from anyone else.
    pub async fn set_mode(&self, mode: Mode) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::SetMode(mode)).await
    }

    /// Leave the current room, keeping the connection open.
    pub async fn leave(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Leave).await?;
        self.view.lock().await.reset();
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Ping).await
    }

    /// Close the connection. The server treats this as a leave.
    pub async fn disconnect(&mut self) -> Result<(), ProtocolError> {
        if let Some(tx) = self.outgoing_tx.take() {
            tx.send(Message::Close(None))
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }
        *self.state.write().await = ConnectionState::Disconnected;
        Ok(())
    }

    async fn send(&self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::NotConnected)?;
        let encoded = msg.encode()?;
        tx.send(Message::Binary(encoded.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Local replica content, if joined.
    pub async fn content(&self) -> Option<String> {
        self.view.lock().await.replica.as_ref().map(Replica::content)
    }

    pub async fn document_id(&self) -> Option<DocumentId> {
        self.view.lock().await.document_id.clone()
    }

    pub async fn language(&self) -> Option<String> {
        self.view.lock().await.language.clone()
    }

    pub async fn members(&self) -> Vec<MemberInfo> {
        self.view.lock().await.members.clone()
    }

    pub async fn host(&self) -> Option<ConnectionId> {
        self.view.lock().await.host
    }

    /// Our own connection id, as assigned by the server on join.
    pub async fn me(&self) -> Option<ConnectionId> {
        self.view.lock().await.me
    }

    pub async fn is_host(&self) -> bool {
        let view = self.view.lock().await;
        view.me.is_some() && view.me == view.host
    }

    pub async fn mode(&self) -> Mode {
        self.view.lock().await.mode
    }

    /// Presence of other replicas, sorted by replica id.
    pub async fn remote_presence(&self) -> Vec<(ReplicaId, PresenceState)> {
        let view = self.view.lock().await;
        let mut states: Vec<(ReplicaId, PresenceState)> = view
            .awareness
            .states()
            .map(|(id, state)| (id, state.clone()))
            .collect();
        states.sort_by_key(|(id, _)| *id);
        states
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

fn header_value(value: &str) -> Result<HeaderValue, ProtocolError> {
    HeaderValue::from_str(value).map_err(|e| ProtocolError::InvalidHeader(e.to_string()))
}

/// Fold one server message into the local view.
///
/// Returns the event for the application and, for presence replay requests,
/// a message to send back.
///
/// When write access comes back after a lock, the reply is a rejoin. Edits
/// sent just before the lock reached us were dropped by the room, so the
/// local replica is rebuilt from a fresh snapshot before editing resumes.
async fn apply_server_message(
    view: &Mutex<RoomView>,
    replica_id: ReplicaId,
    msg: ServerMessage,
) -> (Option<SessionEvent>, Option<Message>) {
    let mut view = view.lock().await;
    let was_read_only = view.read_only();
    let is_room_state = matches!(msg, ServerMessage::RoomState { .. });

    let (event, reply) = fold_server_message(&mut view, replica_id, msg);
    if was_read_only && !is_room_state && !view.read_only() && !view.resyncing {
        if let Some(rejoin) = rejoin_frame(&view, replica_id) {
            view.resyncing = true;
            return (event, Some(rejoin));
        }
    }
    (event, reply)
}

fn fold_server_message(
    view: &mut RoomView,
    replica_id: ReplicaId,
    msg: ServerMessage,
) -> (Option<SessionEvent>, Option<Message>) {
    match msg {
        ServerMessage::RoomState {
            document_id,
            language,
            snapshot,
            mode,
            members,
            host,
            you,
        } => {
            let replica = match Replica::from_snapshot(replica_id, &snapshot) {
                Ok(replica) => replica,
                Err(e) => {
                    log::error!("Could not load room snapshot for {document_id}: {e}");
                    return (None, None);
                }
            };
            view.replica = Some(replica);
            view.awareness.clear();
            view.document_id = Some(document_id.clone());
            view.language = Some(language);
            view.members = members.clone();
            view.host = Some(host);
            view.mode = mode;
            view.me = Some(you);
            view.resyncing = false;

            // announce ourselves to the room we just entered
            let reply = own_presence(view, replica_id);
            (
                Some(SessionEvent::Joined {
                    document_id,
                    members,
                    host,
                    mode,
                }),
                reply,
            )
        }
        ServerMessage::Change(delta) => match view.replica.as_ref() {
            Some(replica) => match replica.apply_remote_change(&delta) {
                Ok(()) => (Some(SessionEvent::RemoteChange), None),
                Err(e) => {
                    log::warn!("Dropping remote change: {e}");
                    (None, None)
                }
            },
            None => (None, None),
        },
        ServerMessage::Presence(payload) => match PresenceUpdate::decode(&payload) {
            Ok(update) if view.awareness.apply(&update) => {
                (Some(SessionEvent::PresenceChanged(update.replica_id)), None)
            }
            Ok(_) => (None, None),
            Err(e) => {
                log::warn!("Dropping remote presence: {e}");
                (None, None)
            }
        },
        ServerMessage::MembersChanged { members, host } => {
            view.members = members.clone();
            view.host = Some(host);
            (Some(SessionEvent::MembersChanged { members, host }), None)
        }
        ServerMessage::HostChanged { host } => {
            view.host = Some(host);
            (Some(SessionEvent::HostChanged(host)), None)
        }
        ServerMessage::ModeChanged(mode) => {
            view.mode = mode;
            (Some(SessionEvent::ModeChanged(mode)), None)
        }
        ServerMessage::PresenceRemoved { replica_id: removed } => {
            view.awareness.remove(removed);
            (Some(SessionEvent::PresenceRemoved(removed)), None)
        }
        ServerMessage::RequestPresenceReplay => (None, own_presence(view, replica_id)),
        ServerMessage::Evicted => {
            view.reset();
            (Some(SessionEvent::Evicted), None)
        }
        ServerMessage::Error { code, message } => (Some(SessionEvent::Error { code, message }), None),
        ServerMessage::Pong => (Some(SessionEvent::Pong), None),
    }
}

fn rejoin_frame(view: &RoomView, replica_id: ReplicaId) -> Option<Message> {
    let document_id = view.document_id.clone()?;
    let frame = ClientMessage::Join {
        document_id,
        replica_id,
    }
    .encode()
    .ok()?;
    Some(Message::Binary(frame.into()))
}

fn own_presence(view: &RoomView, replica_id: ReplicaId) -> Option<Message> {
    let state = view.local_presence.clone()?;
    let payload = PresenceUpdate::new(replica_id, view.presence_clock, state)
        .encode()
        .ok()?;
    let frame = ClientMessage::Presence(payload).encode().ok()?;
    Some(Message::Binary(frame.into()))
}
