//! WebSocket transport in front of the session coordinator.
//!
//! Architecture:
//! ```text
//! Editor A ──┐   upgrade + x-user-id      ┌──────────────────────────┐
//!            ├─────────────────────────► │ connection task (per ws) │
//! Editor B ──┘                            │  select! {               │
//!                                         │    ws frame  → Session   │
//!                                         │    Inbox     → ws frame  │
//!                                         │    idle timer → leave    │
//!                                         │  }                       │
//!                                         └────────────┬─────────────┘
//!                                                      ▼
//!                                         SessionCoordinator ── RoomRegistry
//!                                                                   │
//!                                                            dyn DocumentStore
//! ```
//!
//! Identity is taken from headers set by an authenticating proxy in front of
//! the server. Every exit path of a connection task (close, error, idle
//! timeout, slow consumer) ends in `Session::leave`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::{Instant, Sleep};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::ClientMessage;
use crate::session::{Identity, SessionConfig, SessionCoordinator};
use crate::storage::{DocumentStore, MemoryDocumentStore, RocksDocumentStore, StoreConfig, StoreError};

/// Header carrying the authenticated user id. Required.
pub const USER_ID_HEADER: &str = "x-user-id";
/// Header carrying the display name. Defaults to the user id.
pub const USERNAME_HEADER: &str = "x-username";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Close connections silent for this long (0 disables)
    pub idle_timeout_secs: u64,
    /// Transport ceiling for a single WebSocket message/frame
    pub max_frame_bytes: usize,
    /// RocksDB directory (None = in-memory store)
    pub storage_path: Option<PathBuf>,
    /// Coordinator limits and timeouts
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            idle_timeout_secs: 60,
            max_frame_bytes: 1024 * 1024,
            storage_path: None,
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// How long a silent connection is kept, `None` when disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub refused_handshakes: u64,
    pub active_rooms: usize,
}

/// The collaborative session server.
#[derive(Clone)]
pub struct SessionServer {
    config: ServerConfig,
    coordinator: SessionCoordinator,
    stats: Arc<RwLock<ServerStats>>,
}

impl SessionServer {
    /// Create a server over an existing store.
    pub fn new(config: ServerConfig, store: Arc<dyn DocumentStore>) -> Self {
        let coordinator = SessionCoordinator::new(store, config.session.clone());
        Self {
            config,
            coordinator,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create a server over the store named by `config.storage_path`.
    pub fn open(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn DocumentStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksDocumentStore::open(StoreConfig::new(path))?),
            None => {
                log::warn!("No storage path configured, documents live in memory only");
                Arc::new(MemoryDocumentStore::new())
            }
        };
        Ok(Self::new(config, store))
    }

    /// Bind `config.bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!("Session server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    fn ws_config(&self) -> WebSocketConfig {
        WebSocketConfig::default()
            .max_message_size(Some(self.config.max_frame_bytes))
            .max_frame_size(Some(self.config.max_frame_bytes))
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut identity = None;
        let handshake = tokio_tungstenite::accept_hdr_async_with_config(
            stream,
            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                match identity_from_request(req) {
                    Some(id) => {
                        identity = Some(id);
                        Ok(resp)
                    }
                    None => Err(unauthorized()),
                }
            },
            Some(self.ws_config()),
        )
        .await;

        let (ws_stream, identity) = match (handshake, identity) {
            (Ok(ws), Some(identity)) => (ws, identity),
            (result, _) => {
                self.stats.write().await.refused_handshakes += 1;
                if let Err(e) = result {
                    log::warn!("Refused WebSocket upgrade from {addr}: {e}");
                }
                return Ok(());
            }
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (mut session, mut inbox) = self.coordinator.open_session(identity);
        log::info!(
            "WebSocket connection {} established from {addr} (user {})",
            session.connection_id(),
            session.identity().user_id
        );

        let idle = self.config.idle_timeout();
        let idle_timer = tokio::time::sleep(idle.unwrap_or_default());
        tokio::pin!(idle_timer);

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            rearm(idle_timer.as_mut(), idle);
                            {
                                let mut s = self.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            match ClientMessage::decode(&data) {
                                Ok(client_msg) => {
                                    // outcome is already reported or logged by the session
                                    let _ = session.handle(client_msg).await;
                                }
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                }
                            }
                        }

                        // tungstenite answers pings itself
                        Some(Ok(Message::Ping(_))) => {
                            rearm(idle_timer.as_mut(), idle);
                        }

                        Some(Ok(Message::Text(_))) => {
                            log::warn!("Ignoring text frame from {addr}");
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                frame = inbox.recv() => {
                    match frame {
                        Some(bytes) => {
                            if let Err(e) = ws_sender.send(Message::Binary(bytes.to_vec().into())).await {
                                log::error!("WebSocket write to {addr} failed: {e}");
                                break;
                            }
                        }
                        None => {
                            log::warn!("Disconnecting {addr}: outbound queue overflowed");
                            break;
                        }
                    }
                }

                _ = &mut idle_timer, if idle.is_some() => {
                    log::info!("Closing idle connection from {addr}");
                    break;
                }
            }
        }

        if let Err(e) = session.leave().await {
            log::warn!("Leave on disconnect failed for {addr}: {e}");
        }
        let _ = ws_sender.close().await;

        let mut s = self.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        Ok(())
    }

    /// Gracefully tear down all rooms. See [`SessionCoordinator::shutdown`].
    pub async fn shutdown(&self) -> usize {
        self.coordinator.shutdown().await
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.coordinator.registry().room_count();
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &SessionCoordinator {
        &self.coordinator
    }
}

/// Extract the proxy-provided identity from an upgrade request.
pub fn identity_from_request(req: &Request) -> Option<Identity> {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    let user_id = header(USER_ID_HEADER)?;
    let username = header(USERNAME_HEADER).unwrap_or_else(|| user_id.clone());
    Some(Identity { user_id, username })
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(format!("missing {USER_ID_HEADER} header")));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

fn rearm(timer: Pin<&mut Sleep>, idle: Option<Duration>) {
    if let Some(idle) = idle {
        timer.reset(Instant::now() + idle);
    }
}
