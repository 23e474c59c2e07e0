//! WebSocket collaboration server.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (code) ── RoomState ── FanoutGroup
//! Client B ──┘        │
//!                     └── reducers (single total order per room)
//! ```
//!
//! One task per connection; a connection binds to at most one room via
//! its first `join_room`. Every subsequent event is validated, applied
//! through the room's reducers, and fanned out. Unknown or malformed
//! events are dropped with a log line and no state change. A dropped
//! transport is an implicit leave — peers only ever see `user_left`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::Envelope;
use crate::protocol::{ClientEvent, ServerEvent, Sid};
use crate::room::{Room, RoomRegistry};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Broadcast channel capacity per room.
    pub broadcast_capacity: usize,
    /// How long a room may sit empty before teardown, in seconds.
    /// The window runs from creation (a minted code that nobody joins
    /// dies too) and from the last leave. Zero schedules teardown
    /// immediately.
    pub empty_room_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            broadcast_capacity: 256,
            empty_room_grace_secs: 30,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// A connection's binding to a room, established by `join_room`.
struct Session {
    code: String,
    sid: Sid,
    room: Arc<Room>,
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    registry: RoomRegistry,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = RoomRegistry::new(
            config.broadcast_capacity,
            Duration::from_secs(config.empty_room_grace_secs),
        );
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Handle to the room registry, shared with this server. The
    /// out-of-band HTTP layer calls `create_session`/`lookup_session`
    /// through it.
    pub fn registry(&self) -> RoomRegistry {
        self.registry.clone()
    }

    /// Out-of-band: mint a room code before any socket join occurs.
    pub async fn create_session(&self) -> String {
        self.registry.create_session().await
    }

    /// Out-of-band: confirm a code resolves to a live room.
    pub async fn lookup_session(&self, code: &str) -> bool {
        self.registry.lookup_session(code).await
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Counters plus the room gauge, which is derived on read so it
    /// stays honest across grace-timer teardowns.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.registry.room_count().await;
        stats
    }

    /// Accept loop. Runs until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collab server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: RoomRegistry,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut session: Option<Session> = None;
        let mut broadcast_rx: Option<tokio::sync::broadcast::Receiver<Envelope>> = None;

        loop {
            tokio::select! {
                // Incoming client event
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }

                            match ClientEvent::decode(text.as_str()) {
                                Ok(ClientEvent::JoinRoom { room_id, name }) => {
                                    if session.is_some() {
                                        log::warn!("{addr} sent join_room while already joined; dropped");
                                        continue;
                                    }
                                    match registry.join(&room_id, &name).await {
                                        Ok(joined) => {
                                            // Bind the session before the snapshot
                                            // send: if the send fails, the cleanup
                                            // below must still take this user out
                                            // of the room.
                                            let sid = joined.user.sid;
                                            session = Some(Session {
                                                code: room_id,
                                                sid,
                                                room: joined.room,
                                            });
                                            broadcast_rx = Some(joined.receiver);

                                            let snapshot = ServerEvent::RoomState {
                                                sid,
                                                state: joined.snapshot,
                                            };
                                            let frame = match snapshot.encode() {
                                                Ok(frame) => frame,
                                                Err(e) => {
                                                    log::error!("Failed to encode snapshot for {addr}: {e}");
                                                    break;
                                                }
                                            };
                                            if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                                                log::info!("Connection dropped during join from {addr}");
                                                break;
                                            }
                                        }
                                        Err(e) => {
                                            log::warn!("{addr} failed to join {room_id}: {e}");
                                            let error = ServerEvent::Error {
                                                code: "room_not_found".to_string(),
                                                message: e.to_string(),
                                            };
                                            match error.encode() {
                                                Ok(frame) => {
                                                    if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                                                        break;
                                                    }
                                                }
                                                Err(e) => {
                                                    log::error!("Failed to encode error frame: {e}");
                                                }
                                            }
                                        }
                                    }
                                }
                                Ok(event) => match &session {
                                    Some(s) if event.room_id() == s.code => {
                                        if let Err(e) = s.room.apply(s.sid, &event).await {
                                            log::warn!("Failed to apply event from {addr}: {e}");
                                        }
                                    }
                                    Some(s) => {
                                        log::warn!(
                                            "{addr} sent event for room {} while bound to {}; dropped",
                                            event.room_id(),
                                            s.code
                                        );
                                    }
                                    None => {
                                        log::warn!("{addr} sent event before join_room; dropped");
                                    }
                                },
                                Err(e) => {
                                    log::warn!("Invalid event from {addr}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if ws_sender.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }

                        Some(Ok(Message::Binary(_))) => {
                            log::warn!("Unexpected binary frame from {addr}; dropped");
                        }

                        Some(Err(e)) => {
                            log::info!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing room broadcast
                envelope = async {
                    match broadcast_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        // Not joined yet, wait forever.
                        None => std::future::pending().await,
                    }
                } => {
                    match envelope {
                        Ok(envelope) => {
                            let own = session.as_ref().map(|s| s.sid);
                            if envelope.exclude_origin && Some(envelope.origin) == own {
                                continue;
                            }
                            // A failed forward means the socket is dead;
                            // fall through to the leave below instead of
                            // bailing out around it.
                            if ws_sender
                                .send(Message::Text(envelope.frame.as_str().into()))
                                .await
                                .is_err()
                            {
                                log::info!("Forward failed, dropping connection from {addr}");
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Session at {addr} lagged by {n} broadcasts");
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        // Cleanup: implicit leave on disconnect.
        if let Some(s) = session {
            registry.leave(&s.code, s.sid).await;
        }
        stats.write().await.active_connections -= 1;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8000");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.empty_room_grace_secs, 30);
    }

    #[test]
    fn test_server_creation() {
        let server = CollabServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:8000");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = CollabServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.total_bytes, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_out_of_band_session_ops() {
        let server = CollabServer::with_defaults();
        let code = server.create_session().await;
        assert!(server.lookup_session(&code).await);
        assert!(!server.lookup_session("ZZZZZZ").await);
    }

    #[tokio::test]
    async fn test_registry_handle_shares_rooms() {
        let server = CollabServer::with_defaults();
        let registry = server.registry();
        let code = registry.create_session().await;
        assert!(server.lookup_session(&code).await);
    }

    #[tokio::test]
    async fn test_stats_room_gauge_follows_registry() {
        let server = CollabServer::with_defaults();
        let code = server.create_session().await;
        assert_eq!(server.stats().await.active_rooms, 1);

        // Destruction outside any connection event (the grace timer
        // path) must still be reflected.
        server.registry().destroy(&code).await;
        assert_eq!(server.stats().await.active_rooms, 0);
    }
}
