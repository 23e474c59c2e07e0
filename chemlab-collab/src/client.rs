//! WebSocket sync client for connecting to the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, join, disconnect)
//! - A local [`RoomMirror`] kept in step with server broadcasts
//! - Optimistic cursor and molecule updates
//! - Cursor send throttling (at most one `cursor_move` per 30ms)
//!
//! While disconnected, sends are dropped silently; after reconnecting
//! the caller joins again and the fresh snapshot replaces the mirror.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::mirror::RoomMirror;
use crate::protocol::{
    ClientEvent, Cursor, ModuleKind, MoleculeStructure, ProtocolError, QuizCommand, ServerEvent,
    Sid,
};

/// Minimum interval between outgoing cursor frames.
pub const CURSOR_SEND_INTERVAL: Duration = Duration::from_millis(30);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the collab client.
#[derive(Debug, Clone)]
pub enum CollabEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Initial room snapshot received; our identity is known
    Synced { sid: Sid },
    /// Any other broadcast, already applied to the mirror
    Remote(ServerEvent),
    /// The server rejected something (e.g. unknown room code)
    ServerError { code: String, message: String },
}

/// Rate limiter for cursor sends.
///
/// Local rendering is never throttled, only the wire traffic.
struct CursorThrottle {
    last_sent: Option<Instant>,
    interval: Duration,
}

impl CursorThrottle {
    fn new(interval: Duration) -> Self {
        Self {
            last_sent: None,
            interval,
        }
    }

    /// Whether a frame may be sent now; records the send when allowed.
    fn allow(&mut self) -> bool {
        let now = Instant::now();
        match self.last_sent {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_sent = Some(now);
                true
            }
        }
    }
}

/// The collab client.
///
/// Manages a WebSocket connection to the collaboration server and a
/// local mirror of the joined room's state.
pub struct CollabClient {
    /// Server URL
    server_url: String,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Local mirror of the joined room
    mirror: Arc<RwLock<RoomMirror>>,

    /// Room we joined (set by `join_room`)
    room_id: Option<String>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<CollabEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<CollabEvent>,

    /// Cursor send rate limiter
    throttle: Mutex<CursorThrottle>,
}

impl CollabClient {
    /// Create a new client.
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            mirror: Arc::new(RwLock::new(RoomMirror::new())),
            room_id: None,
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            throttle: Mutex::new(CursorThrottle::new(CURSOR_SEND_INTERVAL)),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<CollabEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading and writing WebSocket
    /// frames. Does not join a room; call [`join_room`] afterwards.
    ///
    /// [`join_room`]: CollabClient::join_room
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_result = tokio_tungstenite::connect_async(&self.server_url).await;
        let (ws_stream, _) = match ws_result {
            Ok(ok) => ok,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };

        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_writer
                    .send(tokio_tungstenite::tungstenite::Message::Text(frame.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            // Channel closed by disconnect(); close the socket so the
            // server sees the leave instead of a dangling connection.
            let _ = ws_writer
                .send(tokio_tungstenite::tungstenite::Message::Close(None))
                .await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(CollabEvent::Connected).await;

        // Reader task: apply broadcasts to the mirror, then surface
        // them to the application.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let mirror = self.mirror.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Text(text)) => {
                        let event = match ServerEvent::decode(text.as_str()) {
                            Ok(event) => event,
                            Err(e) => {
                                log::warn!("Undecodable server frame: {e}");
                                continue;
                            }
                        };
                        mirror.write().await.apply(&event);

                        let out = match &event {
                            ServerEvent::RoomState { sid, .. } => {
                                CollabEvent::Synced { sid: *sid }
                            }
                            ServerEvent::Error { code, message } => CollabEvent::ServerError {
                                code: code.clone(),
                                message: message.clone(),
                            },
                            _ => CollabEvent::Remote(event),
                        };
                        if event_tx.send(out).await.is_err() {
                            break;
                        }
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => {
                        break;
                    }
                    _ => {}
                }
            }

            // Connection lost. The mirror is stale until the next
            // join delivers a fresh snapshot.
            mirror.write().await.reset();
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(CollabEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Join a room by code with a display name.
    ///
    /// The server answers with a `room_state` snapshot (surfaced as
    /// [`CollabEvent::Synced`]) or an error for an unknown code.
    pub async fn join_room(
        &mut self,
        room_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        let room_id = room_id.into();
        let event = ClientEvent::JoinRoom {
            room_id: room_id.clone(),
            name: name.into(),
        };
        self.room_id = Some(room_id);
        self.send_event(&event).await
    }

    /// Send a cursor position, throttled to one frame per 30ms.
    ///
    /// The local mirror is updated immediately regardless of the
    /// throttle, so our own cursor never feels laggy.
    pub async fn update_cursor(&self, x: f64, y: f64) -> Result<Cursor, ProtocolError> {
        let cursor = self.mirror.write().await.set_local_cursor(x, y);

        if !self.throttle.lock().await.allow() {
            return Ok(cursor);
        }
        if let Some(room_id) = &self.room_id {
            let event = ClientEvent::CursorMove {
                room_id: room_id.clone(),
                x: cursor.x,
                y: cursor.y,
            };
            self.send_event(&event).await?;
        }
        Ok(cursor)
    }

    /// Switch the room's active module.
    pub async fn change_module(&self, module: ModuleKind) -> Result<(), ProtocolError> {
        if let Some(room_id) = &self.room_id {
            let event = ClientEvent::ModuleChange {
                room_id: room_id.clone(),
                module,
            };
            self.send_event(&event).await?;
        }
        Ok(())
    }

    /// Send a lab bench update (per-key merge on the server).
    pub async fn send_lab_action(
        &self,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), ProtocolError> {
        if let Some(room_id) = &self.room_id {
            let event = ClientEvent::LabAction {
                room_id: room_id.clone(),
                payload,
            };
            self.send_event(&event).await?;
        }
        Ok(())
    }

    /// Send a quiz command.
    pub async fn send_quiz_action(&self, command: QuizCommand) -> Result<(), ProtocolError> {
        if let Some(room_id) = &self.room_id {
            let event = ClientEvent::QuizAction {
                room_id: room_id.clone(),
                command,
            };
            self.send_event(&event).await?;
        }
        Ok(())
    }

    /// Send a molecule edit, applied optimistically to the mirror.
    ///
    /// Invalid structures are rejected locally instead of being sent
    /// for the server to drop.
    pub async fn send_molecule_action(
        &self,
        structure: MoleculeStructure,
    ) -> Result<(), ProtocolError> {
        structure.validate()?;
        self.mirror
            .write()
            .await
            .set_local_molecule(structure.clone());

        if let Some(room_id) = &self.room_id {
            let event = ClientEvent::MoleculeAction {
                room_id: room_id.clone(),
                command: crate::protocol::MoleculeCommand::UpdateStructure { structure },
            };
            self.send_event(&event).await?;
        }
        Ok(())
    }

    /// Disconnect from the server.
    pub async fn disconnect(&mut self) {
        // Dropping the sender closes the writer task, which closes
        // the socket; the reader task then observes the close.
        self.outgoing_tx = None;
        self.room_id = None;
        *self.state.write().await = ConnectionState::Disconnected;
        self.mirror.write().await.reset();
    }

    /// Encode and send one event, silently dropped while offline.
    async fn send_event(&self, event: &ClientEvent) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            log::debug!("Dropping {} while disconnected", event.name());
            return Ok(());
        }
        let frame = event.encode()?;
        if let Some(ref tx) = self.outgoing_tx {
            tx.send(frame)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }
        Ok(())
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Shared handle to the local room mirror.
    pub fn mirror(&self) -> Arc<RwLock<RoomMirror>> {
        self.mirror.clone()
    }

    /// Our sid, known once the first snapshot arrived.
    pub async fn sid(&self) -> Option<Sid> {
        self.mirror.read().await.sid()
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Room we are bound to, if `join_room` was called.
    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }
}
