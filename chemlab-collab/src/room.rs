//! Room registry and session lifecycle.
//!
//! Each live room is one registry entry owning the authoritative
//! [`RoomState`] behind a per-room mutex plus a [`FanoutGroup`] for
//! broadcasts. Reducer application and the fanout send happen under
//! that mutex, so all events within one room are applied and broadcast
//! in a single total order, while distinct rooms run fully in
//! parallel with no shared mutable state.
//!
//! Rooms are created through `create_session` (the out-of-band
//! "create session" call that hands out a shareable code before any
//! socket joins) and torn down once they have sat empty past the
//! configured grace window. The window runs from creation (a minted
//! code nobody ever joins dies too) and again from the last leave,
//! so a quick refresh keeps the room alive.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use crate::broadcast::{Envelope, FanoutGroup};
use crate::protocol::{
    epoch_millis, ClientEvent, Cursor, ProtocolError, RoomState, ServerEvent, Sid, User,
};
use crate::reducer;

/// Room codes: short, human-typeable, unambiguous to shout across a
/// classroom.
pub const ROOM_CODE_LEN: usize = 6;
const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// The lab palette. Colors are assigned round-robin, skipping colors
/// already in use in the room, and stay stable for the connection's
/// lifetime.
pub const USER_COLORS: [&str; 8] = [
    "#2E6B6B", // Bunsen Blue
    "#C97B49", // Copper Flame
    "#C9A9C9", // Indicator Pink
    "#7B9E7B", // Sage Green
    "#C96B49", // Terracotta
    "#9B6BC9", // Amethyst
    "#E8A838", // Amber
    "#2E8B8B", // Teal
];

/// Generate a candidate room code from UUID entropy.
pub fn generate_room_code() -> String {
    Uuid::new_v4()
        .as_bytes()
        .iter()
        .take(ROOM_CODE_LEN)
        .map(|b| CODE_ALPHABET[*b as usize % CODE_ALPHABET.len()] as char)
        .collect()
}

fn pick_color(users: &HashMap<Sid, User>) -> &'static str {
    let used: std::collections::HashSet<&str> =
        users.values().map(|u| u.color.as_str()).collect();
    USER_COLORS
        .iter()
        .copied()
        .find(|c| !used.contains(c))
        .unwrap_or(USER_COLORS[users.len() % USER_COLORS.len()])
}

/// Registry errors.
#[derive(Debug, Clone)]
pub enum RegistryError {
    RoomNotFound(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RoomNotFound(code) => write!(f, "Room not found: {code}"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// One live room: authoritative state plus its broadcast channel.
pub struct Room {
    code: String,
    state: Mutex<RoomState>,
    fanout: FanoutGroup,
}

impl Room {
    fn new(code: String, broadcast_capacity: usize) -> Self {
        Self {
            code,
            state: Mutex::new(RoomState::new()),
            fanout: FanoutGroup::new(broadcast_capacity),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn fanout(&self) -> &FanoutGroup {
        &self.fanout
    }

    /// Clone the current state (used for join snapshots and the
    /// out-of-band lookup layer).
    pub async fn snapshot(&self) -> RoomState {
        self.state.lock().await.clone()
    }

    /// Apply one event through the reducers and broadcast the result.
    ///
    /// The state lock is held across both steps — this is the room's
    /// total-order guarantee.
    pub async fn apply(&self, sid: Sid, event: &ClientEvent) -> Result<(), ProtocolError> {
        let mut state = self.state.lock().await;
        if let Some(effect) = reducer::reduce(&mut state, sid, event) {
            let frame = effect.event.encode()?;
            self.fanout.send(sid, effect.exclude_sender, frame);
        }
        Ok(())
    }
}

/// What a successful join hands back to the connection task.
pub struct JoinedSession {
    pub user: User,
    /// Full state for the joiner — it has no prior state to diff
    /// against.
    pub snapshot: RoomState,
    pub receiver: broadcast::Receiver<Envelope>,
    pub room: Arc<Room>,
}

/// Creates, resolves and destroys rooms. Cheap to clone; all clones
/// share the same room table.
#[derive(Clone)]
pub struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<String, Arc<Room>>>>,
    broadcast_capacity: usize,
    /// How long a room may sit empty (from creation or from the last
    /// leave) before teardown.
    empty_room_grace: Duration,
}

impl RoomRegistry {
    pub fn new(broadcast_capacity: usize, empty_room_grace: Duration) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            broadcast_capacity,
            empty_room_grace,
        }
    }

    /// Register a new empty room and return its code.
    ///
    /// Codes are unique among live rooms; on the (practically
    /// unreachable) collision we retry with a fresh random code. The
    /// grace clock starts immediately, so a code that is minted but
    /// never joined does not outlive the window.
    pub async fn create_session(&self) -> String {
        let mut rooms = self.rooms.write().await;
        loop {
            let code = generate_room_code();
            if !rooms.contains_key(&code) {
                rooms.insert(
                    code.clone(),
                    Arc::new(Room::new(code.clone(), self.broadcast_capacity)),
                );
                log::info!("Room created: {code}");
                self.schedule_teardown(&code);
                return code;
            }
        }
    }

    /// Out-of-band existence check, used before attempting a join.
    pub async fn lookup_session(&self, code: &str) -> bool {
        self.rooms.read().await.contains_key(code)
    }

    pub async fn get(&self, code: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(code).cloned()
    }

    /// State snapshot for a live room.
    pub async fn snapshot(&self, code: &str) -> Option<RoomState> {
        let room = self.get(code).await?;
        Some(room.snapshot().await)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Remove a room unconditionally. Idempotent; once removed its
    /// code may be reused.
    pub async fn destroy(&self, code: &str) {
        if self.rooms.write().await.remove(code).is_some() {
            log::info!("Room destroyed: {code}");
        }
    }

    async fn destroy_if_empty(&self, code: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(code) {
            if room.state.lock().await.users.is_empty() {
                rooms.remove(code);
                log::info!("Room destroyed (empty past grace): {code}");
            }
        }
    }

    /// Arm the grace timer for a room that just became (or was
    /// created) empty. The emptiness re-check at expiry makes a timer
    /// armed before a join harmless.
    fn schedule_teardown(&self, code: &str) {
        let registry = self.clone();
        let code = code.to_string();
        let grace = self.empty_room_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            registry.destroy_if_empty(&code).await;
        });
    }

    /// Bind a new session to a room.
    ///
    /// Assigns a fresh sid and a palette color, inserts the user,
    /// broadcasts `user_joined` to existing members, and returns the
    /// full snapshot for the joiner.
    pub async fn join(&self, code: &str, name: &str) -> Result<JoinedSession, RegistryError> {
        let room = self
            .get(code)
            .await
            .ok_or_else(|| RegistryError::RoomNotFound(code.to_string()))?;

        let mut state = room.state.lock().await;
        let sid = Uuid::new_v4();
        let user = User {
            sid,
            name: name.to_string(),
            color: pick_color(&state.users).to_string(),
            cursor: Cursor::default(),
            joined_at: epoch_millis(),
        };
        state.users.insert(sid, user.clone());
        let snapshot = state.clone();

        // Subscribe before announcing so ordering is preserved for the
        // joiner too; its own user_joined is filtered by origin.
        let receiver = room.fanout.subscribe();
        if let Ok(frame) = ServerEvent::UserJoined(user.clone()).encode() {
            room.fanout.send(sid, true, frame);
        }
        drop(state);

        log::info!("User {} ({sid}) joined room {code}", user.name);
        Ok(JoinedSession {
            user,
            snapshot,
            receiver,
            room,
        })
    }

    /// Unbind a session from its room on transport disconnect.
    ///
    /// Broadcasts `user_left`; when the room empties, schedules the
    /// grace-window teardown.
    pub async fn leave(&self, code: &str, sid: Sid) {
        let Some(room) = self.get(code).await else {
            return;
        };

        let mut state = room.state.lock().await;
        if state.users.remove(&sid).is_none() {
            return;
        }
        if let Ok(frame) = (ServerEvent::UserLeft { sid }).encode() {
            room.fanout.send(sid, true, frame);
        }
        let empty = state.users.is_empty();
        drop(state);

        log::info!("User {sid} left room {code}");
        if empty {
            self.schedule_teardown(code);
        }
    }
}
