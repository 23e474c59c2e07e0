//! Client-side mirror of a room's state.
//!
//! The mirror is updated canonically by applying server broadcasts in
//! arrival order. Two latency-sensitive paths (the local cursor and
//! local molecule edits) are also applied optimistically before the
//! round trip, and are simply overwritten whenever a later canonical
//! broadcast disagrees (same last-write-wins policy the server uses).
//!
//! Incremental `user_answered` broadcasts mark that a sid answered
//! without carrying the value; only a full snapshot carries values.

use serde_json::Value;

use crate::protocol::{
    Cursor, ModuleKind, MoleculeStructure, QuizUpdate, RoomState, ServerEvent, Sid, User,
};

/// Local copy of one room's state, owned by the client sync adapter.
#[derive(Debug, Clone, Default)]
pub struct RoomMirror {
    sid: Option<Sid>,
    state: RoomState,
    synced: bool,
}

impl RoomMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Our own sid, known once the first snapshot arrives.
    pub fn sid(&self) -> Option<Sid> {
        self.sid
    }

    /// Whether a full snapshot has been received since (re)connecting.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn state(&self) -> &RoomState {
        &self.state
    }

    pub fn active_module(&self) -> ModuleKind {
        self.state.active_module
    }

    pub fn users(&self) -> &std::collections::HashMap<Sid, User> {
        &self.state.users
    }

    /// Everyone except ourselves, for presence rendering.
    pub fn other_users(&self) -> Vec<&User> {
        self.state
            .users
            .values()
            .filter(|u| Some(u.sid) != self.sid)
            .collect()
    }

    pub fn molecule(&self) -> &MoleculeStructure {
        &self.state.molecule_state
    }

    pub fn quiz(&self) -> &crate::protocol::QuizState {
        &self.state.quiz_state
    }

    /// Forget the snapshot on disconnect; the next join must resync.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Apply one canonical broadcast from the server.
    pub fn apply(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::RoomState { sid, state } => {
                self.sid = Some(*sid);
                self.state = state.clone();
                self.synced = true;
            }
            ServerEvent::UserJoined(user) => {
                self.state.users.insert(user.sid, user.clone());
            }
            ServerEvent::UserLeft { sid } => {
                self.state.users.remove(sid);
            }
            ServerEvent::CursorUpdate { sid, x, y } => {
                if let Some(user) = self.state.users.get_mut(sid) {
                    user.cursor = Cursor::new(*x, *y);
                }
            }
            ServerEvent::ModuleChanged { module, .. } => {
                self.state.active_module = *module;
            }
            ServerEvent::QuizUpdate(update) => self.apply_quiz(update),
            ServerEvent::MoleculeUpdate { structure, .. } => {
                self.state.molecule_state = structure.clone();
            }
            ServerEvent::LabUpdate { payload, .. } => {
                // Replay the relay with the same per-key last-write-wins
                // the server applied.
                for (key, value) in payload {
                    self.state.lab_state.insert(key.clone(), value.clone());
                }
            }
            ServerEvent::Error { .. } => {}
        }
    }

    fn apply_quiz(&mut self, update: &QuizUpdate) {
        match update {
            QuizUpdate::Start { state } => {
                self.state.quiz_state = state.clone();
            }
            QuizUpdate::NextQuestion { index } => {
                self.state.quiz_state.current_question = *index;
            }
            QuizUpdate::UserAnswered {
                sid,
                question_index,
                ..
            } => {
                // Value withheld on the wire; mark answered only.
                self.state
                    .quiz_state
                    .record_answer(*question_index, *sid, Value::Bool(true));
            }
        }
    }

    /// Optimistic path: apply our own cursor move immediately.
    ///
    /// Returns the clamped cursor actually stored (and to be sent).
    pub fn set_local_cursor(&mut self, x: f64, y: f64) -> Cursor {
        let cursor = Cursor::new(x, y);
        if let Some(sid) = self.sid {
            if let Some(user) = self.state.users.get_mut(&sid) {
                user.cursor = cursor;
            }
        }
        cursor
    }

    /// Optimistic path: apply our own molecule edit immediately. A
    /// later canonical `molecule_update` overwrites it if the server
    /// processed someone else's edit after ours.
    pub fn set_local_molecule(&mut self, structure: MoleculeStructure) {
        self.state.molecule_state = structure;
    }
}
