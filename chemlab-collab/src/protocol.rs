//! Wire protocol and shared room-state types.
//!
//! Events are JSON text frames tagged with `"event"`:
//! ```text
//! {"event":"cursor_move","room_id":"AB12CD","x":0.5,"y":0.5}
//! {"event":"quiz_action","room_id":"AB12CD","type":"answer",
//!  "payload":{"question_index":0,"answer":"7"}}
//! ```
//! Per-module actions are tagged enums with explicit payload shapes,
//! so the router validates structurally on decode instead of trusting
//! caller-supplied shape. Unknown event kinds and malformed payloads
//! fail decoding and are dropped by the router.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

/// Server-assigned session identifier, valid for one connection.
pub type Sid = Uuid;

/// The shared module every participant of a room is looking at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    #[default]
    Lab,
    Quiz,
    Molecule,
}

/// Cursor position normalized to the unit square, so positions are
/// comparable across differently-sized viewports.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
}

impl Cursor {
    /// Clamping constructor. Out-of-range values are clamped, not
    /// rejected; NaN collapses to 0.
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x: clamp_unit(x),
            y: clamp_unit(y),
        }
    }
}

fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// A participant as seen by everyone in the room.
///
/// Identity is ephemeral: generated at join time, gone on disconnect.
/// There is no token that restores a prior identity on reconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub sid: Sid,
    pub name: String,
    /// Hex color from the fixed lab palette, stable for the
    /// connection's lifetime.
    pub color: String,
    pub cursor: Cursor,
    /// Unix epoch milliseconds.
    pub joined_at: u64,
}

/// Shared quiz progress for a room.
///
/// `answers` is keyed by question index (stringified, as JSON object
/// keys are) then by sid; at most one answer per (question, sid) —
/// a later answer from the same sid overwrites the earlier one.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QuizState {
    pub active: bool,
    pub questions: Vec<Value>,
    pub current_question: usize,
    pub answers: HashMap<String, HashMap<Sid, Value>>,
    /// Carried for the scoring layer; the core never interprets it.
    pub scores: Map<String, Value>,
}

impl QuizState {
    /// Start a fresh quiz over the given questions.
    pub fn started(questions: Vec<Value>) -> Self {
        Self {
            active: true,
            questions,
            current_question: 0,
            answers: HashMap::new(),
            scores: Map::new(),
        }
    }

    /// Record an answer, overwriting any prior answer from the same sid.
    pub fn record_answer(&mut self, question_index: usize, sid: Sid, answer: Value) {
        self.answers
            .entry(question_index.to_string())
            .or_default()
            .insert(sid, answer);
    }

    /// Answers recorded for one question.
    pub fn answers_for(&self, question_index: usize) -> Option<&HashMap<Sid, Value>> {
        self.answers.get(&question_index.to_string())
    }
}

/// One atom of the shared molecule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    pub id: String,
    pub element: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// A bond between two atoms, referenced by atom id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bond {
    pub id: String,
    #[serde(rename = "from")]
    pub from_atom: String,
    #[serde(rename = "to")]
    pub to_atom: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// The molecule module's state: always a full snapshot, never a patch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MoleculeStructure {
    pub atoms: Vec<Atom>,
    pub bonds: Vec<Bond>,
}

impl MoleculeStructure {
    /// Internal-consistency check enforced by the reducer, not clients:
    /// atom ids unique, every bond referencing two distinct existing atoms.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let mut ids = std::collections::HashSet::with_capacity(self.atoms.len());
        for atom in &self.atoms {
            if !ids.insert(atom.id.as_str()) {
                return Err(ProtocolError::InvalidStructure(format!(
                    "duplicate atom id {:?}",
                    atom.id
                )));
            }
        }
        for bond in &self.bonds {
            if bond.from_atom == bond.to_atom {
                return Err(ProtocolError::InvalidStructure(format!(
                    "bond {:?} connects atom {:?} to itself",
                    bond.id, bond.from_atom
                )));
            }
            for end in [&bond.from_atom, &bond.to_atom] {
                if !ids.contains(end.as_str()) {
                    return Err(ProtocolError::InvalidStructure(format!(
                        "bond {:?} references unknown atom {:?}",
                        bond.id, end
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Authoritative per-room state, owned by the registry and mutated
/// only through reducers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomState {
    pub users: HashMap<Sid, User>,
    pub active_module: ModuleKind,
    /// Opaque to the core: relayed lab actions merged per top-level key.
    pub lab_state: Map<String, Value>,
    pub quiz_state: QuizState,
    pub molecule_state: MoleculeStructure,
    /// Unix epoch milliseconds.
    pub created_at: u64,
}

impl RoomState {
    /// Empty room: no users, lab module active.
    pub fn new() -> Self {
        Self {
            users: HashMap::new(),
            active_module: ModuleKind::Lab,
            lab_state: Map::new(),
            quiz_state: QuizState::default(),
            molecule_state: MoleculeStructure::default(),
            created_at: epoch_millis(),
        }
    }
}

impl Default for RoomState {
    fn default() -> Self {
        Self::new()
    }
}

/// Current time as Unix epoch milliseconds.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Quiz actions, adjacently tagged so the wire shape is
/// `{"type":"answer","payload":{…}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum QuizCommand {
    Start {
        #[serde(default)]
        questions: Vec<Value>,
    },
    NextQuestion,
    Answer {
        question_index: usize,
        answer: Value,
    },
}

/// Molecule actions. Only wholesale snapshot replacement; the merge
/// policy is last-write-wins by design.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MoleculeCommand {
    UpdateStructure { structure: MoleculeStructure },
}

/// Client → server events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinRoom {
        room_id: String,
        name: String,
    },
    CursorMove {
        room_id: String,
        x: f64,
        y: f64,
    },
    ModuleChange {
        room_id: String,
        module: ModuleKind,
    },
    LabAction {
        room_id: String,
        payload: Map<String, Value>,
    },
    QuizAction {
        room_id: String,
        #[serde(flatten)]
        command: QuizCommand,
    },
    MoleculeAction {
        room_id: String,
        #[serde(flatten)]
        command: MoleculeCommand,
    },
}

impl ClientEvent {
    /// The room this event is scoped to.
    pub fn room_id(&self) -> &str {
        match self {
            Self::JoinRoom { room_id, .. }
            | Self::CursorMove { room_id, .. }
            | Self::ModuleChange { room_id, .. }
            | Self::LabAction { room_id, .. }
            | Self::QuizAction { room_id, .. }
            | Self::MoleculeAction { room_id, .. } => room_id,
        }
    }

    /// Wire tag of this event, for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join_room",
            Self::CursorMove { .. } => "cursor_move",
            Self::ModuleChange { .. } => "module_change",
            Self::LabAction { .. } => "lab_action",
            Self::QuizAction { .. } => "quiz_action",
            Self::MoleculeAction { .. } => "molecule_action",
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::EncodeError(e.to_string()))
    }

    /// Deserialize from a JSON text frame.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::DecodeError(e.to_string()))
    }
}

/// Incremental quiz broadcasts. Answer values are withheld: other
/// participants only learn that a sid answered, never what — the full
/// snapshot on join/resync is the reveal channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuizUpdate {
    Start { state: QuizState },
    NextQuestion { index: usize },
    UserAnswered {
        sid: Sid,
        question_index: usize,
        answered: bool,
    },
}

/// Server → client events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Full snapshot, sent to a client with no prior state (join or
    /// resync). `sid` tells the recipient which user it is.
    RoomState {
        sid: Sid,
        #[serde(flatten)]
        state: RoomState,
    },
    UserJoined(User),
    UserLeft {
        sid: Sid,
    },
    CursorUpdate {
        sid: Sid,
        x: f64,
        y: f64,
    },
    ModuleChanged {
        module: ModuleKind,
        by: Sid,
    },
    QuizUpdate(QuizUpdate),
    MoleculeUpdate {
        structure: MoleculeStructure,
        by: Sid,
    },
    LabUpdate {
        by: Sid,
        payload: Map<String, Value>,
    },
    /// Client-visible failures (e.g. joining an unknown room code).
    Error {
        code: String,
        message: String,
    },
}

impl ServerEvent {
    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::EncodeError(e.to_string()))
    }

    /// Deserialize from a JSON text frame.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::DecodeError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    EncodeError(String),
    DecodeError(String),
    InvalidStructure(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EncodeError(e) => write!(f, "Encode error: {e}"),
            Self::DecodeError(e) => write!(f, "Decode error: {e}"),
            Self::InvalidStructure(e) => write!(f, "Invalid molecule structure: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
