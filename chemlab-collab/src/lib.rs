//! # chemlab-collab — Real-time collaboration core for ChemLab
//!
//! Small study groups share a room keyed by a 6-character code and see
//! each other's activity live: cursor positions, the active module,
//! lab bench changes, quiz progress and molecule edits.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ CollabClient │ ◄─────────────────► │ CollabServer │
//! │ (per user)   │     JSON events     │ (central)    │
//! └──────┬───────┘                     └──────┬───────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌──────────────┐                     ┌──────────────┐
//! │ RoomMirror   │                     │ RoomRegistry │
//! │ (local copy) │                     │ (authority)  │
//! └──────────────┘                     └──────┬───────┘
//!                                             │
//!                                     ┌───────┴───────┐
//!                                     │ reducers +    │
//!                                     │ FanoutGroup   │
//!                                     └───────────────┘
//! ```
//!
//! The server is the single authority: every client event is applied
//! to the room's state through a reducer while the room lock is held,
//! then broadcast, so all participants observe the same total order.
//! Concurrent writes resolve by last-write-wins in that order.
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire protocol and shared room-state types
//! - [`room`] — Room registry, codes, sessions and lifecycle
//! - [`reducer`] — Per-module state transitions (lab, quiz, molecule)
//! - [`broadcast`] — Per-room fan-out with backpressure
//! - [`server`] — WebSocket collaboration server
//! - [`client`] — WebSocket client with throttling and optimism
//! - [`mirror`] — Client-side mirror of a room's state

pub mod protocol;
pub mod room;
pub mod reducer;
pub mod broadcast;
pub mod server;
pub mod client;
pub mod mirror;

// Re-exports for convenience
pub use protocol::{
    Atom, Bond, ClientEvent, Cursor, ModuleKind, MoleculeCommand, MoleculeStructure,
    ProtocolError, QuizCommand, QuizState, QuizUpdate, RoomState, ServerEvent, Sid, User,
};
pub use broadcast::{Envelope, FanoutGroup, FanoutStats};
pub use reducer::{reduce, Effect};
pub use room::{JoinedSession, RegistryError, Room, RoomRegistry, ROOM_CODE_LEN, USER_COLORS};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use client::{CollabClient, CollabEvent, ConnectionState, CURSOR_SEND_INTERVAL};
pub use mirror::RoomMirror;
