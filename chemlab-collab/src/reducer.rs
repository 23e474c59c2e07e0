//! State reducers: `(state, sid, event) -> (state', broadcast)`.
//!
//! One reducer per module encodes that module's merge policy:
//!
//! - cursor: clamp to the unit square, delta to everyone else
//! - module switch: atomic, echoed to everyone including the sender
//! - lab: last-write-wins per top-level payload key, raw relay
//! - quiz: answer overwrite per (question, sid); answer values are
//!   withheld from incremental broadcasts
//! - molecule: wholesale snapshot replacement, last write wins
//!
//! Reducers never block and never touch the network; the room lock
//! held around them is what gives each room a single total order.

use crate::protocol::{
    ClientEvent, MoleculeCommand, QuizCommand, QuizUpdate, RoomState, ServerEvent,
};
use crate::protocol::{Cursor, Sid};

/// What a reducer wants broadcast after a successful state transition.
#[derive(Debug, Clone)]
pub struct Effect {
    pub event: ServerEvent,
    /// Cursor, lab and molecule relays skip the sender; it already
    /// applied the change optimistically.
    pub exclude_sender: bool,
}

impl Effect {
    fn to_all(event: ServerEvent) -> Option<Self> {
        Some(Self {
            event,
            exclude_sender: false,
        })
    }

    fn to_others(event: ServerEvent) -> Option<Self> {
        Some(Self {
            event,
            exclude_sender: true,
        })
    }
}

/// Apply one validated client event to the room state.
///
/// Returns `None` when the event produces no state change and no
/// broadcast (the silent-drop path for events that fail semantic
/// checks, e.g. answering an inactive quiz).
pub fn reduce(state: &mut RoomState, sid: Sid, event: &ClientEvent) -> Option<Effect> {
    match event {
        // Join/leave are session-manager concerns, not reducer ones.
        ClientEvent::JoinRoom { .. } => None,

        ClientEvent::CursorMove { x, y, .. } => reduce_cursor(state, sid, *x, *y),
        ClientEvent::ModuleChange { module, .. } => {
            state.active_module = *module;
            Effect::to_all(ServerEvent::ModuleChanged {
                module: *module,
                by: sid,
            })
        }
        ClientEvent::LabAction { payload, .. } => {
            // Last write wins per logical key ("chemical added to
            // glassware X" overwrites the previous action on X).
            for (key, value) in payload {
                state.lab_state.insert(key.clone(), value.clone());
            }
            Effect::to_others(ServerEvent::LabUpdate {
                by: sid,
                payload: payload.clone(),
            })
        }
        ClientEvent::QuizAction { command, .. } => reduce_quiz(state, sid, command),
        ClientEvent::MoleculeAction {
            command: MoleculeCommand::UpdateStructure { structure },
            ..
        } => {
            if let Err(e) = structure.validate() {
                log::warn!("Dropping molecule update from {sid}: {e}");
                return None;
            }
            state.molecule_state = structure.clone();
            Effect::to_others(ServerEvent::MoleculeUpdate {
                structure: structure.clone(),
                by: sid,
            })
        }
    }
}

fn reduce_cursor(state: &mut RoomState, sid: Sid, x: f64, y: f64) -> Option<Effect> {
    let cursor = Cursor::new(x, y);
    let user = state.users.get_mut(&sid)?;
    user.cursor = cursor;
    Effect::to_others(ServerEvent::CursorUpdate {
        sid,
        x: cursor.x,
        y: cursor.y,
    })
}

fn reduce_quiz(state: &mut RoomState, sid: Sid, command: &QuizCommand) -> Option<Effect> {
    match command {
        QuizCommand::Start { questions } => {
            state.quiz_state = crate::protocol::QuizState::started(questions.clone());
            Effect::to_all(ServerEvent::QuizUpdate(QuizUpdate::Start {
                state: state.quiz_state.clone(),
            }))
        }
        QuizCommand::NextQuestion => {
            let quiz = &mut state.quiz_state;
            if !quiz.active || quiz.questions.is_empty() {
                return None;
            }
            // Clamp rather than overrun the question list.
            let last = quiz.questions.len() - 1;
            quiz.current_question = (quiz.current_question + 1).min(last);
            Effect::to_all(ServerEvent::QuizUpdate(QuizUpdate::NextQuestion {
                index: quiz.current_question,
            }))
        }
        QuizCommand::Answer {
            question_index,
            answer,
        } => {
            let quiz = &mut state.quiz_state;
            if !quiz.active || *question_index >= quiz.questions.len() {
                log::debug!(
                    "Dropping answer from {sid} for question {question_index}: quiz inactive or out of range"
                );
                return None;
            }
            quiz.record_answer(*question_index, sid, answer.clone());
            Effect::to_all(ServerEvent::QuizUpdate(QuizUpdate::UserAnswered {
                sid,
                question_index: *question_index,
                answered: true,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Atom, Bond, ModuleKind, MoleculeStructure, User};
    use serde_json::{json, Map};
    use uuid::Uuid;

    fn room_with_user(sid: Sid) -> RoomState {
        let mut state = RoomState::new();
        state.users.insert(
            sid,
            User {
                sid,
                name: "Alice".into(),
                color: "#2E6B6B".into(),
                cursor: Cursor::default(),
                joined_at: 0,
            },
        );
        state
    }

    fn structure(atom_ids: &[&str]) -> MoleculeStructure {
        MoleculeStructure {
            atoms: atom_ids
                .iter()
                .map(|id| Atom {
                    id: (*id).into(),
                    element: "C".into(),
                    x: 0.0,
                    y: 0.0,
                    z: 0.0,
                })
                .collect(),
            bonds: vec![],
        }
    }

    #[test]
    fn test_cursor_reducer_clamps_and_excludes_sender() {
        let sid = Uuid::new_v4();
        let mut state = room_with_user(sid);

        let effect = reduce(
            &mut state,
            sid,
            &ClientEvent::CursorMove {
                room_id: "R".into(),
                x: 2.0,
                y: -1.0,
            },
        )
        .unwrap();

        assert_eq!(state.users[&sid].cursor, Cursor { x: 1.0, y: 0.0 });
        assert!(effect.exclude_sender);
        match effect.event {
            ServerEvent::CursorUpdate { sid: s, x, y } => {
                assert_eq!(s, sid);
                assert_eq!(x, 1.0);
                assert_eq!(y, 0.0);
            }
            other => panic!("unexpected broadcast: {other:?}"),
        }
    }

    #[test]
    fn test_cursor_from_unknown_sid_dropped() {
        let mut state = RoomState::new();
        let effect = reduce(
            &mut state,
            Uuid::new_v4(),
            &ClientEvent::CursorMove {
                room_id: "R".into(),
                x: 0.5,
                y: 0.5,
            },
        );
        assert!(effect.is_none());
    }

    #[test]
    fn test_cursor_reducer_idempotent() {
        let sid = Uuid::new_v4();
        let mut once = room_with_user(sid);
        let mut twice = once.clone();

        let event = ClientEvent::CursorMove {
            room_id: "R".into(),
            x: 0.5,
            y: 0.5,
        };
        reduce(&mut once, sid, &event);
        reduce(&mut twice, sid, &event);
        reduce(&mut twice, sid, &event);

        assert_eq!(once, twice);
    }

    #[test]
    fn test_module_reducer_includes_sender() {
        let sid = Uuid::new_v4();
        let mut state = room_with_user(sid);

        let effect = reduce(
            &mut state,
            sid,
            &ClientEvent::ModuleChange {
                room_id: "R".into(),
                module: ModuleKind::Molecule,
            },
        )
        .unwrap();

        assert_eq!(state.active_module, ModuleKind::Molecule);
        assert!(!effect.exclude_sender);
    }

    #[test]
    fn test_lab_reducer_last_write_wins_per_key() {
        let sid = Uuid::new_v4();
        let mut state = room_with_user(sid);

        let mut first = Map::new();
        first.insert("beaker-1".into(), json!({"chemical": "HCl"}));
        first.insert("burner".into(), json!({"lit": true}));
        reduce(
            &mut state,
            sid,
            &ClientEvent::LabAction {
                room_id: "R".into(),
                payload: first,
            },
        )
        .unwrap();

        let mut second = Map::new();
        second.insert("beaker-1".into(), json!({"chemical": "NaOH"}));
        let effect = reduce(
            &mut state,
            sid,
            &ClientEvent::LabAction {
                room_id: "R".into(),
                payload: second,
            },
        )
        .unwrap();

        assert_eq!(state.lab_state["beaker-1"], json!({"chemical": "NaOH"}));
        assert_eq!(state.lab_state["burner"], json!({"lit": true}));
        assert!(effect.exclude_sender);
    }

    #[test]
    fn test_quiz_start_resets_previous_run() {
        let sid = Uuid::new_v4();
        let mut state = room_with_user(sid);
        state.quiz_state = crate::protocol::QuizState::started(vec![json!("old")]);
        state.quiz_state.record_answer(0, sid, json!("stale"));
        state.quiz_state.current_question = 0;

        let effect = reduce(
            &mut state,
            sid,
            &ClientEvent::QuizAction {
                room_id: "R".into(),
                command: QuizCommand::Start {
                    questions: vec![json!("q1"), json!("q2")],
                },
            },
        )
        .unwrap();

        assert!(state.quiz_state.active);
        assert_eq!(state.quiz_state.questions.len(), 2);
        assert_eq!(state.quiz_state.current_question, 0);
        assert!(state.quiz_state.answers.is_empty());
        assert!(!effect.exclude_sender);
        match effect.event {
            ServerEvent::QuizUpdate(QuizUpdate::Start { state: quiz }) => {
                assert_eq!(quiz.questions.len(), 2);
            }
            other => panic!("unexpected broadcast: {other:?}"),
        }
    }

    #[test]
    fn test_quiz_next_question_clamps_at_end() {
        let sid = Uuid::new_v4();
        let mut state = room_with_user(sid);
        state.quiz_state = crate::protocol::QuizState::started(vec![json!("q1"), json!("q2")]);

        let next = ClientEvent::QuizAction {
            room_id: "R".into(),
            command: QuizCommand::NextQuestion,
        };
        reduce(&mut state, sid, &next).unwrap();
        assert_eq!(state.quiz_state.current_question, 1);

        // Already at the last question — stays clamped.
        reduce(&mut state, sid, &next).unwrap();
        assert_eq!(state.quiz_state.current_question, 1);
    }

    #[test]
    fn test_quiz_next_question_inactive_dropped() {
        let sid = Uuid::new_v4();
        let mut state = room_with_user(sid);
        let effect = reduce(
            &mut state,
            sid,
            &ClientEvent::QuizAction {
                room_id: "R".into(),
                command: QuizCommand::NextQuestion,
            },
        );
        assert!(effect.is_none());
    }

    #[test]
    fn test_quiz_answer_overwrites_and_withholds_value() {
        let alice = Uuid::new_v4();
        let mut state = room_with_user(alice);
        state.quiz_state = crate::protocol::QuizState::started(vec![json!("q1")]);

        let answer = |v: &str| ClientEvent::QuizAction {
            room_id: "R".into(),
            command: QuizCommand::Answer {
                question_index: 0,
                answer: json!(v),
            },
        };

        reduce(&mut state, alice, &answer("7")).unwrap();
        let effect = reduce(&mut state, alice, &answer("14")).unwrap();

        let answers = state.quiz_state.answers_for(0).unwrap();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[&alice], json!("14"));

        match effect.event {
            ServerEvent::QuizUpdate(QuizUpdate::UserAnswered {
                sid,
                question_index,
                answered,
            }) => {
                assert_eq!(sid, alice);
                assert_eq!(question_index, 0);
                assert!(answered);
            }
            other => panic!("unexpected broadcast: {other:?}"),
        }
    }

    #[test]
    fn test_quiz_answer_out_of_range_dropped() {
        let sid = Uuid::new_v4();
        let mut state = room_with_user(sid);
        state.quiz_state = crate::protocol::QuizState::started(vec![json!("q1")]);

        let effect = reduce(
            &mut state,
            sid,
            &ClientEvent::QuizAction {
                room_id: "R".into(),
                command: QuizCommand::Answer {
                    question_index: 5,
                    answer: json!("7"),
                },
            },
        );
        assert!(effect.is_none());
        assert!(state.quiz_state.answers.is_empty());
    }

    #[test]
    fn test_quiz_answers_from_two_users_coexist() {
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let mut state = room_with_user(alice);
        state.quiz_state = crate::protocol::QuizState::started(vec![json!("q1"), json!("q2")]);

        for (sid, value) in [(alice, "7"), (bob, "14")] {
            reduce(
                &mut state,
                sid,
                &ClientEvent::QuizAction {
                    room_id: "R".into(),
                    command: QuizCommand::Answer {
                        question_index: 0,
                        answer: json!(value),
                    },
                },
            )
            .unwrap();
        }

        let answers = state.quiz_state.answers_for(0).unwrap();
        assert_eq!(answers.len(), 2);
        assert_eq!(answers[&alice], json!("7"));
        assert_eq!(answers[&bob], json!("14"));
    }

    #[test]
    fn test_molecule_last_write_wins() {
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let mut state = room_with_user(alice);

        let first = structure(&["a1", "a2"]);
        let second = structure(&["b1"]);

        reduce(
            &mut state,
            alice,
            &ClientEvent::MoleculeAction {
                room_id: "R".into(),
                command: MoleculeCommand::UpdateStructure {
                    structure: first,
                },
            },
        )
        .unwrap();
        let effect = reduce(
            &mut state,
            bob,
            &ClientEvent::MoleculeAction {
                room_id: "R".into(),
                command: MoleculeCommand::UpdateStructure {
                    structure: second.clone(),
                },
            },
        )
        .unwrap();

        // Whole-snapshot replacement: Alice's edit is gone. This is
        // the documented conflict policy, asserted on purpose.
        assert_eq!(state.molecule_state, second);
        assert!(effect.exclude_sender);
    }

    #[test]
    fn test_molecule_invalid_structure_dropped() {
        let sid = Uuid::new_v4();
        let mut state = room_with_user(sid);
        let mut bad = structure(&["a1"]);
        bad.bonds.push(Bond {
            id: "b1".into(),
            from_atom: "a1".into(),
            to_atom: "ghost".into(),
            kind: "single".into(),
        });

        let effect = reduce(
            &mut state,
            sid,
            &ClientEvent::MoleculeAction {
                room_id: "R".into(),
                command: MoleculeCommand::UpdateStructure { structure: bad },
            },
        );
        assert!(effect.is_none());
        assert!(state.molecule_state.atoms.is_empty());
    }

    #[test]
    fn test_join_room_is_not_a_reducer_concern() {
        let sid = Uuid::new_v4();
        let mut state = RoomState::new();
        let effect = reduce(
            &mut state,
            sid,
            &ClientEvent::JoinRoom {
                room_id: "R".into(),
                name: "Alice".into(),
            },
        );
        assert!(effect.is_none());
        assert!(state.users.is_empty());
    }
}
