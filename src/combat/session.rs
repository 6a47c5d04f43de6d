//! Turn/round state machine
//!
//! ```text
//! preparing --start--> active --pause--> paused
//!                        ^  \            |
//!                        |   `--end--.   |resume / end
//!                        `-----------+---'
//!                                    v
//!                                  ended
//! ```
//!
//! The turn pointer indexes `turn_order`, a list of participant ids, so
//! appending a newcomer mid-combat never shifts whose turn it is.
//! Every transition checks all of its preconditions before touching state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::CombatError;
use super::participant::{Participant, ParticipantRegistry};

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Preparing,
    Active,
    Paused,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Preparing => "preparing",
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Ended => "ended",
        }
    }

    pub fn parse(s: &str) -> Option<SessionStatus> {
        match s {
            "preparing" => Some(SessionStatus::Preparing),
            "active" => Some(SessionStatus::Active),
            "paused" => Some(SessionStatus::Paused),
            "ended" => Some(SessionStatus::Ended),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attributes for creating a session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewSession {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// A combat encounter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombatSession {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    /// Account allowed to issue mutating commands
    pub controller_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: SessionStatus,
    pub round: u32,
    pub current_turn_index: usize,
    /// Participant ids in turn sequence
    pub turn_order: Vec<String>,
    /// True until the session ends
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CombatSession {
    /// Create an empty session in `preparing`
    pub fn new(controller_id: &str, attrs: NewSession) -> Result<Self, CombatError> {
        let name = attrs.name.trim();
        if name.is_empty() {
            return Err(CombatError::validation("session name is required"));
        }
        let now = Utc::now();
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            campaign_id: attrs.campaign_id,
            controller_id: controller_id.to_string(),
            name: name.to_string(),
            description: attrs.description,
            status: SessionStatus::Preparing,
            round: 0,
            current_turn_index: 0,
            turn_order: Vec::new(),
            is_active: true,
            notes: attrs.notes,
            created_at: now,
            updated_at: now,
        })
    }

    /// Id of the participant whose turn it is
    pub fn current_participant_id(&self) -> Option<&str> {
        match self.status {
            SessionStatus::Active | SessionStatus::Paused => self
                .turn_order
                .get(self.current_turn_index)
                .map(String::as_str),
            _ => None,
        }
    }

    fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
        self.is_active = status != SessionStatus::Ended;
        self.updated_at = Utc::now();
    }

    /// Reject any mutation of an ended session
    pub fn ensure_open(&self) -> Result<(), CombatError> {
        if self.status == SessionStatus::Ended {
            return Err(CombatError::transition("session has ended"));
        }
        Ok(())
    }

    fn require(&self, expected: &[SessionStatus], action: &str) -> Result<(), CombatError> {
        if expected.contains(&self.status) {
            Ok(())
        } else {
            Err(CombatError::transition(format!(
                "cannot {} a session that is {}",
                action, self.status
            )))
        }
    }

    /// Rank for a participant joining now; joins an ongoing fight at the end
    pub fn enlist(&mut self, participant_id: &str, joined_seq: u32) -> u32 {
        match self.status {
            SessionStatus::Active | SessionStatus::Paused => {
                self.turn_order.push(participant_id.to_string());
                self.updated_at = Utc::now();
                (self.turn_order.len() - 1) as u32
            }
            _ => joined_seq,
        }
    }

    /// Rank a participant will receive if it joins now
    pub fn next_rank(&self, joined_seq: u32) -> u32 {
        match self.status {
            SessionStatus::Active | SessionStatus::Paused => self.turn_order.len() as u32,
            _ => joined_seq,
        }
    }

    /// preparing -> active; orders participants by initiative
    pub fn start(&mut self, participants: &mut ParticipantRegistry) -> Result<(), CombatError> {
        self.require(&[SessionStatus::Preparing], "start")?;
        if participants.is_empty() {
            return Err(CombatError::transition(
                "cannot start a session without participants",
            ));
        }

        let mut ranked: Vec<&Participant> = participants.iter().collect();
        ranked.sort_by_key(|p| p.joined_seq);
        // stable: equal initiative keeps insertion order
        ranked.sort_by_key(|p| std::cmp::Reverse(p.initiative));
        let order: Vec<String> = ranked.into_iter().map(|p| p.id.clone()).collect();

        for participant in participants.iter_mut() {
            if let Some(rank) = order.iter().position(|id| *id == participant.id) {
                participant.order = rank as u32;
            }
        }

        self.turn_order = order;
        self.round = 1;
        self.current_turn_index = 0;
        self.set_status(SessionStatus::Active);
        Ok(())
    }

    /// Move to the next active participant; returns whether a new round began
    pub fn advance_turn(&mut self, participants: &ParticipantRegistry) -> Result<bool, CombatError> {
        self.require(&[SessionStatus::Active], "advance the turn of")?;
        let count = self.turn_order.len();
        if count == 0 {
            return Err(CombatError::transition("session has no turn order"));
        }

        let is_active = |index: usize| {
            participants
                .get(&self.turn_order[index])
                .is_some_and(|p| p.is_active)
        };

        let mut index = self.current_turn_index;
        let mut new_round = false;
        for step in 0..count {
            index = (index + 1) % count;
            if index == 0 {
                new_round = true;
            }
            // nobody active: settle for a single step
            if is_active(index) || step + 1 == count {
                break;
            }
        }
        if !(0..count).any(is_active) {
            index = (self.current_turn_index + 1) % count;
            new_round = index == 0;
        }

        self.current_turn_index = index;
        if new_round {
            self.round += 1;
        }
        self.updated_at = Utc::now();
        Ok(new_round)
    }

    /// active -> paused
    pub fn pause(&mut self) -> Result<(), CombatError> {
        self.require(&[SessionStatus::Active], "pause")?;
        self.set_status(SessionStatus::Paused);
        Ok(())
    }

    /// paused -> active
    pub fn resume(&mut self) -> Result<(), CombatError> {
        self.require(&[SessionStatus::Paused], "resume")?;
        self.set_status(SessionStatus::Active);
        Ok(())
    }

    /// active | paused -> ended
    pub fn end(&mut self) -> Result<(), CombatError> {
        self.require(&[SessionStatus::Active, SessionStatus::Paused], "end")?;
        self.set_status(SessionStatus::Ended);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combat::participant::{NewParticipant, ParticipantPatch};

    fn session() -> CombatSession {
        CombatSession::new(
            "dm",
            NewSession {
                name: "Goblin ambush".into(),
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn roster(entries: &[(&str, i32)]) -> ParticipantRegistry {
        let mut registry = ParticipantRegistry::new();
        for (i, (name, init)) in entries.iter().enumerate() {
            registry
                .add("s", NewParticipant::named(*name, *init, 10), None, i as u32)
                .unwrap();
        }
        registry
    }

    fn names_in_order(session: &CombatSession, registry: &ParticipantRegistry) -> Vec<String> {
        session
            .turn_order
            .iter()
            .map(|id| registry.get(id).unwrap().name.clone())
            .collect()
    }

    #[test]
    fn test_new_session_is_preparing() {
        let s = session();
        assert_eq!(s.status, SessionStatus::Preparing);
        assert_eq!(s.round, 0);
        assert!(s.is_active);
        assert!(s.current_participant_id().is_none());
        assert!(CombatSession::new("dm", NewSession::default()).is_err());
    }

    #[test]
    fn test_start_orders_by_initiative() {
        let mut s = session();
        let mut registry = roster(&[("A", 15), ("B", 20), ("C", 10)]);
        s.start(&mut registry).unwrap();

        assert_eq!(names_in_order(&s, &registry), vec!["B", "A", "C"]);
        assert_eq!(s.status, SessionStatus::Active);
        assert_eq!(s.round, 1);
        assert_eq!(s.current_turn_index, 0);
        let b = registry.iter().find(|p| p.name == "B").unwrap();
        assert_eq!(b.order, 0);
        let c = registry.iter().find(|p| p.name == "C").unwrap();
        assert_eq!(c.order, 2);
    }

    #[test]
    fn test_start_ties_keep_insertion_order() {
        let mut s = session();
        let mut registry = roster(&[("First", 12), ("Second", 12), ("Fast", 18), ("Third", 12)]);
        s.start(&mut registry).unwrap();
        assert_eq!(
            names_in_order(&s, &registry),
            vec!["Fast", "First", "Second", "Third"]
        );
    }

    #[test]
    fn test_start_without_participants_fails() {
        let mut s = session();
        let mut registry = ParticipantRegistry::new();
        let err = s.start(&mut registry).unwrap_err();
        assert!(matches!(err, CombatError::InvalidTransition(_)));
        assert_eq!(s.status, SessionStatus::Preparing);
        assert_eq!(s.round, 0);
    }

    #[test]
    fn test_start_twice_fails() {
        let mut s = session();
        let mut registry = roster(&[("A", 1)]);
        s.start(&mut registry).unwrap();
        assert!(matches!(
            s.start(&mut registry),
            Err(CombatError::InvalidTransition(_))
        ));
    }

    #[test]
    fn test_advance_cycles_and_counts_rounds() {
        let mut s = session();
        let mut registry = roster(&[("A", 15), ("B", 20), ("C", 10)]);
        s.start(&mut registry).unwrap();

        assert!(!s.advance_turn(&registry).unwrap());
        assert_eq!(s.current_turn_index, 1);
        assert!(!s.advance_turn(&registry).unwrap());
        assert_eq!(s.current_turn_index, 2);
        assert!(s.advance_turn(&registry).unwrap());
        assert_eq!(s.current_turn_index, 0);
        assert_eq!(s.round, 2);
    }

    #[test]
    fn test_round_increments_every_nth_advance() {
        let mut s = session();
        let mut registry = roster(&[("A", 1), ("B", 2), ("C", 3), ("D", 4)]);
        s.start(&mut registry).unwrap();

        for advance in 1..=12u32 {
            s.advance_turn(&registry).unwrap();
            assert_eq!(s.current_turn_index, (advance % 4) as usize);
            assert_eq!(s.round, 1 + advance / 4);
        }
    }

    #[test]
    fn test_single_participant_every_advance_is_a_round() {
        let mut s = session();
        let mut registry = roster(&[("Solo", 5)]);
        s.start(&mut registry).unwrap();
        assert!(s.advance_turn(&registry).unwrap());
        assert!(s.advance_turn(&registry).unwrap());
        assert_eq!(s.round, 3);
        assert_eq!(s.current_turn_index, 0);
    }

    #[test]
    fn test_advance_skips_inactive() {
        let mut s = session();
        let mut registry = roster(&[("A", 30), ("B", 20), ("C", 10)]);
        s.start(&mut registry).unwrap();
        let b = s.turn_order[1].clone();
        registry
            .update(
                &b,
                ParticipantPatch {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(!s.advance_turn(&registry).unwrap());
        assert_eq!(s.current_turn_index, 2);
        assert!(s.advance_turn(&registry).unwrap());
        assert_eq!(s.current_turn_index, 0);
        assert_eq!(s.round, 2);
    }

    #[test]
    fn test_skip_across_wrap_counts_one_round() {
        let mut s = session();
        let mut registry = roster(&[("A", 30), ("B", 20), ("C", 10)]);
        s.start(&mut registry).unwrap();
        let a = s.turn_order[0].clone();
        registry
            .update(
                &a,
                ParticipantPatch {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();

        s.advance_turn(&registry).unwrap();
        s.advance_turn(&registry).unwrap();
        assert_eq!(s.current_turn_index, 2);
        assert!(s.advance_turn(&registry).unwrap());
        assert_eq!(s.current_turn_index, 1);
        assert_eq!(s.round, 2);
    }

    #[test]
    fn test_all_inactive_moves_one_slot() {
        let mut s = session();
        let mut registry = roster(&[("A", 2), ("B", 1)]);
        s.start(&mut registry).unwrap();
        for id in s.turn_order.clone() {
            registry
                .update(
                    &id,
                    ParticipantPatch {
                        is_active: Some(false),
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        assert!(!s.advance_turn(&registry).unwrap());
        assert_eq!(s.current_turn_index, 1);
        assert!(s.advance_turn(&registry).unwrap());
        assert_eq!(s.current_turn_index, 0);
    }

    #[test]
    fn test_enlist_mid_combat_keeps_pointer() {
        let mut s = session();
        let mut registry = roster(&[("A", 15), ("B", 20)]);
        s.start(&mut registry).unwrap();
        s.advance_turn(&registry).unwrap();
        let current = s.current_participant_id().unwrap().to_string();

        let seq = registry.len() as u32;
        let rank = s.next_rank(seq);
        let late = registry
            .add("s", NewParticipant::named("Late", 99, 5), None, rank)
            .unwrap();
        assert_eq!(s.enlist(&late.id, seq), 2);

        assert_eq!(s.current_participant_id(), Some(current.as_str()));
        assert_eq!(s.turn_order.last(), Some(&late.id));
    }

    #[test]
    fn test_pause_resume_freezes_pointer() {
        let mut s = session();
        let mut registry = roster(&[("A", 1), ("B", 2)]);
        s.start(&mut registry).unwrap();
        s.advance_turn(&registry).unwrap();

        s.pause().unwrap();
        assert_eq!(s.status, SessionStatus::Paused);
        assert!(matches!(
            s.advance_turn(&registry),
            Err(CombatError::InvalidTransition(_))
        ));
        assert!(s.pause().is_err());

        s.resume().unwrap();
        assert_eq!(s.current_turn_index, 1);
        assert_eq!(s.round, 1);
        assert!(s.resume().is_err());
    }

    #[test]
    fn test_end_is_terminal() {
        let mut s = session();
        assert!(matches!(s.end(), Err(CombatError::InvalidTransition(_))));

        let mut registry = roster(&[("A", 1)]);
        s.start(&mut registry).unwrap();
        s.pause().unwrap();
        s.end().unwrap();
        assert_eq!(s.status, SessionStatus::Ended);
        assert!(!s.is_active);
        assert!(s.ensure_open().is_err());
        assert!(s.resume().is_err());
        assert!(s.end().is_err());
        assert!(s.advance_turn(&registry).is_err());
    }

    #[test]
    fn test_status_strings() {
        for status in [
            SessionStatus::Preparing,
            SessionStatus::Active,
            SessionStatus::Paused,
            SessionStatus::Ended,
        ] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SessionStatus::parse("done"), None);
    }
}
