//! Change events and session snapshots
//!
//! Every committed mutation produces one or more [`CombatEvent`]s. Events
//! carry the full post-change object so subscribers can replace their copy
//! instead of merging fields.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::action::{ActionView, CombatAction};
use super::dice::DiceRoll;
use super::participant::Participant;
use super::session::CombatSession;

/// Notification published on a session's channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum CombatEvent {
    #[serde(rename = "combatStarted")]
    SessionStarted { session: CombatSession },
    #[serde(rename = "turnAdvanced")]
    TurnAdvanced {
        session: CombatSession,
        #[serde(rename = "newRound")]
        new_round: bool,
    },
    #[serde(rename = "combatStatusChanged")]
    SessionStatusChanged { session: CombatSession },
    #[serde(rename = "combatEnded")]
    SessionEnded { session: CombatSession },
    ParticipantAdded { participant: Participant },
    ParticipantUpdated { participant: Participant },
    /// A participant became invisible; viewers drop it
    ParticipantHidden {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "participantId")]
        participant_id: String,
    },
    ActionRecorded {
        action: super::action::CombatAction,
    },
    DiceRolled {
        #[serde(rename = "sessionId")]
        session_id: String,
        roll: DiceRoll,
    },
}

impl CombatEvent {
    /// Session this event belongs to
    pub fn session_id(&self) -> &str {
        match self {
            CombatEvent::SessionStarted { session }
            | CombatEvent::TurnAdvanced { session, .. }
            | CombatEvent::SessionStatusChanged { session }
            | CombatEvent::SessionEnded { session } => &session.id,
            CombatEvent::ParticipantAdded { participant }
            | CombatEvent::ParticipantUpdated { participant } => &participant.combat_session_id,
            CombatEvent::ParticipantHidden { session_id, .. }
            | CombatEvent::DiceRolled { session_id, .. } => session_id,
            CombatEvent::ActionRecorded { action } => &action.combat_session_id,
        }
    }

    /// Short name, used in logs
    pub fn name(&self) -> &'static str {
        match self {
            CombatEvent::SessionStarted { .. } => "combatStarted",
            CombatEvent::TurnAdvanced { .. } => "turnAdvanced",
            CombatEvent::SessionStatusChanged { .. } => "combatStatusChanged",
            CombatEvent::SessionEnded { .. } => "combatEnded",
            CombatEvent::ParticipantAdded { .. } => "participantAdded",
            CombatEvent::ParticipantUpdated { .. } => "participantUpdated",
            CombatEvent::ParticipantHidden { .. } => "participantHidden",
            CombatEvent::ActionRecorded { .. } => "actionRecorded",
            CombatEvent::DiceRolled { .. } => "diceRolled",
        }
    }
}

/// What one viewer may see of a session
///
/// Non-controllers never learn about invisible participants, including
/// through turn order or the action log. Visibility is tracked from the
/// events passing through, so one filter must see a session's events in
/// order.
#[derive(Debug, Clone, Default)]
pub struct ViewerFilter {
    is_controller: bool,
    hidden: HashSet<String>,
}

impl ViewerFilter {
    pub fn new(is_controller: bool, participants: &[Participant]) -> Self {
        Self {
            is_controller,
            hidden: participants
                .iter()
                .filter(|p| !p.is_visible)
                .map(|p| p.id.clone())
                .collect(),
        }
    }

    /// The event as this viewer should see it, or `None` to drop it
    ///
    /// An update to an invisible participant becomes `participantHidden`.
    pub fn apply(&mut self, event: &CombatEvent) -> Option<CombatEvent> {
        if let CombatEvent::ParticipantAdded { participant }
        | CombatEvent::ParticipantUpdated { participant } = event
        {
            if participant.is_visible {
                self.hidden.remove(&participant.id);
            } else {
                self.hidden.insert(participant.id.clone());
            }
        }
        if self.is_controller {
            return Some(event.clone());
        }
        match event {
            CombatEvent::ParticipantAdded { participant } if !participant.is_visible => None,
            CombatEvent::ParticipantUpdated { participant } if !participant.is_visible => {
                Some(CombatEvent::ParticipantHidden {
                    session_id: participant.combat_session_id.clone(),
                    participant_id: participant.id.clone(),
                })
            }
            CombatEvent::ParticipantHidden { .. } => None,
            CombatEvent::SessionStarted { session } => Some(CombatEvent::SessionStarted {
                session: self.session(session),
            }),
            CombatEvent::TurnAdvanced { session, new_round } => Some(CombatEvent::TurnAdvanced {
                session: self.session(session),
                new_round: *new_round,
            }),
            CombatEvent::SessionStatusChanged { session } => {
                Some(CombatEvent::SessionStatusChanged {
                    session: self.session(session),
                })
            }
            CombatEvent::SessionEnded { session } => Some(CombatEvent::SessionEnded {
                session: self.session(session),
            }),
            CombatEvent::ActionRecorded { action } => {
                let mut action = action.clone();
                if !self.action(&mut action) {
                    return None;
                }
                Some(CombatEvent::ActionRecorded { action })
            }
            _ => Some(event.clone()),
        }
    }

    /// Turn order without hidden ids
    ///
    /// The turn index keeps pointing at the same participant, or at the next
    /// visible one when a hidden participant is acting.
    fn session(&self, session: &CombatSession) -> CombatSession {
        let mut session = session.clone();
        if self.hidden.is_empty() {
            return session;
        }
        let current = session.current_turn_index.min(session.turn_order.len());
        let before = session.turn_order[..current]
            .iter()
            .filter(|id| !self.hidden.contains(*id))
            .count();
        session.turn_order.retain(|id| !self.hidden.contains(id));
        session.current_turn_index = match session.turn_order.len() {
            0 => 0,
            len => before % len,
        };
        session
    }

    /// Scrub hidden ids from an action; false when the actor is hidden
    fn action(&self, action: &mut CombatAction) -> bool {
        if self.hidden.contains(&action.actor_id) {
            return false;
        }
        if action
            .target_id
            .as_ref()
            .is_some_and(|id| self.hidden.contains(id))
        {
            action.target_id = None;
        }
        true
    }
}

/// Full state of one session for a viewer
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session: CombatSession,
    pub participants: Vec<Participant>,
    /// Most recent first
    pub actions: Vec<ActionView>,
}

impl SessionSnapshot {
    /// Drop what a non-controller must not see
    pub fn for_viewer(mut self, is_controller: bool) -> Self {
        if is_controller {
            return self;
        }
        let filter = ViewerFilter::new(false, &self.participants);
        if filter.hidden.is_empty() {
            return self;
        }
        self.session = filter.session(&self.session);
        self.participants.retain(|p| p.is_visible);
        self.actions.retain_mut(|view| {
            if !filter.action(&mut view.action) {
                return false;
            }
            if view.action.target_id.is_none() {
                view.target = None;
            }
            true
        });
        self
    }
}
