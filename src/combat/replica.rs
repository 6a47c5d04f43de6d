//! Subscription-side read model
//!
//! A [`SessionReplica`] mirrors one session from a snapshot plus the delta
//! events that follow it. Applying an event replaces the affected entity
//! wholesale; nothing here ever issues or interprets commands.

use std::collections::VecDeque;

use super::action::{ActionView, CombatAction};
use super::dice::DiceRoll;
use super::events::{CombatEvent, SessionSnapshot};
use super::participant::Participant;
use super::session::CombatSession;

/// Number of rolls kept in a [`RollHistory`]
pub const ROLL_HISTORY_LIMIT: usize = 50;

/// Local copy of a session kept current by delta events
#[derive(Debug, Clone)]
pub struct SessionReplica {
    session: CombatSession,
    participants: Vec<Participant>,
    actions: Vec<ActionView>,
    needs_resync: bool,
}

impl SessionReplica {
    pub fn from_snapshot(snapshot: SessionSnapshot) -> Self {
        Self {
            session: snapshot.session,
            participants: snapshot.participants,
            actions: snapshot.actions,
            needs_resync: false,
        }
    }

    /// Replace everything with a freshly fetched snapshot
    pub fn reload(&mut self, snapshot: SessionSnapshot) {
        *self = Self::from_snapshot(snapshot);
    }

    pub fn session(&self) -> &CombatSession {
        &self.session
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn participant(&self, id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    /// Most recent first
    pub fn actions(&self) -> &[ActionView] {
        &self.actions
    }

    /// Participant whose turn it is, if known locally
    pub fn current_participant(&self) -> Option<&Participant> {
        self.session
            .current_participant_id()
            .and_then(|id| self.participant(id))
    }

    /// True once deltas were lost; the caller must re-fetch and [`reload`](Self::reload)
    pub fn needs_resync(&self) -> bool {
        self.needs_resync
    }

    /// The channel dropped messages for this subscriber
    pub fn mark_lagged(&mut self) {
        self.needs_resync = true;
    }

    /// Apply one event; returns false if it belongs to another session
    pub fn apply(&mut self, event: &CombatEvent) -> bool {
        if event.session_id() != self.session.id {
            return false;
        }
        match event {
            CombatEvent::SessionStarted { session }
            | CombatEvent::TurnAdvanced { session, .. }
            | CombatEvent::SessionStatusChanged { session }
            | CombatEvent::SessionEnded { session } => {
                self.session = session.clone();
            }
            CombatEvent::ParticipantAdded { participant }
            | CombatEvent::ParticipantUpdated { participant } => {
                self.upsert(participant.clone());
            }
            CombatEvent::ParticipantHidden { participant_id, .. } => {
                self.participants.retain(|p| p.id != *participant_id);
            }
            CombatEvent::ActionRecorded { action } => self.prepend(action),
            CombatEvent::DiceRolled { .. } => {}
        }
        true
    }

    fn upsert(&mut self, participant: Participant) {
        match self.participants.iter_mut().find(|p| p.id == participant.id) {
            Some(existing) => *existing = participant,
            None => self.participants.push(participant),
        }
    }

    fn prepend(&mut self, action: &CombatAction) {
        if self.actions.iter().any(|a| a.action.id == action.id) {
            return;
        }
        let view = ActionView {
            actor: self.participant(&action.actor_id).cloned(),
            target: action
                .target_id
                .as_deref()
                .and_then(|id| self.participant(id))
                .cloned(),
            action: action.clone(),
        };
        self.actions.insert(0, view);
    }
}

/// A roll as the local user sees it
#[derive(Debug, Clone, PartialEq)]
pub enum RollEntry {
    /// Shown immediately; not yet confirmed by the server
    Pending { request_id: String, roll: DiceRoll },
    /// Authoritative result
    Confirmed(DiceRoll),
}

impl RollEntry {
    pub fn roll(&self) -> &DiceRoll {
        match self {
            RollEntry::Pending { roll, .. } | RollEntry::Confirmed(roll) => roll,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, RollEntry::Pending { .. })
    }

    fn request_id(&self) -> Option<&str> {
        match self {
            RollEntry::Pending { request_id, .. } => Some(request_id),
            RollEntry::Confirmed(roll) => roll.request_id.as_deref(),
        }
    }
}

/// Bounded history of recent rolls, newest first
#[derive(Debug, Clone, Default)]
pub struct RollHistory {
    entries: VecDeque<RollEntry>,
}

impl RollHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RollEntry> {
        self.entries.iter()
    }

    /// Record a provisional roll made before the server answers
    pub fn push_pending(&mut self, request_id: impl Into<String>, roll: DiceRoll) {
        self.push(RollEntry::Pending {
            request_id: request_id.into(),
            roll,
        });
    }

    /// Record an authoritative roll, replacing its pending entry if present
    pub fn confirm(&mut self, roll: DiceRoll) {
        if let Some(request_id) = roll.request_id.clone() {
            let existing = self
                .entries
                .iter_mut()
                .find(|e| e.request_id() == Some(request_id.as_str()));
            if let Some(entry) = existing {
                *entry = RollEntry::Confirmed(roll);
                return;
            }
        }
        if self
            .entries
            .iter()
            .any(|e| !e.is_pending() && e.roll().id == roll.id)
        {
            return;
        }
        self.push(RollEntry::Confirmed(roll));
    }

    /// Drop a pending roll the server rejected
    pub fn discard(&mut self, request_id: &str) {
        self.entries
            .retain(|e| !(e.is_pending() && e.request_id() == Some(request_id)));
    }

    fn push(&mut self, entry: RollEntry) {
        self.entries.push_front(entry);
        self.entries.truncate(ROLL_HISTORY_LIMIT);
    }
}
