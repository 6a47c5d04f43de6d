//! Combat manager
//!
//! The command layer. Each session lives behind its own async mutex, so
//! commands on one session run one at a time while different sessions
//! proceed in parallel. A command validates, commits to the in-memory
//! record, persists, then publishes. Failures in the last two steps surface
//! as [`CombatError::Transport`]; the local commit stands.

use parking_lot::Mutex as SyncMutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info};

use super::action::{ActionLog, ActionType, ActionView, CombatAction, NewAction};
use super::conditions::Condition;
use super::damage::{HealthChange, HealthDelta, HealthDeltaKind};
use super::dice::{DiceRequest, DiceRoll, DieSource, RollLabels};
use super::error::CombatError;
use super::events::{CombatEvent, SessionSnapshot, ViewerFilter};
use super::participant::{self, NewParticipant, Participant, ParticipantPatch, ParticipantRegistry};
use super::session::{CombatSession, NewSession};
use super::store::CombatStore;
use crate::auth::Identity;
use crate::characters::CharacterSource;
use crate::realtime::EventChannel;

/// Authoritative in-memory state of one session
struct CombatRecord {
    session: CombatSession,
    participants: ParticipantRegistry,
    actions: ActionLog,
}

impl CombatRecord {
    /// Turn order first, then anyone not in it, in insertion order
    fn ordered_participants(&self) -> Vec<Participant> {
        let mut ordered: Vec<Participant> = self
            .session
            .turn_order
            .iter()
            .filter_map(|id| self.participants.get(id).cloned())
            .collect();
        ordered.extend(
            self.participants
                .iter()
                .filter(|p| !self.session.turn_order.contains(&p.id))
                .cloned(),
        );
        ordered
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session: self.session.clone(),
            participants: self.ordered_participants(),
            actions: self.actions.resolve(None, &self.participants),
        }
    }
}

/// A committed change that still has to reach the store
enum Change {
    Session(CombatSession),
    Participant(Participant),
    Action(CombatAction),
}

/// Result of a health command
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthOutcome {
    pub participant: Participant,
    pub change: HealthChange,
    pub action: CombatAction,
}

type SharedRecord = Arc<Mutex<CombatRecord>>;

/// Executes combat commands against sessions
pub struct CombatManager {
    sessions: RwLock<HashMap<String, SharedRecord>>,
    store: Arc<dyn CombatStore>,
    channel: Arc<dyn EventChannel>,
    characters: Arc<dyn CharacterSource>,
    dice: SyncMutex<Box<dyn DieSource + Send>>,
}

impl CombatManager {
    pub fn new(
        store: Arc<dyn CombatStore>,
        channel: Arc<dyn EventChannel>,
        characters: Arc<dyn CharacterSource>,
    ) -> Self {
        Self::with_dice(store, channel, characters, Box::new(StdRng::from_os_rng()))
    }

    /// Use a specific die source, e.g. scripted dice in tests
    pub fn with_dice(
        store: Arc<dyn CombatStore>,
        channel: Arc<dyn EventChannel>,
        characters: Arc<dyn CharacterSource>,
        dice: Box<dyn DieSource + Send>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            store,
            channel,
            characters,
            dice: SyncMutex::new(dice),
        }
    }

    /// Stream of delta events for a session
    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<CombatEvent> {
        self.channel.subscribe(session_id)
    }

    /// Called once a subscriber is gone so idle channels do not pile up
    pub fn unsubscribe(&self, session_id: &str) {
        self.channel.release(session_id);
    }

    /// Load a session into memory if needed
    async fn record(&self, session_id: &str) -> Result<SharedRecord, CombatError> {
        if let Some(record) = self.sessions.read().await.get(session_id) {
            return Ok(record.clone());
        }

        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| CombatError::not_found(format!("session {}", session_id)))?;
        let participants = self.store.list_participants(session_id).await?;
        let actions = self.store.list_actions(session_id).await?;
        debug!(
            session = %session_id,
            participants = participants.len(),
            actions = actions.len(),
            "Hydrated session"
        );

        let record = CombatRecord {
            session,
            participants: ParticipantRegistry::from_stored(participants),
            actions: ActionLog::from_stored(actions),
        };
        let mut sessions = self.sessions.write().await;
        let shared = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(record)));
        Ok(shared.clone())
    }

    fn authorize(identity: &Identity, session: &CombatSession) -> Result<(), CombatError> {
        if identity.can_control(&session.controller_id) {
            Ok(())
        } else {
            debug!(
                account = %identity.account_id,
                session = %session.id,
                "Rejected command from non-controller"
            );
            Err(CombatError::PermissionDenied(format!(
                "{} does not control session {}",
                identity.username, session.id
            )))
        }
    }

    /// Persist then publish; the local commit has already happened
    async fn commit(&self, changes: Vec<Change>, events: Vec<CombatEvent>) -> Result<(), CombatError> {
        let mut failure: Option<CombatError> = None;

        for change in &changes {
            let result = match change {
                Change::Session(session) => self.store.update_session(session).await,
                Change::Participant(participant) => self.store.upsert_participant(participant).await,
                Change::Action(action) => self.store.insert_action(action).await,
            };
            if let Err(e) = result {
                error!(error = %e, "Persisting committed combat change failed; state may diverge");
                failure = Some(e.into());
                break;
            }
        }

        for event in events {
            let name = event.name();
            let session_id = event.session_id().to_string();
            if let Err(e) = self.channel.publish(event) {
                error!(
                    session = %session_id,
                    event = name,
                    error = %e,
                    "Publishing committed combat change failed; subscribers must re-fetch"
                );
                failure.get_or_insert(CombatError::Transport(e.to_string()));
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Create a session controlled by the caller
    pub async fn create_session(
        &self,
        identity: &Identity,
        attrs: NewSession,
    ) -> Result<CombatSession, CombatError> {
        let session = CombatSession::new(&identity.account_id, attrs)?;
        let record = CombatRecord {
            session: session.clone(),
            participants: ParticipantRegistry::new(),
            actions: ActionLog::new(),
        };
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), Arc::new(Mutex::new(record)));

        if let Err(e) = self.store.insert_session(&session).await {
            error!(session = %session.id, error = %e, "Persisting new session failed");
            return Err(e.into());
        }
        info!(session = %session.id, controller = %identity.username, name = %session.name, "Session created");
        Ok(session)
    }

    /// Full session state as the caller may see it
    pub async fn get_snapshot(
        &self,
        identity: &Identity,
        session_id: &str,
    ) -> Result<SessionSnapshot, CombatError> {
        let shared = self.record(session_id).await?;
        let record = shared.lock().await;
        let is_controller = identity.can_control(&record.session.controller_id);
        Ok(record.snapshot().for_viewer(is_controller))
    }

    /// Snapshot plus the filter for the caller's live events
    pub async fn get_view(
        &self,
        identity: &Identity,
        session_id: &str,
    ) -> Result<(SessionSnapshot, ViewerFilter), CombatError> {
        let shared = self.record(session_id).await?;
        let record = shared.lock().await;
        let is_controller = identity.can_control(&record.session.controller_id);
        let snapshot = record.snapshot();
        let filter = ViewerFilter::new(is_controller, &snapshot.participants);
        Ok((snapshot.for_viewer(is_controller), filter))
    }

    /// Whether the caller controls a session
    pub async fn is_controller(&self, identity: &Identity, session_id: &str) -> Result<bool, CombatError> {
        let shared = self.record(session_id).await?;
        let record = shared.lock().await;
        Ok(identity.can_control(&record.session.controller_id))
    }

    /// Newest first, optionally for one campaign
    pub async fn list_sessions(&self, campaign_id: Option<&str>) -> Result<Vec<CombatSession>, CombatError> {
        let mut sessions = self.store.list_sessions(campaign_id).await?;
        let cached = self.sessions.read().await;
        for session in sessions.iter_mut() {
            if let Some(shared) = cached.get(&session.id) {
                *session = shared.lock().await.session.clone();
            }
        }
        Ok(sessions)
    }

    pub async fn start(&self, identity: &Identity, session_id: &str) -> Result<CombatSession, CombatError> {
        let shared = self.record(session_id).await?;
        let mut guard = shared.lock().await;
        let record = &mut *guard;
        Self::authorize(identity, &record.session)?;

        record.session.start(&mut record.participants)?;
        info!(
            session = %session_id,
            participants = record.participants.len(),
            "Combat started"
        );

        let session = record.session.clone();
        let mut changes = vec![Change::Session(session.clone())];
        changes.extend(record.participants.iter().cloned().map(Change::Participant));
        self.commit(
            changes,
            vec![CombatEvent::SessionStarted {
                session: session.clone(),
            }],
        )
        .await?;
        Ok(session)
    }

    /// Returns the session and whether a new round began
    pub async fn advance_turn(
        &self,
        identity: &Identity,
        session_id: &str,
    ) -> Result<(CombatSession, bool), CombatError> {
        let shared = self.record(session_id).await?;
        let mut record = shared.lock().await;
        Self::authorize(identity, &record.session)?;

        let record = &mut *record;
        let new_round = record.session.advance_turn(&record.participants)?;
        info!(
            session = %session_id,
            round = record.session.round,
            turn = record.session.current_turn_index,
            new_round,
            "Turn advanced"
        );

        let session = record.session.clone();
        self.commit(
            vec![Change::Session(session.clone())],
            vec![CombatEvent::TurnAdvanced {
                session: session.clone(),
                new_round,
            }],
        )
        .await?;
        Ok((session, new_round))
    }

    pub async fn pause(&self, identity: &Identity, session_id: &str) -> Result<CombatSession, CombatError> {
        self.transition(identity, session_id, "paused", CombatSession::pause)
            .await
    }

    pub async fn resume(&self, identity: &Identity, session_id: &str) -> Result<CombatSession, CombatError> {
        self.transition(identity, session_id, "resumed", CombatSession::resume)
            .await
    }

    pub async fn end(&self, identity: &Identity, session_id: &str) -> Result<CombatSession, CombatError> {
        self.transition(identity, session_id, "ended", CombatSession::end)
            .await
    }

    async fn transition(
        &self,
        identity: &Identity,
        session_id: &str,
        verb: &str,
        apply: fn(&mut CombatSession) -> Result<(), CombatError>,
    ) -> Result<CombatSession, CombatError> {
        let shared = self.record(session_id).await?;
        let mut record = shared.lock().await;
        Self::authorize(identity, &record.session)?;

        apply(&mut record.session)?;
        info!(session = %session_id, status = %record.session.status, "Combat {}", verb);

        let session = record.session.clone();
        let event = if session.is_active {
            CombatEvent::SessionStatusChanged {
                session: session.clone(),
            }
        } else {
            CombatEvent::SessionEnded {
                session: session.clone(),
            }
        };
        self.commit(vec![Change::Session(session.clone())], vec![event])
            .await?;
        Ok(session)
    }

    /// Add a participant, prefilling from its character when one is named
    pub async fn add_participant(
        &self,
        identity: &Identity,
        session_id: &str,
        mut attrs: NewParticipant,
    ) -> Result<Participant, CombatError> {
        let shared = self.record(session_id).await?;
        let mut guard = shared.lock().await;
        let record = &mut *guard;
        Self::authorize(identity, &record.session)?;
        record.session.ensure_open()?;

        let mut initiative_roll = None;
        if let Some(character_id) = attrs.character_id.clone() {
            let sheet = self
                .characters
                .get_character(&character_id)
                .await?
                .ok_or_else(|| CombatError::not_found(format!("character {}", character_id)))?;
            attrs.prefill(&sheet);
            if attrs.initiative.is_none() {
                let (initiative, natural) = {
                    let mut dice = self.dice.lock();
                    participant::roll_initiative(sheet.initiative_bonus(), &mut **dice)?
                };
                attrs.initiative = Some(initiative);
                initiative_roll = Some(natural);
            }
        }

        let joined_seq = record.participants.len() as u32;
        let rank = record.session.next_rank(joined_seq);
        let added = record
            .participants
            .add(&record.session.id, attrs, initiative_roll, rank)?;
        record.session.enlist(&added.id, joined_seq);
        debug!(
            session = %session_id,
            participant = %added.id,
            name = %added.name,
            initiative = added.initiative,
            "Participant added"
        );

        self.commit(
            vec![
                Change::Participant(added.clone()),
                Change::Session(record.session.clone()),
            ],
            vec![CombatEvent::ParticipantAdded {
                participant: added.clone(),
            }],
        )
        .await?;
        Ok(added)
    }

    pub async fn update_participant(
        &self,
        identity: &Identity,
        session_id: &str,
        participant_id: &str,
        patch: ParticipantPatch,
    ) -> Result<Participant, CombatError> {
        let shared = self.record(session_id).await?;
        let mut record = shared.lock().await;
        Self::authorize(identity, &record.session)?;
        record.session.ensure_open()?;

        let updated = record.participants.update(participant_id, patch)?;
        debug!(session = %session_id, participant = %participant_id, "Participant updated");

        self.commit(
            vec![Change::Participant(updated.clone())],
            vec![CombatEvent::ParticipantUpdated {
                participant: updated.clone(),
            }],
        )
        .await?;
        Ok(updated)
    }

    /// Apply damage or healing and log it as an action
    pub async fn apply_health_delta(
        &self,
        identity: &Identity,
        session_id: &str,
        participant_id: &str,
        delta: HealthDelta,
    ) -> Result<HealthOutcome, CombatError> {
        let shared = self.record(session_id).await?;
        let mut guard = shared.lock().await;
        let record = &mut *guard;
        Self::authorize(identity, &record.session)?;
        record.session.ensure_open()?;

        // check every reference before touching hit points
        if record.participants.get(participant_id).is_none() {
            return Err(CombatError::not_found(format!("participant {}", participant_id)));
        }
        let actor_id = delta
            .actor_id
            .clone()
            .unwrap_or_else(|| participant_id.to_string());
        if record.participants.get(&actor_id).is_none() {
            return Err(CombatError::not_found(format!("participant {}", actor_id)));
        }

        let (updated, change) = record
            .participants
            .apply_health_delta(participant_id, &delta)?;

        let (action_type, action_name) = match change.kind {
            HealthDeltaKind::Damage => (ActionType::Attack, "Damage"),
            HealthDeltaKind::Heal => (ActionType::Ability, "Healing"),
            HealthDeltaKind::TemporaryHitPoints => (ActionType::Ability, "Temporary Hit Points"),
        };
        let mut new = NewAction::new(&actor_id, action_type, action_name).targeting(participant_id);
        new.description = delta.description.clone();
        new.damage = Some(change.amount);
        new.damage_type = delta.damage_type;
        let action = record.actions.record(
            &record.session.id,
            record.session.round,
            &record.participants,
            new,
        )?;
        debug!(
            session = %session_id,
            participant = %participant_id,
            kind = ?change.kind,
            amount = change.amount,
            current = updated.current_hit_points,
            "Health changed"
        );

        self.commit(
            vec![
                Change::Participant(updated.clone()),
                Change::Action(action.clone()),
            ],
            vec![
                CombatEvent::ParticipantUpdated {
                    participant: updated.clone(),
                },
                CombatEvent::ActionRecorded {
                    action: action.clone(),
                },
            ],
        )
        .await?;
        Ok(HealthOutcome {
            participant: updated,
            change,
            action,
        })
    }

    /// Replace a participant's conditions
    pub async fn set_conditions(
        &self,
        identity: &Identity,
        session_id: &str,
        participant_id: &str,
        conditions: Vec<Condition>,
    ) -> Result<Participant, CombatError> {
        let shared = self.record(session_id).await?;
        let mut record = shared.lock().await;
        Self::authorize(identity, &record.session)?;
        record.session.ensure_open()?;

        let updated = record.participants.set_conditions(participant_id, conditions)?;
        debug!(
            session = %session_id,
            participant = %participant_id,
            conditions = updated.conditions.len(),
            "Conditions replaced"
        );

        self.commit(
            vec![Change::Participant(updated.clone())],
            vec![CombatEvent::ParticipantUpdated {
                participant: updated.clone(),
            }],
        )
        .await?;
        Ok(updated)
    }

    pub async fn record_action(
        &self,
        identity: &Identity,
        session_id: &str,
        new: NewAction,
    ) -> Result<CombatAction, CombatError> {
        let shared = self.record(session_id).await?;
        let mut guard = shared.lock().await;
        let record = &mut *guard;
        Self::authorize(identity, &record.session)?;
        record.session.ensure_open()?;

        let action = record.actions.record(
            &record.session.id,
            record.session.round,
            &record.participants,
            new,
        )?;
        debug!(
            session = %session_id,
            action = %action.action_name,
            round = action.round,
            "Action recorded"
        );

        self.commit(
            vec![Change::Action(action.clone())],
            vec![CombatEvent::ActionRecorded {
                action: action.clone(),
            }],
        )
        .await?;
        Ok(action)
    }

    /// Most recent first, optionally one round only
    pub async fn list_actions(
        &self,
        identity: &Identity,
        session_id: &str,
        round: Option<u32>,
    ) -> Result<Vec<ActionView>, CombatError> {
        let shared = self.record(session_id).await?;
        let record = shared.lock().await;
        let is_controller = identity.can_control(&record.session.controller_id);
        let snapshot = SessionSnapshot {
            session: record.session.clone(),
            participants: record.participants.iter().cloned().collect(),
            actions: record.actions.resolve(round, &record.participants),
        };
        Ok(snapshot.for_viewer(is_controller).actions)
    }

    /// Roll dice for a user; not tied to any session
    pub fn roll_dice(
        &self,
        identity: &Identity,
        request: &DiceRequest,
        labels: RollLabels,
    ) -> Result<DiceRoll, CombatError> {
        let outcome = {
            let mut dice = self.dice.lock();
            request.roll(&mut **dice)?
        };
        let roll = DiceRoll::from_outcome(
            &identity.account_id,
            &identity.username,
            request,
            outcome,
            labels,
        );
        debug!(user = %identity.username, dice = %request, total = roll.total, "Dice rolled");
        Ok(roll)
    }

    /// Show a public roll to everyone watching a session
    pub async fn share_roll(&self, session_id: &str, roll: &DiceRoll) -> Result<(), CombatError> {
        if roll.is_private {
            return Ok(());
        }
        self.record(session_id).await?;
        self.commit(
            Vec::new(),
            vec![CombatEvent::DiceRolled {
                session_id: session_id.to_string(),
                roll: roll.clone(),
            }],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::characters::SqliteCharacters;
    use crate::combat::dice::{DieSize, ScriptedDice};
    use crate::combat::session::SessionStatus;
    use crate::combat::store::StoreError;
    use crate::db::test_utils::{insert_character, test_pool};
    use crate::db::SqliteCombatStore;
    use crate::realtime::{BroadcastChannel, PublishError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn gm() -> Identity {
        Identity {
            account_id: "gm".into(),
            username: "gm".into(),
            role: Role::GameMaster,
        }
    }

    fn player() -> Identity {
        Identity {
            account_id: "p1".into(),
            username: "p1".into(),
            role: Role::Player,
        }
    }

    struct Harness {
        manager: CombatManager,
        channel: Arc<BroadcastChannel>,
        pool: sqlx::SqlitePool,
    }

    async fn harness(dice: Vec<u32>) -> Harness {
        let pool = test_pool().await;
        let channel = Arc::new(BroadcastChannel::new(64));
        let manager = CombatManager::with_dice(
            Arc::new(SqliteCombatStore::new(pool.clone())),
            channel.clone(),
            Arc::new(SqliteCharacters::new(pool.clone())),
            Box::new(ScriptedDice::new(dice)),
        );
        Harness {
            manager,
            channel,
            pool,
        }
    }

    async fn session_with(h: &Harness, roster: &[(&str, i32, u32)]) -> (String, Vec<Participant>) {
        let session = h
            .manager
            .create_session(
                &gm(),
                NewSession {
                    name: "Skirmish".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let mut added = Vec::new();
        for (name, init, hp) in roster {
            added.push(
                h.manager
                    .add_participant(&gm(), &session.id, NewParticipant::named(*name, *init, *hp))
                    .await
                    .unwrap(),
            );
        }
        (session.id, added)
    }

    #[tokio::test]
    async fn test_start_and_cycle_rounds() {
        let h = harness(vec![]).await;
        let (id, _) = session_with(&h, &[("A", 15, 10), ("B", 20, 10), ("C", 10, 10)]).await;

        let session = h.manager.start(&gm(), &id).await.unwrap();
        assert_eq!(session.round, 1);
        let snapshot = h.manager.get_snapshot(&gm(), &id).await.unwrap();
        let names: Vec<&str> = snapshot.participants.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["B", "A", "C"]);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let (session, new_round) = h.manager.advance_turn(&gm(), &id).await.unwrap();
            seen.push((session.current_turn_index, session.round, new_round));
        }
        assert_eq!(seen, vec![(1, 1, false), (2, 1, false), (0, 2, true)]);
    }

    #[tokio::test]
    async fn test_start_without_participants_fails() {
        let h = harness(vec![]).await;
        let (id, _) = session_with(&h, &[]).await;
        let err = h.manager.start(&gm(), &id).await.unwrap_err();
        assert!(matches!(err, CombatError::InvalidTransition(_)));
        let snapshot = h.manager.get_snapshot(&gm(), &id).await.unwrap();
        assert_eq!(snapshot.session.status, SessionStatus::Preparing);
    }

    #[tokio::test]
    async fn test_non_controller_is_rejected() {
        let h = harness(vec![]).await;
        let (id, _) = session_with(&h, &[("A", 10, 10)]).await;

        let err = h.manager.start(&player(), &id).await.unwrap_err();
        assert!(matches!(err, CombatError::PermissionDenied(_)));
        let err = h
            .manager
            .add_participant(&player(), &id, NewParticipant::named("X", 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, CombatError::PermissionDenied(_)));

        let admin = Identity {
            account_id: "root".into(),
            username: "root".into(),
            role: Role::Admin,
        };
        h.manager.start(&admin, &id).await.unwrap();
    }

    #[tokio::test]
    async fn test_health_command_records_action() {
        let h = harness(vec![]).await;
        let (id, added) = session_with(&h, &[("Fighter", 12, 20), ("Orc", 10, 15)]).await;
        let fighter = &added[0];
        let orc = &added[1];
        let mut rx = h.manager.subscribe(&id);

        let mut delta = HealthDelta::damage(25);
        delta.actor_id = Some(orc.id.clone());
        let outcome = h
            .manager
            .apply_health_delta(&gm(), &id, &fighter.id, delta)
            .await
            .unwrap();
        assert_eq!(outcome.participant.current_hit_points, 0);
        assert_eq!(outcome.participant.temporary_hit_points, 0);
        assert_eq!(outcome.action.action_name, "Damage");
        assert_eq!(outcome.action.damage, Some(25));
        assert_eq!(outcome.action.actor_id, orc.id);

        assert!(matches!(
            rx.recv().await.unwrap(),
            CombatEvent::ParticipantUpdated { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            CombatEvent::ActionRecorded { .. }
        ));

        let heal = h
            .manager
            .apply_health_delta(&gm(), &id, &fighter.id, HealthDelta::heal(50).resistant())
            .await
            .unwrap();
        assert_eq!(heal.participant.current_hit_points, 20);
        assert_eq!(heal.action.action_type, ActionType::Ability);
        assert_eq!(heal.action.action_name, "Healing");
    }

    #[tokio::test]
    async fn test_zero_damage_is_recorded_without_change() {
        let h = harness(vec![]).await;
        let (id, added) = session_with(&h, &[("Fighter", 12, 20)]).await;
        let fighter = &added[0];
        let mut rx = h.manager.subscribe(&id);

        let outcome = h
            .manager
            .apply_health_delta(&gm(), &id, &fighter.id, HealthDelta::damage(0))
            .await
            .unwrap();
        assert_eq!(outcome.participant.current_hit_points, 20);
        assert_eq!(outcome.participant.temporary_hit_points, 0);
        assert_eq!(outcome.action.damage, Some(0));

        match rx.recv().await.unwrap() {
            CombatEvent::ParticipantUpdated { participant } => {
                assert_eq!(participant.current_hit_points, 20)
            }
            other => panic!("unexpected event {}", other.name()),
        }
        match rx.recv().await.unwrap() {
            CombatEvent::ActionRecorded { action } => assert_eq!(action.damage, Some(0)),
            other => panic!("unexpected event {}", other.name()),
        }

        let actions = h.manager.list_actions(&gm(), &id, None).await.unwrap();
        assert_eq!(actions.len(), 1);
        let snapshot = h.manager.get_snapshot(&gm(), &id).await.unwrap();
        assert_eq!(snapshot.participants[0].current_hit_points, 20);
    }

    #[tokio::test]
    async fn test_health_command_with_unknown_actor_changes_nothing() {
        let h = harness(vec![]).await;
        let (id, added) = session_with(&h, &[("Fighter", 12, 20)]).await;

        let mut delta = HealthDelta::damage(5);
        delta.actor_id = Some("ghost".into());
        let err = h
            .manager
            .apply_health_delta(&gm(), &id, &added[0].id, delta)
            .await
            .unwrap_err();
        assert!(matches!(err, CombatError::NotFound(_)));

        let snapshot = h.manager.get_snapshot(&gm(), &id).await.unwrap();
        assert_eq!(snapshot.participants[0].current_hit_points, 20);
        assert!(snapshot.actions.is_empty());
    }

    #[tokio::test]
    async fn test_mid_combat_join_keeps_current_turn() {
        let h = harness(vec![]).await;
        let (id, _) = session_with(&h, &[("A", 15, 10), ("B", 20, 10)]).await;
        h.manager.start(&gm(), &id).await.unwrap();
        h.manager.advance_turn(&gm(), &id).await.unwrap();

        let late = h
            .manager
            .add_participant(&gm(), &id, NewParticipant::named("Late", 30, 10))
            .await
            .unwrap();
        assert_eq!(late.order, 2);

        let snapshot = h.manager.get_snapshot(&gm(), &id).await.unwrap();
        let current = snapshot.session.current_participant_id().unwrap();
        let current = snapshot.participants.iter().find(|p| p.id == current).unwrap();
        assert_eq!(current.name, "A");

        let (session, _) = h.manager.advance_turn(&gm(), &id).await.unwrap();
        assert_eq!(session.turn_order[session.current_turn_index], late.id);
    }

    #[tokio::test]
    async fn test_character_prefill_rolls_initiative() {
        let h = harness(vec![13]).await;
        insert_character(&h.pool, "c1", "Brom", 14, 31).await;
        let (id, _) = session_with(&h, &[]).await;

        let attrs = NewParticipant {
            character_id: Some("c1".into()),
            ..Default::default()
        };
        let p = h.manager.add_participant(&gm(), &id, attrs).await.unwrap();
        assert_eq!(p.name, "Brom");
        assert_eq!(p.max_hit_points, 31);
        assert_eq!(p.armor_class, 16);
        assert_eq!(p.initiative, 15);
        assert_eq!(p.initiative_roll, Some(13));

        let missing = NewParticipant {
            character_id: Some("nobody".into()),
            ..Default::default()
        };
        let err = h.manager.add_participant(&gm(), &id, missing).await.unwrap_err();
        assert!(matches!(err, CombatError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_invisible_participants_hidden_from_players() {
        let h = harness(vec![]).await;
        let (id, _) = session_with(&h, &[("Visible", 10, 10)]).await;
        let attrs = NewParticipant {
            is_visible: Some(false),
            ..NewParticipant::named("Assassin", 18, 12)
        };
        h.manager.add_participant(&gm(), &id, attrs).await.unwrap();

        assert_eq!(h.manager.get_snapshot(&gm(), &id).await.unwrap().participants.len(), 2);
        assert_eq!(h.manager.get_snapshot(&player(), &id).await.unwrap().participants.len(), 1);
        assert!(!h.manager.is_controller(&player(), &id).await.unwrap());
    }

    #[tokio::test]
    async fn test_ended_session_rejects_mutation() {
        let h = harness(vec![]).await;
        let (id, added) = session_with(&h, &[("A", 10, 10)]).await;
        h.manager.start(&gm(), &id).await.unwrap();
        h.manager.pause(&gm(), &id).await.unwrap();
        assert!(h.manager.advance_turn(&gm(), &id).await.is_err());
        h.manager.resume(&gm(), &id).await.unwrap();
        let ended = h.manager.end(&gm(), &id).await.unwrap();
        assert!(!ended.is_active);

        let err = h
            .manager
            .update_participant(&gm(), &id, &added[0].id, ParticipantPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CombatError::InvalidTransition(_)));
        let err = h
            .manager
            .record_action(&gm(), &id, NewAction::new(&added[0].id, ActionType::Other, "Flee"))
            .await
            .unwrap_err();
        assert!(matches!(err, CombatError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_state_survives_reload_from_store() {
        let h = harness(vec![]).await;
        let (id, added) = session_with(&h, &[("A", 15, 10), ("B", 20, 10)]).await;
        h.manager.start(&gm(), &id).await.unwrap();
        h.manager.advance_turn(&gm(), &id).await.unwrap();
        h.manager
            .record_action(&gm(), &id, NewAction::new(&added[0].id, ActionType::Movement, "Dash"))
            .await
            .unwrap();

        let fresh = CombatManager::new(
            Arc::new(SqliteCombatStore::new(h.pool.clone())),
            Arc::new(BroadcastChannel::default()),
            Arc::new(SqliteCharacters::new(h.pool.clone())),
        );
        let snapshot = fresh.get_snapshot(&gm(), &id).await.unwrap();
        assert_eq!(snapshot.session.current_turn_index, 1);
        assert_eq!(snapshot.participants[0].name, "B");
        assert_eq!(snapshot.actions.len(), 1);
        assert_eq!(snapshot.actions[0].action.round, 1);

        assert_eq!(fresh.list_sessions(None).await.unwrap().len(), 1);
        assert!(matches!(
            fresh.get_snapshot(&gm(), "missing").await,
            Err(CombatError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_roll_dice_and_share() {
        let h = harness(vec![4, 17]).await;
        let (id, _) = session_with(&h, &[]).await;
        let mut rx = h.manager.subscribe(&id);

        let request = DiceRequest::new(DieSize::D20, 1, 2).with_advantage();
        let roll = h
            .manager
            .roll_dice(&player(), &request, RollLabels::default())
            .unwrap();
        assert_eq!(roll.results, vec![4, 17]);
        assert_eq!(roll.total, 19);

        h.manager.share_roll(&id, &roll).await.unwrap();
        match rx.recv().await.unwrap() {
            CombatEvent::DiceRolled { roll: shared, .. } => assert_eq!(shared.id, roll.id),
            other => panic!("unexpected {:?}", other),
        }

        let private = DiceRoll {
            is_private: true,
            ..roll
        };
        h.manager.share_roll(&id, &private).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(h.channel.subscriber_count(&id), 1);
    }

    /// Store whose writes can be switched off
    struct FlakyStore {
        inner: SqliteCombatStore,
        broken: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> Result<(), StoreError> {
            if self.broken.load(Ordering::SeqCst) {
                Err(StoreError::Corrupt("disk unavailable".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl CombatStore for FlakyStore {
        async fn insert_session(&self, session: &CombatSession) -> Result<(), StoreError> {
            self.check()?;
            self.inner.insert_session(session).await
        }
        async fn update_session(&self, session: &CombatSession) -> Result<(), StoreError> {
            self.check()?;
            self.inner.update_session(session).await
        }
        async fn get_session(&self, id: &str) -> Result<Option<CombatSession>, StoreError> {
            self.inner.get_session(id).await
        }
        async fn list_sessions(&self, campaign_id: Option<&str>) -> Result<Vec<CombatSession>, StoreError> {
            self.inner.list_sessions(campaign_id).await
        }
        async fn upsert_participant(&self, participant: &Participant) -> Result<(), StoreError> {
            self.check()?;
            self.inner.upsert_participant(participant).await
        }
        async fn list_participants(&self, session_id: &str) -> Result<Vec<Participant>, StoreError> {
            self.inner.list_participants(session_id).await
        }
        async fn insert_action(&self, action: &CombatAction) -> Result<(), StoreError> {
            self.check()?;
            self.inner.insert_action(action).await
        }
        async fn list_actions(&self, session_id: &str) -> Result<Vec<CombatAction>, StoreError> {
            self.inner.list_actions(session_id).await
        }
    }

    struct ClosedChannel;

    impl EventChannel for ClosedChannel {
        fn publish(&self, _event: CombatEvent) -> Result<(), PublishError> {
            Err(PublishError("gateway offline".into()))
        }

        fn subscribe(&self, _session_id: &str) -> broadcast::Receiver<CombatEvent> {
            broadcast::channel(1).1
        }

        fn release(&self, _session_id: &str) {}
    }

    #[tokio::test]
    async fn test_persist_failure_is_transport_after_commit() {
        let pool = test_pool().await;
        let store = Arc::new(FlakyStore {
            inner: SqliteCombatStore::new(pool.clone()),
            broken: AtomicBool::new(false),
        });
        let channel = Arc::new(BroadcastChannel::default());
        let manager = CombatManager::new(
            store.clone(),
            channel.clone(),
            Arc::new(SqliteCharacters::new(pool)),
        );
        let session = manager
            .create_session(
                &gm(),
                NewSession {
                    name: "Flaky".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        manager
            .add_participant(&gm(), &session.id, NewParticipant::named("A", 10, 10))
            .await
            .unwrap();
        let mut rx = manager.subscribe(&session.id);

        store.broken.store(true, Ordering::SeqCst);
        let err = manager.start(&gm(), &session.id).await.unwrap_err();
        assert!(err.is_partial_success());

        // committed locally and still announced
        let snapshot = manager.get_snapshot(&gm(), &session.id).await.unwrap();
        assert_eq!(snapshot.session.status, SessionStatus::Active);
        assert!(matches!(
            rx.recv().await.unwrap(),
            CombatEvent::SessionStarted { .. }
        ));
    }

    #[tokio::test]
    async fn test_publish_failure_is_transport_after_commit() {
        let pool = test_pool().await;
        let manager = CombatManager::new(
            Arc::new(SqliteCombatStore::new(pool.clone())),
            Arc::new(ClosedChannel),
            Arc::new(SqliteCharacters::new(pool)),
        );
        let session = manager
            .create_session(
                &gm(),
                NewSession {
                    name: "Quiet".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = manager
            .add_participant(&gm(), &session.id, NewParticipant::named("A", 10, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, CombatError::Transport(_)));
        let snapshot = manager.get_snapshot(&gm(), &session.id).await.unwrap();
        assert_eq!(snapshot.participants.len(), 1);
    }
}
