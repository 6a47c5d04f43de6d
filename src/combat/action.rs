//! Action log
//!
//! Append-only audit trail of what happened in a session. Entries are
//! stamped with the round at recording time and never change afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::damage::DamageType;
use super::error::CombatError;
use super::participant::{Participant, ParticipantRegistry};

/// Category of a recorded action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Attack,
    Spell,
    Ability,
    Movement,
    Item,
    Other,
}

/// Ability used for a saving throw
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ability {
    Strength,
    Dexterity,
    Constitution,
    Intelligence,
    Wisdom,
    Charisma,
}

/// Structured dice data attached to an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RollData {
    /// To-hit roll
    AttackRoll {
        dice: Vec<u32>,
        modifier: i32,
        total: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_ac: Option<i32>,
    },
    /// Damage dice
    Damage {
        dice: Vec<u32>,
        modifier: i32,
        total: i32,
    },
    /// Saving throw made by the target
    Save {
        dice: Vec<u32>,
        modifier: i32,
        total: i32,
        dc: u32,
    },
}

impl RollData {
    pub fn total(&self) -> i32 {
        match self {
            RollData::AttackRoll { total, .. }
            | RollData::Damage { total, .. }
            | RollData::Save { total, .. } => *total,
        }
    }

    fn validate(&self) -> Result<(), CombatError> {
        let dice = match self {
            RollData::AttackRoll { dice, .. }
            | RollData::Damage { dice, .. }
            | RollData::Save { dice, .. } => dice,
        };
        if dice.iter().any(|d| *d == 0) {
            return Err(CombatError::validation("die results start at 1"));
        }
        Ok(())
    }
}

/// Fields for the "record action" command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAction {
    pub actor_id: String,
    #[serde(default)]
    pub target_id: Option<String>,
    pub action_type: ActionType,
    pub action_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub roll_data: Option<RollData>,
    #[serde(default)]
    pub damage: Option<u32>,
    #[serde(default)]
    pub damage_type: Option<DamageType>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub save_type: Option<Ability>,
    #[serde(default)]
    pub save_dc: Option<u32>,
}

impl NewAction {
    pub fn new(actor_id: &str, action_type: ActionType, action_name: &str) -> Self {
        Self {
            actor_id: actor_id.to_string(),
            target_id: None,
            action_type,
            action_name: action_name.to_string(),
            description: None,
            roll_data: None,
            damage: None,
            damage_type: None,
            success: None,
            save_type: None,
            save_dc: None,
        }
    }

    pub fn targeting(mut self, target_id: &str) -> Self {
        self.target_id = Some(target_id.to_string());
        self
    }
}

/// A recorded action; immutable once created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombatAction {
    pub id: String,
    pub combat_session_id: String,
    /// Round at the time of recording
    pub round: u32,
    pub actor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    pub action_type: ActionType,
    pub action_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roll_data: Option<RollData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub damage: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub damage_type: Option<DamageType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_type: Option<Ability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_dc: Option<u32>,
    /// Position in the session log
    pub seq: u64,
    pub created_at: DateTime<Utc>,
}

/// An action with its actor and target resolved for display
#[derive(Debug, Clone, Serialize)]
pub struct ActionView {
    #[serde(flatten)]
    pub action: CombatAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<Participant>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<Participant>,
}

/// Append-only log of a session's actions, oldest first
#[derive(Debug, Clone, Default)]
pub struct ActionLog {
    actions: Vec<CombatAction>,
}

impl ActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from stored actions
    pub fn from_stored(mut actions: Vec<CombatAction>) -> Self {
        actions.sort_by_key(|a| a.seq);
        Self { actions }
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Append a new action stamped with `round`
    pub fn record(
        &mut self,
        session_id: &str,
        round: u32,
        participants: &ParticipantRegistry,
        new: NewAction,
    ) -> Result<CombatAction, CombatError> {
        let action_name = new.action_name.trim();
        if action_name.is_empty() {
            return Err(CombatError::validation("action_name is required"));
        }
        if participants.get(&new.actor_id).is_none() {
            return Err(CombatError::not_found(format!("participant {}", new.actor_id)));
        }
        if let Some(target) = &new.target_id {
            if participants.get(target).is_none() {
                return Err(CombatError::not_found(format!("participant {}", target)));
            }
        }
        if new.save_dc.is_some() && new.save_type.is_none() {
            return Err(CombatError::validation("save_dc requires save_type"));
        }
        if let Some(roll) = &new.roll_data {
            roll.validate()?;
        }

        let action = CombatAction {
            id: uuid::Uuid::new_v4().to_string(),
            combat_session_id: session_id.to_string(),
            round,
            actor_id: new.actor_id,
            target_id: new.target_id,
            action_type: new.action_type,
            action_name: action_name.to_string(),
            description: new.description,
            roll_data: new.roll_data,
            damage: new.damage,
            damage_type: new.damage_type,
            success: new.success,
            save_type: new.save_type,
            save_dc: new.save_dc,
            seq: self.actions.len() as u64,
            created_at: Utc::now(),
        };

        self.actions.push(action.clone());
        Ok(action)
    }

    /// Most recent first, optionally limited to one round
    pub fn query(&self, round: Option<u32>) -> Vec<&CombatAction> {
        self.actions
            .iter()
            .rev()
            .filter(|a| round.map_or(true, |r| a.round == r))
            .collect()
    }

    /// Like [`query`](Self::query), with participants attached
    pub fn resolve(&self, round: Option<u32>, participants: &ParticipantRegistry) -> Vec<ActionView> {
        self.query(round)
            .into_iter()
            .map(|action| ActionView {
                actor: participants.get(&action.actor_id).cloned(),
                target: action
                    .target_id
                    .as_deref()
                    .and_then(|id| participants.get(id))
                    .cloned(),
                action: action.clone(),
            })
            .collect()
    }
}
