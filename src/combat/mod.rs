//! Combat system module
//!
//! Initiative-ordered combat for tabletop sessions:
//! - Dice rolling (e.g., "2d6+3", advantage/disadvantage)
//! - Sessions with a preparing/active/paused/ended lifecycle
//! - Participants with hit points, temporary HP and conditions
//! - Damage types with resistance and vulnerability
//! - An append-only action log per session
//! - Delta events for live views, and a client-side replica that applies them

mod action;
mod conditions;
mod damage;
mod dice;
mod error;
mod events;
mod manager;
mod participant;
mod replica;
mod session;
mod store;

pub use action::{Ability, ActionLog, ActionType, ActionView, CombatAction, NewAction, RollData};
pub use conditions::{normalize as normalize_conditions, Condition, ConditionKind};
pub use damage::{
    DamageModifier, DamageType, HealthChange, HealthDelta, HealthDeltaKind, HitPoints,
};
pub use dice::{
    parse_dice, DiceRequest, DiceRoll, DieSize, DieSource, RollLabels, RollOutcome, ScriptedDice,
    MAX_DICE,
};
pub use error::CombatError;
pub use events::{CombatEvent, SessionSnapshot, ViewerFilter};
pub use manager::{CombatManager, HealthOutcome};
pub use participant::{
    roll_initiative, NewParticipant, Participant, ParticipantPatch, ParticipantRegistry,
    ParticipantType, DEFAULT_ARMOR_CLASS,
};
pub use replica::{RollEntry, RollHistory, SessionReplica, ROLL_HISTORY_LIMIT};
pub use session::{CombatSession, NewSession, SessionStatus};
pub use store::{CombatStore, StoreError};
