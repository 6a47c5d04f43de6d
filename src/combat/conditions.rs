//! Status conditions on participants
//!
//! Conditions are a free-form ordered list. The standard tabletop
//! conditions are recognised so their names can be normalised.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::error::CombatError;

/// The standard conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionKind {
    Blinded,
    Charmed,
    Deafened,
    Exhaustion,
    Frightened,
    Grappled,
    Incapacitated,
    Invisible,
    Paralyzed,
    Petrified,
    Poisoned,
    Prone,
    Restrained,
    Stunned,
    Unconscious,
}

impl FromStr for ConditionKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "blinded" | "blind" => Ok(ConditionKind::Blinded),
            "charmed" => Ok(ConditionKind::Charmed),
            "deafened" | "deaf" => Ok(ConditionKind::Deafened),
            "exhaustion" | "exhausted" => Ok(ConditionKind::Exhaustion),
            "frightened" => Ok(ConditionKind::Frightened),
            "grappled" => Ok(ConditionKind::Grappled),
            "incapacitated" => Ok(ConditionKind::Incapacitated),
            "invisible" => Ok(ConditionKind::Invisible),
            "paralyzed" | "paralysed" => Ok(ConditionKind::Paralyzed),
            "petrified" => Ok(ConditionKind::Petrified),
            "poisoned" => Ok(ConditionKind::Poisoned),
            "prone" => Ok(ConditionKind::Prone),
            "restrained" => Ok(ConditionKind::Restrained),
            "stunned" => Ok(ConditionKind::Stunned),
            "unconscious" => Ok(ConditionKind::Unconscious),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConditionKind::Blinded => "blinded",
            ConditionKind::Charmed => "charmed",
            ConditionKind::Deafened => "deafened",
            ConditionKind::Exhaustion => "exhaustion",
            ConditionKind::Frightened => "frightened",
            ConditionKind::Grappled => "grappled",
            ConditionKind::Incapacitated => "incapacitated",
            ConditionKind::Invisible => "invisible",
            ConditionKind::Paralyzed => "paralyzed",
            ConditionKind::Petrified => "petrified",
            ConditionKind::Poisoned => "poisoned",
            ConditionKind::Prone => "prone",
            ConditionKind::Restrained => "restrained",
            ConditionKind::Stunned => "stunned",
            ConditionKind::Unconscious => "unconscious",
        };
        write!(f, "{}", s)
    }
}

/// A named status effect on a participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub name: String,
    /// Remaining duration in rounds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Condition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            duration: None,
            description: None,
        }
    }

    pub fn lasting(mut self, rounds: u32) -> Self {
        self.duration = Some(rounds);
        self
    }

    /// The standard condition this names, if any
    pub fn kind(&self) -> Option<ConditionKind> {
        self.name.parse().ok()
    }
}

/// Validate and normalise a replacement condition list, preserving order
pub fn normalize(conditions: Vec<Condition>) -> Result<Vec<Condition>, CombatError> {
    conditions
        .into_iter()
        .map(|mut condition| {
            let trimmed = condition.name.trim().to_string();
            if trimmed.is_empty() {
                return Err(CombatError::validation("condition name must not be empty"));
            }
            condition.name = match condition.kind() {
                Some(kind) => kind.to_string(),
                None => trimmed,
            };
            Ok(condition)
        })
        .collect()
}
