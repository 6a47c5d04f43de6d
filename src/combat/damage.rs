//! Damage types, resistance/vulnerability and the hit point rules
//!
//! Handles health mutation with:
//! - Temporary hit points absorbing damage before current hit points
//! - Non-stacking temporary hit point grants
//! - Resistance (50% damage, rounded down) and vulnerability (200% damage)
//! - Healing capped at maximum hit points

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Types of damage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DamageType {
    Acid,
    Bludgeoning,
    Cold,
    Fire,
    Force,
    Lightning,
    Necrotic,
    Piercing,
    Poison,
    Psychic,
    Radiant,
    Slashing,
    Thunder,
}

impl FromStr for DamageType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "acid" => Ok(DamageType::Acid),
            "bludgeoning" => Ok(DamageType::Bludgeoning),
            "cold" | "ice" => Ok(DamageType::Cold),
            "fire" => Ok(DamageType::Fire),
            "force" => Ok(DamageType::Force),
            "lightning" | "electric" => Ok(DamageType::Lightning),
            "necrotic" => Ok(DamageType::Necrotic),
            "piercing" => Ok(DamageType::Piercing),
            "poison" => Ok(DamageType::Poison),
            "psychic" => Ok(DamageType::Psychic),
            "radiant" => Ok(DamageType::Radiant),
            "slashing" => Ok(DamageType::Slashing),
            "thunder" => Ok(DamageType::Thunder),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for DamageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DamageType::Acid => "acid",
            DamageType::Bludgeoning => "bludgeoning",
            DamageType::Cold => "cold",
            DamageType::Fire => "fire",
            DamageType::Force => "force",
            DamageType::Lightning => "lightning",
            DamageType::Necrotic => "necrotic",
            DamageType::Piercing => "piercing",
            DamageType::Poison => "poison",
            DamageType::Psychic => "psychic",
            DamageType::Radiant => "radiant",
            DamageType::Slashing => "slashing",
            DamageType::Thunder => "thunder",
        };
        write!(f, "{}", s)
    }
}

/// Resistance or vulnerability for a single damage request.
///
/// A single enum means a request can carry at most one of the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DamageModifier {
    /// Takes 100% damage
    #[default]
    Normal,
    /// Takes 50% damage (rounded down)
    Resistant,
    /// Takes 200% damage
    Vulnerable,
}

impl DamageModifier {
    /// Apply this modifier to damage amount
    pub fn apply(&self, damage: u32) -> u32 {
        match self {
            DamageModifier::Normal => damage,
            DamageModifier::Resistant => damage / 2,
            DamageModifier::Vulnerable => damage.saturating_mul(2),
        }
    }
}

/// What a health change request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthDeltaKind {
    Damage,
    Heal,
    TemporaryHitPoints,
}

/// A damage or healing request against one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthDelta {
    pub amount: u32,
    #[serde(default)]
    pub is_healing: bool,
    /// A temporary hit point grant; implies healing
    #[serde(default)]
    pub is_temp_hp: bool,
    #[serde(default)]
    pub modifier: DamageModifier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub damage_type: Option<DamageType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Participant credited with the change; defaults to the target itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
}

impl HealthDelta {
    pub fn damage(amount: u32) -> Self {
        Self {
            amount,
            is_healing: false,
            is_temp_hp: false,
            modifier: DamageModifier::Normal,
            damage_type: None,
            description: None,
            actor_id: None,
        }
    }

    pub fn heal(amount: u32) -> Self {
        Self {
            is_healing: true,
            ..Self::damage(amount)
        }
    }

    pub fn temporary(amount: u32) -> Self {
        Self {
            is_healing: true,
            is_temp_hp: true,
            ..Self::damage(amount)
        }
    }

    /// Mark the target as resistant; clears any vulnerability
    pub fn resistant(mut self) -> Self {
        self.modifier = DamageModifier::Resistant;
        self
    }

    /// Mark the target as vulnerable; clears any resistance
    pub fn vulnerable(mut self) -> Self {
        self.modifier = DamageModifier::Vulnerable;
        self
    }

    pub fn of_type(mut self, damage_type: DamageType) -> Self {
        self.damage_type = Some(damage_type);
        self
    }

    pub fn kind(&self) -> HealthDeltaKind {
        if self.is_temp_hp {
            HealthDeltaKind::TemporaryHitPoints
        } else if self.is_healing {
            HealthDeltaKind::Heal
        } else {
            HealthDeltaKind::Damage
        }
    }

    /// Amount after resistance/vulnerability; healing is never modified
    pub fn adjusted_amount(&self) -> u32 {
        match self.kind() {
            HealthDeltaKind::Damage => self.modifier.apply(self.amount),
            _ => self.amount,
        }
    }
}

/// Hit point pool of a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitPoints {
    pub max: u32,
    pub current: u32,
    pub temporary: u32,
}

/// Outcome of applying a [`HealthDelta`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthChange {
    pub kind: HealthDeltaKind,
    /// Amount after resistance/vulnerability
    pub amount: u32,
    /// Damage soaked by temporary hit points
    pub absorbed: u32,
    /// Change applied to current hit points (negative for damage)
    pub current_delta: i64,
}

impl HitPoints {
    /// Apply a damage/heal request in place
    pub fn apply(&mut self, delta: &HealthDelta) -> HealthChange {
        let kind = delta.kind();
        let amount = delta.adjusted_amount();
        let before = self.current;
        let mut absorbed = 0;

        match kind {
            HealthDeltaKind::TemporaryHitPoints => {
                self.temporary = self.temporary.max(amount);
            }
            HealthDeltaKind::Heal => {
                self.current = self.current.saturating_add(amount).min(self.max);
            }
            HealthDeltaKind::Damage => {
                absorbed = amount.min(self.temporary);
                self.temporary -= absorbed;
                self.current = self.current.saturating_sub(amount - absorbed);
            }
        }

        HealthChange {
            kind,
            amount,
            absorbed,
            current_delta: self.current as i64 - before as i64,
        }
    }
}
