//! Dice resolver
//!
//! Parses and rolls dice notation like "2d6+3", "1d20", "4d8-2" over the
//! fixed set of tabletop die sizes, with advantage/disadvantage for a
//! single d20. The random source is injectable through [`DieSource`].

use std::collections::VecDeque;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::error::CombatError;

/// Upper bound on dice in a single roll
pub const MAX_DICE: u32 = 100;

/// Supported die sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DieSize {
    D4,
    D6,
    D8,
    D10,
    D12,
    D20,
    D100,
}

impl DieSize {
    /// Number of faces
    pub fn sides(&self) -> u32 {
        match self {
            DieSize::D4 => 4,
            DieSize::D6 => 6,
            DieSize::D8 => 8,
            DieSize::D10 => 10,
            DieSize::D12 => 12,
            DieSize::D20 => 20,
            DieSize::D100 => 100,
        }
    }

    /// Look up a die by its face count
    pub fn from_sides(sides: u32) -> Option<DieSize> {
        match sides {
            4 => Some(DieSize::D4),
            6 => Some(DieSize::D6),
            8 => Some(DieSize::D8),
            10 => Some(DieSize::D10),
            12 => Some(DieSize::D12),
            20 => Some(DieSize::D20),
            100 => Some(DieSize::D100),
            _ => None,
        }
    }
}

impl FromStr for DieSize {
    type Err = CombatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        let sides = s.strip_prefix('d').unwrap_or(&s);
        sides
            .parse::<u32>()
            .ok()
            .and_then(DieSize::from_sides)
            .ok_or_else(|| CombatError::validation(format!("unsupported die: {}", s)))
    }
}

impl std::fmt::Display for DieSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "d{}", self.sides())
    }
}

/// Source of individual die results
pub trait DieSource {
    /// Produce a value in `1..=sides`
    fn roll_die(&mut self, sides: u32) -> u32;
}

impl<R: Rng + ?Sized> DieSource for R {
    fn roll_die(&mut self, sides: u32) -> u32 {
        self.random_range(1..=sides)
    }
}

/// Replays a fixed sequence of results, cycling when exhausted.
///
/// Values are clamped into the range of the die being rolled.
#[derive(Debug, Clone)]
pub struct ScriptedDice {
    values: VecDeque<u32>,
}

impl ScriptedDice {
    pub fn new(values: impl IntoIterator<Item = u32>) -> Self {
        Self {
            values: values.into_iter().collect(),
        }
    }
}

impl DieSource for ScriptedDice {
    fn roll_die(&mut self, sides: u32) -> u32 {
        match self.values.pop_front() {
            Some(v) => {
                self.values.push_back(v);
                v.clamp(1, sides)
            }
            None => 1,
        }
    }
}

/// A validated roll request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiceRequest {
    pub die: DieSize,
    pub count: u32,
    #[serde(default)]
    pub modifier: i32,
    #[serde(default)]
    pub advantage: bool,
    #[serde(default)]
    pub disadvantage: bool,
}

impl DiceRequest {
    pub fn new(die: DieSize, count: u32, modifier: i32) -> Self {
        Self {
            die,
            count,
            modifier,
            advantage: false,
            disadvantage: false,
        }
    }

    pub fn with_advantage(mut self) -> Self {
        self.advantage = true;
        self
    }

    pub fn with_disadvantage(mut self) -> Self {
        self.disadvantage = true;
        self
    }

    /// Check the count bounds
    pub fn validate(&self) -> Result<(), CombatError> {
        if self.count == 0 {
            return Err(CombatError::validation("dice count must be at least 1"));
        }
        if self.count > MAX_DICE {
            return Err(CombatError::validation(format!(
                "dice count must be at most {}",
                MAX_DICE
            )));
        }
        Ok(())
    }

    /// Advantage or disadvantage only matter for a lone d20, and cancel out
    fn keep_mode(&self) -> Option<Keep> {
        if self.die != DieSize::D20 || self.count != 1 {
            return None;
        }
        match (self.advantage, self.disadvantage) {
            (true, false) => Some(Keep::Highest),
            (false, true) => Some(Keep::Lowest),
            _ => None,
        }
    }

    /// Roll against the given source
    pub fn roll<S: DieSource + ?Sized>(&self, source: &mut S) -> Result<RollOutcome, CombatError> {
        self.validate()?;
        let sides = self.die.sides();

        if let Some(keep) = self.keep_mode() {
            let first = source.roll_die(sides);
            let second = source.roll_die(sides);
            let kept = match keep {
                Keep::Highest => first.max(second),
                Keep::Lowest => first.min(second),
            };
            return Ok(RollOutcome {
                results: vec![first, second],
                kept: Some(kept),
                total: self.total(kept)?,
            });
        }

        let results: Vec<u32> = (0..self.count).map(|_| source.roll_die(sides)).collect();
        let sum: u32 = results.iter().sum();
        Ok(RollOutcome {
            total: self.total(sum)?,
            results,
            kept: None,
        })
    }

    fn total(&self, rolled: u32) -> Result<i32, CombatError> {
        i32::try_from(rolled)
            .ok()
            .and_then(|rolled| rolled.checked_add(self.modifier))
            .ok_or_else(|| CombatError::validation(format!("modifier {} is out of range", self.modifier)))
    }
}

impl FromStr for DiceRequest {
    type Err = CombatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_dice(s)
    }
}

impl std::fmt::Display for DiceRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.count, self.die)?;
        if self.modifier > 0 {
            write!(f, "+{}", self.modifier)
        } else if self.modifier < 0 {
            write!(f, "{}", self.modifier)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Keep {
    Highest,
    Lowest,
}

/// Result of resolving a [`DiceRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollOutcome {
    /// Every die rolled, including a discarded advantage/disadvantage die
    pub results: Vec<u32>,
    /// The die that counted, when two d20s were rolled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kept: Option<u32>,
    pub total: i32,
}

impl RollOutcome {
    /// The natural d20 value for attack/save style rolls
    pub fn natural(&self) -> Option<u32> {
        self.kept.or_else(|| self.results.first().copied())
    }
}

/// Parse a dice notation string like "2d6+3"
pub fn parse_dice(notation: &str) -> Result<DiceRequest, CombatError> {
    let notation = notation.trim().to_lowercase();

    let d_pos = notation
        .find('d')
        .ok_or_else(|| CombatError::validation("missing 'd' in dice notation"))?;

    let count_str = &notation[..d_pos];
    let count: u32 = if count_str.is_empty() {
        1
    } else {
        count_str
            .parse()
            .map_err(|_| CombatError::validation(format!("invalid dice count: {}", count_str)))?
    };

    let rest = &notation[d_pos + 1..];
    let (sides_str, modifier) = match rest.find(['+', '-']) {
        Some(pos) => {
            let mod_str = rest[pos..].trim_start_matches('+');
            let modifier: i32 = mod_str
                .parse()
                .map_err(|_| CombatError::validation(format!("invalid modifier: {}", mod_str)))?;
            (&rest[..pos], modifier)
        }
        None => (rest, 0),
    };

    let die: DieSize = sides_str.parse()?;
    let request = DiceRequest::new(die, count, modifier);
    request.validate()?;
    Ok(request)
}

/// A resolved roll as shown in roll histories and broadcast to viewers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiceRoll {
    pub id: String,
    /// Client-chosen id used to reconcile a provisional local roll
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub user_id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_name: Option<String>,
    pub dice_type: DieSize,
    pub dice_count: u32,
    pub modifier: i32,
    pub results: Vec<u32>,
    pub total: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roll_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roll_label: Option<String>,
    pub advantage: bool,
    pub disadvantage: bool,
    pub is_private: bool,
    pub timestamp: DateTime<Utc>,
}

/// Presentation fields attached to a roll
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollLabels {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub character_name: Option<String>,
    #[serde(default)]
    pub roll_type: Option<String>,
    #[serde(default)]
    pub roll_label: Option<String>,
    #[serde(default)]
    pub is_private: bool,
}

impl DiceRoll {
    /// Build a roll record from a request and its outcome
    pub fn from_outcome(
        user_id: &str,
        username: &str,
        request: &DiceRequest,
        outcome: RollOutcome,
        labels: RollLabels,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request_id: labels.request_id,
            user_id: user_id.to_string(),
            username: username.to_string(),
            character_name: labels.character_name,
            dice_type: request.die,
            dice_count: request.count,
            modifier: request.modifier,
            results: outcome.results,
            total: outcome.total,
            roll_type: labels.roll_type,
            roll_label: labels.roll_label,
            advantage: request.advantage,
            disadvantage: request.disadvantage,
            is_private: labels.is_private,
            timestamp: Utc::now(),
        }
    }
}
