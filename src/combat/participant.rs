//! Participant registry
//!
//! Owns the combatants of one session in insertion order and applies
//! health, condition and attribute mutations to them. Participants are
//! never removed; deactivation is the only way out of the fight.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::conditions::{self, Condition};
use super::damage::{HealthChange, HealthDelta, HitPoints};
use super::dice::{DiceRequest, DieSize, DieSource};
use super::error::CombatError;
use crate::characters::CharacterSheet;

/// Default armor class when none is given
pub const DEFAULT_ARMOR_CLASS: i32 = 10;

/// Kind of combatant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantType {
    Player,
    #[default]
    Npc,
    Monster,
}

/// A combatant in a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub combat_session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParticipantType,
    pub initiative: i32,
    /// Natural d20 when initiative was rolled by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiative_roll: Option<u32>,
    pub armor_class: i32,
    pub max_hit_points: u32,
    pub current_hit_points: u32,
    pub temporary_hit_points: u32,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Rank in the turn sequence
    pub order: u32,
    pub is_visible: bool,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Position in the session's insertion order, used for stable tie-breaks
    pub joined_seq: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Participant {
    pub fn hit_points(&self) -> HitPoints {
        HitPoints {
            max: self.max_hit_points,
            current: self.current_hit_points,
            temporary: self.temporary_hit_points,
        }
    }

    fn set_hit_points(&mut self, hp: HitPoints) {
        self.max_hit_points = hp.max;
        self.current_hit_points = hp.current;
        self.temporary_hit_points = hp.temporary;
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Attributes for the "add participant" command
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewParticipant {
    #[serde(default)]
    pub character_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<ParticipantType>,
    #[serde(default)]
    pub initiative: Option<i32>,
    #[serde(default)]
    pub armor_class: Option<i32>,
    #[serde(default)]
    pub max_hit_points: Option<u32>,
    #[serde(default)]
    pub current_hit_points: Option<u32>,
    #[serde(default)]
    pub temporary_hit_points: Option<u32>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub is_visible: Option<bool>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl NewParticipant {
    pub fn named(name: impl Into<String>, initiative: i32, max_hit_points: u32) -> Self {
        Self {
            name: Some(name.into()),
            initiative: Some(initiative),
            max_hit_points: Some(max_hit_points),
            ..Default::default()
        }
    }

    /// Fill unset fields from a character sheet
    pub fn prefill(&mut self, sheet: &CharacterSheet) {
        self.character_id.get_or_insert_with(|| sheet.id.clone());
        self.name.get_or_insert_with(|| sheet.name.clone());
        self.kind.get_or_insert(ParticipantType::Player);
        self.armor_class.get_or_insert(sheet.armor_class);
        self.max_hit_points.get_or_insert(sheet.max_hit_points);
        self.current_hit_points.get_or_insert(sheet.current_hit_points);
        self.temporary_hit_points
            .get_or_insert(sheet.temporary_hit_points);
    }
}

/// Roll `1d20 + bonus`, returning the initiative and the natural die
pub fn roll_initiative<S: DieSource + ?Sized>(
    bonus: i32,
    source: &mut S,
) -> Result<(i32, u32), CombatError> {
    let outcome = DiceRequest::new(DieSize::D20, 1, bonus).roll(source)?;
    let natural = outcome.natural().unwrap_or(1);
    Ok((outcome.total, natural))
}

/// Partial update of a participant; unset fields are left alone
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParticipantPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<ParticipantType>,
    #[serde(default)]
    pub initiative: Option<i32>,
    #[serde(default)]
    pub armor_class: Option<i32>,
    #[serde(default)]
    pub max_hit_points: Option<u32>,
    #[serde(default)]
    pub current_hit_points: Option<u32>,
    #[serde(default)]
    pub temporary_hit_points: Option<u32>,
    #[serde(default)]
    pub conditions: Option<Vec<Condition>>,
    #[serde(default)]
    pub is_visible: Option<bool>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl ParticipantPatch {
    /// Apply onto a copy so a rejected patch leaves the original untouched
    fn applied_to(self, participant: &Participant) -> Result<Participant, CombatError> {
        let mut next = participant.clone();

        if let Some(name) = self.name {
            next.name = validate_name(&name)?;
        }
        if let Some(kind) = self.kind {
            next.kind = kind;
        }
        if let Some(initiative) = self.initiative {
            next.initiative = initiative;
        }
        if let Some(armor_class) = self.armor_class {
            next.armor_class = armor_class;
        }
        if let Some(max) = self.max_hit_points {
            if max == 0 {
                return Err(CombatError::validation("max_hit_points must be greater than 0"));
            }
            next.max_hit_points = max;
        }
        if let Some(current) = self.current_hit_points {
            next.current_hit_points = current;
        }
        next.current_hit_points = next.current_hit_points.min(next.max_hit_points);
        if let Some(temporary) = self.temporary_hit_points {
            next.temporary_hit_points = temporary;
        }
        if let Some(list) = self.conditions {
            next.conditions = conditions::normalize(list)?;
        }
        if let Some(visible) = self.is_visible {
            next.is_visible = visible;
        }
        if let Some(active) = self.is_active {
            next.is_active = active;
        }
        if let Some(notes) = self.notes {
            next.notes = Some(notes);
        }

        next.touch();
        Ok(next)
    }
}

fn validate_name(name: &str) -> Result<String, CombatError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(CombatError::validation("participant name is required"));
    }
    Ok(name.to_string())
}

/// The participant set of one session, in insertion order
#[derive(Debug, Clone, Default)]
pub struct ParticipantRegistry {
    participants: Vec<Participant>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from stored participants
    pub fn from_stored(mut participants: Vec<Participant>) -> Self {
        participants.sort_by_key(|p| p.joined_seq);
        Self { participants }
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Participant> {
        self.participants.iter_mut()
    }

    pub fn get(&self, id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut Participant, CombatError> {
        self.participants
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| CombatError::not_found(format!("participant {}", id)))
    }

    /// Validate attributes and append a new participant
    ///
    /// `order` is the rank the caller assigns; the turn state machine decides it.
    pub fn add(
        &mut self,
        session_id: &str,
        attrs: NewParticipant,
        initiative_roll: Option<u32>,
        order: u32,
    ) -> Result<Participant, CombatError> {
        let name = validate_name(attrs.name.as_deref().unwrap_or_default())?;
        let max = attrs
            .max_hit_points
            .ok_or_else(|| CombatError::validation("max_hit_points is required"))?;
        if max == 0 {
            return Err(CombatError::validation("max_hit_points must be greater than 0"));
        }
        let current = attrs.current_hit_points.unwrap_or(max);
        if current > max {
            return Err(CombatError::validation(
                "current_hit_points cannot exceed max_hit_points",
            ));
        }
        let conditions = conditions::normalize(attrs.conditions)?;

        let now = Utc::now();
        let participant = Participant {
            id: uuid::Uuid::new_v4().to_string(),
            combat_session_id: session_id.to_string(),
            character_id: attrs.character_id,
            name,
            kind: attrs.kind.unwrap_or_default(),
            initiative: attrs.initiative.unwrap_or(0),
            initiative_roll,
            armor_class: attrs.armor_class.unwrap_or(DEFAULT_ARMOR_CLASS),
            max_hit_points: max,
            current_hit_points: current,
            temporary_hit_points: attrs.temporary_hit_points.unwrap_or(0),
            conditions,
            order,
            is_visible: attrs.is_visible.unwrap_or(true),
            is_active: true,
            notes: attrs.notes,
            joined_seq: self.participants.len() as u32,
            created_at: now,
            updated_at: now,
        };

        self.participants.push(participant.clone());
        Ok(participant)
    }

    /// Apply damage or healing to one participant
    pub fn apply_health_delta(
        &mut self,
        id: &str,
        delta: &HealthDelta,
    ) -> Result<(Participant, HealthChange), CombatError> {
        let participant = self.get_mut(id)?;
        let mut hp = participant.hit_points();
        let change = hp.apply(delta);
        participant.set_hit_points(hp);
        participant.touch();
        Ok((participant.clone(), change))
    }

    /// Replace the whole condition list
    pub fn set_conditions(
        &mut self,
        id: &str,
        list: Vec<Condition>,
    ) -> Result<Participant, CombatError> {
        let list = conditions::normalize(list)?;
        let participant = self.get_mut(id)?;
        participant.conditions = list;
        participant.touch();
        Ok(participant.clone())
    }

    /// Apply a partial update atomically
    pub fn update(&mut self, id: &str, patch: ParticipantPatch) -> Result<Participant, CombatError> {
        let participant = self.get_mut(id)?;
        let next = patch.applied_to(participant)?;
        *participant = next.clone();
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combat::dice::ScriptedDice;

    fn registry_with(names: &[(&str, i32)]) -> ParticipantRegistry {
        let mut registry = ParticipantRegistry::new();
        for (i, (name, init)) in names.iter().enumerate() {
            registry
                .add("s1", NewParticipant::named(*name, *init, 20), None, i as u32)
                .unwrap();
        }
        registry
    }

    #[test]
    fn test_add_defaults() {
        let mut registry = ParticipantRegistry::new();
        let p = registry
            .add("s1", NewParticipant::named("Goblin", 12, 7), None, 0)
            .unwrap();
        assert_eq!(p.current_hit_points, 7);
        assert_eq!(p.temporary_hit_points, 0);
        assert_eq!(p.armor_class, DEFAULT_ARMOR_CLASS);
        assert_eq!(p.kind, ParticipantType::Npc);
        assert!(p.is_visible);
        assert!(p.is_active);
        assert_eq!(p.joined_seq, 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_add_validation() {
        let mut registry = ParticipantRegistry::new();

        let err = registry
            .add("s1", NewParticipant::named("Ghost", 0, 0), None, 0)
            .unwrap_err();
        assert!(matches!(err, CombatError::Validation(_)));

        let mut attrs = NewParticipant::named("Orc", 0, 10);
        attrs.current_hit_points = Some(11);
        assert!(registry.add("s1", attrs, None, 0).is_err());

        let attrs = NewParticipant {
            max_hit_points: Some(5),
            ..Default::default()
        };
        assert!(registry.add("s1", attrs, None, 0).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_prefill_from_character() {
        let sheet = CharacterSheet {
            id: "c1".into(),
            name: "Thalia".into(),
            class: "ranger".into(),
            level: 3,
            dexterity: 16,
            max_hit_points: 28,
            current_hit_points: 21,
            temporary_hit_points: 2,
            armor_class: 15,
            initiative_bonus: None,
            ..Default::default()
        };
        let mut attrs = NewParticipant {
            name: Some("Thalia the Swift".into()),
            ..Default::default()
        };
        attrs.prefill(&sheet);

        assert_eq!(attrs.character_id.as_deref(), Some("c1"));
        assert_eq!(attrs.name.as_deref(), Some("Thalia the Swift"));
        assert_eq!(attrs.kind, Some(ParticipantType::Player));
        assert_eq!(attrs.armor_class, Some(15));
        assert_eq!(attrs.current_hit_points, Some(21));
        assert_eq!(attrs.temporary_hit_points, Some(2));
    }

    #[test]
    fn test_roll_initiative() {
        let mut dice = ScriptedDice::new([14]);
        let (initiative, natural) = roll_initiative(3, &mut dice).unwrap();
        assert_eq!(initiative, 17);
        assert_eq!(natural, 14);

        let mut dice = ScriptedDice::new([14]);
        assert!(matches!(
            roll_initiative(i32::MAX, &mut dice),
            Err(CombatError::Validation(_))
        ));
    }

    #[test]
    fn test_health_delta_updates_participant() {
        let mut registry = registry_with(&[("Fighter", 10)]);
        let id = registry.iter().next().unwrap().id.clone();

        registry.apply_health_delta(&id, &HealthDelta::temporary(3)).unwrap();
        let (p, change) = registry.apply_health_delta(&id, &HealthDelta::damage(10)).unwrap();
        assert_eq!(p.temporary_hit_points, 0);
        assert_eq!(p.current_hit_points, 13);
        assert_eq!(change.absorbed, 3);

        let err = registry
            .apply_health_delta("missing", &HealthDelta::damage(1))
            .unwrap_err();
        assert!(matches!(err, CombatError::NotFound(_)));
    }

    #[test]
    fn test_set_conditions_replaces() {
        let mut registry = registry_with(&[("Rogue", 10)]);
        let id = registry.iter().next().unwrap().id.clone();

        registry
            .set_conditions(&id, vec![Condition::new("prone"), Condition::new("Poisoned")])
            .unwrap();
        let p = registry.set_conditions(&id, vec![Condition::new("stunned")]).unwrap();
        assert_eq!(p.conditions, vec![Condition::new("stunned")]);
    }

    #[test]
    fn test_patch_is_atomic() {
        let mut registry = registry_with(&[("Cleric", 10)]);
        let id = registry.iter().next().unwrap().id.clone();

        let patch = ParticipantPatch {
            name: Some("Renamed".into()),
            max_hit_points: Some(0),
            ..Default::default()
        };
        assert!(registry.update(&id, patch).is_err());
        assert_eq!(registry.get(&id).unwrap().name, "Cleric");
    }

    #[test]
    fn test_patch_clamps_current_to_max() {
        let mut registry = registry_with(&[("Wizard", 10)]);
        let id = registry.iter().next().unwrap().id.clone();

        let patch = ParticipantPatch {
            max_hit_points: Some(12),
            is_active: Some(false),
            ..Default::default()
        };
        let p = registry.update(&id, patch).unwrap();
        assert_eq!(p.max_hit_points, 12);
        assert_eq!(p.current_hit_points, 12);
        assert!(!p.is_active);
    }

    #[test]
    fn test_from_stored_restores_insertion_order() {
        let registry = registry_with(&[("A", 1), ("B", 2), ("C", 3)]);
        let mut stored: Vec<Participant> = registry.iter().cloned().collect();
        stored.reverse();
        let restored = ParticipantRegistry::from_stored(stored);
        let names: Vec<&str> = restored.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
    }
}
