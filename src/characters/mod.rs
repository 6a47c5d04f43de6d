//! Character data access
//!
//! Read-only view of the character sheets kept by the campaign side. Combat
//! only needs enough of a sheet to prefill a participant.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

use crate::combat::StoreError;

/// Character attributes relevant to combat
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharacterSheet {
    pub id: String,
    pub name: String,
    pub class: String,
    pub level: u32,
    pub strength: i32,
    pub dexterity: i32,
    pub constitution: i32,
    pub intelligence: i32,
    pub wisdom: i32,
    pub charisma: i32,
    pub max_hit_points: u32,
    pub current_hit_points: u32,
    pub temporary_hit_points: u32,
    pub armor_class: i32,
    /// Explicit bonus; falls back to the Dexterity modifier
    pub initiative_bonus: Option<i32>,
}

/// Standard ability modifier: floor((score - 10) / 2)
pub fn ability_modifier(score: i32) -> i32 {
    (score - 10).div_euclid(2)
}

impl CharacterSheet {
    pub fn initiative_bonus(&self) -> i32 {
        self.initiative_bonus
            .unwrap_or_else(|| ability_modifier(self.dexterity))
    }
}

/// Source of character sheets
#[async_trait]
pub trait CharacterSource: Send + Sync {
    async fn get_character(&self, id: &str) -> Result<Option<CharacterSheet>, StoreError>;
}

/// Characters from the shared SQLite database
pub struct SqliteCharacters {
    pool: SqlitePool,
}

impl SqliteCharacters {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CharacterSource for SqliteCharacters {
    async fn get_character(&self, id: &str) -> Result<Option<CharacterSheet>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, class, level, strength, dexterity, constitution, intelligence,
                    wisdom, charisma, max_hit_points, current_hit_points, temporary_hit_points,
                    armor_class, initiative_bonus
             FROM characters WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(sheet_from_row).transpose()
    }
}

fn sheet_from_row(row: &SqliteRow) -> Result<CharacterSheet, StoreError> {
    let id: String = row.try_get("id")?;
    let unsigned = |column: &str| -> Result<u32, StoreError> {
        let value: i64 = row.try_get(column)?;
        u32::try_from(value)
            .map_err(|_| StoreError::Corrupt(format!("character {} has bad {}", id, column)))
    };
    let score = |column: &str| -> Result<i32, StoreError> {
        let value: i64 = row.try_get(column)?;
        Ok(value as i32)
    };
    let initiative_bonus: Option<i64> = row.try_get("initiative_bonus")?;

    Ok(CharacterSheet {
        name: row.try_get("name")?,
        class: row.try_get("class")?,
        level: unsigned("level")?,
        strength: score("strength")?,
        dexterity: score("dexterity")?,
        constitution: score("constitution")?,
        intelligence: score("intelligence")?,
        wisdom: score("wisdom")?,
        charisma: score("charisma")?,
        max_hit_points: unsigned("max_hit_points")?,
        current_hit_points: unsigned("current_hit_points")?,
        temporary_hit_points: unsigned("temporary_hit_points")?,
        armor_class: score("armor_class")?,
        initiative_bonus: initiative_bonus.map(|b| b as i32),
        id,
    })
}
