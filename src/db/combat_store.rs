//! SQLite-backed combat store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

use crate::combat::{CombatAction, CombatSession, CombatStore, Participant, SessionStatus, StoreError};

/// Combat records in the shared SQLite database
#[derive(Clone)]
pub struct SqliteCombatStore {
    pool: SqlitePool,
}

impl SqliteCombatStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// Unit enums are stored by their serde name
fn enum_text<T: Serialize>(value: &T) -> Result<String, StoreError> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(StoreError::Corrupt(format!("expected string enum, got {}", other))),
    }
}

fn parse_enum<T: DeserializeOwned>(text: &str) -> Result<T, StoreError> {
    Ok(serde_json::from_value(serde_json::Value::String(text.to_string()))?)
}

fn parse_time(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {:?}: {}", text, e)))
}

fn to_u32(value: i64, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{} out of range: {}", column, value)))
}

fn session_from_row(row: &SqliteRow) -> Result<CombatSession, StoreError> {
    let status: String = row.try_get("status")?;
    let turn_order: String = row.try_get("turn_order")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let index: i64 = row.try_get("current_turn_index")?;

    Ok(CombatSession {
        id: row.try_get("id")?,
        campaign_id: row.try_get("campaign_id")?,
        controller_id: row.try_get("controller_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        status: SessionStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown status {:?}", status)))?,
        round: to_u32(row.try_get("round")?, "round")?,
        current_turn_index: to_u32(index, "current_turn_index")? as usize,
        turn_order: serde_json::from_str(&turn_order)?,
        is_active: row.try_get("is_active")?,
        notes: row.try_get("notes")?,
        created_at: parse_time(&created_at)?,
        updated_at: parse_time(&updated_at)?,
    })
}

fn participant_from_row(row: &SqliteRow) -> Result<Participant, StoreError> {
    let kind: String = row.try_get("kind")?;
    let conditions: String = row.try_get("conditions")?;
    let initiative: i64 = row.try_get("initiative")?;
    let initiative_roll: Option<i64> = row.try_get("initiative_roll")?;
    let armor_class: i64 = row.try_get("armor_class")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Participant {
        id: row.try_get("id")?,
        combat_session_id: row.try_get("combat_session_id")?,
        character_id: row.try_get("character_id")?,
        name: row.try_get("name")?,
        kind: parse_enum(&kind)?,
        initiative: initiative as i32,
        initiative_roll: initiative_roll
            .map(|r| to_u32(r, "initiative_roll"))
            .transpose()?,
        armor_class: armor_class as i32,
        max_hit_points: to_u32(row.try_get("max_hit_points")?, "max_hit_points")?,
        current_hit_points: to_u32(row.try_get("current_hit_points")?, "current_hit_points")?,
        temporary_hit_points: to_u32(row.try_get("temporary_hit_points")?, "temporary_hit_points")?,
        conditions: serde_json::from_str(&conditions)?,
        order: to_u32(row.try_get("turn_rank")?, "turn_rank")?,
        is_visible: row.try_get("is_visible")?,
        is_active: row.try_get("is_active")?,
        notes: row.try_get("notes")?,
        joined_seq: to_u32(row.try_get("joined_seq")?, "joined_seq")?,
        created_at: parse_time(&created_at)?,
        updated_at: parse_time(&updated_at)?,
    })
}

fn action_from_row(row: &SqliteRow) -> Result<CombatAction, StoreError> {
    let action_type: String = row.try_get("action_type")?;
    let roll_data: Option<String> = row.try_get("roll_data")?;
    let damage: Option<i64> = row.try_get("damage")?;
    let damage_type: Option<String> = row.try_get("damage_type")?;
    let save_type: Option<String> = row.try_get("save_type")?;
    let save_dc: Option<i64> = row.try_get("save_dc")?;
    let seq: i64 = row.try_get("seq")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(CombatAction {
        id: row.try_get("id")?,
        combat_session_id: row.try_get("combat_session_id")?,
        round: to_u32(row.try_get("round")?, "round")?,
        actor_id: row.try_get("actor_id")?,
        target_id: row.try_get("target_id")?,
        action_type: parse_enum(&action_type)?,
        action_name: row.try_get("action_name")?,
        description: row.try_get("description")?,
        roll_data: roll_data.map(|r| serde_json::from_str(&r)).transpose()?,
        damage: damage.map(|d| to_u32(d, "damage")).transpose()?,
        damage_type: damage_type.map(|d| parse_enum(&d)).transpose()?,
        success: row.try_get("success")?,
        save_type: save_type.map(|s| parse_enum(&s)).transpose()?,
        save_dc: save_dc.map(|d| to_u32(d, "save_dc")).transpose()?,
        seq: seq as u64,
        created_at: parse_time(&created_at)?,
    })
}

#[async_trait]
impl CombatStore for SqliteCombatStore {
    async fn insert_session(&self, session: &CombatSession) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO combat_sessions
                (id, campaign_id, controller_id, name, description, status, round,
                 current_turn_index, turn_order, is_active, notes, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.campaign_id)
        .bind(&session.controller_id)
        .bind(&session.name)
        .bind(&session.description)
        .bind(session.status.as_str())
        .bind(session.round as i64)
        .bind(session.current_turn_index as i64)
        .bind(serde_json::to_string(&session.turn_order)?)
        .bind(session.is_active)
        .bind(&session.notes)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_session(&self, session: &CombatSession) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE combat_sessions
             SET name = ?, description = ?, status = ?, round = ?, current_turn_index = ?,
                 turn_order = ?, is_active = ?, notes = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&session.name)
        .bind(&session.description)
        .bind(session.status.as_str())
        .bind(session.round as i64)
        .bind(session.current_turn_index as i64)
        .bind(serde_json::to_string(&session.turn_order)?)
        .bind(session.is_active)
        .bind(&session.notes)
        .bind(session.updated_at.to_rfc3339())
        .bind(&session.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Corrupt(format!("session {} missing", session.id)));
        }
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<CombatSession>, StoreError> {
        let row = sqlx::query("SELECT * FROM combat_sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn list_sessions(&self, campaign_id: Option<&str>) -> Result<Vec<CombatSession>, StoreError> {
        let rows = match campaign_id {
            Some(campaign) => {
                sqlx::query(
                    "SELECT * FROM combat_sessions WHERE campaign_id = ? ORDER BY created_at DESC",
                )
                .bind(campaign)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM combat_sessions ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(session_from_row).collect()
    }

    async fn upsert_participant(&self, participant: &Participant) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO combat_participants
                (id, combat_session_id, character_id, name, kind, initiative, initiative_roll,
                 armor_class, max_hit_points, current_hit_points, temporary_hit_points,
                 conditions, turn_rank, is_visible, is_active, notes, joined_seq,
                 created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                kind = excluded.kind,
                initiative = excluded.initiative,
                armor_class = excluded.armor_class,
                max_hit_points = excluded.max_hit_points,
                current_hit_points = excluded.current_hit_points,
                temporary_hit_points = excluded.temporary_hit_points,
                conditions = excluded.conditions,
                turn_rank = excluded.turn_rank,
                is_visible = excluded.is_visible,
                is_active = excluded.is_active,
                notes = excluded.notes,
                updated_at = excluded.updated_at",
        )
        .bind(&participant.id)
        .bind(&participant.combat_session_id)
        .bind(&participant.character_id)
        .bind(&participant.name)
        .bind(enum_text(&participant.kind)?)
        .bind(participant.initiative as i64)
        .bind(participant.initiative_roll.map(i64::from))
        .bind(participant.armor_class as i64)
        .bind(participant.max_hit_points as i64)
        .bind(participant.current_hit_points as i64)
        .bind(participant.temporary_hit_points as i64)
        .bind(serde_json::to_string(&participant.conditions)?)
        .bind(participant.order as i64)
        .bind(participant.is_visible)
        .bind(participant.is_active)
        .bind(&participant.notes)
        .bind(participant.joined_seq as i64)
        .bind(participant.created_at.to_rfc3339())
        .bind(participant.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_participants(&self, session_id: &str) -> Result<Vec<Participant>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM combat_participants WHERE combat_session_id = ? ORDER BY joined_seq",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(participant_from_row).collect()
    }

    async fn insert_action(&self, action: &CombatAction) -> Result<(), StoreError> {
        let roll_data = action
            .roll_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let damage_type = action.damage_type.as_ref().map(enum_text).transpose()?;
        let save_type = action.save_type.as_ref().map(enum_text).transpose()?;

        sqlx::query(
            "INSERT INTO combat_actions
                (id, combat_session_id, seq, round, actor_id, target_id, action_type,
                 action_name, description, roll_data, damage, damage_type, success,
                 save_type, save_dc, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&action.id)
        .bind(&action.combat_session_id)
        .bind(action.seq as i64)
        .bind(action.round as i64)
        .bind(&action.actor_id)
        .bind(&action.target_id)
        .bind(enum_text(&action.action_type)?)
        .bind(&action.action_name)
        .bind(&action.description)
        .bind(roll_data)
        .bind(action.damage.map(i64::from))
        .bind(damage_type)
        .bind(action.success)
        .bind(save_type)
        .bind(action.save_dc.map(i64::from))
        .bind(action.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_actions(&self, session_id: &str) -> Result<Vec<CombatAction>, StoreError> {
        let rows = sqlx::query("SELECT * FROM combat_actions WHERE combat_session_id = ? ORDER BY seq")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(action_from_row).collect()
    }
}
