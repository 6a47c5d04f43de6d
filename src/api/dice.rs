//! Dice rolling endpoint

use axum::{extract::State, routing::post, Json, Router};
use serde::Deserialize;

use super::{ApiError, ApiJson, AppState, Caller};
use crate::combat::{parse_dice, CombatError, DiceRequest, DiceRoll, DieSize, RollLabels};

pub fn router() -> Router<AppState> {
    Router::new().route("/dice/roll", post(roll))
}

/// A roll as clients send it, either as notation or as separate fields
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RollRequest {
    /// e.g. "2d6+3"; overrides the separate fields
    #[serde(default)]
    pub notation: Option<String>,
    #[serde(default)]
    pub dice_type: Option<DieSize>,
    #[serde(default)]
    pub dice_count: Option<u32>,
    #[serde(default)]
    pub modifier: Option<i32>,
    #[serde(default)]
    pub advantage: bool,
    #[serde(default)]
    pub disadvantage: bool,
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

impl RollRequest {
    pub fn into_parts(self) -> Result<(DiceRequest, RollLabels), CombatError> {
        let mut request = match &self.notation {
            Some(notation) => parse_dice(notation)?,
            None => {
                let die = self
                    .dice_type
                    .ok_or_else(|| CombatError::validation("dice_type or notation is required"))?;
                DiceRequest::new(die, self.dice_count.unwrap_or(1), self.modifier.unwrap_or(0))
            }
        };
        request.advantage = self.advantage;
        request.disadvantage = self.disadvantage;
        request.validate()?;

        let labels = RollLabels {
            request_id: self.request_id,
            character_name: self.character_name,
            roll_type: self.roll_type,
            roll_label: self.roll_label,
            is_private: self.is_private,
        };
        Ok((request, labels))
    }
}

async fn roll(
    State(state): State<AppState>,
    Caller(identity): Caller,
    ApiJson(req): ApiJson<RollRequest>,
) -> Result<Json<DiceRoll>, ApiError> {
    let (request, labels) = req.into_parts()?;
    Ok(Json(state.combat.roll_dice(&identity, &request, labels)?))
}
