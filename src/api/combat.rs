//! Combat session endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::{ApiError, ApiJson, AppState, Caller};
use crate::combat::{
    CombatSession, Condition, HealthDelta, NewAction, NewParticipant, NewSession, ParticipantPatch,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/combat", post(create_session).get(list_sessions))
        .route("/combat/{id}", get(get_session))
        .route("/combat/{id}/participants", post(add_participant))
        .route("/combat/{id}/participants/{pid}", put(update_participant))
        .route("/combat/{id}/participants/{pid}/health", post(apply_health))
        .route("/combat/{id}/participants/{pid}/conditions", put(set_conditions))
        .route("/combat/{id}/start", post(start))
        .route("/combat/{id}/next-turn", post(next_turn))
        .route("/combat/{id}/toggle-status", post(toggle_status))
        .route("/combat/{id}/end", post(end))
        .route("/combat/{id}/actions", post(record_action).get(list_actions))
}

async fn create_session(
    State(state): State<AppState>,
    Caller(identity): Caller,
    ApiJson(attrs): ApiJson<NewSession>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.combat.create_session(&identity, attrs).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    campaign_id: Option<String>,
}

async fn list_sessions(
    State(state): State<AppState>,
    Caller(_identity): Caller,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<CombatSession>>, ApiError> {
    let sessions = state
        .combat
        .list_sessions(query.campaign_id.as_deref())
        .await?;
    Ok(Json(sessions))
}

async fn get_session(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.combat.get_snapshot(&identity, &id).await?))
}

async fn add_participant(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path(id): Path<String>,
    ApiJson(attrs): ApiJson<NewParticipant>,
) -> Result<impl IntoResponse, ApiError> {
    let participant = state.combat.add_participant(&identity, &id, attrs).await?;
    Ok((StatusCode::CREATED, Json(participant)))
}

async fn update_participant(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path((id, pid)): Path<(String, String)>,
    ApiJson(patch): ApiJson<ParticipantPatch>,
) -> Result<impl IntoResponse, ApiError> {
    let participant = state
        .combat
        .update_participant(&identity, &id, &pid, patch)
        .await?;
    Ok(Json(participant))
}

async fn apply_health(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path((id, pid)): Path<(String, String)>,
    ApiJson(delta): ApiJson<HealthDelta>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state
        .combat
        .apply_health_delta(&identity, &id, &pid, delta)
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
struct ConditionsRequest {
    conditions: Vec<Condition>,
}

async fn set_conditions(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path((id, pid)): Path<(String, String)>,
    ApiJson(req): ApiJson<ConditionsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let participant = state
        .combat
        .set_conditions(&identity, &id, &pid, req.conditions)
        .await?;
    Ok(Json(participant))
}

async fn start(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path(id): Path<String>,
) -> Result<Json<CombatSession>, ApiError> {
    Ok(Json(state.combat.start(&identity, &id).await?))
}

#[derive(Debug, Serialize)]
struct TurnResponse {
    session: CombatSession,
    new_round: bool,
}

async fn next_turn(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path(id): Path<String>,
) -> Result<Json<TurnResponse>, ApiError> {
    let (session, new_round) = state.combat.advance_turn(&identity, &id).await?;
    Ok(Json(TurnResponse { session, new_round }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ToggleAction {
    Pause,
    Resume,
}

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    action: ToggleAction,
}

async fn toggle_status(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<ToggleRequest>,
) -> Result<Json<CombatSession>, ApiError> {
    let session = match req.action {
        ToggleAction::Pause => state.combat.pause(&identity, &id).await?,
        ToggleAction::Resume => state.combat.resume(&identity, &id).await?,
    };
    Ok(Json(session))
}

async fn end(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path(id): Path<String>,
) -> Result<Json<CombatSession>, ApiError> {
    Ok(Json(state.combat.end(&identity, &id).await?))
}

async fn record_action(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path(id): Path<String>,
    ApiJson(new): ApiJson<NewAction>,
) -> Result<impl IntoResponse, ApiError> {
    let action = state.combat.record_action(&identity, &id, new).await?;
    Ok((StatusCode::CREATED, Json(action)))
}

#[derive(Debug, Deserialize)]
struct ActionsQuery {
    round: Option<u32>,
}

async fn list_actions(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path(id): Path<String>,
    Query(query): Query<ActionsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let actions = state
        .combat
        .list_actions(&identity, &id, query.round)
        .await?;
    Ok(Json(actions))
}
