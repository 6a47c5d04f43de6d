//! Authentication API endpoints

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::{ApiError, ApiJson, AppState};
use crate::auth::{Account, Role};

/// Build auth router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/validate", get(validate))
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub role: Option<String>,
}

/// Returned by register and login
#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub account_id: String,
    pub username: String,
    pub role: Role,
}

impl AuthResponse {
    fn new(account: Account, token: String) -> Self {
        Self {
            token,
            account_id: account.id,
            username: account.username,
            role: account.role,
        }
    }
}

async fn register(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let role = match req.role.as_deref() {
        Some(role) => role.parse()?,
        None => Role::Player,
    };
    let (account, token) = state
        .accounts
        .register(&req.username, &req.password, role)
        .await?;
    tracing::info!(username = %account.username, role = account.role.as_str(), "Account registered");
    Ok((StatusCode::CREATED, Json(AuthResponse::new(account, token))))
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

async fn login(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (account, token) = state.accounts.login(&req.username, &req.password).await?;
    Ok(Json(AuthResponse::new(account, token)))
}

#[derive(Debug, Deserialize)]
pub struct LogoutRequest {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    pub success: bool,
}

async fn logout(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<LogoutRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let success = state.accounts.logout(&req.token).await?;
    Ok(Json(LogoutResponse { success }))
}

#[derive(Debug, Deserialize)]
pub struct ValidateQuery {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

async fn validate(
    State(state): State<AppState>,
    Query(params): Query<ValidateQuery>,
) -> impl IntoResponse {
    match state.accounts.validate_token(&params.token).await {
        Ok(Some(account)) => Json(ValidateResponse {
            valid: true,
            account_id: Some(account.id),
            username: Some(account.username),
            role: Some(account.role),
        }),
        _ => Json(ValidateResponse {
            valid: false,
            account_id: None,
            username: None,
            role: None,
        }),
    }
}
