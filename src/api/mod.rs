//! HTTP API module - REST endpoints and WebSocket

mod auth;
mod combat;
mod dice;
mod websocket;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{FromRequest, FromRequestParts, Request, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{de::DeserializeOwned, Serialize};
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, error};

use crate::auth::{AccountService, AuthError, Identity};
use crate::combat::{CombatError, CombatManager};
use crate::db::Database;
pub use dice::RollRequest;
pub use websocket::{ClientMessage, ConnectionManager, ServerMessage};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub accounts: Arc<AccountService>,
    pub combat: Arc<CombatManager>,
    pub connections: Arc<ConnectionManager>,
}

/// Build the API router
pub fn router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(root))
        .route("/ws", get(websocket::ws_handler))
        .merge(auth::router())
        .merge(combat::router())
        .merge(dice::router())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error body shared by every endpoint
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
}

/// Errors returned from handlers
#[derive(Debug)]
pub enum ApiError {
    Combat(CombatError),
    Auth(AuthError),
    /// Request body missing or not the expected JSON
    Body(String),
}

impl From<CombatError> for ApiError {
    fn from(e: CombatError) -> Self {
        ApiError::Combat(e)
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        ApiError::Auth(e)
    }
}

impl ApiError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Combat(e) => {
                let status = match e {
                    CombatError::Validation(_) => StatusCode::BAD_REQUEST,
                    CombatError::InvalidTransition(_) => StatusCode::CONFLICT,
                    CombatError::PermissionDenied(_) => StatusCode::FORBIDDEN,
                    CombatError::NotFound(_) => StatusCode::NOT_FOUND,
                    CombatError::Transport(_) => StatusCode::BAD_GATEWAY,
                };
                (status, e.kind())
            }
            ApiError::Auth(e) => match e {
                AuthError::UsernameExists => (StatusCode::CONFLICT, "username_exists"),
                AuthError::InvalidCredentials | AuthError::InvalidToken => {
                    (StatusCode::UNAUTHORIZED, "unauthorized")
                }
                AuthError::MissingCredentials | AuthError::UnknownRole(_) => {
                    (StatusCode::BAD_REQUEST, "validation")
                }
                AuthError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            },
            ApiError::Body(_) => (StatusCode::BAD_REQUEST, "validation"),
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Combat(e) => e.to_string(),
            ApiError::Auth(AuthError::Database(_)) => "internal error".to_string(),
            ApiError::Auth(e) => e.to_string(),
            ApiError::Body(message) => message.clone(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        match &self {
            // already reported where the commit happened
            ApiError::Combat(CombatError::Transport(_)) => {}
            ApiError::Auth(AuthError::Database(e)) => error!(error = %e, "Account lookup failed"),
            other => debug!(status = %status, error = ?other, "Request rejected"),
        }
        let body = ErrorResponse {
            error: kind,
            message: self.message(),
        };
        (status, Json(body)).into_response()
    }
}

/// The authenticated caller, from `Authorization: Bearer` or `?token=`
pub struct Caller(pub Identity);

fn bearer_token(parts: &Parts) -> Option<String> {
    let from_header = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string());
    from_header.or_else(|| {
        parts.uri.query().and_then(|query| {
            query
                .split('&')
                .find_map(|pair| pair.strip_prefix("token="))
                .map(str::to_string)
        })
    })
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(AuthError::InvalidToken)?;
        let identity = state.accounts.identify(&token).await?;
        Ok(Caller(identity))
    }
}

/// `Json` whose rejections use the shared error body
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| ApiError::Body(rejection.body_text()))?;
        Ok(ApiJson(value))
    }
}

/// Root endpoint
async fn root() -> impl IntoResponse {
    Json(RootResponse {
        name: "skirmishd",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
struct RootResponse {
    name: &'static str,
    version: &'static str,
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let connections = state.connections.connection_count().await;
    let accounts = state.connections.account_count().await;
    match state.db.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "healthy",
                database: "ok",
                connections,
                accounts,
            }),
        ),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "unhealthy",
                database: "error",
                connections,
                accounts,
            }),
        ),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    database: &'static str,
    connections: usize,
    accounts: usize,
}
