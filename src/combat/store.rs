//! Persistence interface for combat records

use async_trait::async_trait;
use thiserror::Error;

use super::action::CombatAction;
use super::error::CombatError;
use super::participant::Participant;
use super::session::CombatSession;

/// Failure inside a [`CombatStore`] backend
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<StoreError> for CombatError {
    fn from(err: StoreError) -> Self {
        CombatError::Transport(err.to_string())
    }
}

/// Durable storage for sessions, participants and actions
#[async_trait]
pub trait CombatStore: Send + Sync {
    async fn insert_session(&self, session: &CombatSession) -> Result<(), StoreError>;

    async fn update_session(&self, session: &CombatSession) -> Result<(), StoreError>;

    async fn get_session(&self, id: &str) -> Result<Option<CombatSession>, StoreError>;

    /// Newest first, optionally limited to one campaign
    async fn list_sessions(&self, campaign_id: Option<&str>) -> Result<Vec<CombatSession>, StoreError>;

    /// Insert or replace by id
    async fn upsert_participant(&self, participant: &Participant) -> Result<(), StoreError>;

    /// Insertion order
    async fn list_participants(&self, session_id: &str) -> Result<Vec<Participant>, StoreError>;

    async fn insert_action(&self, action: &CombatAction) -> Result<(), StoreError>;

    /// Insertion order
    async fn list_actions(&self, session_id: &str) -> Result<Vec<CombatAction>, StoreError>;
}
