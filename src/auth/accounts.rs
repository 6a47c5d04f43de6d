//! Account management service
//!
//! Handles account creation, authentication, and token management.

use sqlx::sqlite::SqlitePool;
use thiserror::Error;

use super::{generate_salt, generate_token, hash_password, verify_password, Identity, Role};

/// Account data
#[derive(Debug, Clone, serde::Serialize)]
pub struct Account {
    pub id: String,
    pub username: String,
    pub role: Role,
    pub created_at: String,
}

impl Account {
    pub fn identity(&self) -> Identity {
        Identity {
            account_id: self.id.clone(),
            username: self.username.clone(),
            role: self.role,
        }
    }
}

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("username already exists")]
    UsernameExists,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("missing or invalid token")]
    InvalidToken,

    #[error("username and password are required")]
    MissingCredentials,

    #[error("unknown role: {0}")]
    UnknownRole(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

type AccountRow = (String, String, String, String);

fn account_from_row((id, username, role, created_at): AccountRow) -> Result<Account, AuthError> {
    Ok(Account {
        id,
        username,
        role: role.parse()?,
        created_at,
    })
}

/// Account service for authentication operations
pub struct AccountService {
    pool: SqlitePool,
}

impl AccountService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create an account and log it in
    ///
    /// Self-registration may ask for `player` or `game_master`; admins are
    /// promoted with [`set_role`](Self::set_role).
    pub async fn register(
        &self,
        username: &str,
        password: &str,
        role: Role,
    ) -> Result<(Account, String), AuthError> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(AuthError::MissingCredentials);
        }
        let role = role.min(Role::GameMaster);

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT id FROM accounts WHERE username = ?")
                .bind(username)
                .fetch_optional(&self.pool)
                .await?;
        if existing.is_some() {
            return Err(AuthError::UsernameExists);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let salt = generate_salt();
        let password_hash = hash_password(password, &salt);
        let token = generate_token();
        let now = chrono::Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO accounts (id, username, password_hash, salt, token, role, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(username)
        .bind(&password_hash)
        .bind(&salt)
        .bind(&token)
        .bind(role.as_str())
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let account = Account {
            id,
            username: username.to_string(),
            role,
            created_at: now,
        };
        Ok((account, token))
    }

    /// Login with username and password; issues a fresh token
    pub async fn login(&self, username: &str, password: &str) -> Result<(Account, String), AuthError> {
        let row: Option<(String, String, String, String, String)> = sqlx::query_as(
            "SELECT id, password_hash, salt, role, created_at FROM accounts WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        let (id, stored_hash, salt, role, created_at) = row.ok_or(AuthError::InvalidCredentials)?;
        if !verify_password(password, &salt, &stored_hash) {
            return Err(AuthError::InvalidCredentials);
        }

        let token = generate_token();
        sqlx::query("UPDATE accounts SET token = ? WHERE id = ?")
            .bind(&token)
            .bind(&id)
            .execute(&self.pool)
            .await?;

        let account = account_from_row((id, username.to_string(), role, created_at))?;
        Ok((account, token))
    }

    /// Account for a token, if the token is live
    pub async fn validate_token(&self, token: &str) -> Result<Option<Account>, AuthError> {
        let row: Option<AccountRow> = sqlx::query_as(
            "SELECT id, username, role, created_at FROM accounts WHERE token = ?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        row.map(account_from_row).transpose()
    }

    /// Resolve a bearer token to the caller's identity
    pub async fn identify(&self, token: &str) -> Result<Identity, AuthError> {
        self.validate_token(token)
            .await?
            .map(|account| account.identity())
            .ok_or(AuthError::InvalidToken)
    }

    /// Logout by clearing the token
    pub async fn logout(&self, token: &str) -> Result<bool, AuthError> {
        let result = sqlx::query("UPDATE accounts SET token = NULL WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_role(&self, username: &str, role: Role) -> Result<(), AuthError> {
        let result = sqlx::query("UPDATE accounts SET role = ? WHERE username = ?")
            .bind(role.as_str())
            .bind(username)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AuthError::InvalidCredentials);
        }
        Ok(())
    }
}
