//! Authentication and identity
//!
//! Bearer tokens identify an account; the account's role and id are all
//! the combat layer needs to decide who may control a session.

pub mod accounts;

pub use accounts::{Account, AccountService, AuthError};

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;

/// Account roles, lowest first
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Player,
    GameMaster,
    /// May control any session
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Player => "player",
            Role::GameMaster => "game_master",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "player" => Ok(Role::Player),
            "game_master" | "gm" | "dm" => Ok(Role::GameMaster),
            "admin" => Ok(Role::Admin),
            other => Err(AuthError::UnknownRole(other.to_string())),
        }
    }
}

/// The authenticated caller of a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub account_id: String,
    pub username: String,
    pub role: Role,
}

impl Identity {
    /// Whether this caller may issue mutating commands for a session
    pub fn can_control(&self, controller_id: &str) -> bool {
        self.account_id == controller_id || self.role >= Role::Admin
    }
}

/// Random 256-bit bearer token, hex encoded
pub fn generate_token() -> String {
    let random_bytes: [u8; 32] = rand::rng().random();
    hex::encode(random_bytes)
}

/// Random 128-bit salt, hex encoded
pub fn generate_salt() -> String {
    let random_bytes: [u8; 16] = rand::rng().random();
    hex::encode(random_bytes)
}

/// SHA-256 of salt followed by password
pub fn hash_password(password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn verify_password(password: &str, salt: &str, hash: &str) -> bool {
    hash_password(password, salt) == hash
}
