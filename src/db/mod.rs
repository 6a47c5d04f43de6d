//! Database module - SQLite schema for accounts, characters and combat

mod combat_store;

#[cfg(test)]
pub mod test_utils;

pub use combat_store::SqliteCombatStore;

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::info;

/// Database handle wrapping SQLite connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    /// If path is None, uses in-memory database (for testing)
    pub async fn new(path: Option<&str>) -> Result<Self> {
        let (conn_str, max_connections) = match path {
            Some(p) => (format!("sqlite:{}?mode=rwc", p), 10),
            // every connection to :memory: is its own database
            None => ("sqlite::memory:".to_string(), 1),
        };

        let options = SqliteConnectOptions::from_str(&conn_str)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        let mut pool_options = SqlitePoolOptions::new().max_connections(max_connections);
        if path.is_none() {
            // the database lives only as long as its connection
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations...");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                salt TEXT NOT NULL,
                token TEXT,
                role TEXT NOT NULL DEFAULT 'player',
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Owned by the campaign side; read-only from here
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS characters (
                id TEXT PRIMARY KEY,
                owner_id TEXT REFERENCES accounts(id),
                campaign_id TEXT,
                name TEXT NOT NULL,
                class TEXT NOT NULL DEFAULT '',
                level INTEGER NOT NULL DEFAULT 1,
                strength INTEGER NOT NULL DEFAULT 10,
                dexterity INTEGER NOT NULL DEFAULT 10,
                constitution INTEGER NOT NULL DEFAULT 10,
                intelligence INTEGER NOT NULL DEFAULT 10,
                wisdom INTEGER NOT NULL DEFAULT 10,
                charisma INTEGER NOT NULL DEFAULT 10,
                max_hit_points INTEGER NOT NULL,
                current_hit_points INTEGER NOT NULL,
                temporary_hit_points INTEGER NOT NULL DEFAULT 0,
                armor_class INTEGER NOT NULL DEFAULT 10,
                initiative_bonus INTEGER,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS combat_sessions (
                id TEXT PRIMARY KEY,
                campaign_id TEXT,
                controller_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                status TEXT NOT NULL,
                round INTEGER NOT NULL DEFAULT 0,
                current_turn_index INTEGER NOT NULL DEFAULT 0,
                turn_order TEXT NOT NULL DEFAULT '[]',
                is_active INTEGER NOT NULL DEFAULT 1,
                notes TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS combat_participants (
                id TEXT PRIMARY KEY,
                combat_session_id TEXT NOT NULL REFERENCES combat_sessions(id),
                character_id TEXT,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                initiative INTEGER NOT NULL,
                initiative_roll INTEGER,
                armor_class INTEGER NOT NULL,
                max_hit_points INTEGER NOT NULL,
                current_hit_points INTEGER NOT NULL,
                temporary_hit_points INTEGER NOT NULL,
                conditions TEXT NOT NULL DEFAULT '[]',
                turn_rank INTEGER NOT NULL,
                is_visible INTEGER NOT NULL,
                is_active INTEGER NOT NULL,
                notes TEXT,
                joined_seq INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS combat_actions (
                id TEXT PRIMARY KEY,
                combat_session_id TEXT NOT NULL REFERENCES combat_sessions(id),
                seq INTEGER NOT NULL,
                round INTEGER NOT NULL,
                actor_id TEXT NOT NULL,
                target_id TEXT,
                action_type TEXT NOT NULL,
                action_name TEXT NOT NULL,
                description TEXT,
                roll_data TEXT,
                damage INTEGER,
                damage_type TEXT,
                success INTEGER,
                save_type TEXT,
                save_dc INTEGER,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sessions_campaign ON combat_sessions(campaign_id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_participants_session ON combat_participants(combat_session_id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_actions_session_seq ON combat_actions(combat_session_id, seq)",
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Check if database is healthy
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
