//! skirmishd - tabletop combat tracker daemon
//!
//! Runs initiative-ordered combat sessions for tabletop RPG groups and
//! streams every change to connected clients over WebSocket.

pub mod api;
pub mod auth;
pub mod characters;
pub mod combat;
pub mod db;
pub mod realtime;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::Router;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use api::{AppState, ConnectionManager};
use auth::AccountService;
use characters::SqliteCharacters;
use combat::CombatManager;
use db::{Database, SqliteCombatStore};
use realtime::{BroadcastChannel, DEFAULT_EVENT_BUFFER};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// None = in-memory
    pub db_path: Option<String>,
    /// Per-session event buffer before slow subscribers are told to resync
    pub event_buffer: usize,
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            db_path: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
            request_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Defaults, then the TOML file if given, then `SKIRMISHD_*` variables
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = config_file {
            figment = figment.merge(Toml::file(path));
        }
        let config = figment.merge(Env::prefixed("SKIRMISHD_")).extract()?;
        Ok(config)
    }
}

/// The skirmishd server instance
pub struct Server {
    config: Config,
    db: Arc<Database>,
    state: AppState,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    /// Create a new server instance
    pub async fn new(config: Config) -> Result<Self> {
        let db = Arc::new(Database::new(config.db_path.as_deref()).await?);
        let pool = db.pool().clone();

        let combat = CombatManager::new(
            Arc::new(SqliteCombatStore::new(pool.clone())),
            Arc::new(BroadcastChannel::new(config.event_buffer)),
            Arc::new(SqliteCharacters::new(pool.clone())),
        );
        let state = AppState {
            db: db.clone(),
            accounts: Arc::new(AccountService::new(pool)),
            combat: Arc::new(combat),
            connections: Arc::new(ConnectionManager::new()),
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            db,
            state,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Get the database handle
    pub fn db(&self) -> Arc<Database> {
        self.db.clone()
    }

    /// Build the router
    fn router(&self) -> Router {
        api::router(
            self.state.clone(),
            Duration::from_secs(self.config.request_timeout_secs),
        )
    }

    /// Bind the configured address and run until shutdown
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Run on an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("skirmishd listening on {}", listener.local_addr()?);

        let router = self.router();
        let mut shutdown_rx = self.shutdown_rx.clone();

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_rx.changed().await.ok();
            })
            .await?;

        info!("skirmishd shutdown complete");
        Ok(())
    }

    /// Signal the server to shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Get the configured bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }
}
