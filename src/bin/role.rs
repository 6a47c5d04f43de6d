//! skirmishd_role - Grant a role to an existing account
//!
//! Self-registration stops at game_master; this is how admins are made.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use skirmishd::auth::{AccountService, Role};
use skirmishd::db::Database;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// skirmishd account role tool
#[derive(Parser, Debug)]
#[command(
    name = "skirmishd_role",
    version,
    about = "Set the role of a skirmishd account"
)]
struct Args {
    /// Path to the server's SQLite database
    #[arg(short, long)]
    database: PathBuf,

    /// Account to change
    #[arg(short, long)]
    username: String,

    /// player, game_master or admin
    #[arg(short, long)]
    role: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skirmishd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let role: Role = args.role.parse()?;

    let path = args.database.to_string_lossy();
    let db = Database::new(Some(path.as_ref())).await?;
    let accounts = AccountService::new(db.pool().clone());
    accounts
        .set_role(&args.username, role)
        .await
        .map_err(|e| anyhow::anyhow!("could not update {}: {}", args.username, e))?;

    tracing::info!(username = %args.username, role = role.as_str(), "Role updated");
    Ok(())
}
