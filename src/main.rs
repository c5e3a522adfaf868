//! Headless trading server: load config, run migrations, start the
//! supervision tree and wait for ctrl-c.

use anyhow::{Context, Result};
use clap::Parser;
use helmsman::application::supervisor::{Repositories, SupervisorActor, SupervisorMsg};
use helmsman::config::Config;
use helmsman::infrastructure::persistence::Database;
use helmsman::infrastructure::persistence::repositories::{
    SqliteOrderRepository, SqliteSettingsRepository, SqliteSnapshotRepository,
    SqliteTradeRepository,
};
use helmsman::runtime::{SpawnOpts, spawn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "helmsman", about = "Multi-exchange trading bot core")]
struct Args {
    /// Path to the TOML configuration document.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn load_scripts(directory: &str) -> Result<Vec<(String, String)>> {
    let mut scripts = Vec::new();
    let dir = std::path::Path::new(directory);
    if !dir.is_dir() {
        return Ok(scripts);
    }
    for entry in std::fs::read_dir(dir).context("failed to read strategy directory")? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("rhai") {
            continue;
        }
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unnamed")
            .to_string();
        let source = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read strategy script {}", path.display()))?;
        scripts.push((name, source));
    }
    scripts.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(scripts)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with_target(false)
        .init();

    info!("helmsman {} starting", env!("CARGO_PKG_VERSION"));

    let database = Database::open(&config.database_path)
        .await
        .context("failed to open database")?;
    let repositories = Repositories {
        orders: Arc::new(SqliteOrderRepository::new(database.clone())),
        trades: Arc::new(SqliteTradeRepository::new(database.clone())),
        settings: Arc::new(SqliteSettingsRepository::new(database.clone())),
        snapshots: Some(Arc::new(SqliteSnapshotRepository::new(database.clone()))),
    };

    let scripts = load_scripts(&config.strategies.directory)?;
    info!(
        scripts = scripts.len(),
        exchanges = config.enabled_exchanges().count(),
        "configuration loaded"
    );

    let supervisor = SupervisorActor::new(config, repositories, scripts);
    let (addr, handle) = spawn("supervisor", supervisor, SpawnOpts::default());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown signal received");

    let _ = addr
        .ask(|reply| SupervisorMsg::Shutdown { reply }, Duration::from_secs(30))
        .await;
    handle.stop(Duration::from_secs(5)).await;
    info!("helmsman stopped");
    Ok(())
}
