use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use gh_watchbot::config;
use gh_watchbot::db;
use gh_watchbot::ledger::Ledger;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Delete deduplication records older than the retention window and exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override app.retention_days
    #[arg(long)]
    days: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let ledger = Ledger::new(pool);

    let days = args.days.unwrap_or(cfg.app.retention_days).max(1);
    let before = ledger.count().await?;
    let removed = ledger.sweep(days).await?;
    info!(removed, before, days, "ledger sweep finished");
    println!("removed {} of {} records older than {} days", removed, before, days);

    ledger.close().await;
    Ok(())
}
