use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use gh_watchbot::channel::event_channel;
use gh_watchbot::config;
use gh_watchbot::db;
use gh_watchbot::github::GitHubClient;
use gh_watchbot::handlers;
use gh_watchbot::ledger::{run_sweeper, Ledger};
use gh_watchbot::notifier::Notifier;
use gh_watchbot::poller::Poller;
use gh_watchbot::telegram::TelegramMessenger;
use gh_watchbot::webhook::{self, WebhookState};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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
    let ledger = Ledger::new(pool.clone());

    let bot = Bot::new(cfg.telegram.bot_token.clone());
    let github = GitHubClient::new(cfg.github.token().map(str::to_owned))?;
    let cancel = CancellationToken::new();
    let (events, receiver) = event_channel(cfg.app.event_buffer);

    let notifier = Notifier::new(
        pool.clone(),
        ledger.clone(),
        Arc::new(TelegramMessenger::new(bot.clone())),
    );
    let consumer = tokio::spawn(notifier.run(receiver));

    let poller = if cfg.github.mode.polling() {
        let poller = Poller::new(
            Arc::new(github.clone()),
            pool.clone(),
            ledger.clone(),
            events.clone(),
            Duration::from_secs(cfg.github.poll_interval_seconds),
            cfg.github.poll_concurrency,
        );
        Some(tokio::spawn(poller.run(cancel.clone())))
    } else {
        None
    };

    let sweeper = tokio::spawn(run_sweeper(
        ledger.clone(),
        cfg.app.retention_days,
        Duration::from_secs(cfg.app.sweep_interval_hours * 3600),
        cancel.clone(),
    ));

    let app = if cfg.github.mode.webhook() {
        if cfg.github.webhook_secret().is_none() {
            warn!("no webhook secret configured; deliveries are not verified");
        }
        webhook::router(WebhookState::new(cfg.github.webhook_secret(), events.clone()))
    } else {
        webhook::health_router()
    };
    // Remaining senders live in the poller and the router.
    drop(events);

    let address = cfg.server.address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {}", address))?;
    info!(%address, mode = ?cfg.github.mode, "http server listening");
    let http_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { http_cancel.cancelled().await })
            .await
    });

    info!("starting telegram bot");
    let handler_pool = pool.clone();
    let started_at = chrono::Utc::now();
    teloxide::repl(bot, move |bot: Bot, msg: Message| {
        let pool = handler_pool.clone();
        let github = github.clone();
        async move {
            if let Err(err) = handlers::handle_update(&bot, &pool, &github, started_at, &msg).await {
                error!(?err, "failed to handle update");
            }
            respond(())
        }
    })
    .await;

    info!("shutting down");
    cancel.cancel();
    if let Some(poller) = poller {
        poller.await?;
    }
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(?err, "http server error"),
        Err(err) => warn!(?err, "http server task failed"),
    }
    consumer.await?;
    sweeper.await?;
    ledger.close().await;
    info!("stopped");
    Ok(())
}
