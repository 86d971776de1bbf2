use crate::db;
use crate::github::GitHubClient;
use crate::model::{EventKind, RepoRef};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::SqlitePool;
use teloxide::prelude::*;
use tracing::{info, instrument, warn};

static REPO_ARG: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r"^(?:https?://)?(?:www\.)?(?:github\.com/)?([A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)/([A-Za-z0-9._-]+?)(?:\.git)?/?$",
    )
    .ok()
});

const HELP: &str = "Commands:
/subscribe owner/repo [push release issue pull_request] - watch a repository (alias /sub)
/unsubscribe owner/repo - stop watching (alias /unsub)
/list - show this chat's subscriptions
/status - uptime, watched repositories and API quota
/ping - health check
/help - this message

Repositories may also be given as github.com URLs.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Ping,
    Subscribe { repo: RepoRef, kinds: Vec<EventKind> },
    Unsubscribe(RepoRef),
    List,
    Status,
    /// Recognised command with bad arguments; carries the reply.
    Usage(String),
    Unknown,
}

/// Accepts `owner/repo` or a github.com URL.
pub fn parse_repo(arg: &str) -> Option<RepoRef> {
    let caps = REPO_ARG.as_ref()?.captures(arg.trim())?;
    Some(RepoRef::new(&caps[1], &caps[2]))
}

/// `None` for plain text that is not a command.
pub fn parse_command(text: &str) -> Option<Command> {
    let text = text.trim();
    if !text.starts_with('/') {
        return None;
    }
    let mut parts = text.split_whitespace();
    let head = parts.next().unwrap_or_default();
    // Group chats address commands as /cmd@BotName.
    let name = head.split('@').next().unwrap_or(head);
    let args: Vec<&str> = parts.collect();

    let cmd = match name {
        "/start" => Command::Start,
        "/help" => Command::Help,
        "/ping" => Command::Ping,
        "/list" => Command::List,
        "/status" => Command::Status,
        "/subscribe" | "/sub" => match args.split_first() {
            None => Command::Usage("Usage: /subscribe owner/repo [kinds...]".into()),
            Some((repo, kinds)) => match parse_repo(repo) {
                None => Command::Usage(format!("Not a repository: {}", repo)),
                Some(repo) => match parse_kinds(kinds) {
                    Ok(kinds) => Command::Subscribe { repo, kinds },
                    Err(bad) => Command::Usage(format!(
                        "Unknown event type: {}. Use push, release, issue or pull_request.",
                        bad
                    )),
                },
            },
        },
        "/unsubscribe" | "/unsub" => match args.first().and_then(|a| parse_repo(a)) {
            Some(repo) => Command::Unsubscribe(repo),
            None => Command::Usage("Usage: /unsubscribe owner/repo".into()),
        },
        _ => Command::Unknown,
    };
    Some(cmd)
}

fn parse_kinds(args: &[&str]) -> Result<Vec<EventKind>, String> {
    if args.is_empty() {
        return Ok(EventKind::ALL.to_vec());
    }
    let mut kinds = Vec::new();
    for arg in args.iter().flat_map(|a| a.split(',')).filter(|a| !a.is_empty()) {
        let kind = EventKind::parse(arg).ok_or_else(|| arg.to_string())?;
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    Ok(kinds)
}

/// Coarse human duration: `2d 3h`, `3h 5m`, `5m 10s` or `42s`.
pub fn format_uptime(d: Duration) -> String {
    let secs = d.num_seconds().max(0);
    let (days, hours, mins, secs) = (secs / 86_400, secs / 3_600 % 24, secs / 60 % 60, secs % 60);
    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, mins)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

async fn status_text(
    pool: &SqlitePool,
    github: &GitHubClient,
    chat_id: i64,
    started_at: DateTime<Utc>,
) -> String {
    let now = Utc::now();
    let watched = db::list_repositories_with_subscribers(pool)
        .await
        .map(|r| r.len().to_string())
        .unwrap_or_else(|_| "unknown".into());
    let own = db::list_chat_subscriptions(pool, chat_id)
        .await
        .map(|s| s.len().to_string())
        .unwrap_or_else(|_| "unknown".into());
    let quota = match github.rate_limit().await {
        Ok(rl) => format!(
            "{}/{} (resets in {})",
            rl.remaining,
            rl.limit,
            format_uptime(rl.reset - now)
        ),
        Err(err) => {
            warn!(?err, "failed to read rate limit");
            "unknown".into()
        }
    };
    format!(
        "Status\nUptime: {}\nWatched repositories: {}\nThis chat's subscriptions: {}\nGitHub API quota: {}",
        format_uptime(now - started_at),
        watched,
        own,
        quota
    )
}

fn chat_type(chat: &teloxide::types::Chat) -> &'static str {
    if chat.is_private() {
        "private"
    } else if chat.is_supergroup() {
        "supergroup"
    } else if chat.is_group() {
        "group"
    } else {
        "channel"
    }
}

#[instrument(skip_all)]
pub async fn handle_update(
    bot: &Bot,
    pool: &SqlitePool,
    github: &GitHubClient,
    started_at: DateTime<Utc>,
    msg: &Message,
) -> Result<()> {
    let Some(command) = msg.text().and_then(parse_command) else {
        return Ok(());
    };

    let chat_id = msg.chat.id.0;
    let title = msg.chat.title().or(msg.chat.username());
    db::upsert_chat(pool, chat_id, chat_type(&msg.chat), title).await?;

    let reply = match command {
        Command::Start => format!("Hi! I relay GitHub activity to this chat.\n\n{}", HELP),
        Command::Help => HELP.to_string(),
        Command::Ping => "PONG".to_string(),
        Command::Usage(text) => text,
        Command::Unknown => "Unknown command. Try /help.".to_string(),
        Command::Status => status_text(pool, github, chat_id, started_at).await,
        Command::List => {
            let subs = db::list_chat_subscriptions(pool, chat_id).await?;
            if subs.is_empty() {
                "No subscriptions yet.".to_string()
            } else {
                let lines: Vec<String> = subs
                    .iter()
                    .map(|s| {
                        let kinds: Vec<&str> = s.events.iter().map(|k| k.as_str()).collect();
                        format!("• {} ({})", s.repo, kinds.join(", "))
                    })
                    .collect();
                format!("Subscriptions:\n{}", lines.join("\n"))
            }
        }
        Command::Subscribe { repo, kinds } => {
            match github.repository_exists(&repo.owner, &repo.name).await {
                Ok(false) => format!("Repository {} not found or not public.", repo),
                result => {
                    if let Err(err) = result {
                        warn!(?err, repo = %repo, "could not verify repository; subscribing anyway");
                    }
                    db::subscribe(pool, chat_id, &repo, &kinds).await?;
                    info!(chat_id, repo = %repo, "subscribed");
                    let kinds: Vec<&str> = kinds.iter().map(|k| k.as_str()).collect();
                    format!("Subscribed to {} ({}).", repo, kinds.join(", "))
                }
            }
        }
        Command::Unsubscribe(repo) => {
            if db::unsubscribe(pool, chat_id, &repo).await? {
                info!(chat_id, repo = %repo, "unsubscribed");
                format!("Unsubscribed from {}.", repo)
            } else {
                format!("Not subscribed to {}.", repo)
            }
        }
    };

    let _ = bot.send_message(msg.chat.id, reply).await;
    Ok(())
}
