use super::model::{decode_event_filter, encode_event_filter, Subscription};
use crate::model::{EventKind, RepoRef};
use anyhow::{Context, Result};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::Row;
use sqlx::SqlitePool;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {}", normalized))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// Single-connection in-memory pool with migrations applied. Every handle sees
/// the same database, which a multi-connection `sqlite::memory:` pool does not
/// guarantee.
pub async fn memory_pool() -> Result<Pool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    // sqlx refuses to create a missing file unless asked to.
    let mut rebuilt = format!("sqlite://{}", expanded_path);
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn upsert_chat(pool: &Pool, chat_id: i64, chat_type: &str, title: Option<&str>) -> Result<()> {
    sqlx::query(
        "INSERT INTO chats (chat_id, chat_type, title) VALUES (?, ?, ?) \
         ON CONFLICT(chat_id) DO UPDATE SET chat_type = excluded.chat_type, title = excluded.title",
    )
    .bind(chat_id)
    .bind(chat_type)
    .bind(title)
    .execute(pool)
    .await?;
    Ok(())
}

/// Create or replace a chat's subscription to a repository.
#[instrument(skip_all, fields(repo = %repo))]
pub async fn subscribe(pool: &Pool, chat_id: i64, repo: &RepoRef, events: &[EventKind]) -> Result<()> {
    sqlx::query(
        "INSERT INTO subscriptions (chat_id, repo_owner, repo_name, events) VALUES (?, ?, ?, ?) \
         ON CONFLICT(chat_id, repo_owner, repo_name) DO UPDATE SET events = excluded.events",
    )
    .bind(chat_id)
    .bind(&repo.owner)
    .bind(&repo.name)
    .bind(encode_event_filter(events))
    .execute(pool)
    .await
    .context("failed to store subscription")?;
    Ok(())
}

/// Returns `false` when there was nothing to remove.
#[instrument(skip_all, fields(repo = %repo))]
pub async fn unsubscribe(pool: &Pool, chat_id: i64, repo: &RepoRef) -> Result<bool> {
    let res = sqlx::query(
        "DELETE FROM subscriptions WHERE chat_id = ? AND repo_owner = ? AND repo_name = ?",
    )
    .bind(chat_id)
    .bind(&repo.owner)
    .bind(&repo.name)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn list_chat_subscriptions(pool: &Pool, chat_id: i64) -> Result<Vec<Subscription>> {
    let rows = sqlx::query(
        "SELECT chat_id, repo_owner, repo_name, events FROM subscriptions \
         WHERE chat_id = ? ORDER BY repo_owner, repo_name",
    )
    .bind(chat_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(subscription_from_row).collect())
}

/// Every repository with at least one subscriber; the poller's work list.
#[instrument(skip_all)]
pub async fn list_repositories_with_subscribers(pool: &Pool) -> Result<Vec<RepoRef>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT DISTINCT repo_owner, repo_name FROM subscriptions ORDER BY repo_owner, repo_name",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(owner, name)| RepoRef { owner, name })
        .collect())
}

#[instrument(skip_all, fields(repo = %repo))]
pub async fn list_subscribers(pool: &Pool, repo: &RepoRef) -> Result<Vec<Subscription>> {
    let rows = sqlx::query(
        "SELECT chat_id, repo_owner, repo_name, events FROM subscriptions \
         WHERE repo_owner = ? AND repo_name = ? ORDER BY id",
    )
    .bind(&repo.owner)
    .bind(&repo.name)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(subscription_from_row).collect())
}

fn subscription_from_row(row: &sqlx::sqlite::SqliteRow) -> Subscription {
    let events: String = row.get("events");
    Subscription {
        chat_id: row.get("chat_id"),
        repo: RepoRef {
            owner: row.get("repo_owner"),
            name: row.get("repo_name"),
        },
        events: decode_event_filter(&events),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_list_unsubscribe() {
        let pool = memory_pool().await.unwrap();
        let widgets = RepoRef::new("acme", "widgets");
        let gadgets = RepoRef::new("acme", "gadgets");

        upsert_chat(&pool, 1, "private", Some("Alice")).await.unwrap();
        subscribe(&pool, 1, &widgets, &EventKind::ALL).await.unwrap();
        subscribe(&pool, 2, &widgets, &[EventKind::Release]).await.unwrap();
        subscribe(&pool, 2, &gadgets, &[EventKind::Push]).await.unwrap();

        let repos = list_repositories_with_subscribers(&pool).await.unwrap();
        assert_eq!(repos, vec![gadgets.clone(), widgets.clone()]);

        let subs = list_subscribers(&pool, &widgets).await.unwrap();
        assert_eq!(subs.len(), 2);
        assert!(subs[0].wants(EventKind::Issue));
        assert!(!subs[1].wants(EventKind::Issue));

        // Re-subscribing replaces the filter instead of duplicating the row.
        subscribe(&pool, 2, &widgets, &[EventKind::Issue]).await.unwrap();
        let subs = list_subscribers(&pool, &widgets).await.unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[1].events, vec![EventKind::Issue]);

        assert!(unsubscribe(&pool, 2, &gadgets).await.unwrap());
        assert!(!unsubscribe(&pool, 2, &gadgets).await.unwrap());
        assert_eq!(
            list_repositories_with_subscribers(&pool).await.unwrap(),
            vec![widgets.clone()]
        );
        assert_eq!(list_chat_subscriptions(&pool, 2).await.unwrap().len(), 1);
    }

    #[test]
    fn sqlite_url_normalization() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
        let td = tempfile::tempdir().unwrap();
        let db = td.path().join("nested").join("bot.db");
        let url = prepare_sqlite_url(&format!("sqlite://{}", db.display()));
        assert_eq!(url, format!("sqlite://{}?mode=rwc", db.display()));
        assert!(td.path().join("nested").exists());
    }
}
