//! Deduplication ledger: the durable set of facts already acted upon.
//!
//! Correctness under concurrency rests entirely on the `UNIQUE` constraint of
//! `event_records`. Two producers racing to record the same key both issue an
//! `INSERT OR IGNORE`; exactly one sees a row inserted. No in-process lock is
//! taken, so several processes may share one database file.
use crate::db::Pool;
use crate::model::DedupKey;
use anyhow::{Context, Result};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    AlreadyPresent,
}

#[derive(Clone)]
pub struct Ledger {
    pool: Pool,
}

impl Ledger {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Atomic insert-or-ignore. Recording the same key twice is a no-op that
    /// reports `AlreadyPresent`, never an error.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn record_if_absent(&self, key: &DedupKey) -> Result<RecordOutcome> {
        let res = sqlx::query(
            "INSERT OR IGNORE INTO event_records (repo_owner, repo_name, event_kind, event_id) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(&key.owner)
        .bind(&key.name)
        .bind(key.kind.as_str())
        .bind(&key.event_id)
        .execute(&self.pool)
        .await
        .context("failed to record event")?;
        if res.rows_affected() == 0 {
            Ok(RecordOutcome::AlreadyPresent)
        } else {
            Ok(RecordOutcome::Inserted)
        }
    }

    /// Undo a claim whose event never reached the notifier, so a later
    /// pass can announce it. Returns whether a record was removed.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn release(&self, key: &DedupKey) -> Result<bool> {
        let res = sqlx::query(
            "DELETE FROM event_records \
             WHERE repo_owner = ? AND repo_name = ? AND event_kind = ? AND event_id = ?",
        )
        .bind(&key.owner)
        .bind(&key.name)
        .bind(key.kind.as_str())
        .bind(&key.event_id)
        .execute(&self.pool)
        .await
        .context("failed to release event")?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn try_contains(&self, key: &DedupKey) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM event_records \
             WHERE repo_owner = ? AND repo_name = ? AND event_kind = ? AND event_id = ?",
        )
        .bind(&key.owner)
        .bind(&key.name)
        .bind(key.kind.as_str())
        .bind(&key.event_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up event")?;
        Ok(found.is_some())
    }

    /// Membership check that fails open: a lookup error answers "not yet
    /// processed", so a genuine first occurrence is never silently dropped.
    pub async fn contains(&self, key: &DedupKey) -> bool {
        match self.try_contains(key).await {
            Ok(found) => found,
            Err(err) => {
                warn!(?err, key = %key, "ledger lookup failed; treating event as new");
                false
            }
        }
    }

    /// Delete records older than `max_age_days`. Returns the number removed.
    #[instrument(skip_all)]
    pub async fn sweep(&self, max_age_days: u32) -> Result<u64> {
        let res = sqlx::query("DELETE FROM event_records WHERE inserted_at < datetime('now', ?)")
            .bind(format!("-{} days", max_age_days))
            .execute(&self.pool)
            .await
            .context("failed to sweep event records")?;
        Ok(res.rows_affected())
    }

    pub async fn count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM event_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// Release the storage handle. Call last during shutdown.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Periodic retention sweep until `cancel` fires. The first sweep runs
/// immediately.
pub async fn run_sweeper(
    ledger: Ledger,
    max_age_days: u32,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match ledger.sweep(max_age_days).await {
                    Ok(0) => debug!("ledger sweep removed nothing"),
                    Ok(removed) => info!(removed, max_age_days, "ledger sweep"),
                    Err(err) => warn!(?err, "ledger sweep failed"),
                }
            }
        }
    }
    debug!("ledger sweeper stopped");
}
