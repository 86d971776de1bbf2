//! Fan-out of normalized events to subscribed chats.
use crate::channel::EventReceiver;
use crate::db::{self, Pool};
use crate::format::format_message;
use crate::ledger::{Ledger, RecordOutcome};
use crate::model::NormalizedEvent;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Outbound delivery of one formatted message to one chat.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn deliver(&self, chat_id: i64, text: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    NoSubscribers,
    /// Another producer already claimed this event.
    Duplicate,
    Delivered { delivered: usize, failed: usize },
}

pub struct Notifier {
    pool: Pool,
    ledger: Ledger,
    messenger: Arc<dyn Messenger>,
}

impl Notifier {
    pub fn new(pool: Pool, ledger: Ledger, messenger: Arc<dyn Messenger>) -> Self {
        Self {
            pool,
            ledger,
            messenger,
        }
    }

    /// Deliver `event` to every subscriber whose filter includes its kind.
    ///
    /// Events not yet claimed by their producer are claimed here, which is
    /// what suppresses a fact seen by both the webhook and the poller. One
    /// failed delivery never stops the others.
    #[instrument(skip_all, fields(repo = %event.repo, kind = %event.kind()))]
    pub async fn handle(&self, event: &NormalizedEvent) -> Result<HandleOutcome> {
        let subscribers = db::list_subscribers(&self.pool, &event.repo)
            .await
            .context("failed to load subscribers")?;
        if subscribers.is_empty() {
            debug!("no subscribers");
            return Ok(HandleOutcome::NoSubscribers);
        }

        let key = event.dedup_key();
        let mut record_after = false;
        if !event.claimed {
            match self.ledger.record_if_absent(&key).await {
                Ok(RecordOutcome::Inserted) => {}
                Ok(RecordOutcome::AlreadyPresent) => {
                    debug!(key = %key, "already processed, skipping");
                    return Ok(HandleOutcome::Duplicate);
                }
                Err(err) => {
                    warn!(?err, key = %key, "ledger unavailable; delivering anyway");
                    record_after = true;
                }
            }
        }

        let text = format_message(event);
        let kind = event.kind();
        let (mut delivered, mut failed) = (0, 0);
        for sub in subscribers.iter().filter(|s| s.wants(kind)) {
            match self.messenger.deliver(sub.chat_id, &text).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    error!(?err, chat_id = sub.chat_id, "failed to send notification");
                    failed += 1;
                }
            }
        }

        if record_after {
            if let Err(err) = self.ledger.record_if_absent(&key).await {
                warn!(?err, key = %key, "failed to record event");
            }
        }
        for covered in event.covered_keys() {
            if let Err(err) = self.ledger.record_if_absent(&covered).await {
                warn!(?err, key = %covered, "failed to record covered commit");
            }
        }

        info!(delivered, failed, "event delivered");
        Ok(HandleOutcome::Delivered { delivered, failed })
    }

    /// Drain the channel in arrival order until every sender is gone.
    pub async fn run(self, mut events: EventReceiver) {
        while let Some(event) = events.recv().await {
            if let Err(err) = self.handle(&event).await {
                error!(?err, repo = %event.repo, "failed to handle event");
            }
        }
        info!("notifier stopped");
    }
}
