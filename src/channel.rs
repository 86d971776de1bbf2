//! Bounded conduit from the ingestors to the notifier.
//!
//! Producers never wait: when the buffer is full the event is dropped and
//! counted. Losing an occasional notification is preferred over stalling a
//! webhook response or a polling pass.
use crate::model::NormalizedEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, warn};

pub type EventReceiver = mpsc::Receiver<NormalizedEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Enqueued,
    /// Channel full; the event is gone.
    Dropped,
    /// Consumer has shut down.
    Closed,
}

#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<NormalizedEvent>,
    dropped: Arc<AtomicU64>,
}

/// Create the channel. A zero capacity is raised to one.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        EventSender {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

impl EventSender {
    /// Non-blocking enqueue.
    pub fn send(&self, event: NormalizedEvent) -> SendOutcome {
        match self.tx.try_send(event) {
            Ok(()) => SendOutcome::Enqueued,
            Err(mpsc::error::TrySendError::Full(ev)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    repo = %ev.repo,
                    kind = %ev.kind(),
                    dropped_total = total,
                    "event channel full, dropping event"
                );
                SendOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(ev)) => {
                error!(repo = %ev.repo, kind = %ev.kind(), "event channel closed");
                SendOutcome::Closed
            }
        }
    }

    /// Events discarded because the channel was full, across all clones.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
