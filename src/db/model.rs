//! Row models returned by subscription queries.
//!
//! Keep these structs focused on the data returned by queries. Delivery
//! decisions live in the notifier.

use crate::model::{EventKind, RepoRef};

/// One chat's subscription to one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub chat_id: i64,
    pub repo: RepoRef,
    pub events: Vec<EventKind>,
}

impl Subscription {
    pub fn wants(&self, kind: EventKind) -> bool {
        self.events.contains(&kind)
    }
}

/// Decode the JSON `events` column. Anything unreadable means "everything",
/// so a corrupted filter never silences a subscriber.
pub fn decode_event_filter(raw: &str) -> Vec<EventKind> {
    match serde_json::from_str::<Vec<String>>(raw) {
        Ok(names) => {
            let kinds: Vec<EventKind> = names.iter().filter_map(|n| EventKind::parse(n)).collect();
            if kinds.is_empty() && !names.is_empty() {
                EventKind::ALL.to_vec()
            } else {
                kinds
            }
        }
        Err(_) => EventKind::ALL.to_vec(),
    }
}

pub fn encode_event_filter(kinds: &[EventKind]) -> String {
    let names: Vec<&str> = kinds.iter().map(EventKind::as_str).collect();
    serde_json::to_string(&names).unwrap_or_else(|_| "[]".to_string())
}
