//! Database module: subscription models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: typed rows returned by the subscription queries.
//! - `repo`: pool setup, migrations and SQL-only subscription functions.
//!
//! The deduplication ledger lives in `crate::ledger`; it owns the
//! `event_records` table and nothing here writes to it.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::Subscription;
