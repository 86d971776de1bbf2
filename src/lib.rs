pub mod channel;
pub mod config;
pub mod db;
pub mod format;
pub mod github;
pub mod handlers;
pub mod ledger;
pub mod model;
pub mod notifier;
pub mod poller;
pub mod telegram;
pub mod webhook;
