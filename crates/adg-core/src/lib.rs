//! Core domain + application logic for the group-chat ads guard.
//!
//! This crate is framework-agnostic. Telegram, the classification backend and
//! PostgreSQL live behind ports (traits) implemented in adapter crates.

pub mod actions;
pub mod callbacks;
pub mod caption;
pub mod classify;
pub mod config;
pub mod decision;
pub mod dedup;
pub mod domain;
pub mod errors;
pub mod examples;
pub mod guard;
pub mod ledger;
pub mod logging;
pub mod messaging;
pub mod notices;
pub mod settings;
pub mod store;
pub mod tasks;
pub mod text;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{Error, Result};
pub use guard::{AdsGuard, GuardOptions, GuardPorts, WatchOutcome};
