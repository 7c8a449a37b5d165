//! Database module: row models, the record store and the idempotency ledger.
//!
//! - `model`: view models returned by queries.
//! - `repo`: SQL for items, sync records, destination statuses and cursors.
//! - `ledger`: SQL for idempotency entries.
//!
//! The record store API is re-exported at `crate::db::*`.

pub mod ledger;
pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{IdempotencyEntry, LedgerStatus, StageCount};
