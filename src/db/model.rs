//! View models returned by repositories.
//!
//! Keep these focused on the data returned by queries. Transition rules live
//! in the coordinator.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::Stage;

/// Status of one ledger entry.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum LedgerStatus {
    /// Dispatched; no outcome persisted yet.
    InFlight,
    /// Last attempt failed transiently.
    Retryable,
    Succeeded,
    Failed,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::InFlight => "in_flight",
            LedgerStatus::Retryable => "retryable",
            LedgerStatus::Succeeded => "succeeded",
            LedgerStatus::Failed => "failed",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "in_flight" => Some(LedgerStatus::InFlight),
            "retryable" => Some(LedgerStatus::Retryable),
            "succeeded" => Some(LedgerStatus::Succeeded),
            "failed" => Some(LedgerStatus::Failed),
            _ => None,
        }
    }
}

/// A persisted side-effect record keyed by `(item_id, stage_key)`.
#[derive(Debug, Clone, Serialize)]
pub struct IdempotencyEntry {
    pub item_id: String,
    pub stage_key: String,
    pub idempotency_key: String,
    pub status: LedgerStatus,
    pub result: Option<String>,
    pub last_error: Option<String>,
    pub attempts: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Number of records per stage, for status reporting.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StageCount {
    pub stage: Stage,
    pub count: i64,
}
