//! Idempotency ledger: one row per `(item_id, stage_key)` side effect.
//!
//! An entry is created on the first attempt and never deleted. Executors
//! consult it before every (re-)execution so a successful translation or
//! publish is never dispatched twice by a retry or a restart.

use super::model::{IdempotencyEntry, LedgerStatus};
use super::repo::Pool;
use crate::model::IdempotencyKey;
use anyhow::{anyhow, Result};
use chrono::Utc;
use sqlx::Row;
use tracing::instrument;

/// What the ledger says about a side effect that is about to be executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// No outcome recorded; the caller may dispatch. `attempts` includes this one.
    Proceed { attempts: i64 },
    /// A previous dispatch never recorded an outcome (crash between the
    /// external call and the ledger write). The side effect may or may not
    /// have happened.
    Interrupted { attempts: i64 },
    /// Already executed; carries the stored result.
    Succeeded(String),
    /// Terminally failed earlier; carries the reason.
    Failed(String),
}

/// Claim `key` for execution, marking it `in_flight` unless an outcome is
/// already recorded.
#[instrument(skip_all, fields(key = %key))]
pub async fn claim(pool: &Pool, key: &IdempotencyKey) -> Result<Claim> {
    let stage_key = key.stage.to_string();
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    let row = sqlx::query(
        "SELECT status, result, last_error, attempts FROM idempotency_entries \
         WHERE item_id = ? AND stage_key = ?",
    )
    .bind(&key.item_id)
    .bind(&stage_key)
    .fetch_optional(&mut *tx)
    .await?;

    let claim = match row {
        None => {
            sqlx::query(
                "INSERT INTO idempotency_entries \
                 (item_id, stage_key, idempotency_key, status, attempts, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, 1, ?, ?)",
            )
            .bind(&key.item_id)
            .bind(&stage_key)
            .bind(key.to_string())
            .bind(LedgerStatus::InFlight.as_str())
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            Claim::Proceed { attempts: 1 }
        }
        Some(row) => {
            let status_str: String = row.get("status");
            let status = LedgerStatus::parse_status(&status_str)
                .ok_or_else(|| anyhow!("ledger entry {} has unknown status {}", key, status_str))?;
            let attempts: i64 = row.get("attempts");
            match status {
                LedgerStatus::Succeeded => {
                    Claim::Succeeded(row.get::<Option<String>, _>("result").unwrap_or_default())
                }
                LedgerStatus::Failed => {
                    Claim::Failed(row.get::<Option<String>, _>("last_error").unwrap_or_default())
                }
                LedgerStatus::Retryable | LedgerStatus::InFlight => {
                    sqlx::query(
                        "UPDATE idempotency_entries SET status = ?, attempts = attempts + 1, updated_at = ? \
                         WHERE item_id = ? AND stage_key = ?",
                    )
                    .bind(LedgerStatus::InFlight.as_str())
                    .bind(now)
                    .bind(&key.item_id)
                    .bind(&stage_key)
                    .execute(&mut *tx)
                    .await?;
                    if status == LedgerStatus::InFlight {
                        Claim::Interrupted {
                            attempts: attempts + 1,
                        }
                    } else {
                        Claim::Proceed {
                            attempts: attempts + 1,
                        }
                    }
                }
            }
        }
    };

    tx.commit().await?;
    Ok(claim)
}

pub async fn record_success(pool: &Pool, key: &IdempotencyKey, result: &str) -> Result<()> {
    settle(pool, key, LedgerStatus::Succeeded, Some(result), None).await
}

/// A transient failure: the entry stays open for the next attempt.
pub async fn record_retryable(pool: &Pool, key: &IdempotencyKey, error: &str) -> Result<()> {
    settle(pool, key, LedgerStatus::Retryable, None, Some(error)).await
}

/// A terminal failure or an exhausted retry budget.
pub async fn record_failure(pool: &Pool, key: &IdempotencyKey, reason: &str) -> Result<()> {
    settle(pool, key, LedgerStatus::Failed, None, Some(reason)).await
}

async fn settle(
    pool: &Pool,
    key: &IdempotencyKey,
    status: LedgerStatus,
    result: Option<&str>,
    error: Option<&str>,
) -> Result<()> {
    // Outcomes are final: a succeeded or failed entry is never rewritten.
    let res = sqlx::query(
        "UPDATE idempotency_entries SET status = ?, result = COALESCE(?, result), \
         last_error = COALESCE(?, last_error), updated_at = ? \
         WHERE item_id = ? AND stage_key = ? AND status IN ('in_flight', 'retryable')",
    )
    .bind(status.as_str())
    .bind(result)
    .bind(error)
    .bind(Utc::now())
    .bind(&key.item_id)
    .bind(key.stage.to_string())
    .execute(pool)
    .await?;
    if res.rows_affected() != 1 {
        return Err(anyhow!("ledger entry {} is not open; cannot record {}", key, status.as_str()));
    }
    Ok(())
}

pub async fn entry(pool: &Pool, key: &IdempotencyKey) -> Result<Option<IdempotencyEntry>> {
    let row = sqlx::query(
        "SELECT item_id, stage_key, idempotency_key, status, result, last_error, attempts, created_at, updated_at \
         FROM idempotency_entries WHERE item_id = ? AND stage_key = ?",
    )
    .bind(&key.item_id)
    .bind(key.stage.to_string())
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let status_str: String = row.get("status");
    let status = LedgerStatus::parse_status(&status_str)
        .ok_or_else(|| anyhow!("ledger entry {} has unknown status {}", key, status_str))?;
    Ok(Some(IdempotencyEntry {
        item_id: row.get("item_id"),
        stage_key: row.get("stage_key"),
        idempotency_key: row.get("idempotency_key"),
        status,
        result: row.get("result"),
        last_error: row.get("last_error"),
        attempts: row.get("attempts"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }))
}

/// All ledger entries for one item, for status reporting.
pub async fn entries_for_item(pool: &Pool, item_id: &str) -> Result<Vec<IdempotencyEntry>> {
    let keys: Vec<String> = sqlx::query_scalar(
        "SELECT stage_key FROM idempotency_entries WHERE item_id = ? ORDER BY created_at ASC",
    )
    .bind(item_id)
    .fetch_all(pool)
    .await?;
    let mut entries = Vec::with_capacity(keys.len());
    for stage_key in keys {
        let Some(stage) = crate::model::StageKey::parse_key(&stage_key) else {
            continue;
        };
        if let Some(e) = entry(pool, &IdempotencyKey::new(item_id, stage)).await? {
            entries.push(e);
        }
    }
    Ok(entries)
}
