use super::model::StageCount;
use crate::model::{Destination, DestinationStatus, Item, MediaRef, Stage, SyncRecord};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnection, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use tracing::instrument;

pub type Pool = SqlitePool;

/// Stages a record can be resumed from after a restart.
const OPEN_STAGES: &str = "'NEW', 'FETCHED', 'TRANSLATING', 'TRANSLATED', 'PUBLISHING'";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // One connection: SQLite has a single writer and every transition is a
    // read-modify-write transaction.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {}", normalized))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    // Rebuild URL, prefer sqlite:// form; create the file on first open.
    let mut rebuilt = format!("sqlite://{}", expanded_path);
    match query_part {
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Persist an item and its NEW record. Returns `true` only when the record
/// was created by this call; redelivered items are left untouched.
#[instrument(skip_all)]
pub async fn record_item(pool: &Pool, item: &Item) -> Result<bool> {
    let media = serde_json::to_string(&item.media).context("failed to encode item media")?;
    let now = Utc::now();
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT OR IGNORE INTO items (id, feed, author_id, content, media, source_created_at, first_seen_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&item.id)
    .bind(&item.feed)
    .bind(&item.author_id)
    .bind(&item.content)
    .bind(media)
    .bind(item.source_created_at)
    .bind(item.first_seen_at)
    .execute(&mut *tx)
    .await?;
    let created = sqlx::query(
        "INSERT OR IGNORE INTO sync_records (item_id, stage, created_at, updated_at) VALUES (?, ?, ?, ?)",
    )
    .bind(&item.id)
    .bind(Stage::New.as_str())
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?
    .rows_affected()
        == 1;
    tx.commit().await?;
    Ok(created)
}

pub async fn fetch_item(conn: &mut SqliteConnection, item_id: &str) -> Result<Option<Item>> {
    let row = sqlx::query(
        "SELECT id, feed, author_id, content, media, source_created_at, first_seen_at FROM items WHERE id = ?",
    )
    .bind(item_id)
    .fetch_optional(&mut *conn)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let media_json: String = row.get("media");
    let media: Vec<MediaRef> = serde_json::from_str(&media_json)
        .with_context(|| format!("item {} has malformed media", item_id))?;
    Ok(Some(Item {
        id: row.get("id"),
        feed: row.get("feed"),
        author_id: row.get("author_id"),
        content: row.get("content"),
        media,
        source_created_at: row.get("source_created_at"),
        first_seen_at: row.get("first_seen_at"),
    }))
}

/// Load a record with its destination statuses and attempt counters.
pub async fn load_record(conn: &mut SqliteConnection, item_id: &str) -> Result<Option<SyncRecord>> {
    let row = sqlx::query(
        "SELECT item_id, stage, translated_text, error_message, created_at, updated_at \
         FROM sync_records WHERE item_id = ?",
    )
    .bind(item_id)
    .fetch_optional(&mut *conn)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let stage_str: String = row.get("stage");
    let stage = Stage::parse_stage(&stage_str)
        .ok_or_else(|| anyhow!("record {} has unknown stage {}", item_id, stage_str))?;

    let mut destination_statuses = BTreeMap::new();
    let dest_rows = sqlx::query(
        "SELECT destination, status, external_ref, reason FROM destination_statuses WHERE item_id = ?",
    )
    .bind(item_id)
    .fetch_all(&mut *conn)
    .await?;
    for dest_row in dest_rows {
        let name: String = dest_row.get("destination");
        let label: String = dest_row.get("status");
        let dest = Destination::parse_destination(&name)
            .ok_or_else(|| anyhow!("record {} has unknown destination {}", item_id, name))?;
        let status = DestinationStatus::from_columns(
            &label,
            dest_row.get("external_ref"),
            dest_row.get("reason"),
        )
        .ok_or_else(|| anyhow!("record {} has unknown {} status {}", item_id, name, label))?;
        destination_statuses.insert(dest, status);
    }

    let retry_count = sqlx::query("SELECT stage_key, attempts FROM stage_attempts WHERE item_id = ?")
        .bind(item_id)
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(|r| (r.get::<String, _>("stage_key"), r.get::<i64, _>("attempts")))
        .collect();

    Ok(Some(SyncRecord {
        item_id: row.get("item_id"),
        stage,
        translated_text: row.get("translated_text"),
        error_message: row.get("error_message"),
        destination_statuses,
        retry_count,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }))
}

pub async fn get_record(pool: &Pool, item_id: &str) -> Result<Option<SyncRecord>> {
    let mut conn = pool.acquire().await?;
    load_record(&mut conn, item_id).await
}

/// Compare-and-swap the record stage. Illegal transitions are refused before
/// touching the database; a `false` return means the stage moved underneath.
pub async fn advance_stage(
    conn: &mut SqliteConnection,
    item_id: &str,
    from: Stage,
    to: Stage,
) -> Result<bool> {
    if !from.can_advance_to(to) {
        return Err(anyhow!("illegal transition {} -> {} for {}", from, to, item_id));
    }
    let res = sqlx::query(
        "UPDATE sync_records SET stage = ?, updated_at = ? WHERE item_id = ? AND stage = ?",
    )
    .bind(to.as_str())
    .bind(Utc::now())
    .bind(item_id)
    .bind(from.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// TRANSLATING -> TRANSLATED, storing the text in the same statement.
pub async fn complete_translation(
    conn: &mut SqliteConnection,
    item_id: &str,
    text: &str,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE sync_records SET stage = ?, translated_text = ?, updated_at = ? \
         WHERE item_id = ? AND stage = ?",
    )
    .bind(Stage::Translated.as_str())
    .bind(text)
    .bind(Utc::now())
    .bind(item_id)
    .bind(Stage::Translating.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Move a non-terminal record to FAILED with a reason.
pub async fn fail_record(
    conn: &mut SqliteConnection,
    item_id: &str,
    from: Stage,
    reason: &str,
) -> Result<bool> {
    if !from.can_advance_to(Stage::Failed) {
        return Err(anyhow!("record {} is already terminal ({})", item_id, from));
    }
    let res = sqlx::query(
        "UPDATE sync_records SET stage = ?, error_message = ?, updated_at = ? \
         WHERE item_id = ? AND stage = ?",
    )
    .bind(Stage::Failed.as_str())
    .bind(reason)
    .bind(Utc::now())
    .bind(item_id)
    .bind(from.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Create PENDING entries for each destination; existing entries are kept.
pub async fn init_destinations(
    conn: &mut SqliteConnection,
    item_id: &str,
    destinations: &[Destination],
) -> Result<()> {
    let now = Utc::now();
    for dest in destinations {
        sqlx::query(
            "INSERT OR IGNORE INTO destination_statuses (item_id, destination, status, updated_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(item_id)
        .bind(dest.as_str())
        .bind(DestinationStatus::Pending.label())
        .bind(now)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Compare-and-swap one destination's status. `expected` lists the labels the
/// entry may currently hold.
pub async fn transition_destination(
    conn: &mut SqliteConnection,
    item_id: &str,
    destination: Destination,
    expected: &[&str],
    next: &DestinationStatus,
) -> Result<bool> {
    if expected.is_empty() {
        return Ok(false);
    }
    let placeholders = vec!["?"; expected.len()].join(", ");
    let sql = format!(
        "UPDATE destination_statuses SET status = ?, external_ref = ?, reason = ?, updated_at = ? \
         WHERE item_id = ? AND destination = ? AND status IN ({})",
        placeholders
    );
    let mut query = sqlx::query(&sql)
        .bind(next.label())
        .bind(next.external_ref())
        .bind(next.reason())
        .bind(Utc::now())
        .bind(item_id)
        .bind(destination.as_str());
    for label in expected {
        query = query.bind(*label);
    }
    let res = query.execute(&mut *conn).await?;
    Ok(res.rows_affected() == 1)
}

/// Increment and return the attempt counter for `(item_id, stage_key)`.
#[instrument(skip_all)]
pub async fn bump_attempt(pool: &Pool, item_id: &str, stage_key: &str) -> Result<i64> {
    let attempts: i64 = sqlx::query_scalar(
        "INSERT INTO stage_attempts (item_id, stage_key, attempts) VALUES (?, ?, 1) \
         ON CONFLICT(item_id, stage_key) DO UPDATE SET attempts = attempts + 1 \
         RETURNING attempts",
    )
    .bind(item_id)
    .bind(stage_key)
    .fetch_one(pool)
    .await?;
    Ok(attempts)
}

/// Item IDs whose records have not reached a terminal stage, oldest first.
#[instrument(skip_all)]
pub async fn open_item_ids(pool: &Pool) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT item_id FROM sync_records WHERE stage IN ({}) ORDER BY created_at ASC",
        OPEN_STAGES
    );
    let ids: Vec<String> = sqlx::query_scalar(&sql).fetch_all(pool).await?;
    Ok(ids)
}

/// Records that are FAILED or have at least one FAILED destination.
#[instrument(skip_all)]
pub async fn records_needing_attention(pool: &Pool) -> Result<Vec<SyncRecord>> {
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT r.item_id FROM sync_records r \
         LEFT JOIN destination_statuses d ON d.item_id = r.item_id \
         WHERE r.stage = 'FAILED' OR d.status = 'FAILED' \
         ORDER BY r.updated_at DESC",
    )
    .fetch_all(pool)
    .await?;

    let mut conn = pool.acquire().await?;
    let mut records = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(record) = load_record(&mut conn, &id).await? {
            records.push(record);
        }
    }
    Ok(records)
}

#[instrument(skip_all)]
pub async fn count_by_stage(pool: &Pool) -> Result<Vec<StageCount>> {
    let rows = sqlx::query("SELECT stage, COUNT(*) AS cnt FROM sync_records GROUP BY stage")
        .fetch_all(pool)
        .await?;
    let mut counts: Vec<StageCount> = rows
        .into_iter()
        .filter_map(|row| {
            let stage: String = row.get("stage");
            Stage::parse_stage(&stage).map(|stage| StageCount {
                stage,
                count: row.get("cnt"),
            })
        })
        .collect();
    counts.sort_by_key(|c| c.stage);
    Ok(counts)
}

pub async fn get_cursor(pool: &Pool, feed: &str) -> Result<Option<String>> {
    let cursor = sqlx::query_scalar("SELECT cursor FROM fetch_cursors WHERE feed = ?")
        .bind(feed)
        .fetch_optional(pool)
        .await?;
    Ok(cursor)
}

pub async fn set_cursor(pool: &Pool, feed: &str, cursor: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO fetch_cursors (feed, cursor, updated_at) VALUES (?, ?, ?) \
         ON CONFLICT(feed) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at",
    )
    .bind(feed)
    .bind(cursor)
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("failed to persist fetch cursor")?;
    Ok(())
}
