//! Scan-run and repair-run persistence

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::models::job::RunStatus;

/// Cumulative counters for one reconciliation pass
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanCounters {
    pub files_processed: u64,
    pub files_added: u64,
    pub files_updated: u64,
    pub files_deleted: u64,
    pub errors: u64,
}

/// Insert a `running` scan-run row, returning its id
pub async fn insert_scan_run(pool: &SqlitePool) -> Result<i64> {
    let result =
        sqlx::query("INSERT INTO scan_runs (start_time, status) VALUES (?, 'running')")
            .bind(Utc::now().to_rfc3339())
            .execute(pool)
            .await?;
    Ok(result.last_insert_rowid())
}

/// Flush cumulative counters mid-scan (observability under long scans)
pub async fn update_scan_counters(
    pool: &SqlitePool,
    scan_id: i64,
    counters: &ScanCounters,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE scan_runs
        SET files_processed = ?, files_added = ?, files_updated = ?,
            files_deleted = ?, errors = ?
        WHERE id = ?
        "#,
    )
    .bind(counters.files_processed as i64)
    .bind(counters.files_added as i64)
    .bind(counters.files_updated as i64)
    .bind(counters.files_deleted as i64)
    .bind(counters.errors as i64)
    .bind(scan_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn finalize_scan_run(
    pool: &SqlitePool,
    scan_id: i64,
    status: RunStatus,
    counters: &ScanCounters,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE scan_runs
        SET end_time = ?, status = ?, files_processed = ?, files_added = ?,
            files_updated = ?, files_deleted = ?, errors = ?
        WHERE id = ?
        "#,
    )
    .bind(Utc::now().to_rfc3339())
    .bind(status.as_str())
    .bind(counters.files_processed as i64)
    .bind(counters.files_added as i64)
    .bind(counters.files_updated as i64)
    .bind(counters.files_deleted as i64)
    .bind(counters.errors as i64)
    .bind(scan_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// One reconciliation pass as stored
#[derive(Debug, Clone)]
pub struct ScanRunRow {
    pub id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: String,
    pub files_processed: i64,
    pub files_added: i64,
    pub files_updated: i64,
    pub files_deleted: i64,
    pub errors: i64,
}

pub async fn latest_scan_run(pool: &SqlitePool) -> Result<Option<ScanRunRow>> {
    let row = sqlx::query(
        r#"
        SELECT id, start_time, end_time, status, files_processed, files_added,
               files_updated, files_deleted, errors
        FROM scan_runs ORDER BY id DESC LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else { return Ok(None) };

    let start: String = row.get("start_time");
    let end: Option<String> = row.get("end_time");
    Ok(Some(ScanRunRow {
        id: row.get("id"),
        start_time: DateTime::parse_from_rfc3339(&start)?.with_timezone(&Utc),
        end_time: match end {
            Some(s) => Some(DateTime::parse_from_rfc3339(&s)?.with_timezone(&Utc)),
            None => None,
        },
        status: row.get("status"),
        files_processed: row.get("files_processed"),
        files_added: row.get("files_added"),
        files_updated: row.get("files_updated"),
        files_deleted: row.get("files_deleted"),
        errors: row.get("errors"),
    }))
}

/// Insert a `running` repair-run row, returning its id
pub async fn insert_repair_run(pool: &SqlitePool, repair_type: &str) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO repair_runs (repair_type, start_time, status) VALUES (?, ?, 'running')",
    )
    .bind(repair_type)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Flush live repair counters (periodic during both phases)
pub async fn update_repair_progress(
    pool: &SqlitePool,
    run_id: i64,
    files_checked: u64,
    files_repaired: u64,
    errors: u64,
    current_path: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE repair_runs
        SET files_checked = ?, files_repaired = ?, errors = ?, current_path = ?
        WHERE id = ?
        "#,
    )
    .bind(files_checked as i64)
    .bind(files_repaired as i64)
    .bind(errors as i64)
    .bind(current_path)
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn finalize_repair_run(
    pool: &SqlitePool,
    run_id: i64,
    status: RunStatus,
    files_checked: u64,
    files_repaired: u64,
    errors: u64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE repair_runs
        SET end_time = ?, status = ?, files_checked = ?, files_repaired = ?,
            errors = ?, current_path = NULL
        WHERE id = ?
        "#,
    )
    .bind(Utc::now().to_rfc3339())
    .bind(status.as_str())
    .bind(files_checked as i64)
    .bind(files_repaired as i64)
    .bind(errors as i64)
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// One repair run as stored
#[derive(Debug, Clone)]
pub struct RepairRunRow {
    pub id: i64,
    pub repair_type: String,
    pub status: String,
    pub files_checked: i64,
    pub files_repaired: i64,
    pub errors: i64,
    pub current_path: Option<String>,
}

pub async fn latest_repair_run(pool: &SqlitePool) -> Result<Option<RepairRunRow>> {
    let row = sqlx::query(
        r#"
        SELECT id, repair_type, status, files_checked, files_repaired, errors, current_path
        FROM repair_runs ORDER BY id DESC LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| RepairRunRow {
        id: row.get("id"),
        repair_type: row.get("repair_type"),
        status: row.get("status"),
        files_checked: row.get("files_checked"),
        files_repaired: row.get("files_repaired"),
        errors: row.get("errors"),
        current_path: row.get("current_path"),
    }))
}
