//! Scrape history and download-log persistence

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::models::job::RunStatus;

/// One scrape job attempt as stored
#[derive(Debug, Clone)]
pub struct ScrapeHistoryRow {
    pub id: i64,
    pub source_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: String,
    pub files_downloaded: i64,
    pub bytes_downloaded: i64,
    pub error_count: i64,
    pub skipped_count: i64,
    pub posts_processed: i64,
    pub average_speed: i64,
    pub last_error: Option<String>,
    pub task_id: String,
}

/// Insert a `running` history row at job start, returning its id
pub async fn insert_history(pool: &SqlitePool, source_id: i64, task_id: &str) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO scrape_history (source_id, start_time, status, task_id) VALUES (?, ?, 'running', ?)",
    )
    .bind(source_id)
    .bind(Utc::now().to_rfc3339())
    .bind(task_id)
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Final counter snapshot written when a job reaches a terminal state
#[derive(Debug, Clone)]
pub struct HistoryOutcome<'a> {
    pub status: RunStatus,
    pub files_downloaded: u64,
    pub bytes_downloaded: u64,
    pub error_count: u64,
    pub skipped_count: u64,
    pub posts_processed: u64,
    pub average_speed: i64,
    pub last_error: Option<&'a str>,
}

pub async fn finalize_history(
    pool: &SqlitePool,
    history_id: i64,
    outcome: &HistoryOutcome<'_>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE scrape_history
        SET end_time = ?, status = ?, files_downloaded = ?, bytes_downloaded = ?,
            error_count = ?, skipped_count = ?, posts_processed = ?,
            average_speed = ?, last_error = ?
        WHERE id = ?
        "#,
    )
    .bind(Utc::now().to_rfc3339())
    .bind(outcome.status.as_str())
    .bind(outcome.files_downloaded as i64)
    .bind(outcome.bytes_downloaded as i64)
    .bind(outcome.error_count as i64)
    .bind(outcome.skipped_count as i64)
    .bind(outcome.posts_processed as i64)
    .bind(outcome.average_speed)
    .bind(outcome.last_error)
    .bind(history_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Recent history rows for one source, newest first
pub async fn list_recent(
    pool: &SqlitePool,
    source_id: i64,
    limit: i64,
) -> Result<Vec<ScrapeHistoryRow>> {
    let rows = sqlx::query(
        r#"
        SELECT id, source_id, start_time, end_time, status, files_downloaded,
               bytes_downloaded, error_count, skipped_count, posts_processed,
               average_speed, last_error, task_id
        FROM scrape_history
        WHERE source_id = ?
        ORDER BY id DESC
        LIMIT ?
        "#,
    )
    .bind(source_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let start: String = row.get("start_time");
            let end: Option<String> = row.get("end_time");
            Ok(ScrapeHistoryRow {
                id: row.get("id"),
                source_id: row.get("source_id"),
                start_time: DateTime::parse_from_rfc3339(&start)?.with_timezone(&Utc),
                end_time: match end {
                    Some(s) => Some(DateTime::parse_from_rfc3339(&s)?.with_timezone(&Utc)),
                    None => None,
                },
                status: row.get("status"),
                files_downloaded: row.get("files_downloaded"),
                bytes_downloaded: row.get("bytes_downloaded"),
                error_count: row.get("error_count"),
                skipped_count: row.get("skipped_count"),
                posts_processed: row.get("posts_processed"),
                average_speed: row.get("average_speed"),
                last_error: row.get("last_error"),
                task_id: row.get("task_id"),
            })
        })
        .collect()
}

/// Bulk-log discovered files against their source, in fixed-size chunks
/// with insert-or-ignore (the path column is unique; re-logging is a no-op).
/// Returns the number of new rows.
pub async fn log_downloaded_files(
    pool: &SqlitePool,
    source_id: i64,
    paths: &[PathBuf],
) -> Result<u64> {
    const CHUNK: usize = 100;

    let now = Utc::now().to_rfc3339();
    let mut inserted = 0u64;

    for chunk in paths.chunks(CHUNK) {
        let mut tx = pool.begin().await?;
        for path in chunk {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO scraper_download_log (source_id, file_path, created_at) VALUES (?, ?, ?)",
            )
            .bind(source_id)
            .bind(path.to_string_lossy().as_ref())
            .bind(&now)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
    }

    Ok(inserted)
}

/// Load the provenance cache: file path → source id
pub async fn load_provenance_map(pool: &SqlitePool) -> Result<HashMap<String, i64>> {
    let rows = sqlx::query("SELECT file_path, source_id FROM scraper_download_log")
        .fetch_all(pool)
        .await?;

    Ok(rows
        .iter()
        .map(|r| (r.get::<String, _>("file_path"), r.get::<i64, _>("source_id")))
        .collect())
}

/// Which source produced a file, if known
pub async fn source_for_file(pool: &SqlitePool, path: &str) -> Result<Option<i64>> {
    Ok(
        sqlx::query_scalar("SELECT source_id FROM scraper_download_log WHERE file_path = ?")
            .bind(path)
            .fetch_optional(pool)
            .await?,
    )
}
