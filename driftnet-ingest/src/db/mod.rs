//! Database access for driftnet-ingest
//!
//! SQLite via sqlx. The schema is created idempotently at pool init; every
//! table write used by this crate is an insert, an update-by-key, an
//! insert-or-ignore, or a delete-by-key-set, so the whole store can be
//! rebuilt from the filesystem by re-running reconciliation.

pub mod history;
pub mod media;
pub mod posts;
pub mod runs;
pub mod sources;
pub mod tags;
pub mod users;

use anyhow::Result;
use chrono::Utc;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::SqlitePool;
use std::path::Path;

/// Initialize database connection pool
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::debug!("Connecting to database: {}", db_path.display());

    // foreign_keys is a per-connection pragma, so it goes through the
    // connect options rather than a one-off query against the pool
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePool::connect_with(options).await?;

    init_tables(&pool).await?;
    recover_stale_runs(&pool).await?;

    Ok(pool)
}

/// Create all tables if they don't exist
async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            url TEXT NOT NULL,
            extractor_type TEXT NOT NULL,
            name TEXT,
            created_at TEXT NOT NULL,
            deleted_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS posts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            extractor_type TEXT NOT NULL,
            json_source_id TEXT,
            internal_source_id INTEGER REFERENCES sources(id),
            user_id TEXT,
            date TEXT,
            title TEXT,
            content TEXT,
            url TEXT,
            metadata_path TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Dedup key: one post per (family, origin id) when the origin id is known
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_posts_dedup
        ON posts(extractor_type, json_source_id)
        WHERE json_source_id IS NOT NULL
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS twitter_details (
            post_id INTEGER PRIMARY KEY REFERENCES posts(id) ON DELETE CASCADE,
            retweet_count INTEGER NOT NULL DEFAULT 0,
            favorite_count INTEGER NOT NULL DEFAULT 0,
            reply_count INTEGER NOT NULL DEFAULT 0,
            quote_count INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pixiv_details (
            post_id INTEGER PRIMARY KEY REFERENCES posts(id) ON DELETE CASCADE,
            page_count INTEGER NOT NULL DEFAULT 1,
            total_bookmarks INTEGER NOT NULL DEFAULT 0,
            total_view INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS gelbooru_details (
            post_id INTEGER PRIMARY KEY REFERENCES posts(id) ON DELETE CASCADE,
            rating TEXT,
            score INTEGER NOT NULL DEFAULT 0,
            md5 TEXT,
            source_url TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS media_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_path TEXT NOT NULL UNIQUE,
            media_type TEXT NOT NULL,
            captured_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            post_id INTEGER REFERENCES posts(id) ON DELETE SET NULL,
            metadata_fingerprint TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS twitter_users (
            id TEXT PRIMARY KEY,
            name TEXT,
            handle TEXT,
            profile_image_local_path TEXT,
            followers_count INTEGER NOT NULL DEFAULT 0,
            friends_count INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pixiv_users (
            id TEXT PRIMARY KEY,
            name TEXT,
            account TEXT,
            profile_image_local_path TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tags (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS post_tags (
            tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
            post_id INTEGER NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
            PRIMARY KEY (tag_id, post_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scrape_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id INTEGER NOT NULL REFERENCES sources(id),
            start_time TEXT NOT NULL,
            end_time TEXT,
            status TEXT NOT NULL,
            files_downloaded INTEGER NOT NULL DEFAULT 0,
            bytes_downloaded INTEGER NOT NULL DEFAULT 0,
            error_count INTEGER NOT NULL DEFAULT 0,
            skipped_count INTEGER NOT NULL DEFAULT 0,
            posts_processed INTEGER NOT NULL DEFAULT 0,
            average_speed INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            task_id TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scan_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            start_time TEXT NOT NULL,
            end_time TEXT,
            status TEXT NOT NULL,
            files_processed INTEGER NOT NULL DEFAULT 0,
            files_added INTEGER NOT NULL DEFAULT 0,
            files_updated INTEGER NOT NULL DEFAULT 0,
            files_deleted INTEGER NOT NULL DEFAULT 0,
            errors INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS repair_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            repair_type TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT,
            status TEXT NOT NULL,
            files_checked INTEGER NOT NULL DEFAULT 0,
            files_repaired INTEGER NOT NULL DEFAULT 0,
            errors INTEGER NOT NULL DEFAULT 0,
            current_path TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scraper_download_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id INTEGER NOT NULL REFERENCES sources(id),
            file_path TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!("Database tables initialized");

    Ok(())
}

/// Mark any run rows still `running` from a previous process as failed.
///
/// A crash mid-job cannot finalize its rows; recovery happens at the next
/// startup so history never shows phantom in-flight work.
async fn recover_stale_runs(pool: &SqlitePool) -> Result<()> {
    let now = Utc::now().to_rfc3339();

    let jobs = sqlx::query(
        r#"
        UPDATE scrape_history
        SET status = 'failed', end_time = ?, last_error = 'process exited before completion'
        WHERE status = 'running'
        "#,
    )
    .bind(&now)
    .execute(pool)
    .await?
    .rows_affected();

    let scans = sqlx::query(
        r#"
        UPDATE scan_runs
        SET status = 'failed', end_time = ?, errors = errors + 1
        WHERE status = 'running'
        "#,
    )
    .bind(&now)
    .execute(pool)
    .await?
    .rows_affected();

    let repairs = sqlx::query(
        r#"
        UPDATE repair_runs
        SET status = 'failed', end_time = ?, errors = errors + 1
        WHERE status = 'running'
        "#,
    )
    .bind(&now)
    .execute(pool)
    .await?
    .rows_affected();

    if jobs + scans + repairs > 0 {
        tracing::warn!(
            stale_jobs = jobs,
            stale_scans = scans,
            stale_repairs = repairs,
            "Recovered stale running rows from a previous process"
        );
    }

    Ok(())
}
