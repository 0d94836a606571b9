//! Source registry reads
//!
//! Source creation and soft-deletion belong to the registry layer; this
//! core only reads active (non-deleted) sources. The insert exists for the
//! registry layer and test fixtures to share.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

/// A content source as the registry exposes it
#[derive(Debug, Clone)]
pub struct Source {
    pub id: i64,
    pub url: String,
    pub extractor_type: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

fn source_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Source> {
    let created_at: String = row.get("created_at");
    let deleted_at: Option<String> = row.get("deleted_at");
    Ok(Source {
        id: row.get("id"),
        url: row.get("url"),
        extractor_type: row.get("extractor_type"),
        name: row.get("name"),
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        deleted_at: match deleted_at {
            Some(s) => Some(DateTime::parse_from_rfc3339(&s)?.with_timezone(&Utc)),
            None => None,
        },
    })
}

/// Load a single active source by id
pub async fn load_source(pool: &SqlitePool, id: i64) -> Result<Option<Source>> {
    let row = sqlx::query(
        "SELECT id, url, extractor_type, name, created_at, deleted_at
         FROM sources WHERE id = ? AND deleted_at IS NULL",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(source_from_row).transpose()
}

/// Load every active source
pub async fn load_active_sources(pool: &SqlitePool) -> Result<Vec<Source>> {
    let rows = sqlx::query(
        "SELECT id, url, extractor_type, name, created_at, deleted_at
         FROM sources WHERE deleted_at IS NULL ORDER BY id",
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(source_from_row).collect()
}

/// Insert a new source row, returning its id
pub async fn insert_source(
    pool: &SqlitePool,
    url: &str,
    extractor_type: &str,
    name: Option<&str>,
) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO sources (url, extractor_type, name, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(url)
    .bind(extractor_type)
    .bind(name)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}
