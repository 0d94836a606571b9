//! Media item persistence
//!
//! `media_items.file_path` is globally unique and is the join key between
//! filesystem truth and stored state during reconciliation.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::HashMap;

/// Media classification, the unit of display and deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Image,
    Video,
    Audio,
    /// A sidecar with no media file; kept so text-only content stays
    /// visible and taggable
    Text,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Text => "text",
        }
    }

    /// Classify a file by lowercase extension; `None` for unknown kinds
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "bmp" | "avif" => Some(MediaType::Image),
            "mp4" | "webm" | "mkv" | "mov" | "m4v" => Some(MediaType::Video),
            "mp3" | "m4a" | "wav" | "flac" | "ogg" | "opus" => Some(MediaType::Audio),
            _ => None,
        }
    }
}

/// Cached view of one stored media item, loaded up front per scan
#[derive(Debug, Clone)]
pub struct MediaCacheEntry {
    pub id: i64,
    pub fingerprint: Option<String>,
}

/// Load the reconciliation cache: file path → {id, fingerprint}
pub async fn load_media_cache(pool: &SqlitePool) -> Result<HashMap<String, MediaCacheEntry>> {
    let rows = sqlx::query("SELECT id, file_path, metadata_fingerprint FROM media_items")
        .fetch_all(pool)
        .await?;

    let mut map = HashMap::with_capacity(rows.len());
    for row in rows {
        map.insert(
            row.get::<String, _>("file_path"),
            MediaCacheEntry {
                id: row.get("id"),
                fingerprint: row.get("metadata_fingerprint"),
            },
        );
    }
    Ok(map)
}

#[derive(Debug, Clone)]
pub struct NewMediaItem<'a> {
    pub file_path: &'a str,
    pub media_type: MediaType,
    pub captured_at: DateTime<Utc>,
    pub post_id: Option<i64>,
    pub fingerprint: Option<&'a str>,
}

pub async fn insert_media_item(
    conn: &mut SqliteConnection,
    item: &NewMediaItem<'_>,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO media_items
            (file_path, media_type, captured_at, created_at, post_id, metadata_fingerprint)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(item.file_path)
    .bind(item.media_type.as_str())
    .bind(item.captured_at.to_rfc3339())
    .bind(Utc::now().to_rfc3339())
    .bind(item.post_id)
    .bind(item.fingerprint)
    .execute(conn)
    .await?;

    Ok(result.last_insert_rowid())
}

pub async fn update_media_item(
    conn: &mut SqliteConnection,
    id: i64,
    captured_at: DateTime<Utc>,
    post_id: Option<i64>,
    fingerprint: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE media_items
        SET captured_at = ?, post_id = ?, metadata_fingerprint = ?
        WHERE id = ?
        "#,
    )
    .bind(captured_at.to_rfc3339())
    .bind(post_id)
    .bind(fingerprint)
    .bind(id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Delete media items by path, in chunks to keep IN-lists bounded.
/// Returns the number of rows removed.
pub async fn delete_media_by_paths(pool: &SqlitePool, paths: &[String]) -> Result<u64> {
    const CHUNK: usize = 500;

    let mut deleted = 0u64;
    for chunk in paths.chunks(CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!("DELETE FROM media_items WHERE file_path IN ({})", placeholders);

        let mut query = sqlx::query(&sql);
        for path in chunk {
            query = query.bind(path);
        }
        deleted += query.execute(pool).await?.rows_affected();
    }

    Ok(deleted)
}

/// Count media items (test observability)
pub async fn count_media(pool: &SqlitePool) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM media_items")
        .fetch_one(pool)
        .await?)
}

/// Media type stored for one path (test observability)
pub async fn media_type_for_path(pool: &SqlitePool, path: &str) -> Result<Option<String>> {
    Ok(
        sqlx::query_scalar("SELECT media_type FROM media_items WHERE file_path = ?")
            .bind(path)
            .fetch_optional(pool)
            .await?,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_extensions() {
        assert_eq!(MediaType::from_extension("jpg"), Some(MediaType::Image));
        assert_eq!(MediaType::from_extension("webm"), Some(MediaType::Video));
        assert_eq!(MediaType::from_extension("flac"), Some(MediaType::Audio));
        assert_eq!(MediaType::from_extension("json"), None);
        assert_eq!(MediaType::from_extension("exe"), None);
    }
}
