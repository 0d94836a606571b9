//! Post and per-family detail persistence

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::HashMap;

use crate::models::job::SourceFamily;
use crate::models::metadata::{GelbooruMetadata, PixivMetadata, TweetMetadata};

/// Fields of a post about to be inserted
#[derive(Debug, Clone)]
pub struct NewPost<'a> {
    pub extractor_type: SourceFamily,
    pub json_source_id: Option<&'a str>,
    pub internal_source_id: Option<i64>,
    pub user_id: Option<&'a str>,
    pub date: Option<DateTime<Utc>>,
    pub title: Option<&'a str>,
    pub content: Option<&'a str>,
    pub url: Option<&'a str>,
    pub metadata_path: Option<&'a str>,
}

/// Insert a post, tolerating a concurrent insert of the same dedup key.
///
/// `INSERT OR IGNORE` followed by a re-select on the (family, origin id)
/// key: if this insert loses a race within the same batch, the winner's id
/// is returned instead.
pub async fn insert_post(conn: &mut SqliteConnection, post: &NewPost<'_>) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO posts
            (extractor_type, json_source_id, internal_source_id, user_id,
             date, title, content, url, metadata_path, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(post.extractor_type.as_str())
    .bind(post.json_source_id)
    .bind(post.internal_source_id)
    .bind(post.user_id)
    .bind(post.date.map(|d| d.to_rfc3339()))
    .bind(post.title)
    .bind(post.content)
    .bind(post.url)
    .bind(post.metadata_path)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() > 0 {
        return Ok(result.last_insert_rowid());
    }

    let id: i64 = sqlx::query_scalar(
        "SELECT id FROM posts WHERE extractor_type = ? AND json_source_id = ?",
    )
    .bind(post.extractor_type.as_str())
    .bind(post.json_source_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(id)
}

/// Load the dedup cache: `<family>:<origin id>` → post id, for every post
/// with a known origin id.
pub async fn load_existing_post_keys(pool: &SqlitePool) -> Result<HashMap<String, i64>> {
    let rows = sqlx::query(
        "SELECT id, extractor_type, json_source_id FROM posts WHERE json_source_id IS NOT NULL",
    )
    .fetch_all(pool)
    .await?;

    let mut map = HashMap::with_capacity(rows.len());
    for row in rows {
        let family: String = row.get("extractor_type");
        let origin: String = row.get("json_source_id");
        map.insert(format!("{}:{}", family, origin), row.get("id"));
    }
    Ok(map)
}

/// Count posts (test observability)
pub async fn count_posts(pool: &SqlitePool) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM posts")
        .fetch_one(pool)
        .await?)
}

// Detail rows are created once per post and never duplicated; the post_id
// primary key plus INSERT OR IGNORE enforces that.

pub async fn insert_twitter_detail(
    conn: &mut SqliteConnection,
    post_id: i64,
    meta: &TweetMetadata,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO twitter_details
            (post_id, retweet_count, favorite_count, reply_count, quote_count)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(post_id)
    .bind(meta.retweet_count)
    .bind(meta.favorite_count)
    .bind(meta.reply_count)
    .bind(meta.quote_count)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn insert_pixiv_detail(
    conn: &mut SqliteConnection,
    post_id: i64,
    meta: &PixivMetadata,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO pixiv_details
            (post_id, page_count, total_bookmarks, total_view)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(post_id)
    .bind(meta.count.unwrap_or(1) as i64)
    .bind(meta.total_bookmarks)
    .bind(meta.total_view)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn insert_gelbooru_detail(
    conn: &mut SqliteConnection,
    post_id: i64,
    meta: &GelbooruMetadata,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO gelbooru_details
            (post_id, rating, score, md5, source_url)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(post_id)
    .bind(meta.rating.as_deref())
    .bind(meta.score)
    .bind(meta.md5.as_deref())
    .bind(meta.source.as_deref())
    .execute(conn)
    .await?;
    Ok(())
}
