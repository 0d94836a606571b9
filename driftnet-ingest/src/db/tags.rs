//! Tag and post-tag persistence

use anyhow::Result;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::HashMap;

/// Load the full tag cache: name → id
pub async fn load_tag_map(pool: &SqlitePool) -> Result<HashMap<String, i64>> {
    let rows = sqlx::query("SELECT id, name FROM tags").fetch_all(pool).await?;
    Ok(rows
        .iter()
        .map(|r| (r.get::<String, _>("name"), r.get::<i64, _>("id")))
        .collect())
}

/// Get-or-create a tag by unique name, race-tolerant.
///
/// The insert-or-ignore may lose to a concurrent insert of the same name;
/// the follow-up select by unique name resolves the winner's id either way.
pub async fn get_or_create_tag(conn: &mut SqliteConnection, name: &str) -> Result<i64> {
    let result = sqlx::query("INSERT OR IGNORE INTO tags (name) VALUES (?)")
        .bind(name)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() > 0 {
        return Ok(result.last_insert_rowid());
    }

    let id: i64 = sqlx::query_scalar("SELECT id FROM tags WHERE name = ?")
        .bind(name)
        .fetch_one(&mut *conn)
        .await?;
    Ok(id)
}

/// Link a tag to a post; duplicates are not errors
pub async fn link_post_tag(conn: &mut SqliteConnection, tag_id: i64, post_id: i64) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO post_tags (tag_id, post_id) VALUES (?, ?)")
        .bind(tag_id)
        .bind(post_id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Count tags (test observability)
pub async fn count_tags(pool: &SqlitePool) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM tags")
        .fetch_one(pool)
        .await?)
}

/// Count tag links for one post (test observability)
pub async fn count_post_tags(pool: &SqlitePool, post_id: i64) -> Result<i64> {
    Ok(
        sqlx::query_scalar("SELECT COUNT(*) FROM post_tags WHERE post_id = ?")
            .bind(post_id)
            .fetch_one(pool)
            .await?,
    )
}
