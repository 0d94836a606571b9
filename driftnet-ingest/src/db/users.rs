//! Per-family user persistence
//!
//! Users are keyed by their platform id and upserted: mutable fields
//! (display name, handle, avatar path) follow the newest sidecar; an absent
//! avatar path never clobbers a previously cached one.

use anyhow::Result;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::HashSet;

use crate::models::job::SourceFamily;

pub async fn upsert_twitter_user(
    conn: &mut SqliteConnection,
    id: &str,
    name: Option<&str>,
    handle: Option<&str>,
    avatar_local_path: Option<&str>,
    followers_count: i64,
    friends_count: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO twitter_users
            (id, name, handle, profile_image_local_path, followers_count, friends_count)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            handle = excluded.handle,
            profile_image_local_path =
                COALESCE(excluded.profile_image_local_path, twitter_users.profile_image_local_path),
            followers_count = excluded.followers_count,
            friends_count = excluded.friends_count
        "#,
    )
    .bind(id)
    .bind(name)
    .bind(handle)
    .bind(avatar_local_path)
    .bind(followers_count)
    .bind(friends_count)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn upsert_pixiv_user(
    conn: &mut SqliteConnection,
    id: &str,
    name: Option<&str>,
    account: Option<&str>,
    avatar_local_path: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO pixiv_users (id, name, account, profile_image_local_path)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            account = excluded.account,
            profile_image_local_path =
                COALESCE(excluded.profile_image_local_path, pixiv_users.profile_image_local_path)
        "#,
    )
    .bind(id)
    .bind(name)
    .bind(account)
    .bind(avatar_local_path)
    .execute(conn)
    .await?;
    Ok(())
}

/// Load the set of known user ids for one family (reconciliation cache)
pub async fn load_user_ids(pool: &SqlitePool, family: SourceFamily) -> Result<HashSet<String>> {
    let query = match family {
        SourceFamily::Twitter => "SELECT id FROM twitter_users",
        SourceFamily::Pixiv => "SELECT id FROM pixiv_users",
        // Boorus have no user entity
        SourceFamily::Gelbooru => return Ok(HashSet::new()),
    };

    let rows = sqlx::query(query).fetch_all(pool).await?;
    Ok(rows.iter().map(|r| r.get::<String, _>("id")).collect())
}

/// Count users of one family (test observability)
pub async fn count_users(pool: &SqlitePool, family: SourceFamily) -> Result<i64> {
    let query = match family {
        SourceFamily::Twitter => "SELECT COUNT(*) FROM twitter_users",
        SourceFamily::Pixiv => "SELECT COUNT(*) FROM pixiv_users",
        SourceFamily::Gelbooru => return Ok(0),
    };
    Ok(sqlx::query_scalar(query).fetch_one(pool).await?)
}
