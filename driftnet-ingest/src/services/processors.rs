//! Metadata processors
//!
//! One processor per content-source family: normalize a parsed sidecar
//! record into Post + Detail + User + Tag rows and return the resolved post
//! id. Processors are idempotent: the per-run existing-posts cache is
//! consulted before any insert, and every insert below it is an upsert or
//! insert-or-ignore, so reprocessing an unchanged record writes nothing new.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use crate::db;
use crate::db::posts::NewPost;
use crate::models::job::SourceFamily;
use crate::models::metadata::{GelbooruMetadata, PixivMetadata, SidecarMetadata, TweetMetadata};

/// Per-run caches shared across batches within one reconciliation pass
#[derive(Debug, Default)]
pub struct ProcessorContext {
    /// `<family>:<origin id>` → post id, loaded up front and extended as
    /// posts are created
    pub existing_posts: HashMap<String, i64>,
    /// Tag name → id
    pub tags: HashMap<String, i64>,
    pub known_twitter_users: HashSet<String>,
    pub known_pixiv_users: HashSet<String>,
    /// `<family>:<user id>` → locally cached avatar, pre-resolved per batch
    pub avatars: HashMap<String, PathBuf>,
}

/// Fields common to every family, derived once by the dispatcher
#[derive(Debug, Clone)]
pub struct PostCommon<'a> {
    pub date: Option<DateTime<Utc>>,
    pub title: Option<&'a str>,
    pub content: Option<&'a str>,
    pub metadata_path: &'a str,
    pub source_id: Option<i64>,
    pub tags: Vec<String>,
}

/// Normalize one parsed metadata record, returning the post id.
///
/// Dispatches on the sidecar's tagged union; each arm is the family's
/// processor.
pub async fn process_metadata(
    conn: &mut SqliteConnection,
    meta: &SidecarMetadata,
    metadata_path: &str,
    source_id: Option<i64>,
    ctx: &mut ProcessorContext,
) -> Result<Option<i64>> {
    let key = meta.post_key();
    if let Some(&id) = ctx.existing_posts.get(&key) {
        return Ok(Some(id));
    }

    let common = PostCommon {
        date: meta.captured_at(),
        title: meta.title(),
        content: meta.content(),
        metadata_path,
        source_id,
        tags: meta.tag_names(),
    };

    let post_id = match meta {
        SidecarMetadata::Twitter(t) => process_twitter(conn, t, &common, ctx).await?,
        SidecarMetadata::Pixiv(p) => process_pixiv(conn, p, &common, ctx).await?,
        SidecarMetadata::Gelbooru(g) => process_gelbooru(conn, g, &common, ctx).await?,
    };

    if let Some(id) = post_id {
        ctx.existing_posts.insert(key, id);
    }

    Ok(post_id)
}

async fn process_twitter(
    conn: &mut SqliteConnection,
    meta: &TweetMetadata,
    common: &PostCommon<'_>,
    ctx: &mut ProcessorContext,
) -> Result<Option<i64>> {
    let origin_id = meta.tweet_id.to_string();

    let user_id = match &meta.author {
        Some(author) => {
            let uid = author.id.to_string();
            let avatar = ctx
                .avatars
                .get(&format!("twitter:{}", uid))
                .map(|p| p.to_string_lossy().into_owned());
            db::users::upsert_twitter_user(
                conn,
                &uid,
                author.nick.as_deref(),
                author.name.as_deref(),
                avatar.as_deref(),
                author.followers_count,
                author.friends_count,
            )
            .await?;
            ctx.known_twitter_users.insert(uid.clone());
            Some(uid)
        }
        None => None,
    };

    let post_id = db::posts::insert_post(
        conn,
        &NewPost {
            extractor_type: SourceFamily::Twitter,
            json_source_id: Some(&origin_id),
            internal_source_id: common.source_id,
            user_id: user_id.as_deref(),
            date: common.date,
            title: common.title,
            content: common.content,
            url: Some(&SourceFamily::Twitter.entity_url(&origin_id)),
            metadata_path: Some(common.metadata_path),
        },
    )
    .await?;

    db::posts::insert_twitter_detail(conn, post_id, meta).await?;
    attach_tags(conn, &mut ctx.tags, &common.tags, post_id).await?;

    Ok(Some(post_id))
}

async fn process_pixiv(
    conn: &mut SqliteConnection,
    meta: &PixivMetadata,
    common: &PostCommon<'_>,
    ctx: &mut ProcessorContext,
) -> Result<Option<i64>> {
    let origin_id = meta.id.to_string();

    let user_id = match &meta.user {
        Some(user) => {
            let uid = user.id.to_string();
            let avatar = ctx
                .avatars
                .get(&format!("pixiv:{}", uid))
                .map(|p| p.to_string_lossy().into_owned());
            db::users::upsert_pixiv_user(
                conn,
                &uid,
                user.name.as_deref(),
                user.account.as_deref(),
                avatar.as_deref(),
            )
            .await?;
            ctx.known_pixiv_users.insert(uid.clone());
            Some(uid)
        }
        None => None,
    };

    let post_id = db::posts::insert_post(
        conn,
        &NewPost {
            extractor_type: SourceFamily::Pixiv,
            json_source_id: Some(&origin_id),
            internal_source_id: common.source_id,
            user_id: user_id.as_deref(),
            date: common.date,
            title: common.title,
            content: common.content,
            url: Some(&SourceFamily::Pixiv.entity_url(&origin_id)),
            metadata_path: Some(common.metadata_path),
        },
    )
    .await?;

    db::posts::insert_pixiv_detail(conn, post_id, meta).await?;
    attach_tags(conn, &mut ctx.tags, &common.tags, post_id).await?;

    Ok(Some(post_id))
}

async fn process_gelbooru(
    conn: &mut SqliteConnection,
    meta: &GelbooruMetadata,
    common: &PostCommon<'_>,
    ctx: &mut ProcessorContext,
) -> Result<Option<i64>> {
    let origin_id = meta.id.to_string();

    let post_id = db::posts::insert_post(
        conn,
        &NewPost {
            extractor_type: SourceFamily::Gelbooru,
            json_source_id: Some(&origin_id),
            internal_source_id: common.source_id,
            user_id: None,
            date: common.date,
            title: common.title,
            content: common.content,
            url: Some(&SourceFamily::Gelbooru.entity_url(&origin_id)),
            metadata_path: Some(common.metadata_path),
        },
    )
    .await?;

    db::posts::insert_gelbooru_detail(conn, post_id, meta).await?;
    attach_tags(conn, &mut ctx.tags, &common.tags, post_id).await?;

    Ok(Some(post_id))
}

/// Get-or-create each tag through the per-run cache, then link it to the
/// post; both steps tolerate duplicates.
async fn attach_tags(
    conn: &mut SqliteConnection,
    tag_cache: &mut HashMap<String, i64>,
    names: &[String],
    post_id: i64,
) -> Result<()> {
    for name in names {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }

        let tag_id = match tag_cache.get(name) {
            Some(&id) => id,
            None => {
                let id = db::tags::get_or_create_tag(conn, name).await?;
                tag_cache.insert(name.to_string(), id);
                id
            }
        };

        db::tags::link_post_tag(conn, tag_id, post_id).await?;
    }
    Ok(())
}
