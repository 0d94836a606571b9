//! Sidecar metadata shapes
//!
//! Every media file may carry a `<name>.json` sidecar written by the
//! extractor tool. Sidecars are a tagged union keyed by the `category`
//! field; parsing validates the shape up front so downstream processors
//! receive a typed variant instead of an open-ended record.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;

use super::job::SourceFamily;

/// Parsed sidecar metadata, one variant per content-source family
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "category", rename_all = "lowercase")]
pub enum SidecarMetadata {
    Twitter(TweetMetadata),
    Pixiv(PixivMetadata),
    Gelbooru(GelbooruMetadata),
}

#[derive(Debug, Clone, Deserialize)]
pub struct TweetMetadata {
    pub tweet_id: u64,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub author: Option<TweetAuthor>,
    #[serde(default)]
    pub hashtags: Vec<String>,
    #[serde(default)]
    pub retweet_count: i64,
    #[serde(default)]
    pub favorite_count: i64,
    #[serde(default)]
    pub reply_count: i64,
    #[serde(default)]
    pub quote_count: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TweetAuthor {
    pub id: u64,
    /// Screen name (handle)
    #[serde(default)]
    pub name: Option<String>,
    /// Display name
    #[serde(default)]
    pub nick: Option<String>,
    #[serde(default)]
    pub profile_image: Option<String>,
    #[serde(default)]
    pub followers_count: i64,
    #[serde(default)]
    pub friends_count: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PixivMetadata {
    pub id: u64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub user: Option<PixivUserInfo>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Number of pages (media files) belonging to this work
    #[serde(default)]
    pub count: Option<u64>,
    #[serde(default)]
    pub total_bookmarks: i64,
    #[serde(default)]
    pub total_view: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PixivUserInfo {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub profile_image: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GelbooruMetadata {
    pub id: u64,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// Space-separated tag list, the booru convention
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub rating: Option<String>,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

/// Owner of a piece of content, extracted for user upserts and avatar
/// retrieval
#[derive(Debug, Clone)]
pub struct UserRef {
    pub family: SourceFamily,
    pub id: String,
    pub name: Option<String>,
    pub handle: Option<String>,
    pub avatar_url: Option<String>,
}

impl SidecarMetadata {
    /// Parse raw sidecar bytes, validating the shape for the declared family
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn family(&self) -> SourceFamily {
        match self {
            SidecarMetadata::Twitter(_) => SourceFamily::Twitter,
            SidecarMetadata::Pixiv(_) => SourceFamily::Pixiv,
            SidecarMetadata::Gelbooru(_) => SourceFamily::Gelbooru,
        }
    }

    /// Origin platform id of the post this sidecar describes
    pub fn origin_id(&self) -> String {
        match self {
            SidecarMetadata::Twitter(t) => t.tweet_id.to_string(),
            SidecarMetadata::Pixiv(p) => p.id.to_string(),
            SidecarMetadata::Gelbooru(g) => g.id.to_string(),
        }
    }

    /// Dedup key shared with the posts table: `<family>:<origin id>`
    pub fn post_key(&self) -> String {
        format!("{}:{}", self.family().as_str(), self.origin_id())
    }

    pub fn title(&self) -> Option<&str> {
        match self {
            // Tweets have no title; the caption doubles as content below
            SidecarMetadata::Twitter(_) => None,
            SidecarMetadata::Pixiv(p) => p.title.as_deref(),
            SidecarMetadata::Gelbooru(g) => g.title.as_deref(),
        }
    }

    pub fn content(&self) -> Option<&str> {
        match self {
            SidecarMetadata::Twitter(t) => t.content.as_deref(),
            SidecarMetadata::Pixiv(p) => p.caption.as_deref(),
            SidecarMetadata::Gelbooru(g) => g.source.as_deref(),
        }
    }

    /// Post timestamp declared by the platform, if parseable
    pub fn captured_at(&self) -> Option<DateTime<Utc>> {
        let raw = match self {
            SidecarMetadata::Twitter(t) => t.date.as_deref(),
            SidecarMetadata::Pixiv(p) => p.date.as_deref(),
            SidecarMetadata::Gelbooru(g) => g.created_at.as_deref(),
        }?;
        parse_platform_date(raw)
    }

    /// Tag names in declaration order
    pub fn tag_names(&self) -> Vec<String> {
        match self {
            SidecarMetadata::Twitter(t) => t.hashtags.clone(),
            SidecarMetadata::Pixiv(p) => p.tags.clone(),
            SidecarMetadata::Gelbooru(g) => g
                .tags
                .as_deref()
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
        }
    }

    /// Content owner, when the family tracks users
    pub fn user_ref(&self) -> Option<UserRef> {
        match self {
            SidecarMetadata::Twitter(t) => t.author.as_ref().map(|a| UserRef {
                family: SourceFamily::Twitter,
                id: a.id.to_string(),
                name: a.nick.clone(),
                handle: a.name.clone(),
                avatar_url: a.profile_image.clone(),
            }),
            SidecarMetadata::Pixiv(p) => p.user.as_ref().map(|u| UserRef {
                family: SourceFamily::Pixiv,
                id: u.id.to_string(),
                name: u.name.clone(),
                handle: u.account.clone(),
                avatar_url: u.profile_image.clone(),
            }),
            // Boorus are tag-indexed; there is no user entity
            SidecarMetadata::Gelbooru(_) => None,
        }
    }

    /// Media count the sidecar claims to describe (repair defect scan)
    pub fn declared_media_count(&self) -> Option<u64> {
        match self {
            SidecarMetadata::Pixiv(p) => p.count,
            _ => None,
        }
    }
}

/// Parse the date formats the extractor tools emit: RFC3339 first, then the
/// bare `YYYY-MM-DD HH:MM:SS` form.
fn parse_platform_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_twitter_sidecar() {
        let raw = br#"{
            "category": "twitter",
            "tweet_id": 17290401,
            "date": "2024-02-03 10:20:30",
            "content": "hello world #rust",
            "hashtags": ["rust"],
            "favorite_count": 12,
            "retweet_count": 3,
            "author": {"id": 99, "name": "someone", "nick": "Some One",
                       "profile_image": "https://img.example/u/99.jpg"}
        }"#;

        let meta = SidecarMetadata::parse(raw).unwrap();
        assert_eq!(meta.family(), SourceFamily::Twitter);
        assert_eq!(meta.origin_id(), "17290401");
        assert_eq!(meta.post_key(), "twitter:17290401");
        assert_eq!(meta.tag_names(), vec!["rust".to_string()]);
        assert_eq!(meta.content(), Some("hello world #rust"));
        assert!(meta.captured_at().is_some());

        let user = meta.user_ref().unwrap();
        assert_eq!(user.id, "99");
        assert_eq!(user.handle.as_deref(), Some("someone"));
        assert_eq!(
            user.avatar_url.as_deref(),
            Some("https://img.example/u/99.jpg")
        );
    }

    #[test]
    fn parses_pixiv_sidecar_with_count() {
        let raw = br#"{
            "category": "pixiv",
            "id": 99,
            "title": "sketchbook",
            "date": "2023-06-01T09:00:00+09:00",
            "tags": ["original", "landscape"],
            "count": 2,
            "user": {"id": 42, "name": "Artist", "account": "artist42"}
        }"#;

        let meta = SidecarMetadata::parse(raw).unwrap();
        assert_eq!(meta.family(), SourceFamily::Pixiv);
        assert_eq!(meta.title(), Some("sketchbook"));
        assert_eq!(meta.declared_media_count(), Some(2));
        assert_eq!(meta.tag_names().len(), 2);
        assert!(meta.captured_at().is_some());
    }

    #[test]
    fn parses_gelbooru_sidecar_splitting_tags() {
        let raw = br#"{
            "category": "gelbooru",
            "id": 555,
            "tags": "sky cloud 1girl",
            "rating": "general",
            "score": 10,
            "md5": "abc123"
        }"#;

        let meta = SidecarMetadata::parse(raw).unwrap();
        assert_eq!(meta.family(), SourceFamily::Gelbooru);
        assert_eq!(
            meta.tag_names(),
            vec!["sky".to_string(), "cloud".to_string(), "1girl".to_string()]
        );
        assert!(meta.user_ref().is_none());
    }

    #[test]
    fn rejects_unknown_category_and_malformed_json() {
        assert!(SidecarMetadata::parse(br#"{"category": "flickr", "id": 1}"#).is_err());
        assert!(SidecarMetadata::parse(b"not json").is_err());
        // Missing required id field for the declared family
        assert!(SidecarMetadata::parse(br#"{"category": "pixiv", "title": "x"}"#).is_err());
    }
}
