//! Avatar retrieval and caching
//!
//! Profile images are downloaded once per (platform, user) through the
//! rate-limited queue and cached at `avatarRoot/<platform>/<userId><ext>`.
//! A failed fetch leaves the user without a local avatar rather than
//! failing the surrounding batch.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::models::job::SourceFamily;
use crate::services::task_queue::RateLimitedQueue;

const USER_AGENT: &str = concat!("driftnet/", env!("CARGO_PKG_VERSION"));

pub struct AvatarFetcher {
    http: reqwest::Client,
    queue: Arc<RateLimitedQueue>,
    avatar_root: PathBuf,
}

impl AvatarFetcher {
    pub fn new(queue: Arc<RateLimitedQueue>, avatar_root: PathBuf) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build avatar HTTP client")?;

        Ok(Self {
            http,
            queue,
            avatar_root,
        })
    }

    /// Resolve a user's avatar to a local path, downloading it if not yet
    /// cached. Returns `None` on any failure.
    pub async fn resolve(
        &self,
        family: SourceFamily,
        user_id: &str,
        remote_url: &str,
    ) -> Option<PathBuf> {
        if let Some(cached) = self.cached(family, user_id) {
            return Some(cached);
        }

        let dest = self
            .avatar_root
            .join(family.as_str())
            .join(format!("{}{}", user_id, extension_of(remote_url)));

        let http = self.http.clone();
        let url = remote_url.to_string();
        let target = dest.clone();

        let outcome = self
            .queue
            .run(CancellationToken::new(), async move {
                fetch_to_file(&http, &url, &target).await
            })
            .await;

        match outcome {
            Ok(Ok(())) => Some(dest),
            Ok(Err(e)) => {
                tracing::warn!(
                    family = %family,
                    user_id = %user_id,
                    error = %e,
                    "Avatar fetch failed, leaving user without local avatar"
                );
                None
            }
            Err(e) => {
                tracing::warn!(family = %family, user_id = %user_id, error = %e, "Avatar fetch not started");
                None
            }
        }
    }

    /// Already-cached avatar path, matching any extension
    pub fn cached(&self, family: SourceFamily, user_id: &str) -> Option<PathBuf> {
        let dir = self.avatar_root.join(family.as_str());
        let entries = std::fs::read_dir(&dir).ok()?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path
                .file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(|stem| stem == user_id)
            {
                return Some(path);
            }
        }
        None
    }
}

async fn fetch_to_file(http: &reqwest::Client, url: &str, dest: &Path) -> Result<()> {
    let response = http.get(url).send().await?.error_for_status()?;
    let bytes = response.bytes().await?;

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(dest, &bytes).await?;

    tracing::debug!(url = %url, dest = %dest.display(), bytes = bytes.len(), "Avatar cached");
    Ok(())
}

/// File extension from a URL path, defaulting to `.jpg`
fn extension_of(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.rsplit('/').next().and_then(|name| {
        name.rsplit_once('.')
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(char::is_alphanumeric))
    }) {
        Some(ext) => format!(".{}", ext.to_ascii_lowercase()),
        None => ".jpg".to_string(),
    }
}
