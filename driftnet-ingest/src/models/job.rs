//! Scrape job types and shared status record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// External extractor tool families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractorTool {
    /// Generic content extractor (gallery-dl)
    GalleryDl,
    /// Media downloader (yt-dlp)
    YtDlp,
}

impl ExtractorTool {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractorTool::GalleryDl => "gallery-dl",
            ExtractorTool::YtDlp => "yt-dlp",
        }
    }
}

/// Content-source families with their own metadata shape and detail table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceFamily {
    Twitter,
    Pixiv,
    Gelbooru,
}

impl SourceFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFamily::Twitter => "twitter",
            SourceFamily::Pixiv => "pixiv",
            SourceFamily::Gelbooru => "gelbooru",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "twitter" => Some(SourceFamily::Twitter),
            "pixiv" => Some(SourceFamily::Pixiv),
            "gelbooru" => Some(SourceFamily::Gelbooru),
            _ => None,
        }
    }

    /// Canonical URL for a single entity of this family, used by repair
    pub fn entity_url(&self, id: &str) -> String {
        match self {
            SourceFamily::Twitter => format!("https://twitter.com/i/status/{}", id),
            SourceFamily::Pixiv => format!("https://www.pixiv.net/artworks/{}", id),
            SourceFamily::Gelbooru => {
                format!("https://gelbooru.com/index.php?page=post&s=view&id={}", id)
            }
        }
    }
}

impl std::fmt::Display for SourceFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal and non-terminal states shared by jobs, scans, and repair runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Stopped,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Stopped => "stopped",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the external tool is pointed at
#[derive(Debug, Clone)]
pub enum JobTarget {
    /// A single target URL
    Url(String),
    /// A newline-delimited file of target URLs (repair mode)
    UrlFile(PathBuf),
}

/// One invocation of an external extraction tool
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub target: JobTarget,
    pub dest_dir: PathBuf,
    /// Terminate early once this many files have completed
    pub stop_after_completed: Option<u64>,
    /// Terminate early once this many posts have been processed
    pub stop_after_posts: Option<u64>,
    /// Skip the tool's dedup archive so previously-seen items are retried
    pub bypass_archive: bool,
}

impl JobSpec {
    pub fn for_url(url: impl Into<String>, dest_dir: PathBuf) -> Self {
        Self {
            target: JobTarget::Url(url.into()),
            dest_dir,
            stop_after_completed: None,
            stop_after_posts: None,
            bypass_archive: false,
        }
    }

    pub fn for_url_file(path: PathBuf, dest_dir: PathBuf) -> Self {
        Self {
            target: JobTarget::UrlFile(path),
            dest_dir,
            stop_after_completed: None,
            stop_after_posts: None,
            bypass_archive: true,
        }
    }
}

/// Optional per-job limits passed through `start_scrape`
#[derive(Debug, Clone, Copy, Default)]
pub struct ScrapeOptions {
    pub stop_after_completed: Option<u64>,
    pub stop_after_posts: Option<u64>,
}

/// In-memory status of one scrape job, shared between the supervision task
/// (single writer) and status-polling consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeStatus {
    pub source_id: i64,
    pub url: String,
    pub tool: ExtractorTool,
    pub start_time: DateTime<Utc>,
    pub history_id: i64,
    pub downloaded_count: u64,
    pub skipped_count: u64,
    pub error_count: u64,
    pub posts_processed: u64,
    /// Current transfer speed, bytes per second
    pub speed: u64,
    /// Cumulative bytes reported by the tool
    pub total_bytes: u64,
    pub is_rate_limited: bool,
    pub is_finished: bool,
    pub final_status: Option<RunStatus>,
}

impl ScrapeStatus {
    pub fn new(
        source_id: i64,
        url: String,
        tool: ExtractorTool,
        history_id: i64,
    ) -> Self {
        Self {
            source_id,
            url,
            tool,
            start_time: Utc::now(),
            history_id,
            downloaded_count: 0,
            skipped_count: 0,
            error_count: 0,
            posts_processed: 0,
            speed: 0,
            total_bytes: 0,
            is_rate_limited: false,
            is_finished: false,
            final_status: None,
        }
    }

    /// Average transfer speed over the job lifetime, floored to integer
    /// bytes per second.
    pub fn average_speed(&self, end_time: DateTime<Utc>) -> i64 {
        let duration_seconds = (end_time - self.start_time).num_seconds().max(1);
        self.total_bytes as i64 / duration_seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_round_trips_as_str() {
        for status in [
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Stopped,
            RunStatus::Failed,
        ] {
            let s = status.as_str();
            let back: RunStatus = serde_json::from_str(&format!("\"{}\"", s)).unwrap();
            assert_eq!(back, status);
        }
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Stopped.is_terminal());
    }

    #[test]
    fn average_speed_floors_and_avoids_zero_division() {
        let mut status = ScrapeStatus::new(1, "u".into(), ExtractorTool::GalleryDl, 1);
        status.total_bytes = 1000;
        // end == start clamps the duration to one second
        assert_eq!(status.average_speed(status.start_time), 1000);
        let later = status.start_time + chrono::Duration::seconds(3);
        assert_eq!(status.average_speed(later), 333);
    }

    #[test]
    fn entity_urls_are_canonical() {
        assert_eq!(
            SourceFamily::Pixiv.entity_url("99"),
            "https://www.pixiv.net/artworks/99"
        );
        assert_eq!(
            SourceFamily::Twitter.entity_url("12345"),
            "https://twitter.com/i/status/12345"
        );
    }
}
