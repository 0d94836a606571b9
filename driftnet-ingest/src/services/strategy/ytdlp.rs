//! Tool B strategy: media downloader (yt-dlp)
//!
//! Line grammar:
//! - `[download]  12.5% of 14.31MiB at 1.25MiB/s ...`: progress (size/speed)
//! - `[download] Destination: <path>`: a new file starts transferring
//! - `[download] <path> has already been downloaded`: archived item
//!
//! `downloaded_count` increments on the first destination announcement for
//! a path; re-announcements (resumed fragments) are ignored.

use regex::Regex;
use std::path::PathBuf;

use driftnet_common::bytesize;

use super::{ProcessStrategy, ProcessedFiles, StrategyCounters};
use crate::models::job::{JobSpec, JobTarget};
use crate::services::runner::ProcessHandle;

const ALREADY_DOWNLOADED: &str = " has already been downloaded";

pub struct YtDlpStrategy {
    program: String,
    spec: JobSpec,
    counters: StrategyCounters,
    files: ProcessedFiles,
    progress_re: Regex,
}

impl YtDlpStrategy {
    pub fn new(program: String, spec: JobSpec) -> Self {
        // The pattern is a compile-time constant
        let progress_re =
            Regex::new(r"\[download\]\s+(\d+\.\d+)%\s+of\s+~?\s*([\d.]+\w+)\s+at\s+([\d.]+\w+/s)")
                .expect("valid progress regex");
        Self {
            program,
            spec,
            counters: StrategyCounters::default(),
            files: ProcessedFiles::default(),
            progress_re,
        }
    }

    fn register_download(&mut self, path: &str, handle: &ProcessHandle) {
        if self.files.insert(PathBuf::from(path.trim())) {
            self.counters.downloaded_count += 1;
            if let Some(limit) = self.spec.stop_after_completed {
                if self.counters.downloaded_count >= limit {
                    tracing::debug!(limit, "download limit reached, requesting termination");
                    handle.request_stop();
                }
            }
        }
    }
}

impl ProcessStrategy for YtDlpStrategy {
    fn program(&self) -> &str {
        &self.program
    }

    fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "--newline".to_string(),
            "-o".to_string(),
            format!("{}/%(title)s [%(id)s].%(ext)s", self.spec.dest_dir.display()),
        ];

        if !self.spec.bypass_archive {
            args.push("--download-archive".to_string());
            args.push(
                self.spec
                    .dest_dir
                    .join("archive.txt")
                    .to_string_lossy()
                    .into_owned(),
            );
        }

        match &self.spec.target {
            JobTarget::Url(url) => args.push(url.clone()),
            JobTarget::UrlFile(path) => {
                args.push("--batch-file".to_string());
                args.push(path.to_string_lossy().into_owned());
            }
        }

        args
    }

    fn parse_line(&mut self, line: &str, handle: &ProcessHandle) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        if let Some(caps) = self.progress_re.captures(line) {
            let percent: f64 = caps[1].parse().unwrap_or(0.0);
            if let Some(total) = bytesize::parse_size(&caps[2]) {
                self.counters.cumulative_bytes = total;
                self.counters.current_file_bytes =
                    (total as f64 * percent / 100.0).round() as u64;
            }
            if let Some(speed) = bytesize::parse_speed(&caps[3]) {
                self.counters.current_speed = speed;
            }
            return;
        }

        if let Some(idx) = line.find("Destination: ") {
            let path = &line[idx + "Destination: ".len()..];
            self.register_download(path, handle);
            return;
        }

        if let Some(idx) = line.find(ALREADY_DOWNLOADED) {
            let path = line[..idx].trim_start_matches("[download]").trim();
            if self.files.insert(PathBuf::from(path)) {
                self.counters.skipped_count += 1;
            }
        }
    }

    fn is_noise(&self, line: &str) -> bool {
        // Percentage progress spam; destination and archive lines are kept
        self.progress_re.is_match(line)
    }

    fn counters(&self) -> StrategyCounters {
        self.counters
    }

    fn processed_files(&self) -> Vec<PathBuf> {
        self.files.to_vec()
    }
}
