//! Process strategies
//!
//! One strategy per external tool family. A strategy is a pure line-parsing
//! state machine: it owns no I/O, builds the tool's argv, consumes one line
//! of output at a time, and snapshots a final result at process exit. The
//! line grammars are compatibility contracts with the tools' real output
//! and must not drift.

pub mod gallery_dl;
pub mod ytdlp;

pub use gallery_dl::GalleryDlStrategy;
pub use ytdlp::YtDlpStrategy;

use std::collections::HashSet;
use std::path::PathBuf;

use crate::models::job::{ExtractorTool, JobSpec};
use crate::services::runner::ProcessHandle;

/// Counters accumulated while parsing tool output
#[derive(Debug, Clone, Copy, Default)]
pub struct StrategyCounters {
    pub downloaded_count: u64,
    pub skipped_count: u64,
    pub posts_processed: u64,
    pub error_count: u64,
    pub is_rate_limited: bool,
    /// Current transfer speed, bytes per second
    pub current_speed: u64,
    /// Total bytes reported by the tool so far
    pub cumulative_bytes: u64,
    /// Bytes of the file currently transferring
    pub current_file_bytes: u64,
}

/// Ordered, deduplicated list of file paths the tool has announced.
/// The set gives O(1) membership; the vec preserves announcement order.
#[derive(Debug, Default)]
pub struct ProcessedFiles {
    order: Vec<PathBuf>,
    seen: HashSet<PathBuf>,
}

impl ProcessedFiles {
    /// Insert a path; returns true if it was not seen before
    pub fn insert(&mut self, path: PathBuf) -> bool {
        if self.seen.insert(path.clone()) {
            self.order.push(path);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn as_slice(&self) -> &[PathBuf] {
        &self.order
    }

    pub fn to_vec(&self) -> Vec<PathBuf> {
        self.order.clone()
    }
}

/// Final result of one tool invocation
#[derive(Debug, Clone)]
pub struct ScrapeOutcome {
    pub success: bool,
    /// Retained stdout (log noise excluded)
    pub output: String,
    pub error: Option<String>,
    /// Files the tool announced, in order
    pub files: Vec<PathBuf>,
    pub counters: StrategyCounters,
}

/// Per-tool line-parsing state machine
pub trait ProcessStrategy: Send {
    /// Tool binary to spawn (path or PATH-resolved name)
    fn program(&self) -> &str;

    /// Deterministic argv for the job this strategy was built for
    fn build_args(&self) -> Vec<String>;

    /// Consume one line of stdout or stderr. May request early termination
    /// through the handle when a configured limit is reached.
    fn parse_line(&mut self, line: &str, handle: &ProcessHandle);

    /// Whether a line is log noise excluded from retained output buffers
    /// (it is still parsed)
    fn is_noise(&self, line: &str) -> bool;

    /// Counter snapshot
    fn counters(&self) -> StrategyCounters;

    /// Announced file list snapshot, ordered and deduplicated
    fn processed_files(&self) -> Vec<PathBuf>;

    /// Final result snapshot taken at process exit
    fn final_result(&self, success: bool, error: Option<String>, output: String) -> ScrapeOutcome {
        ScrapeOutcome {
            success,
            output,
            error,
            files: self.processed_files(),
            counters: self.counters(),
        }
    }
}

/// Construct the strategy for a tool and job
pub fn build_strategy(
    tool: ExtractorTool,
    program: String,
    spec: JobSpec,
) -> Box<dyn ProcessStrategy> {
    match tool {
        ExtractorTool::GalleryDl => Box::new(GalleryDlStrategy::new(program, spec)),
        ExtractorTool::YtDlp => Box::new(YtDlpStrategy::new(program, spec)),
    }
}
