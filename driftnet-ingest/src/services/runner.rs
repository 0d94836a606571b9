//! External process runner
//!
//! Spawns one extractor process per invocation with argv from the job's
//! strategy (no shell interpolation), splits stdout and stderr into lines,
//! feeds every line to the strategy, and resolves a final outcome exactly
//! once at process exit. Log-noise lines are parsed but excluded from the
//! retained output buffers.

use anyhow::{Context, Result};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::services::strategy::{ProcessStrategy, ScrapeOutcome};
use crate::services::terminate::TreeKill;

/// Retained-output cap per stream; older lines are dropped from the front
const MAX_RETAINED: usize = 256 * 1024;

/// Strategy shared between the supervision task (parsing) and pollers
/// (counter snapshots, stop persistence).
pub type SharedStrategy = Arc<tokio::sync::Mutex<Box<dyn ProcessStrategy>>>;

/// Shared handle to one running external process
pub struct ProcessHandle {
    pid: Option<u32>,
    stop: AtomicBool,
    notify: tokio::sync::Notify,
}

impl ProcessHandle {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pid,
            stop: AtomicBool::new(false),
            notify: tokio::sync::Notify::new(),
        }
    }

    /// Handle not attached to any process, for strategy unit tests
    pub fn detached() -> Self {
        Self::new(None)
    }

    /// Request termination of the process tree. Safe from any task,
    /// including from `parse_line` on the output-consuming path.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// A spawned job: the termination handle plus the single-resolution result
pub struct RunningJob {
    pub handle: Arc<ProcessHandle>,
    pub result: tokio::task::JoinHandle<ScrapeOutcome>,
}

/// Spawns and supervises external extractor processes
#[derive(Debug, Clone, Copy)]
pub struct ProcessRunner {
    terminator: TreeKill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Stdout,
    Stderr,
}

impl ProcessRunner {
    pub fn new(terminator: TreeKill) -> Self {
        Self { terminator }
    }

    /// Spawn the strategy's process and supervise it to completion.
    ///
    /// Returns immediately after the spawn; `RunningJob::result` resolves
    /// exactly once with the final outcome.
    pub async fn run(&self, strategy: SharedStrategy) -> Result<RunningJob> {
        let (program, args) = {
            let s = strategy.lock().await;
            (s.program().to_string(), s.build_args())
        };

        tracing::info!(program = %program, args = ?args, "Spawning extractor process");

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", program))?;

        let handle = Arc::new(ProcessHandle::new(child.id()));

        let stdout = child.stdout.take().context("child stdout not captured")?;
        let stderr = child.stderr.take().context("child stderr not captured")?;

        // Both pipes funnel into one consumer so parse_line always runs on
        // a single path.
        let (tx, rx) = mpsc::channel::<(StreamKind, String)>(256);
        spawn_line_reader(stdout, StreamKind::Stdout, tx.clone());
        spawn_line_reader(stderr, StreamKind::Stderr, tx);

        let terminator = self.terminator;
        let supervision_handle = handle.clone();
        let result = tokio::spawn(async move {
            supervise(child, strategy, supervision_handle, terminator, rx).await
        });

        Ok(RunningJob { handle, result })
    }
}

fn spawn_line_reader<R>(reader: R, kind: StreamKind, tx: mpsc::Sender<(StreamKind, String)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send((kind, line)).await.is_err() {
                break;
            }
        }
    });
}

async fn supervise(
    mut child: Child,
    strategy: SharedStrategy,
    handle: Arc<ProcessHandle>,
    terminator: TreeKill,
    mut rx: mpsc::Receiver<(StreamKind, String)>,
) -> ScrapeOutcome {
    let mut stdout_buf = String::new();
    let mut stderr_buf = String::new();
    let mut killed = false;
    let mut pipes_closed = false;

    // Feed lines to the strategy until the process exits. Kill requests
    // (from stop_scrape or from the strategy hitting a limit) are honored
    // at the top of each iteration.
    let status = loop {
        if handle.stop_requested() && !killed {
            killed = true;
            if let Err(e) = terminator.terminate(&mut child).await {
                tracing::warn!(error = %e, "Failed to terminate process");
            }
        }

        tokio::select! {
            line = rx.recv(), if !pipes_closed => match line {
                Some((kind, line)) => {
                    consume_line(&strategy, &handle, kind, &line, &mut stdout_buf, &mut stderr_buf)
                        .await;
                }
                // Both pipes closed; the wait arm below reaps the child
                None => pipes_closed = true,
            },
            status = child.wait() => break status,
            // Wake up so the loop top can perform the kill
            _ = handle.notify.notified(), if !killed => {}
        }
    };

    // Drain lines the readers still hold. Bounded: a killed child's
    // descendants can inherit the pipes and keep them open indefinitely.
    loop {
        match tokio::time::timeout(Duration::from_millis(250), rx.recv()).await {
            Ok(Some((kind, line))) => {
                consume_line(&strategy, &handle, kind, &line, &mut stdout_buf, &mut stderr_buf)
                    .await;
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }

    let (success, error) = match status {
        Ok(status) => match status.code() {
            Some(0) => (true, None),
            // No exit code: the process was forcibly terminated
            None => (false, Some("Process was terminated".to_string())),
            Some(code) => {
                let stderr_tail = stderr_buf.trim();
                let message = if stderr_tail.is_empty() {
                    format!("Process exited with code {}", code)
                } else {
                    format!("Process exited with code {}: {}", code, stderr_tail)
                };
                (false, Some(message))
            }
        },
        Err(e) => (false, Some(format!("Failed to await process exit: {}", e))),
    };

    tracing::info!(success, error = ?error, "Extractor process finished");

    let s = strategy.lock().await;
    s.final_result(success, error, stdout_buf)
}

async fn consume_line(
    strategy: &SharedStrategy,
    handle: &Arc<ProcessHandle>,
    kind: StreamKind,
    line: &str,
    stdout_buf: &mut String,
    stderr_buf: &mut String,
) {
    let noise = {
        let mut s = strategy.lock().await;
        s.parse_line(line, handle);
        s.is_noise(line)
    };
    if !noise {
        let buf = match kind {
            StreamKind::Stdout => stdout_buf,
            StreamKind::Stderr => stderr_buf,
        };
        push_capped(buf, line);
    }
}

fn push_capped(buf: &mut String, line: &str) {
    if buf.len() + line.len() + 1 > MAX_RETAINED {
        let excess = (buf.len() + line.len() + 1).saturating_sub(MAX_RETAINED);
        let cut = buf
            .char_indices()
            .map(|(i, _)| i)
            .find(|&i| i >= excess)
            .unwrap_or(buf.len());
        buf.drain(..cut);
    }
    if !buf.is_empty() {
        buf.push('\n');
    }
    buf.push_str(line);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::strategy::StrategyCounters;
    use crate::services::terminate::platform_terminator;
    use std::path::PathBuf;

    /// Strategy driving /bin/sh for exit-status tests
    struct ShellStrategy {
        script: String,
        #[allow(dead_code)]
        lines: Vec<String>,
    }

    impl ShellStrategy {
        fn new(script: &str) -> Self {
            Self {
                script: script.to_string(),
                lines: Vec::new(),
            }
        }
    }

    impl ProcessStrategy for ShellStrategy {
        fn program(&self) -> &str {
            "/bin/sh"
        }

        fn build_args(&self) -> Vec<String> {
            vec!["-c".to_string(), self.script.clone()]
        }

        fn parse_line(&mut self, line: &str, _handle: &ProcessHandle) {
            self.lines.push(line.to_string());
        }

        fn is_noise(&self, line: &str) -> bool {
            line.starts_with("noise:")
        }

        fn counters(&self) -> StrategyCounters {
            StrategyCounters::default()
        }

        fn processed_files(&self) -> Vec<PathBuf> {
            Vec::new()
        }
    }

    fn shared(script: &str) -> SharedStrategy {
        Arc::new(tokio::sync::Mutex::new(
            Box::new(ShellStrategy::new(script)) as Box<dyn ProcessStrategy>
        ))
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn zero_exit_is_success_and_lines_are_parsed() {
        let strategy = shared("echo one; echo noise: skipme; echo two >&2");
        let runner = ProcessRunner::new(platform_terminator());

        let job = runner.run(strategy.clone()).await.unwrap();
        let outcome = job.result.await.unwrap();

        assert!(outcome.success);
        assert!(outcome.error.is_none());
        // Noise was parsed but excluded from retained output
        assert!(outcome.output.contains("one"));
        assert!(!outcome.output.contains("skipme"));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn nonzero_exit_carries_stderr() {
        let strategy = shared("echo boom >&2; exit 3");
        let runner = ProcessRunner::new(platform_terminator());

        let outcome = runner.run(strategy).await.unwrap().result.await.unwrap();

        assert!(!outcome.success);
        let error = outcome.error.unwrap();
        assert!(error.contains("code 3"), "error was: {}", error);
        assert!(error.contains("boom"), "error was: {}", error);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn forced_termination_reports_killed_process() {
        let strategy = shared("sleep 30");
        let runner = ProcessRunner::new(platform_terminator());

        let job = runner.run(strategy).await.unwrap();
        job.handle.request_stop();
        let outcome = job.result.await.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("Process was terminated"));
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        struct Missing;
        impl ProcessStrategy for Missing {
            fn program(&self) -> &str {
                "/nonexistent/driftnet-test-binary"
            }
            fn build_args(&self) -> Vec<String> {
                Vec::new()
            }
            fn parse_line(&mut self, _: &str, _: &ProcessHandle) {}
            fn is_noise(&self, _: &str) -> bool {
                false
            }
            fn counters(&self) -> StrategyCounters {
                StrategyCounters::default()
            }
            fn processed_files(&self) -> Vec<PathBuf> {
                Vec::new()
            }
        }

        let strategy: SharedStrategy = Arc::new(tokio::sync::Mutex::new(
            Box::new(Missing) as Box<dyn ProcessStrategy>
        ));
        let runner = ProcessRunner::new(platform_terminator());
        assert!(runner.run(strategy).await.is_err());
    }

    #[test]
    fn push_capped_drops_oldest_content() {
        let mut buf = String::new();
        push_capped(&mut buf, "first");
        push_capped(&mut buf, "second");
        assert_eq!(buf, "first\nsecond");

        let long = "x".repeat(MAX_RETAINED);
        push_capped(&mut buf, &long);
        assert!(buf.len() <= MAX_RETAINED);
        assert!(!buf.contains("first"));
    }
}
