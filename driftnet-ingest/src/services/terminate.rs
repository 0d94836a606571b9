//! Cross-platform process-tree termination
//!
//! POSIX signals the child directly. Windows must go through an external
//! tree-kill utility targeting the PID, because a plain signal does not
//! reliably terminate descendant processes there. The capability is picked
//! once at startup and passed to every component that kills processes.

use std::io;
use tokio::process::Child;

/// Process-tree termination capability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKill {
    /// Direct signal to the child process (POSIX)
    Signal,
    /// `taskkill /PID <pid> /T /F` targeting the PID (Windows)
    TaskKill,
}

/// Select the termination capability for the current platform
pub fn platform_terminator() -> TreeKill {
    if cfg!(windows) {
        TreeKill::TaskKill
    } else {
        TreeKill::Signal
    }
}

impl TreeKill {
    /// Terminate the child's process tree. A child that already exited is
    /// not an error.
    pub async fn terminate(&self, child: &mut Child) -> io::Result<()> {
        if let TreeKill::TaskKill = self {
            if let Some(pid) = child.id() {
                let status = tokio::process::Command::new("taskkill")
                    .args(["/PID", &pid.to_string(), "/T", "/F"])
                    .status()
                    .await?;
                if !status.success() {
                    tracing::warn!(pid, "taskkill reported failure, falling back to direct kill");
                }
            }
        }

        match child.start_kill() {
            Ok(()) => Ok(()),
            // Already reaped
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e),
        }
    }
}
