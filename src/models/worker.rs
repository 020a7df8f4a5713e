//! Worker lifecycle model.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Lifecycle state of one worker handle.
///
/// `Exited` is terminal: restarting always produces a new handle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Handle constructed, nothing spawned yet.
    Created,
    /// Process spawned, waiting for the `ready` handshake.
    Starting,
    /// Handshake complete; remote calls are accepted.
    Ready,
    /// Process gone (crash, kill, or failed start).
    Exited,
}

impl WorkerState {
    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Starting | Self::Exited)
                | (Self::Starting, Self::Ready | Self::Exited)
                | (Self::Ready, Self::Exited)
        )
    }

    /// Whether the handle still owns (or may still own) a live process.
    #[must_use]
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Exited)
    }
}

/// How a worker left the process table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerExit {
    /// Process exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Human-readable reason for the exit.
    pub reason: String,
}

impl WorkerExit {
    /// Exit requested through `kill()`.
    #[must_use]
    pub fn killed() -> Self {
        Self {
            code: None,
            reason: "killed".into(),
        }
    }

    /// Exit caused by a failed start.
    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            reason: reason.into(),
        }
    }

    /// Translate an OS exit status.
    #[must_use]
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        let code = status.code();
        let reason = code.map_or_else(
            || "process terminated by signal".to_owned(),
            |c| format!("process exited with code {c}"),
        );
        Self { code, reason }
    }
}

/// Private directories owned by one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantDirs {
    /// Worker's current directory.
    pub working_dir: PathBuf,
    /// Cache directory handed to the engine at bootstrap.
    pub cache_dir: PathBuf,
}
