use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{BackendKind, SandboxConfig};

/// Lifecycle state of a sandbox. `Destroyed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Created,
    Provisioned,
    Executing,
    Completed,
    Failed,
    TimedOut,
    Destroyed,
}

impl SandboxStatus {
    /// States from which `execute` may start a new run.
    pub fn is_runnable(self) -> bool {
        matches!(
            self,
            Self::Provisioned | Self::Completed | Self::Failed | Self::TimedOut
        )
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Provisioned => f.write_str("provisioned"),
            Self::Executing => f.write_str("executing"),
            Self::Completed => f.write_str("completed"),
            Self::Failed => f.write_str("failed"),
            Self::TimedOut => f.write_str("timed_out"),
            Self::Destroyed => f.write_str("destroyed"),
        }
    }
}

/// Why a completed `execute` call did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The run exceeded its wall-clock deadline and was killed.
    Timeout,
    /// The source imports a module outside the configured allow/block lists.
    BlockedImport,
    /// The source matched the destructive-content blocklist.
    ForbiddenPattern,
    /// The runner exited with a non-zero code.
    ExecutionError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub source_code: String,
    pub entry_filename: String,
}

impl ExecutionRequest {
    pub fn new(source_code: impl Into<String>) -> Self {
        Self {
            source_code: source_code.into(),
            entry_filename: "main.py".into(),
        }
    }

    pub fn with_entry(mut self, entry_filename: impl Into<String>) -> Self {
        self.entry_filename = entry_filename.into();
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
    pub failure: Option<FailureKind>,
}

impl ExecutionResult {
    /// A failed result produced without spawning any process.
    pub fn rejected(failure: FailureKind, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: -1,
            duration: Duration::ZERO,
            failure: Some(failure),
        }
    }
}

/// Accumulated, best-effort resource accounting for one sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub cpu_time_secs: f64,
    pub memory_peak_mb: f64,
    pub files_created: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SandboxSummary {
    pub id: String,
    pub name: String,
    pub backend: BackendKind,
    pub status: SandboxStatus,
    pub created_at: DateTime<Utc>,
    pub root: PathBuf,
    pub usage: ResourceUsage,
}

/// Full view of a tracked sandbox, as returned by `get_info`.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxInfo {
    pub id: String,
    pub status: SandboxStatus,
    pub created_at: DateTime<Utc>,
    pub root: PathBuf,
    pub config: SandboxConfig,
    pub usage: ResourceUsage,
}

/// Lock-free cell recording the pid of a sandbox's live runner process.
///
/// Backends set it right after spawn and clear it once the child is reaped,
/// so the reaper can signal a running sandbox without taking its state lock.
/// A pid of 0 means "no live runner".
#[derive(Debug, Default)]
pub struct RunnerHandle {
    pid: AtomicU32,
}

impl RunnerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, pid: u32) {
        self.pid.store(pid, Ordering::Release);
    }

    pub fn clear(&self) {
        self.pid.store(0, Ordering::Release);
    }

    pub fn get(&self) -> Option<u32> {
        match self.pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }
}
