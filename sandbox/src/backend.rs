use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{BackendKind, SandboxConfig};
use crate::error::Result;
use crate::types::RunnerHandle;

/// One runner invocation inside a provisioned environment.
pub struct RunSpec<'a> {
    /// Absolute path of the entry file, already written under the sandbox root.
    pub entry: &'a Path,
    /// Wall-clock deadline for the run, clamped by the dispatcher.
    pub timeout: Duration,
    /// Cell the backend must fill with the spawned pid and clear after reaping.
    pub runner: &'a RunnerHandle,
}

/// What happened to one runner invocation.
#[derive(Debug)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    /// The deadline fired and the process was terminated.
    pub timed_out: bool,
    /// Best-effort peak RSS of reaped children, 0 when unavailable.
    pub max_rss_mb: f64,
}

/// Provisions isolated environments for one [`BackendKind`].
#[async_trait]
pub trait Provisioner: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Cheap host-capability check. Runs before any scratch directory is
    /// created so an unavailable backend leaves no disk state behind.
    async fn probe(&self) -> Result<()>;

    /// Set up the environment rooted at `root` (already created, empty).
    async fn provision(&self, config: &SandboxConfig, root: &Path) -> Result<Box<dyn Environment>>;
}

impl std::fmt::Debug for dyn Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("kind", &self.kind())
            .finish()
    }
}

/// A provisioned environment able to run code and tear itself down.
#[async_trait]
pub trait Environment: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Run the entry file, blocking until exit or deadline. Timeouts are
    /// reported through [`RunOutcome::timed_out`], not as errors.
    async fn run(&self, spec: RunSpec<'_>) -> Result<RunOutcome>;

    /// Remove backend-specific resources (venv directory, container image).
    /// Every step is attempted; one message per failed step is returned.
    async fn teardown(&self) -> Vec<String>;
}
