//! Shared runner-process machinery: spawn into a fresh process group, wait
//! under a wall-clock deadline, escalate SIGTERM to SIGKILL on expiry, and
//! capture output.

use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use nix::sys::resource::{UsageWho, getrusage};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use sandbox::{RunOutcome, RunnerHandle, SandboxError};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::trace;

/// Grace period between SIGTERM and SIGKILL when a deadline fires.
pub const TERM_GRACE: Duration = Duration::from_secs(2);

/// How the child's environment is built.
pub enum EnvPolicy {
    /// Inherit the manager's environment plus the given overrides.
    Inherit(BTreeMap<String, String>),
    /// Start from an empty environment containing only the given variables.
    Scrubbed(BTreeMap<String, String>),
}

pub struct SpawnSpec<'a> {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: &'a Path,
    pub env: EnvPolicy,
    /// Kernel ceilings applied between fork and exec, if any.
    pub rlimits: Option<crate::limits::RlimitSpec>,
    pub timeout: Duration,
    pub runner: &'a RunnerHandle,
}

/// Spawn the runner and wait for it under the deadline.
///
/// The child gets its own process group so the whole tree can be signalled.
/// `kill_on_drop` covers caller cancellation: dropping the returned future
/// kills the child instead of abandoning the wait.
pub async fn run(spec: SpawnSpec<'_>) -> sandbox::Result<RunOutcome> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0);

    match &spec.env {
        EnvPolicy::Inherit(vars) => {
            cmd.envs(vars);
        }
        EnvPolicy::Scrubbed(vars) => {
            cmd.env_clear().envs(vars);
        }
    }

    if let Some(rlimits) = spec.rlimits {
        // SAFETY: the hook only calls setrlimit, which is safe between fork
        // and exec.
        unsafe {
            cmd.pre_exec(move || crate::limits::apply(&rlimits));
        }
    }

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|e| {
        SandboxError::ExecutionFailed(format!("spawn {}: {e}", spec.program.display()))
    })?;
    if let Some(pid) = child.id() {
        spec.runner.set(pid);
    }

    let stdout = collect_pipe(child.stdout.take());
    let stderr = collect_pipe(child.stderr.take());

    let wait_result = tokio::time::timeout(spec.timeout, child.wait()).await;
    let (status, timed_out) = match wait_result {
        Ok(status) => (wait_status(status, spec.runner)?, false),
        Err(_) => {
            trace!(program = %spec.program.display(), "deadline fired, escalating");
            terminate_group(&mut child).await;
            (wait_status(child.wait().await, spec.runner)?, true)
        }
    };
    spec.runner.clear();

    let exit_code = status
        .code()
        .unwrap_or_else(|| status.signal().map_or(-1, |sig| 128 + sig));

    Ok(RunOutcome {
        exit_code,
        stdout: stdout.await.unwrap_or_default(),
        stderr: stderr.await.unwrap_or_default(),
        duration: start.elapsed(),
        timed_out,
        max_rss_mb: children_max_rss_mb(),
    })
}

fn wait_status(
    status: std::io::Result<std::process::ExitStatus>,
    runner: &RunnerHandle,
) -> sandbox::Result<std::process::ExitStatus> {
    status.map_err(|e| {
        runner.clear();
        SandboxError::ExecutionFailed(format!("wait for runner: {e}"))
    })
}

/// SIGTERM the child's process group, wait up to [`TERM_GRACE`], then
/// SIGKILL whatever is still alive.
async fn terminate_group(child: &mut Child) {
    signal_group(child, Signal::SIGTERM);
    if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok() {
        return;
    }
    signal_group(child, Signal::SIGKILL);
}

/// Signal the entire process group of `child`.
///
/// Requires the child to have been spawned with `process_group(0)` so its
/// PGID equals its PID. No-op if the child has already been reaped.
fn signal_group(child: &Child, signal: Signal) {
    if let Some(pid) = child.id()
        && let Ok(pid) = i32::try_from(pid)
    {
        let _ = killpg(Pid::from_raw(pid), signal);
    }
}

fn collect_pipe<R>(pipe: Option<R>) -> tokio::task::JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Peak RSS of reaped children in MiB. Process-wide and therefore monotonic;
/// callers treat it as a best-effort high-water mark.
fn children_max_rss_mb() -> f64 {
    match getrusage(UsageWho::RUSAGE_CHILDREN) {
        Ok(usage) => usage.max_rss() as f64 / 1024.0,
        Err(_) => 0.0,
    }
}
