//! Lifecycle reaper: terminates runner processes with terminate-then-kill
//! escalation, releases backend resources and scratch directories, and
//! normalizes orphaned executions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use sandbox::{RunnerHandle, SandboxStatus};
use sandbox_local::process::TERM_GRACE;
use tracing::{info, warn};

use crate::registry::SandboxEntry;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Tear down one sandbox: live process, backend resources, scratch
/// directory — in that order. Every step is attempted even when an earlier
/// one fails; failures are aggregated rather than aborting.
pub(crate) async fn destroy_entry(entry: &SandboxEntry) -> Vec<String> {
    let mut failures = Vec::new();

    terminate_runner(&entry.runner).await;

    // Waits for any in-flight execution to unwind before teardown.
    let mut environment_guard = entry.environment.lock().await;
    if let Some(environment) = environment_guard.take() {
        failures.extend(environment.teardown().await);
    }
    entry.status.store(SandboxStatus::Destroyed);
    drop(environment_guard);

    match tokio::fs::remove_dir_all(&entry.root).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => failures.push(format!("remove root {}: {e}", entry.root.display())),
    }

    if failures.is_empty() {
        info!(id = %entry.id, "sandbox destroyed");
    } else {
        warn!(id = %entry.id, failures = failures.len(), "sandbox destroyed with failures");
    }
    failures
}

/// Escalating stop for a live runner: SIGTERM to its process group, up to
/// [`TERM_GRACE`] to exit, then SIGKILL.
pub(crate) async fn terminate_runner(runner: &RunnerHandle) {
    let Some(pid) = runner.get() else {
        return;
    };
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    let pgid = Pid::from_raw(raw);

    if killpg(pgid, Signal::SIGTERM).is_err() {
        // Group already gone.
        return;
    }
    let deadline = Instant::now() + TERM_GRACE;
    while Instant::now() < deadline {
        if runner.get().is_none() || killpg(pgid, None).is_err() {
            return;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    let _ = killpg(pgid, Signal::SIGKILL);
}

/// Normalize entries stuck in `Executing` whose runner process no longer
/// exists (crashed dispatcher task, killed manager). Entries whose
/// environment lock is held have a live dispatcher and are skipped.
pub(crate) fn reap_orphans(entries: &[Arc<SandboxEntry>]) -> usize {
    let mut reaped = 0;
    for entry in entries {
        if entry.status.load() != SandboxStatus::Executing {
            continue;
        }
        let Ok(_guard) = entry.environment.try_lock() else {
            continue;
        };
        if runner_alive(&entry.runner) {
            continue;
        }
        entry.status.store(SandboxStatus::Failed);
        entry.runner.clear();
        warn!(id = %entry.id, "orphaned execution normalized to failed");
        reaped += 1;
    }
    reaped
}

fn runner_alive(runner: &RunnerHandle) -> bool {
    runner
        .get()
        .and_then(|pid| i32::try_from(pid).ok())
        .is_some_and(|raw| kill(Pid::from_raw(raw), None).is_ok())
}

/// Spawn the periodic orphan sweep.
pub fn spawn_sweeper(
    registry: Arc<crate::Registry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let reaped = registry.reap_orphans().await;
            if reaped > 0 {
                info!(reaped, "orphan sweep");
            }
        }
    })
}
