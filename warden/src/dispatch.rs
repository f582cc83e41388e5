//! Execution dispatcher: validates sandbox state, applies the pre-spawn
//! policy gates, writes the entry file, and maps the backend outcome back
//! onto the sandbox lifecycle.

use sandbox::{
    ExecutionRequest, ExecutionResult, FailureKind, Result, RunSpec, SandboxError,
    SandboxStatus, policy,
};
use tracing::{info, warn};

use crate::registry::SandboxEntry;

pub(crate) async fn execute(
    entry: &SandboxEntry,
    request: &ExecutionRequest,
) -> Result<ExecutionResult> {
    // Holding the environment guard for the whole run serializes this
    // sandbox; independent sandboxes proceed in parallel.
    let environment_guard = entry.environment.lock().await;

    let status = entry.status.load();
    if !status.is_runnable() {
        return Err(SandboxError::InvalidState {
            id: entry.id.clone(),
            status,
            required: "a runnable state",
        });
    }
    let Some(environment) = environment_guard.as_ref() else {
        return Err(SandboxError::InvalidState {
            id: entry.id.clone(),
            status,
            required: "a provisioned environment",
        });
    };

    // Policy gates run before anything is written or spawned, so a rejected
    // request leaves no side effects.
    if let Some(pattern) = policy::find_destructive_pattern(&request.source_code) {
        warn!(id = %entry.id, pattern, "destructive content rejected");
        return Ok(ExecutionResult::rejected(
            FailureKind::ForbiddenPattern,
            format!("destructive pattern rejected: {pattern}"),
        ));
    }
    if let Some(module) = policy::find_blocked_import(&request.source_code, &entry.config.restrictions)
    {
        info!(id = %entry.id, module = %module, "blocked import rejected");
        return Ok(ExecutionResult::rejected(
            FailureKind::BlockedImport,
            format!("import of '{module}' is not permitted in this sandbox"),
        ));
    }

    let entry_name = validate_entry_filename(&request.entry_filename)?;
    let entry_path = entry.root.join(entry_name);
    tokio::fs::write(&entry_path, &request.source_code)
        .await
        .map_err(|e| SandboxError::ExecutionFailed(format!("write entry file: {e}")))?;

    entry.status.store(SandboxStatus::Executing);
    let timeout = policy::effective_timeout(&entry.config.restrictions);
    let outcome = match environment
        .run(RunSpec {
            entry: &entry_path,
            timeout,
            runner: &entry.runner,
        })
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            entry.status.store(SandboxStatus::Failed);
            entry.runner.clear();
            return Err(e);
        }
    };

    let (status, failure) = if outcome.timed_out {
        (SandboxStatus::TimedOut, Some(FailureKind::Timeout))
    } else if outcome.exit_code == 0 {
        (SandboxStatus::Completed, None)
    } else {
        (SandboxStatus::Failed, Some(FailureKind::ExecutionError))
    };
    entry.status.store(status);
    entry.update_usage(|usage| {
        usage.files_created += 1;
        usage.cpu_time_secs += outcome.duration.as_secs_f64();
        if outcome.max_rss_mb > usage.memory_peak_mb {
            usage.memory_peak_mb = outcome.max_rss_mb;
        }
    });

    info!(
        id = %entry.id,
        exit_code = outcome.exit_code,
        timed_out = outcome.timed_out,
        "execution finished"
    );

    Ok(ExecutionResult {
        success: status == SandboxStatus::Completed,
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        exit_code: outcome.exit_code,
        duration: outcome.duration,
        failure,
    })
}

/// The entry filename must be a bare file name; anything path-like could
/// escape the sandbox root.
fn validate_entry_filename(filename: &str) -> Result<&str> {
    let ok = !filename.is_empty()
        && filename != "."
        && filename != ".."
        && !filename.contains('/')
        && !filename.contains('\\');
    if ok {
        Ok(filename)
    } else {
        Err(SandboxError::ExecutionFailed(format!(
            "invalid entry filename: {filename:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_filenames_are_accepted() {
        assert_eq!(validate_entry_filename("main.py").unwrap(), "main.py");
        assert_eq!(validate_entry_filename("job-2.py").unwrap(), "job-2.py");
    }

    #[test]
    fn path_like_filenames_are_rejected() {
        for bad in ["", ".", "..", "../evil.py", "a/b.py", "a\\b.py", "/etc/passwd"] {
            assert!(
                validate_entry_filename(bad).is_err(),
                "accepted {bad:?}"
            );
        }
    }
}
