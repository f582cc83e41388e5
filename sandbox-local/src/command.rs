use std::ffi::OsStr;
use std::time::Duration;

use tokio::process::Command;
use tracing::trace;

/// Error from a failed command.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

/// Format a human-readable display string for a command invocation.
fn format_command_display(program: &OsStr, args: &[&str]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    let program = program.to_string_lossy();
    parts.push(program.as_ref());
    parts.extend_from_slice(args);
    parts.join(" ")
}

/// Execute a command and return trimmed stdout on success.
pub async fn exec(program: impl AsRef<OsStr>, args: &[&str]) -> Result<String, CommandError> {
    let program = program.as_ref();
    let cmd_display = format_command_display(program, args);
    trace!(command = %cmd_display, "exec");

    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| CommandError {
            command: cmd_display.clone(),
            detail: e.to_string(),
        })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(CommandError {
            command: cmd_display,
            detail: stderr,
        })
    }
}

/// Execute a command with a deadline. The child is killed if the deadline
/// fires (`kill_on_drop` on the dropped wait future).
pub async fn exec_with_timeout(
    program: impl AsRef<OsStr>,
    args: &[&str],
    timeout: Duration,
) -> Result<String, CommandError> {
    let program = program.as_ref();
    let cmd_display = format_command_display(program, args);

    match tokio::time::timeout(timeout, exec(program, args)).await {
        Ok(result) => result,
        Err(_) => Err(CommandError {
            command: cmd_display,
            detail: format!("timed out after {timeout:?}"),
        }),
    }
}

/// Execute a command, ignoring any errors.
pub async fn exec_ignore_errors(program: impl AsRef<OsStr>, args: &[&str]) {
    let program = program.as_ref();
    let cmd_display = format_command_display(program, args);
    trace!(command = %cmd_display, "exec_ignore_errors");

    match Command::new(program).args(args).output().await {
        Ok(o) if !o.status.success() => {
            let stderr = String::from_utf8_lossy(&o.stderr);
            trace!(command = %cmd_display, stderr = %stderr.trim(), "command failed (ignored)");
        }
        Err(e) => {
            trace!(command = %cmd_display, error = %e, "command failed to spawn (ignored)");
        }
        _ => {}
    }
}
