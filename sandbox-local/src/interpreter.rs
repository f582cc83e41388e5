use std::path::{Path, PathBuf};

use sandbox::{Result, SandboxError};

/// Locate the Python interpreter used by the process-level backends.
///
/// An explicit override must exist on disk; otherwise `python3` (then
/// `python`) is resolved from `PATH`.
pub fn find_python(override_path: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = override_path {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(SandboxError::BackendUnavailable(format!(
            "python interpreter not found: {}",
            path.display()
        )));
    }

    which::which("python3")
        .or_else(|_| which::which("python"))
        .map_err(|_| {
            SandboxError::BackendUnavailable("no python interpreter on PATH".to_string())
        })
}
