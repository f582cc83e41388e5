//! Backend-independent security policy: package allow list, static import
//! scanning, destructive-content blocklist, and the execution-time ceiling.
//!
//! The static import scan runs before any process is spawned and is the
//! enforced layer. The generated runner installs the same check as an
//! in-process import hook, but that hook runs inside the interpreter that
//! also runs the untrusted code and is advisory only — real isolation comes
//! from the backend boundary (separate process, scrubbed env, container).

use std::collections::BTreeSet;
use std::time::Duration;

use crate::config::Restrictions;
use crate::error::{Result, SandboxError};

/// Hard per-execution ceiling applied regardless of configuration.
pub const EXECUTION_CEILING: Duration = Duration::from_secs(300);

/// Packages installable into a sandbox when the manager does not override
/// the allow list.
pub const DEFAULT_ALLOWED_PACKAGES: [&str; 10] = [
    "requests",
    "numpy",
    "pandas",
    "matplotlib",
    "flask",
    "fastapi",
    "click",
    "colorama",
    "tqdm",
    "beautifulsoup4",
];

/// Well-known destructive content rejected outright, before any spawn.
const DESTRUCTIVE_PATTERNS: [&str; 10] = [
    "rm -rf /",
    "rm -fr /",
    ":(){ :|:& };:",
    "dd if=/dev/zero",
    "mkfs",
    "fdisk",
    "parted",
    "shutdown",
    "reboot",
    "format c:",
];

/// Wall-clock deadline for one execution: the configured limit clamped by
/// [`EXECUTION_CEILING`]. A configured limit of 0 means "ceiling only".
pub fn effective_timeout(restrictions: &Restrictions) -> Duration {
    match restrictions.max_execution_secs {
        0 => EXECUTION_CEILING,
        secs => EXECUTION_CEILING.min(Duration::from_secs(u64::from(secs))),
    }
}

/// Returns the first destructive pattern found in `source`, if any.
pub fn find_destructive_pattern(source: &str) -> Option<&'static str> {
    let lowered = source.to_lowercase();
    DESTRUCTIVE_PATTERNS
        .into_iter()
        .find(|pattern| lowered.contains(pattern))
}

/// Returns the first top-level import in `source` that falls outside the
/// configured lists: on the block list, or (when the allow list is
/// non-empty) absent from the allow list.
pub fn find_blocked_import(source: &str, restrictions: &Restrictions) -> Option<String> {
    for line in source.lines() {
        let line = line.trim_start();
        if let Some(rest) = line.strip_prefix("import ") {
            for item in rest.split(',') {
                let module = top_level_module(item);
                if let Some(found) = check_module(module, restrictions) {
                    return Some(found);
                }
            }
        } else if let Some(rest) = line.strip_prefix("from ") {
            let token = rest.trim().split_whitespace().next().unwrap_or_default();
            if token.starts_with('.') {
                // Relative import, stays inside the sandbox directory.
                continue;
            }
            if let Some(found) = check_module(top_level_module(token), restrictions) {
                return Some(found);
            }
        }
    }
    None
}

fn top_level_module(item: &str) -> &str {
    let name = item.trim().split_whitespace().next().unwrap_or_default();
    name.split('.').next().unwrap_or_default()
}

fn check_module(module: &str, restrictions: &Restrictions) -> Option<String> {
    if module.is_empty() {
        return None;
    }
    if restrictions.blocked_imports.contains(module) {
        return Some(module.to_string());
    }
    if !restrictions.allowed_imports.is_empty() && !restrictions.allowed_imports.contains(module) {
        return Some(module.to_string());
    }
    None
}

/// Allow list of installable packages, enforced at provision time.
#[derive(Debug, Clone)]
pub struct PackagePolicy {
    allowed: BTreeSet<String>,
}

impl PackagePolicy {
    pub fn new(allowed: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }

    /// Checks every requested package before anything is installed, so a
    /// rejected request leaves the environment untouched.
    pub fn ensure_allowed(&self, packages: &[String]) -> Result<()> {
        for package in packages {
            if !self.allowed.contains(package) {
                return Err(SandboxError::PackageNotAllowed(package.clone()));
            }
        }
        Ok(())
    }
}

impl Default for PackagePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_PACKAGES.into_iter().map(String::from))
    }
}
