//! Kernel-enforced resource ceilings, applied in the child between fork and
//! exec.
//!
//! `RLIMIT_DATA` is used instead of `RLIMIT_AS`: modern runtimes reserve
//! large virtual ranges they never commit, and an address-space cap would
//! kill them spuriously while the data segment cap still bounds real usage.

use std::io;

use nix::sys::resource::{Resource, setrlimit};
use sandbox::{Restrictions, Result, SandboxError, policy};

const NOFILE_LIMIT: u64 = 256;
const NPROC_LIMIT: u64 = 256;

/// Resolved rlimit values for one sandbox.
#[derive(Debug, Clone, Copy)]
pub struct RlimitSpec {
    memory_bytes: u64,
    cpu_secs: u64,
}

impl RlimitSpec {
    /// CPU time gets headroom over the wall-clock deadline so the parent's
    /// terminate-then-kill escalation fires first and `RLIMIT_CPU` only
    /// catches runaways that escaped it.
    pub fn from_restrictions(restrictions: &Restrictions) -> Self {
        let wall_secs = policy::effective_timeout(restrictions).as_secs();
        Self {
            memory_bytes: u64::from(restrictions.max_memory_mb)
                .saturating_mul(1024)
                .saturating_mul(1024),
            cpu_secs: wall_secs.saturating_mul(2).saturating_add(30),
        }
    }
}

/// Explicit capability check, surfaced to callers instead of a silent no-op
/// on hosts without rlimit support.
pub fn ensure_rlimits_supported() -> Result<()> {
    if cfg!(unix) {
        Ok(())
    } else {
        Err(SandboxError::ResourceLimitUnsupported(
            "setrlimit requires a unix host",
        ))
    }
}

/// Apply the ceilings to the calling process. Runs inside `pre_exec`, so a
/// failure aborts the spawn rather than crippling the parent.
pub(crate) fn apply(spec: &RlimitSpec) -> io::Result<()> {
    set(Resource::RLIMIT_DATA, spec.memory_bytes)?;
    set(Resource::RLIMIT_CPU, spec.cpu_secs)?;
    set(Resource::RLIMIT_NOFILE, NOFILE_LIMIT)?;
    set(Resource::RLIMIT_NPROC, NPROC_LIMIT)?;
    set(Resource::RLIMIT_CORE, 0)?;
    Ok(())
}

fn set(resource: Resource, limit: u64) -> io::Result<()> {
    setrlimit(resource, limit, limit).map_err(|e| io::Error::from_raw_os_error(e as i32))
}
