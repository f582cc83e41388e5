//! Host-level backends for the sandbox manager: python virtual environments,
//! container images, restricted processes, and plain working directories.
//!
//! All four implement the [`sandbox::Provisioner`] / [`sandbox::Environment`]
//! trait pair; the shared process machinery (spawn with process group,
//! deadline wait, terminate-then-kill escalation) lives in [`process`].

mod basic;
mod command;
mod container;
mod interpreter;
mod isolated;
mod limits;
mod paths;
pub mod process;
mod pyrunner;
mod venv;

pub use basic::BasicProvisioner;
pub use command::{CommandError, exec, exec_ignore_errors, exec_with_timeout};
pub use container::ContainerProvisioner;
pub use interpreter::find_python;
pub use isolated::IsolatedProcessProvisioner;
pub use limits::{RlimitSpec, ensure_rlimits_supported};
pub use paths::SandboxPaths;
pub use pyrunner::runner_source;
pub use venv::VenvProvisioner;
