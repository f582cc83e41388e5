mod backend;
mod config;
mod error;
pub mod policy;
mod types;

pub use backend::{Environment, Provisioner, RunOutcome, RunSpec};
pub use config::{BackendKind, EnvironmentSpec, FsAccess, Restrictions, SandboxConfig, SecuritySpec};
pub use error::{Result, SandboxError};
pub use types::{
    ExecutionRequest, ExecutionResult, FailureKind, ResourceUsage, RunnerHandle, SandboxInfo,
    SandboxStatus, SandboxSummary,
};
