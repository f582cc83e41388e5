use std::time::Duration;

use crate::types::SandboxStatus;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox capacity exceeded: {active} active of {limit} allowed")]
    CapacityExceeded { active: usize, limit: usize },

    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("sandbox {id} is {status}, operation requires {required}")]
    InvalidState {
        id: String,
        status: SandboxStatus,
        required: &'static str,
    },

    #[error("provisioning failed: {0}")]
    ProvisionFailed(String),

    #[error("backend not available: {0}")]
    BackendUnavailable(String),

    #[error("package not allowed: {0}")]
    PackageNotAllowed(String),

    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("resource limits unsupported on this host: {0}")]
    ResourceLimitUnsupported(&'static str),

    #[error("cleanup finished with {} failure(s): {}", .0.len(), .0.join("; "))]
    CleanupPartialFailure(Vec<String>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_message_names_both_counts() {
        let err = SandboxError::CapacityExceeded {
            active: 10,
            limit: 10,
        };
        assert_eq!(
            err.to_string(),
            "sandbox capacity exceeded: 10 active of 10 allowed"
        );
    }

    #[test]
    fn cleanup_failure_aggregates_messages() {
        let err = SandboxError::CleanupPartialFailure(vec![
            "remove image: no such image".into(),
            "remove root: permission denied".into(),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("2 failure(s)"), "got: {msg}");
        assert!(msg.contains("no such image"), "got: {msg}");
        assert!(msg.contains("permission denied"), "got: {msg}");
    }

    #[test]
    fn invalid_state_names_the_sandbox() {
        let err = SandboxError::InvalidState {
            id: "sandbox_1_abc".into(),
            status: SandboxStatus::Destroyed,
            required: "a runnable state",
        };
        let msg = err.to_string();
        assert!(msg.contains("sandbox_1_abc"), "got: {msg}");
        assert!(msg.contains("destroyed"), "got: {msg}");
    }
}
