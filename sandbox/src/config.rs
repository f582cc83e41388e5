use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Isolation strategy used to provision and run a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Dedicated Python virtual environment under the sandbox root.
    PythonVenv,
    /// Container image built per sandbox, run with resource flags.
    Container,
    /// Direct interpreter spawn with a scrubbed environment and kernel rlimits.
    IsolatedProcess,
    /// Dedicated working directory only. No security boundary.
    Basic,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PythonVenv => f.write_str("python_venv"),
            Self::Container => f.write_str("container"),
            Self::IsolatedProcess => f.write_str("isolated_process"),
            Self::Basic => f.write_str("basic"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsAccess {
    Full,
    Restricted,
    ReadOnly,
}

/// Execution-time restrictions attached to a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Restrictions {
    pub network_access: bool,
    pub fs_access: FsAccess,
    pub max_memory_mb: u32,
    pub max_cpu_percent: u32,
    pub max_execution_secs: u32,
    /// Top-level modules the submitted code may import. Empty = unrestricted.
    pub allowed_imports: BTreeSet<String>,
    /// Top-level modules rejected regardless of the allow list.
    pub blocked_imports: BTreeSet<String>,
}

impl Default for Restrictions {
    fn default() -> Self {
        Self {
            network_access: false,
            fs_access: FsAccess::Restricted,
            max_memory_mb: 512,
            max_cpu_percent: 50,
            max_execution_secs: 60,
            allowed_imports: ["os", "sys", "json", "time", "datetime"]
                .into_iter()
                .map(String::from)
                .collect(),
            blocked_imports: ["subprocess", "socket", "urllib"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Interpreter environment requested for a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentSpec {
    /// Packages to install. Each must be on the manager's allow list.
    pub packages: Vec<String>,
    pub env_vars: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySpec {
    pub read_only: bool,
    pub isolated_network: bool,
    pub auto_cleanup: bool,
}

impl Default for SecuritySpec {
    fn default() -> Self {
        Self {
            read_only: false,
            isolated_network: true,
            auto_cleanup: true,
        }
    }
}

/// Immutable sandbox configuration supplied at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub name: String,
    pub backend: BackendKind,
    #[serde(default)]
    pub restrictions: Restrictions,
    #[serde(default)]
    pub environment: EnvironmentSpec,
    #[serde(default)]
    pub security: SecuritySpec,
}

impl SandboxConfig {
    pub fn new(name: impl Into<String>, backend: BackendKind) -> Self {
        Self {
            name: name.into(),
            backend,
            restrictions: Restrictions::default(),
            environment: EnvironmentSpec::default(),
            security: SecuritySpec::default(),
        }
    }
}
