use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use sandbox::policy::PackagePolicy;
use sandbox::{
    BackendKind, Environment, Provisioner, Result, RunOutcome, RunSpec, SandboxConfig,
    SandboxError,
};
use tracing::{debug, info};

use crate::command;
use crate::interpreter::find_python;
use crate::limits::{RlimitSpec, ensure_rlimits_supported};
use crate::paths::SandboxPaths;
use crate::process::{EnvPolicy, SpawnSpec};
use crate::pyrunner;

/// Creating a venv copies/symlinks an interpreter and bootstraps pip.
const VENV_TIMEOUT: Duration = Duration::from_secs(120);
/// Ceiling for a single package install.
const PIP_TIMEOUT: Duration = Duration::from_secs(120);

/// Provisions an isolated Python virtual environment under `<root>/venv`.
pub struct VenvProvisioner {
    python: Option<PathBuf>,
    packages: PackagePolicy,
}

impl VenvProvisioner {
    pub fn new(python: Option<PathBuf>, packages: PackagePolicy) -> Self {
        Self { python, packages }
    }
}

#[async_trait]
impl Provisioner for VenvProvisioner {
    fn kind(&self) -> BackendKind {
        BackendKind::PythonVenv
    }

    async fn probe(&self) -> Result<()> {
        let python = find_python(self.python.as_deref())?;
        ensure_rlimits_supported()?;
        // `-m venv --help` succeeds even when ensurepip is missing, so
        // import both modules venv creation actually needs.
        command::exec(&python, &["-c", "import ensurepip, venv"])
            .await
            .map_err(|e| {
                SandboxError::BackendUnavailable(format!("python venv module unavailable: {e}"))
            })?;
        Ok(())
    }

    async fn provision(&self, config: &SandboxConfig, root: &Path) -> Result<Box<dyn Environment>> {
        // Reject disallowed packages before anything touches the disk.
        self.packages.ensure_allowed(&config.environment.packages)?;

        let python = find_python(self.python.as_deref())?;
        let paths = SandboxPaths::new(root);

        let venv = paths.venv().display().to_string();
        command::exec_with_timeout(&python, &["-m", "venv", venv.as_str()], VENV_TIMEOUT)
            .await
            .map_err(|e| SandboxError::ProvisionFailed(format!("create venv: {e}")))?;

        for package in &config.environment.packages {
            debug!(package = %package, "installing into venv");
            command::exec_with_timeout(
                paths.venv_pip(),
                &["install", "--no-input", package.as_str()],
                PIP_TIMEOUT,
            )
            .await
            .map_err(|e| SandboxError::ProvisionFailed(format!("install {package}: {e}")))?;
        }

        tokio::fs::write(paths.runner(), pyrunner::runner_source(&config.restrictions))
            .await
            .map_err(|e| SandboxError::ProvisionFailed(format!("write runner: {e}")))?;

        info!(root = %root.display(), packages = config.environment.packages.len(), "venv provisioned");

        Ok(Box::new(VenvEnvironment {
            paths,
            env_vars: config.environment.env_vars.clone(),
            rlimits: RlimitSpec::from_restrictions(&config.restrictions),
        }))
    }
}

struct VenvEnvironment {
    paths: SandboxPaths,
    env_vars: BTreeMap<String, String>,
    rlimits: RlimitSpec,
}

#[async_trait]
impl Environment for VenvEnvironment {
    fn kind(&self) -> BackendKind {
        BackendKind::PythonVenv
    }

    async fn run(&self, spec: RunSpec<'_>) -> Result<RunOutcome> {
        crate::process::run(SpawnSpec {
            program: self.paths.venv_python(),
            args: vec![
                self.paths.runner().display().to_string(),
                spec.entry.display().to_string(),
            ],
            cwd: self.paths.root(),
            env: EnvPolicy::Inherit(self.env_vars.clone()),
            rlimits: Some(self.rlimits),
            timeout: spec.timeout,
            runner: spec.runner,
        })
        .await
    }

    async fn teardown(&self) -> Vec<String> {
        // The venv sits under the sandbox root and would go with it, but
        // removing it here reports a failure even when root removal also
        // breaks.
        match tokio::fs::remove_dir_all(self.paths.venv()).await {
            Ok(()) => Vec::new(),
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => vec![format!("remove venv: {e}")],
        }
    }
}
