use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sandbox::{
    BackendKind, Environment, Provisioner, Result, RunOutcome, RunSpec, SandboxConfig,
    SandboxError,
};
use tracing::info;

use crate::interpreter::find_python;
use crate::paths::SandboxPaths;
use crate::process::{EnvPolicy, SpawnSpec};

/// Dedicated working directory and nothing else. Provides **no security
/// boundary** — for trusted, low-risk code only.
pub struct BasicProvisioner {
    python: Option<PathBuf>,
}

impl BasicProvisioner {
    pub fn new(python: Option<PathBuf>) -> Self {
        Self { python }
    }
}

#[async_trait]
impl Provisioner for BasicProvisioner {
    fn kind(&self) -> BackendKind {
        BackendKind::Basic
    }

    async fn probe(&self) -> Result<()> {
        find_python(self.python.as_deref()).map(|_| ())
    }

    async fn provision(&self, config: &SandboxConfig, root: &Path) -> Result<Box<dyn Environment>> {
        let python = find_python(self.python.as_deref())?;
        let paths = SandboxPaths::new(root);

        for dir in [paths.code_dir(), paths.data_dir(), paths.output_dir()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| SandboxError::ProvisionFailed(format!("mkdir {}: {e}", dir.display())))?;
        }

        info!(root = %root.display(), "basic sandbox provisioned");

        Ok(Box::new(BasicEnvironment {
            python,
            env_vars: config.environment.env_vars.clone(),
            paths,
        }))
    }
}

struct BasicEnvironment {
    python: PathBuf,
    env_vars: BTreeMap<String, String>,
    paths: SandboxPaths,
}

#[async_trait]
impl Environment for BasicEnvironment {
    fn kind(&self) -> BackendKind {
        BackendKind::Basic
    }

    async fn run(&self, spec: RunSpec<'_>) -> Result<RunOutcome> {
        crate::process::run(SpawnSpec {
            program: self.python.clone(),
            args: vec![spec.entry.display().to_string()],
            cwd: self.paths.root(),
            env: EnvPolicy::Inherit(self.env_vars.clone()),
            rlimits: None,
            timeout: spec.timeout,
            runner: spec.runner,
        })
        .await
    }

    async fn teardown(&self) -> Vec<String> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox::RunnerHandle;
    use std::time::Duration;

    fn python_missing() -> bool {
        if find_python(None).is_err() {
            eprintln!("no python interpreter on PATH, skipping");
            return true;
        }
        false
    }

    #[tokio::test]
    async fn provision_creates_layout() {
        if python_missing() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let provisioner = BasicProvisioner::new(None);
        let config = SandboxConfig::new("layout", BackendKind::Basic);
        provisioner.provision(&config, dir.path()).await.unwrap();
        assert!(dir.path().join("code").is_dir());
        assert!(dir.path().join("data").is_dir());
        assert!(dir.path().join("output").is_dir());
    }

    #[tokio::test]
    async fn runs_python_directly() {
        if python_missing() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let provisioner = BasicProvisioner::new(None);
        let config = SandboxConfig::new("direct", BackendKind::Basic);
        let env = provisioner.provision(&config, dir.path()).await.unwrap();

        let entry = dir.path().join("main.py");
        tokio::fs::write(&entry, "print('hi')\n").await.unwrap();
        let runner = RunnerHandle::new();
        let outcome = env
            .run(RunSpec {
                entry: &entry,
                timeout: Duration::from_secs(10),
                runner: &runner,
            })
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0, "stderr: {}", outcome.stderr);
        assert_eq!(outcome.stdout, "hi\n");
    }
}
