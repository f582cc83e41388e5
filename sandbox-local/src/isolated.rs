use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sandbox::{
    BackendKind, Environment, Provisioner, Result, RunOutcome, RunSpec, SandboxConfig,
    SandboxError,
};
use tracing::info;

use crate::interpreter::find_python;
use crate::limits::{RlimitSpec, ensure_rlimits_supported};
use crate::paths::SandboxPaths;
use crate::process::{EnvPolicy, SpawnSpec};
use crate::pyrunner;

/// Spawns the interpreter directly with a scrubbed environment and kernel
/// rlimits.
///
/// The child's environment is built from scratch rather than filtered, so
/// inherited `PATH` extensions, `PYTHONPATH`, and `LD_LIBRARY_PATH` never
/// reach the runner.
pub struct IsolatedProcessProvisioner {
    python: Option<PathBuf>,
}

impl IsolatedProcessProvisioner {
    pub fn new(python: Option<PathBuf>) -> Self {
        Self { python }
    }
}

/// Fixed safe search path for the child and its subprocesses.
const SAFE_PATH: &str = "/usr/bin:/bin";

fn scrubbed_env(root: &Path, extra: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("PATH".to_string(), SAFE_PATH.to_string());
    env.insert("HOME".to_string(), root.display().to_string());
    for (key, value) in extra {
        env.insert(key.clone(), value.clone());
    }
    env
}

#[async_trait]
impl Provisioner for IsolatedProcessProvisioner {
    fn kind(&self) -> BackendKind {
        BackendKind::IsolatedProcess
    }

    async fn probe(&self) -> Result<()> {
        find_python(self.python.as_deref())?;
        ensure_rlimits_supported()
    }

    async fn provision(&self, config: &SandboxConfig, root: &Path) -> Result<Box<dyn Environment>> {
        let python = find_python(self.python.as_deref())?;
        let paths = SandboxPaths::new(root);

        tokio::fs::write(paths.runner(), pyrunner::runner_source(&config.restrictions))
            .await
            .map_err(|e| SandboxError::ProvisionFailed(format!("write runner: {e}")))?;

        info!(root = %root.display(), "isolated process sandbox provisioned");

        Ok(Box::new(IsolatedEnvironment {
            python,
            env: scrubbed_env(root, &config.environment.env_vars),
            rlimits: RlimitSpec::from_restrictions(&config.restrictions),
            paths,
        }))
    }
}

struct IsolatedEnvironment {
    python: PathBuf,
    env: BTreeMap<String, String>,
    rlimits: RlimitSpec,
    paths: SandboxPaths,
}

#[async_trait]
impl Environment for IsolatedEnvironment {
    fn kind(&self) -> BackendKind {
        BackendKind::IsolatedProcess
    }

    async fn run(&self, spec: RunSpec<'_>) -> Result<RunOutcome> {
        crate::process::run(SpawnSpec {
            program: self.python.clone(),
            args: vec![
                self.paths.runner().display().to_string(),
                spec.entry.display().to_string(),
            ],
            cwd: self.paths.root(),
            env: EnvPolicy::Scrubbed(self.env.clone()),
            rlimits: Some(self.rlimits),
            timeout: spec.timeout,
            runner: spec.runner,
        })
        .await
    }

    async fn teardown(&self) -> Vec<String> {
        // Nothing beyond the scratch directory, which the reaper removes.
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox::RunnerHandle;
    use std::time::Duration;

    #[tokio::test]
    async fn runner_hook_blocks_listed_imports_at_runtime() {
        let provisioner = IsolatedProcessProvisioner::new(None);
        if provisioner.probe().await.is_err() {
            eprintln!("isolated process backend unavailable, skipping");
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let config = SandboxConfig::new("hook", BackendKind::IsolatedProcess);
        let environment = provisioner.provision(&config, dir.path()).await.unwrap();

        // Bypasses the manager's static scan on purpose: the generated
        // runner's import hook is the layer under test here.
        let entry = dir.path().join("main.py");
        tokio::fs::write(&entry, "__import__('subprocess')\n")
            .await
            .unwrap();
        let runner = RunnerHandle::new();
        let outcome = environment
            .run(RunSpec {
                entry: &entry,
                timeout: Duration::from_secs(30),
                runner: &runner,
            })
            .await
            .unwrap();
        assert_ne!(outcome.exit_code, 0);
        assert!(
            outcome.stderr.contains("blocked"),
            "stderr: {}",
            outcome.stderr
        );
    }

    #[test]
    fn scrubbed_env_contains_only_safe_variables() {
        let extra = BTreeMap::from([("APP_MODE".to_string(), "test".to_string())]);
        let env = scrubbed_env(Path::new("/tmp/sb"), &extra);
        assert_eq!(env.get("PATH").map(String::as_str), Some(SAFE_PATH));
        assert_eq!(env.get("HOME").map(String::as_str), Some("/tmp/sb"));
        assert_eq!(env.get("APP_MODE").map(String::as_str), Some("test"));
        assert!(!env.contains_key("PYTHONPATH"));
        assert!(!env.contains_key("LD_LIBRARY_PATH"));
        assert_eq!(env.len(), 3);
    }
}
