use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use sandbox::policy::PackagePolicy;
use sandbox::{
    BackendKind, Environment, FsAccess, Provisioner, Restrictions, Result, RunOutcome, RunSpec,
    SandboxConfig, SandboxError, SecuritySpec,
};
use tracing::info;

use crate::command;
use crate::paths::SandboxPaths;
use crate::process::{EnvPolicy, SpawnSpec};
use crate::pyrunner;

/// Ceiling for one image build, pip installs included.
const BUILD_TIMEOUT: Duration = Duration::from_secs(300);
const IMAGE_REMOVE_TIMEOUT: Duration = Duration::from_secs(30);

const ENGINE_CANDIDATES: [&str; 2] = ["docker", "podman"];

/// Provisions per-sandbox container images and runs them with explicit
/// resource flags.
pub struct ContainerProvisioner {
    engine: Option<PathBuf>,
    packages: PackagePolicy,
}

impl ContainerProvisioner {
    pub fn new(engine: Option<PathBuf>, packages: PackagePolicy) -> Self {
        Self { engine, packages }
    }

    fn resolve_engine(&self) -> Result<PathBuf> {
        if let Some(engine) = &self.engine {
            if engine.exists() {
                return Ok(engine.clone());
            }
            return Err(SandboxError::BackendUnavailable(format!(
                "container engine not found: {}",
                engine.display()
            )));
        }
        for candidate in ENGINE_CANDIDATES {
            if let Ok(path) = which::which(candidate) {
                return Ok(path);
            }
        }
        Err(SandboxError::BackendUnavailable(
            "no container engine (docker or podman) on PATH".to_string(),
        ))
    }
}

/// Verify the engine answers with parseable version output, not just that a
/// binary exists on disk.
async fn probe_engine(engine: &Path) -> Result<()> {
    let output = command::exec(engine, &["version", "--format", "{{json .}}"])
        .await
        .map_err(|e| {
            SandboxError::BackendUnavailable(format!("container engine not responding: {e}"))
        })?;
    serde_json::from_str::<serde_json::Value>(&output).map_err(|e| {
        SandboxError::BackendUnavailable(format!("unexpected engine version output: {e}"))
    })?;
    Ok(())
}

fn image_tag(root: &Path) -> String {
    let id = root
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("sandbox_{id}")
}

fn render_dockerfile(packages: &[String]) -> String {
    let mut dockerfile = String::from(
        "FROM python:3.12-slim\nWORKDIR /sandbox\nCOPY runner.py /sandbox/runner.py\n",
    );
    if !packages.is_empty() {
        dockerfile.push_str(&format!(
            "RUN pip install --no-cache-dir {}\n",
            packages.join(" ")
        ));
    }
    dockerfile.push_str("CMD [\"python\", \"/sandbox/runner.py\"]\n");
    dockerfile
}

#[async_trait]
impl Provisioner for ContainerProvisioner {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn probe(&self) -> Result<()> {
        let engine = self.resolve_engine()?;
        probe_engine(&engine).await
    }

    async fn provision(&self, config: &SandboxConfig, root: &Path) -> Result<Box<dyn Environment>> {
        self.packages.ensure_allowed(&config.environment.packages)?;
        let engine = self.resolve_engine()?;
        let paths = SandboxPaths::new(root);

        tokio::fs::write(paths.runner(), pyrunner::runner_source(&config.restrictions))
            .await
            .map_err(|e| SandboxError::ProvisionFailed(format!("write runner: {e}")))?;
        tokio::fs::write(
            paths.dockerfile(),
            render_dockerfile(&config.environment.packages),
        )
        .await
        .map_err(|e| SandboxError::ProvisionFailed(format!("write Dockerfile: {e}")))?;

        let tag = image_tag(root);
        let root_str = root.display().to_string();
        command::exec_with_timeout(
            &engine,
            &["build", "-q", "-t", tag.as_str(), root_str.as_str()],
            BUILD_TIMEOUT,
        )
        .await
        .map_err(|e| SandboxError::ProvisionFailed(format!("build image {tag}: {e}")))?;

        info!(tag = %tag, "container image built");

        Ok(Box::new(ContainerEnvironment {
            engine,
            tag,
            paths,
            restrictions: config.restrictions.clone(),
            security: config.security.clone(),
        }))
    }
}

struct ContainerEnvironment {
    engine: PathBuf,
    tag: String,
    paths: SandboxPaths,
    restrictions: Restrictions,
    security: SecuritySpec,
}

impl ContainerEnvironment {
    fn run_args(&self, entry_name: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            self.tag.clone(),
        ];
        if self.restrictions.max_memory_mb > 0 {
            args.push(format!("--memory={}m", self.restrictions.max_memory_mb));
        }
        if self.restrictions.max_cpu_percent > 0 {
            let cpus = f64::from(self.restrictions.max_cpu_percent) / 100.0;
            args.push(format!("--cpus={cpus:.2}"));
        }
        if !self.restrictions.network_access || self.security.isolated_network {
            args.push("--network=none".to_string());
        }
        let read_only =
            self.security.read_only || self.restrictions.fs_access == FsAccess::ReadOnly;
        let ro_suffix = if read_only { ":ro" } else { "" };
        args.push("-v".to_string());
        args.push(format!("{}:/sandbox{ro_suffix}", self.paths.root().display()));
        args.push(self.tag.clone());
        args.push("python".to_string());
        args.push("/sandbox/runner.py".to_string());
        args.push(format!("/sandbox/{entry_name}"));
        args
    }
}

#[async_trait]
impl Environment for ContainerEnvironment {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn run(&self, spec: RunSpec<'_>) -> Result<RunOutcome> {
        let entry_name = spec
            .entry
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| SandboxError::ExecutionFailed("entry file has no name".to_string()))?;

        let outcome = crate::process::run(SpawnSpec {
            program: self.engine.clone(),
            args: self.run_args(&entry_name),
            cwd: self.paths.root(),
            env: EnvPolicy::Inherit(Default::default()),
            rlimits: None,
            timeout: spec.timeout,
            runner: spec.runner,
        })
        .await?;

        if outcome.timed_out {
            // Killing the CLI client does not stop the container itself.
            command::exec_ignore_errors(&self.engine, &["rm", "-f", self.tag.as_str()]).await;
        }
        Ok(outcome)
    }

    async fn teardown(&self) -> Vec<String> {
        let mut failures = Vec::new();
        // A stale container from a timed-out run would hold the image.
        command::exec_ignore_errors(&self.engine, &["rm", "-f", self.tag.as_str()]).await;
        if let Err(e) = command::exec_with_timeout(
            &self.engine,
            &["rmi", "-f", self.tag.as_str()],
            IMAGE_REMOVE_TIMEOUT,
        )
        .await
        {
            failures.push(format!("remove image {}: {e}", self.tag));
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_tag_uses_directory_name() {
        assert_eq!(
            image_tag(Path::new("/tmp/roots/sandbox_1700000000_ab12cd34")),
            "sandbox_sandbox_1700000000_ab12cd34"
        );
    }

    #[test]
    fn dockerfile_installs_requested_packages() {
        let dockerfile = render_dockerfile(&["requests".into(), "click".into()]);
        assert!(dockerfile.contains("FROM python:3.12-slim"));
        assert!(dockerfile.contains("RUN pip install --no-cache-dir requests click"));
    }

    #[test]
    fn dockerfile_skips_install_without_packages() {
        let dockerfile = render_dockerfile(&[]);
        assert!(!dockerfile.contains("RUN pip install"));
    }

    #[tokio::test]
    async fn probe_fails_without_engine() {
        let provisioner = ContainerProvisioner::new(
            Some(PathBuf::from("/nonexistent/docker")),
            PackagePolicy::default(),
        );
        let err = provisioner.probe().await.unwrap_err();
        assert!(matches!(err, SandboxError::BackendUnavailable(_)));
    }

    #[test]
    fn run_args_apply_resource_flags() {
        let env = ContainerEnvironment {
            engine: PathBuf::from("docker"),
            tag: "sandbox_x".into(),
            paths: SandboxPaths::new("/tmp/x"),
            restrictions: Restrictions::default(),
            security: SecuritySpec::default(),
        };
        let args = env.run_args("main.py");
        assert!(args.contains(&"--memory=512m".to_string()));
        assert!(args.contains(&"--cpus=0.50".to_string()));
        assert!(args.contains(&"--network=none".to_string()));
        assert!(args.contains(&"/sandbox/main.py".to_string()));
    }

    #[test]
    fn run_args_mount_read_only_when_requested() {
        let env = ContainerEnvironment {
            engine: PathBuf::from("docker"),
            tag: "sandbox_x".into(),
            paths: SandboxPaths::new("/tmp/x"),
            restrictions: Restrictions::default(),
            security: SecuritySpec {
                read_only: true,
                ..SecuritySpec::default()
            },
        };
        let args = env.run_args("main.py");
        assert!(args.contains(&"/tmp/x:/sandbox:ro".to_string()));
    }

    #[test]
    fn run_args_mount_read_only_for_fs_access_level() {
        let env = ContainerEnvironment {
            engine: PathBuf::from("docker"),
            tag: "sandbox_x".into(),
            paths: SandboxPaths::new("/tmp/x"),
            restrictions: Restrictions {
                fs_access: FsAccess::ReadOnly,
                ..Restrictions::default()
            },
            security: SecuritySpec::default(),
        };
        let args = env.run_args("main.py");
        assert!(args.contains(&"/tmp/x:/sandbox:ro".to_string()));
    }
}
