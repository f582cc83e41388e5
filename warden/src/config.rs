use std::path::{Path, PathBuf};

use sandbox::policy::DEFAULT_ALLOWED_PACKAGES;
use serde::{Deserialize, Serialize};

use crate::error::{WardenError, WardenResult};

pub(crate) const DEFAULT_MAX_SANDBOXES: usize = 10;
const DEFAULT_SANDBOX_ROOT: &str = "sandbox_environments";

/// Manager configuration. Every field has a default, so an empty file (or no
/// file at all) yields a working single-host setup.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// Directory under which per-sandbox scratch directories are created.
    pub sandbox_root: PathBuf,
    /// Ceiling on concurrently active (non-destroyed) sandboxes.
    pub max_sandboxes: usize,
    /// Interpreter override for the process-level backends.
    pub python: Option<PathBuf>,
    /// Container engine override (otherwise docker, then podman, from PATH).
    pub container_engine: Option<PathBuf>,
    /// Packages installable into sandbox environments.
    pub allowed_packages: Vec<String>,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            sandbox_root: PathBuf::from(DEFAULT_SANDBOX_ROOT),
            max_sandboxes: DEFAULT_MAX_SANDBOXES,
            python: None,
            container_engine: None,
            allowed_packages: DEFAULT_ALLOWED_PACKAGES
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Load and validate a manager config from a YAML file.
///
/// Relative paths are resolved against the config file's parent directory.
pub async fn load(path: &Path) -> WardenResult<WardenConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| WardenError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: WardenConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| WardenError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    validate_overrides(&config).await?;
    Ok(config)
}

async fn validate_overrides(config: &WardenConfig) -> WardenResult<()> {
    check_override_exists(config.python.as_deref(), "python").await?;
    check_override_exists(config.container_engine.as_deref(), "container_engine").await?;
    Ok(())
}

async fn check_override_exists(path: Option<&Path>, label: &str) -> WardenResult<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let exists = tokio::fs::try_exists(path)
        .await
        .map_err(|e| WardenError::Config(format!("check {label}: {e}")))?;
    if !exists {
        return Err(WardenError::Config(format!(
            "{label} not found: {}",
            path.display()
        )));
    }
    Ok(())
}

impl WardenConfig {
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        resolve(&mut self.sandbox_root);
        if let Some(python) = &mut self.python {
            resolve(python);
        }
        if let Some(engine) = &mut self.container_engine {
            resolve(engine);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let python = dir.path().join("python3");
        tokio::fs::write(&python, b"").await.unwrap();

        let yaml = format!(
            r#"
sandbox_root: {root}
max_sandboxes: 4
python: {python}
allowed_packages:
  - requests
"#,
            root = dir.path().join("roots").display(),
            python = python.display(),
        );
        let config_path = dir.path().join("warden.yaml");
        tokio::fs::write(&config_path, &yaml).await.unwrap();

        let config = load(&config_path).await.unwrap();
        assert_eq!(config.sandbox_root, dir.path().join("roots"));
        assert_eq!(config.max_sandboxes, 4);
        assert_eq!(config.python, Some(python));
        assert_eq!(config.allowed_packages, vec!["requests".to_string()]);
    }

    #[tokio::test]
    async fn load_applies_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("warden.yaml");
        tokio::fs::write(&config_path, "max_sandboxes: 2\n")
            .await
            .unwrap();

        let config = load(&config_path).await.unwrap();
        assert_eq!(config.max_sandboxes, 2);
        assert_eq!(
            config.sandbox_root,
            dir.path().join(DEFAULT_SANDBOX_ROOT),
            "relative default resolves against the config dir"
        );
        assert!(config.python.is_none());
        assert_eq!(config.allowed_packages.len(), DEFAULT_ALLOWED_PACKAGES.len());
    }

    #[tokio::test]
    async fn load_fails_on_missing_override() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("warden.yaml");
        tokio::fs::write(&config_path, "python: /nonexistent/python9\n")
            .await
            .unwrap();

        let err = load(&config_path).await.unwrap_err();
        assert!(err.to_string().contains("not found"), "got: {err}");
    }

    #[tokio::test]
    async fn load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("warden.yaml");
        tokio::fs::write(&config_path, "sandbox_root: boxes\n")
            .await
            .unwrap();

        let config = load(&config_path).await.unwrap();
        assert!(config.sandbox_root.is_absolute());
        assert_eq!(config.sandbox_root, dir.path().join("boxes"));
    }
}
