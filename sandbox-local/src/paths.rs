use std::path::{Path, PathBuf};

/// Path derivations inside one sandbox's scratch directory.
#[derive(Debug, Clone)]
pub struct SandboxPaths {
    root: PathBuf,
}

impl SandboxPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Virtual environment directory: `<root>/venv`.
    pub fn venv(&self) -> PathBuf {
        self.root.join("venv")
    }

    pub fn venv_python(&self) -> PathBuf {
        self.venv().join("bin").join("python")
    }

    pub fn venv_pip(&self) -> PathBuf {
        self.venv().join("bin").join("pip")
    }

    /// Generated runner entry point: `<root>/runner.py`.
    pub fn runner(&self) -> PathBuf {
        self.root.join("runner.py")
    }

    /// Submitted entry file: `<root>/<filename>`.
    pub fn entry(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }

    pub fn dockerfile(&self) -> PathBuf {
        self.root.join("Dockerfile")
    }

    // Basic-backend layout.
    pub fn code_dir(&self) -> PathBuf {
        self.root.join("code")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }
}
