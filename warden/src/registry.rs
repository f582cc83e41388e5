use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::{DateTime, Utc};
use sandbox::policy::PackagePolicy;
use sandbox::{
    BackendKind, Environment, ExecutionRequest, ExecutionResult, Provisioner, ResourceUsage,
    Result, RunnerHandle, SandboxConfig, SandboxError, SandboxInfo, SandboxStatus, SandboxSummary,
};
use sandbox_local::{
    BasicProvisioner, ContainerProvisioner, IsolatedProcessProvisioner, VenvProvisioner,
};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::WardenConfig;
use crate::{dispatch, reaper};

/// Destroyed entries kept around for introspection before being pruned.
const TOMBSTONE_LIMIT: usize = 32;

/// Atomic [`SandboxStatus`] cell, readable without the entry's state lock.
pub(crate) struct StatusCell(AtomicU8);

impl StatusCell {
    pub(crate) fn new(status: SandboxStatus) -> Self {
        Self(AtomicU8::new(encode(status)))
    }

    pub(crate) fn load(&self) -> SandboxStatus {
        decode(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, status: SandboxStatus) {
        self.0.store(encode(status), Ordering::Release);
    }
}

fn encode(status: SandboxStatus) -> u8 {
    match status {
        SandboxStatus::Created => 0,
        SandboxStatus::Provisioned => 1,
        SandboxStatus::Executing => 2,
        SandboxStatus::Completed => 3,
        SandboxStatus::Failed => 4,
        SandboxStatus::TimedOut => 5,
        SandboxStatus::Destroyed => 6,
    }
}

fn decode(value: u8) -> SandboxStatus {
    debug_assert!(value <= 6, "invalid SandboxStatus: {value}");
    match value {
        0 => SandboxStatus::Created,
        1 => SandboxStatus::Provisioned,
        2 => SandboxStatus::Executing,
        3 => SandboxStatus::Completed,
        4 => SandboxStatus::Failed,
        5 => SandboxStatus::TimedOut,
        _ => SandboxStatus::Destroyed,
    }
}

/// One tracked sandbox. Owned by the registry; mutated only through the
/// dispatcher (status, usage) and the reaper (teardown).
pub(crate) struct SandboxEntry {
    pub(crate) id: String,
    pub(crate) root: PathBuf,
    pub(crate) config: SandboxConfig,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) status: StatusCell,
    pub(crate) usage: StdMutex<ResourceUsage>,
    /// Pid of the live runner process while `Executing`.
    pub(crate) runner: RunnerHandle,
    /// Holds the backend environment and serializes per-sandbox operations:
    /// a sandbox is never executed or torn down concurrently with itself.
    pub(crate) environment: Mutex<Option<Box<dyn Environment>>>,
}

impl SandboxEntry {
    pub(crate) fn usage(&self) -> ResourceUsage {
        *self
            .usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn update_usage(&self, update: impl FnOnce(&mut ResourceUsage)) {
        let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut usage);
    }

    fn summary(&self) -> SandboxSummary {
        SandboxSummary {
            id: self.id.clone(),
            name: self.config.name.clone(),
            backend: self.config.backend,
            status: self.status.load(),
            created_at: self.created_at,
            root: self.root.clone(),
            usage: self.usage(),
        }
    }
}

/// Tracks every sandbox on this host, enforces the concurrency ceiling, and
/// owns the sandbox root directory tree.
pub struct Registry {
    config: WardenConfig,
    provisioners: Vec<Arc<dyn Provisioner>>,
    sandboxes: Mutex<HashMap<String, Arc<SandboxEntry>>>,
}

impl Registry {
    pub fn new(config: WardenConfig) -> Self {
        let packages = PackagePolicy::new(config.allowed_packages.iter().cloned());
        let provisioners: Vec<Arc<dyn Provisioner>> = vec![
            Arc::new(VenvProvisioner::new(config.python.clone(), packages.clone())),
            Arc::new(ContainerProvisioner::new(
                config.container_engine.clone(),
                packages,
            )),
            Arc::new(IsolatedProcessProvisioner::new(config.python.clone())),
            Arc::new(BasicProvisioner::new(config.python.clone())),
        ];
        Self {
            config,
            provisioners,
            sandboxes: Mutex::new(HashMap::new()),
        }
    }

    pub fn sandbox_root(&self) -> &Path {
        &self.config.sandbox_root
    }

    fn provisioner(&self, kind: BackendKind) -> Result<Arc<dyn Provisioner>> {
        self.provisioners
            .iter()
            .find(|p| p.kind() == kind)
            .cloned()
            .ok_or_else(|| SandboxError::BackendUnavailable(format!("no provisioner for {kind}")))
    }

    /// Probe every backend on this host.
    pub async fn probe_backends(&self) -> Vec<(BackendKind, Result<()>)> {
        let mut results = Vec::with_capacity(self.provisioners.len());
        for provisioner in &self.provisioners {
            results.push((provisioner.kind(), provisioner.probe().await));
        }
        results
    }

    async fn lookup(&self, id: &str) -> Result<Arc<SandboxEntry>> {
        self.sandboxes
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))
    }

    /// Create and provision a new sandbox, returning its ID.
    ///
    /// The backend is probed before any disk state exists, so an unavailable
    /// backend leaves nothing behind. The slot is reserved under the map
    /// lock, but provisioning itself runs outside it.
    pub async fn create_sandbox(&self, config: SandboxConfig) -> Result<String> {
        let provisioner = self.provisioner(config.backend)?;
        provisioner.probe().await?;

        let entry = {
            let mut map = self.sandboxes.lock().await;
            let active = map
                .values()
                .filter(|e| e.status.load() != SandboxStatus::Destroyed)
                .count();
            if active >= self.config.max_sandboxes {
                return Err(SandboxError::CapacityExceeded {
                    active,
                    limit: self.config.max_sandboxes,
                });
            }
            let mut id = generate_id();
            while map.contains_key(&id) {
                id = generate_id();
            }
            let entry = Arc::new(SandboxEntry {
                root: self.config.sandbox_root.join(&id),
                id: id.clone(),
                config,
                created_at: Utc::now(),
                status: StatusCell::new(SandboxStatus::Created),
                usage: StdMutex::new(ResourceUsage::default()),
                runner: RunnerHandle::new(),
                environment: Mutex::new(None),
            });
            map.insert(id, entry.clone());
            entry
        };

        if let Err(e) = self.provision_entry(&provisioner, &entry).await {
            // Roll back: remove the partial root and release the slot.
            let _ = tokio::fs::remove_dir_all(&entry.root).await;
            self.sandboxes.lock().await.remove(&entry.id);
            warn!(id = %entry.id, error = %e, "provisioning failed");
            return Err(e);
        }

        info!(id = %entry.id, backend = %entry.config.backend, "sandbox created");
        Ok(entry.id.clone())
    }

    async fn provision_entry(
        &self,
        provisioner: &Arc<dyn Provisioner>,
        entry: &Arc<SandboxEntry>,
    ) -> Result<()> {
        tokio::fs::create_dir_all(&entry.root)
            .await
            .map_err(|e| SandboxError::ProvisionFailed(format!("create sandbox root: {e}")))?;
        let environment = provisioner.provision(&entry.config, &entry.root).await?;
        *entry.environment.lock().await = Some(environment);
        entry.status.store(SandboxStatus::Provisioned);
        Ok(())
    }

    /// Run code in a provisioned sandbox. Per-sandbox operations serialize;
    /// independent sandboxes execute in parallel.
    pub async fn execute(&self, id: &str, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let entry = self.lookup(id).await?;
        dispatch::execute(&entry, request).await
    }

    pub async fn get_info(&self, id: &str) -> Result<SandboxInfo> {
        let entry = self.lookup(id).await?;
        Ok(SandboxInfo {
            id: entry.id.clone(),
            status: entry.status.load(),
            created_at: entry.created_at,
            root: entry.root.clone(),
            config: entry.config.clone(),
            usage: entry.usage(),
        })
    }

    /// Read-only snapshot of every tracked sandbox, tombstones included.
    pub async fn list(&self) -> Vec<SandboxSummary> {
        self.sandboxes
            .lock()
            .await
            .values()
            .map(|entry| entry.summary())
            .collect()
    }

    /// Destroy a sandbox: kill its runner, tear down backend resources,
    /// delete its scratch directory. Destroying an already-destroyed sandbox
    /// is a no-op success; partial teardown failures are aggregated, never
    /// swallowed.
    pub async fn destroy(&self, id: &str) -> Result<()> {
        let entry = self.lookup(id).await?;
        if entry.status.load() == SandboxStatus::Destroyed {
            return Ok(());
        }

        let failures = reaper::destroy_entry(&entry).await;
        self.prune_tombstones().await;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SandboxError::CleanupPartialFailure(failures))
        }
    }

    /// Best-effort destroy of every tracked sandbox; used at shutdown.
    /// Returns the destroyed count and every error encountered.
    pub async fn cleanup_all(&self) -> (usize, Vec<SandboxError>) {
        let ids: Vec<String> = {
            let map = self.sandboxes.lock().await;
            map.values()
                .filter(|e| e.status.load() != SandboxStatus::Destroyed)
                .map(|e| e.id.clone())
                .collect()
        };

        let mut destroyed = 0;
        let mut errors = Vec::new();
        for id in ids {
            match self.destroy(&id).await {
                Ok(()) => destroyed += 1,
                Err(e) => errors.push(e),
            }
        }
        info!(destroyed, errors = errors.len(), "cleanup finished");
        (destroyed, errors)
    }

    /// Normalize sandboxes whose runner died without a status transition.
    pub async fn reap_orphans(&self) -> usize {
        let entries: Vec<Arc<SandboxEntry>> =
            self.sandboxes.lock().await.values().cloned().collect();
        reaper::reap_orphans(&entries)
    }

    async fn prune_tombstones(&self) {
        let mut map = self.sandboxes.lock().await;
        let mut tombstones: Vec<(String, DateTime<Utc>)> = map
            .iter()
            .filter(|(_, e)| e.status.load() == SandboxStatus::Destroyed)
            .map(|(id, e)| (id.clone(), e.created_at))
            .collect();
        if tombstones.len() <= TOMBSTONE_LIMIT {
            return;
        }
        tombstones.sort_by_key(|(_, created_at)| *created_at);
        let excess = tombstones.len() - TOMBSTONE_LIMIT;
        for (id, _) in tombstones.into_iter().take(excess) {
            map.remove(&id);
        }
    }
}

/// `sandbox_<unixtime>_<random8>`. Uniqueness is re-checked under the map
/// lock before the ID is handed out.
fn generate_id() -> String {
    let unixtime = Utc::now().timestamp();
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
    format!("sandbox_{unixtime}_{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox::FailureKind;
    use std::time::{Duration, Instant};

    fn python_missing() -> bool {
        if which::which("python3").or_else(|_| which::which("python")).is_err() {
            eprintln!("no python interpreter on PATH, skipping");
            return true;
        }
        false
    }

    fn test_config(dir: &Path) -> WardenConfig {
        WardenConfig {
            sandbox_root: dir.join("roots"),
            ..WardenConfig::default()
        }
    }

    fn basic_config(name: &str) -> SandboxConfig {
        SandboxConfig::new(name, BackendKind::Basic)
    }

    #[test]
    fn generated_ids_are_pairwise_distinct() {
        let ids: Vec<String> = (0..64).map(|_| generate_id()).collect();
        for (i, a) in ids.iter().enumerate() {
            for b in ids.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn generated_ids_have_expected_shape() {
        let id = generate_id();
        assert!(id.starts_with("sandbox_"), "got: {id}");
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3, "got: {id}");
        assert_eq!(parts[2].len(), 8, "got: {id}");
    }

    #[tokio::test]
    async fn create_execute_destroy_round_trip() {
        if python_missing() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(test_config(dir.path()));

        let id = registry.create_sandbox(basic_config("round-trip")).await.unwrap();
        let info = registry.get_info(&id).await.unwrap();
        assert_eq!(info.status, SandboxStatus::Provisioned);
        assert!(info.root.is_dir());

        let result = registry
            .execute(&id, &ExecutionRequest::new("print('hi')"))
            .await
            .unwrap();
        assert!(result.success, "stderr: {}", result.stderr);
        assert_eq!(result.stdout, "hi\n");
        assert_eq!(result.exit_code, 0);

        let info = registry.get_info(&id).await.unwrap();
        assert_eq!(info.status, SandboxStatus::Completed);
        assert_eq!(info.usage.files_created, 1);

        registry.destroy(&id).await.unwrap();
        assert!(!dir.path().join("roots").join(&id).exists());
        let info = registry.get_info(&id).await.unwrap();
        assert_eq!(info.status, SandboxStatus::Destroyed);
    }

    #[tokio::test]
    async fn capacity_ceiling_is_enforced_and_released() {
        if python_missing() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let config = WardenConfig {
            max_sandboxes: 2,
            ..test_config(dir.path())
        };
        let registry = Registry::new(config);

        let first = registry.create_sandbox(basic_config("a")).await.unwrap();
        let _second = registry.create_sandbox(basic_config("b")).await.unwrap();

        let err = registry.create_sandbox(basic_config("c")).await.unwrap_err();
        assert!(
            matches!(err, SandboxError::CapacityExceeded { active: 2, limit: 2 }),
            "got: {err}"
        );

        // Destroying one frees a slot.
        registry.destroy(&first).await.unwrap();
        registry.create_sandbox(basic_config("c")).await.unwrap();
    }

    #[tokio::test]
    async fn created_ids_are_unique() {
        if python_missing() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(test_config(dir.path()));
        let mut ids = std::collections::HashSet::new();
        for i in 0..5 {
            let id = registry
                .create_sandbox(basic_config(&format!("s{i}")))
                .await
                .unwrap();
            assert!(ids.insert(id), "duplicate sandbox id");
        }
    }

    #[tokio::test]
    async fn execute_unknown_sandbox_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(test_config(dir.path()));
        let err = registry
            .execute("sandbox_0_deadbeef", &ExecutionRequest::new("print(1)"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(_)), "got: {err}");
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        if python_missing() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(test_config(dir.path()));
        let id = registry.create_sandbox(basic_config("twice")).await.unwrap();
        registry.destroy(&id).await.unwrap();
        registry.destroy(&id).await.unwrap();
    }

    #[tokio::test]
    async fn execute_after_destroy_is_invalid_state() {
        if python_missing() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(test_config(dir.path()));
        let id = registry.create_sandbox(basic_config("gone")).await.unwrap();
        registry.destroy(&id).await.unwrap();

        let err = registry
            .execute(&id, &ExecutionRequest::new("print(1)"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::InvalidState { .. }), "got: {err}");
    }

    #[tokio::test]
    async fn blocked_import_is_rejected_without_side_effects() {
        if python_missing() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(test_config(dir.path()));
        let id = registry.create_sandbox(basic_config("blocked")).await.unwrap();

        let result = registry
            .execute(
                &id,
                &ExecutionRequest::new("import subprocess\nsubprocess.run(['id'])"),
            )
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::BlockedImport));

        // Nothing was spawned and no entry file was written.
        let info = registry.get_info(&id).await.unwrap();
        assert_eq!(info.status, SandboxStatus::Provisioned);
        assert!(!info.root.join("main.py").exists());
    }

    #[tokio::test]
    async fn destructive_source_is_rejected() {
        if python_missing() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(test_config(dir.path()));
        let id = registry.create_sandbox(basic_config("nasty")).await.unwrap();

        let result = registry
            .execute(
                &id,
                &ExecutionRequest::new("import os\nos.system('rm -rf / --no-preserve-root')"),
            )
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::ForbiddenPattern));
    }

    #[tokio::test]
    async fn isolated_process_timeout_kills_the_runner() {
        if python_missing() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(test_config(dir.path()));

        let mut config = SandboxConfig::new("spinner", BackendKind::IsolatedProcess);
        config.restrictions.max_execution_secs = 2;
        let id = registry.create_sandbox(config).await.unwrap();

        let start = Instant::now();
        let result = registry
            .execute(&id, &ExecutionRequest::new("while True: pass"))
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Timeout));
        assert!(elapsed >= Duration::from_secs(2), "returned in {elapsed:?}");
        assert!(elapsed < Duration::from_secs(15), "took {elapsed:?}");

        let info = registry.get_info(&id).await.unwrap();
        assert_eq!(info.status, SandboxStatus::TimedOut);
        // No runner process may survive the call.
        assert!(
            registry.lookup(&id).await.unwrap().runner.get().is_none(),
            "runner handle still set"
        );
    }

    #[tokio::test]
    async fn isolated_process_runs_to_completion() {
        if python_missing() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(test_config(dir.path()));

        let mut config = SandboxConfig::new("hello", BackendKind::IsolatedProcess);
        config.restrictions.max_execution_secs = 10;
        let id = registry.create_sandbox(config).await.unwrap();

        let result = registry
            .execute(&id, &ExecutionRequest::new("print('hi')"))
            .await
            .unwrap();
        assert!(result.success, "stderr: {}", result.stderr);
        assert_eq!(result.stdout, "hi\n");
        assert!(result.duration < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn sandbox_is_reexecutable_after_failure() {
        if python_missing() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(test_config(dir.path()));
        let id = registry.create_sandbox(basic_config("retry")).await.unwrap();

        let failed = registry
            .execute(&id, &ExecutionRequest::new("raise SystemExit(3)"))
            .await
            .unwrap();
        assert!(!failed.success);
        assert_eq!(failed.exit_code, 3);
        assert_eq!(failed.failure, Some(FailureKind::ExecutionError));

        let ok = registry
            .execute(&id, &ExecutionRequest::new("print('again')"))
            .await
            .unwrap();
        assert!(ok.success);
        assert_eq!(ok.stdout, "again\n");
    }

    #[tokio::test]
    async fn container_backend_unavailable_creates_no_scratch_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = WardenConfig {
            container_engine: Some(PathBuf::from("/nonexistent/docker")),
            ..test_config(dir.path())
        };
        let registry = Registry::new(config);

        let err = registry
            .create_sandbox(SandboxConfig::new("boxed", BackendKind::Container))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::BackendUnavailable(_)), "got: {err}");
        assert!(
            !dir.path().join("roots").exists()
                || dir.path().join("roots").read_dir().unwrap().next().is_none(),
            "scratch state was created"
        );
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn disallowed_package_fails_provisioning() {
        if python_missing() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(test_config(dir.path()));

        let mut config = SandboxConfig::new("pkgs", BackendKind::PythonVenv);
        config.environment.packages = vec!["cryptomine".into()];
        let err = registry.create_sandbox(config).await.unwrap_err();
        assert!(matches!(err, SandboxError::PackageNotAllowed(_)), "got: {err}");
        assert!(registry.list().await.is_empty(), "slot was not released");
    }

    #[tokio::test]
    async fn list_includes_tombstones() {
        if python_missing() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(test_config(dir.path()));
        let id = registry.create_sandbox(basic_config("ghost")).await.unwrap();
        registry.destroy(&id).await.unwrap();

        let summaries = registry.list().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].status, SandboxStatus::Destroyed);
    }

    #[tokio::test]
    async fn cleanup_all_destroys_everything() {
        if python_missing() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(test_config(dir.path()));
        for i in 0..3 {
            registry
                .create_sandbox(basic_config(&format!("c{i}")))
                .await
                .unwrap();
        }

        let (destroyed, errors) = registry.cleanup_all().await;
        assert_eq!(destroyed, 3);
        assert!(errors.is_empty(), "errors: {errors:?}");
        assert!(
            registry
                .list()
                .await
                .iter()
                .all(|s| s.status == SandboxStatus::Destroyed)
        );
    }

    #[tokio::test]
    async fn parallel_executions_on_independent_sandboxes() {
        if python_missing() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::new(test_config(dir.path())));

        let a = registry.create_sandbox(basic_config("par-a")).await.unwrap();
        let b = registry.create_sandbox(basic_config("par-b")).await.unwrap();

        let ra = {
            let registry = Arc::clone(&registry);
            let a = a.clone();
            tokio::spawn(async move {
                registry
                    .execute(&a, &ExecutionRequest::new("print('a')"))
                    .await
            })
        };
        let rb = {
            let registry = Arc::clone(&registry);
            let b = b.clone();
            tokio::spawn(async move {
                registry
                    .execute(&b, &ExecutionRequest::new("print('b')"))
                    .await
            })
        };

        let ra = ra.await.unwrap().unwrap();
        let rb = rb.await.unwrap().unwrap();
        assert_eq!(ra.stdout, "a\n");
        assert_eq!(rb.stdout, "b\n");
    }
}
