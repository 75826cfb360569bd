//! Container lifecycle orchestration on the daemon side.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::client::RemoteTask;
use crate::control::TaskControl;
use crate::error::{Error, Result};
use crate::registry::{Registry, TaskGuard};
use crate::runtime::Runtime;
use crate::shim::ShimSupervisor;
use crate::task::{TaskKey, TaskSnapshot, TaskState};

/// Drives container create/start/delete through the registry and the shims.
pub struct TaskManager {
    registry: Arc<Registry>,
    supervisor: ShimSupervisor,
    /// Used directly only to clean up after a shim that is gone.
    runtime: Arc<dyn Runtime>,
}

impl TaskManager {
    pub fn new(registry: Arc<Registry>, supervisor: ShimSupervisor, runtime: Arc<dyn Runtime>) -> Self {
        Self {
            registry,
            supervisor,
            runtime,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Register a container, start its shim and have the shim create it.
    ///
    /// On failure nothing is left behind: the shim is terminated and the entry
    /// rolled back.
    pub async fn create(&self, key: TaskKey, bundle: PathBuf) -> Result<TaskSnapshot> {
        let mut guard = self.registry.insert(key, bundle).await?;

        match self.bring_up(&mut guard).await {
            Ok(pid) => {
                guard.commit();
                info!(key = %guard.key(), pid, "Container created");
                Ok(guard.snapshot())
            }
            Err(e) => {
                warn!(key = %guard.key(), error = %e, "Create failed, rolling back");
                if let Some(shim) = guard.take_shim() {
                    self.supervisor.shutdown(&shim).await;
                    if let Err(te) = self.supervisor.terminate(&shim).await {
                        warn!(key = %guard.key(), error = %te, "Failed to terminate shim");
                    }
                }
                self.registry.rollback(guard).await;
                Err(e)
            }
        }
    }

    async fn bring_up(&self, guard: &mut TaskGuard<'_>) -> Result<u32> {
        let shim = self.supervisor.spawn(guard.key()).await?;
        let socket = shim.socket_path().to_path_buf();
        guard.attach_shim(shim);

        let task = self.supervisor.connect(&socket).await?;
        task.create(guard.key().id(), guard.bundle_path()).await
    }

    /// Start a created container; returns its init pid.
    pub async fn start(&self, key: &TaskKey) -> Result<u32> {
        let mut guard = self.registry.lock(key).await?;
        guard.transition(TaskState::Starting)?;

        let started = async {
            let task = self.shim_task(&guard).await?;
            task.start(key.id()).await
        }
        .await;

        match started {
            Ok(pid) => {
                guard.set_running(pid)?;
                info!(key = %key, pid, "Container started");
                Ok(pid)
            }
            Err(e) => {
                guard.fail(e.to_string())?;
                Err(e)
            }
        }
    }

    /// Stop and delete a container, terminate its shim and drop the entry.
    pub async fn delete(&self, key: &TaskKey) -> Result<()> {
        let mut guard = self.registry.lock(key).await?;

        match guard.state() {
            TaskState::Created | TaskState::Running => {
                guard.transition(TaskState::Stopping)?;

                let deleted = async {
                    let task = self.shim_task(&guard).await?;
                    task.delete(key.id()).await
                }
                .await;

                match deleted {
                    Ok(deleted) => {
                        debug!(
                            key = %key,
                            pid = deleted.pid,
                            exit_status = ?deleted.exit_status,
                            "Shim deleted container"
                        );
                    }
                    // The shim already dropped it, e.g. on a retried delete.
                    Err(Error::NotFound(_)) => {
                        debug!(key = %key, "Container already gone on shim");
                    }
                    Err(e) => {
                        guard.fail(e.to_string())?;
                        return Err(e);
                    }
                }
                guard.transition(TaskState::Stopped)?;
            }
            TaskState::Failed => self.cleanup_failed(&guard).await,
            TaskState::Stopped => {}
            state => {
                return Err(Error::PreconditionFailed(format!(
                    "container {key} is {state}"
                )));
            }
        }

        if let Some(shim) = guard.take_shim() {
            self.supervisor.shutdown(&shim).await;
            if let Err(e) = self.supervisor.terminate(&shim).await {
                // Keep the handle so a later delete can try again.
                guard.attach_shim(shim);
                return Err(e);
            }
        }

        guard.remove().await?;
        info!(key = %key, "Container deleted");
        Ok(())
    }

    pub async fn get(&self, key: &TaskKey) -> Result<TaskSnapshot> {
        self.registry
            .get(key)
            .await
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    pub async fn list(&self, namespace: Option<&str>) -> Vec<TaskSnapshot> {
        self.registry.list(namespace).await
    }

    /// Client for the shim owning the locked entry.
    async fn shim_task(&self, guard: &TaskGuard<'_>) -> Result<RemoteTask> {
        let Some(shim) = guard.shim() else {
            return Err(Error::PreconditionFailed(format!(
                "container {} has no shim",
                guard.key()
            )));
        };
        if let Some(exit) = shim.exit() {
            return Err(Error::ShimUnreachable {
                socket: shim.socket_path().to_path_buf(),
                reason: format!("shim exited ({exit})"),
            });
        }
        self.supervisor.connect(shim.socket_path()).await
    }

    /// Best-effort runtime cleanup for a failed container. Errors are logged only.
    async fn cleanup_failed(&self, guard: &TaskGuard<'_>) {
        let key = guard.key();

        let via_shim = match guard.shim() {
            Some(shim) if shim.is_running() => {
                match self.supervisor.route_connection(shim.socket_path()).await {
                    Ok(task) => task.delete(key.id()).await.map(|_| ()),
                    Err(e) => Err(e),
                }
            }
            _ => Err(Error::PreconditionFailed("shim not running".to_string())),
        };

        match via_shim {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => {
                debug!(key = %key, error = %e, "Cleaning up failed container through the runtime");
                if let Err(e) = self.runtime.delete_container(key.id()).await {
                    warn!(key = %key, error = %e, "Runtime cleanup of failed container failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::test_util::{InProcessLauncher, MockRuntime, RuntimeCall};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        state_dir: PathBuf,
        shim_runtime: Arc<MockRuntime>,
        daemon_runtime: Arc<MockRuntime>,
        launcher: Arc<InProcessLauncher>,
        manager: Arc<TaskManager>,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let state_dir = dir.path().to_path_buf();
        let config = Config {
            state_dir: state_dir.clone(),
            connect_timeout: Duration::from_secs(1),
            shim_stop_timeout: Duration::from_secs(1),
            ..Config::default()
        };

        let shim_runtime = Arc::new(MockRuntime::new());
        let daemon_runtime = Arc::new(MockRuntime::new());
        let launcher = Arc::new(InProcessLauncher::new(shim_runtime.clone()));
        let registry = Arc::new(Registry::new());
        let supervisor = ShimSupervisor::new(registry.clone(), launcher.clone(), &config);
        let manager = Arc::new(TaskManager::new(
            registry,
            supervisor,
            daemon_runtime.clone(),
        ));

        Harness {
            _dir: dir,
            state_dir,
            shim_runtime,
            daemon_runtime,
            launcher,
            manager,
        }
    }

    fn key(id: &str) -> TaskKey {
        TaskKey::new("default", id).unwrap()
    }

    fn bundle(id: &str) -> PathBuf {
        PathBuf::from(format!("/bundles/{id}"))
    }

    #[tokio::test]
    async fn test_create_start_delete() {
        let h = harness();

        let created = h.manager.create(key("c1"), bundle("c1")).await.unwrap();
        assert_eq!(created.state, TaskState::Created);
        let socket = created.shim_socket_path.unwrap();
        assert_eq!(socket, h.state_dir.join("default/c1/shim.sock"));
        assert!(socket.exists());

        let pid = h.manager.start(&key("c1")).await.unwrap();
        assert_ne!(pid, 0);
        let running = h.manager.get(&key("c1")).await.unwrap();
        assert_eq!(running.state, TaskState::Running);
        assert_eq!(running.pid, Some(pid));

        h.manager.delete(&key("c1")).await.unwrap();

        assert!(matches!(
            h.manager.get(&key("c1")).await,
            Err(Error::NotFound(_))
        ));
        assert!(!socket.exists());
        assert_eq!(
            h.shim_runtime.calls(),
            vec![
                RuntimeCall::GenerateBundle(bundle("c1")),
                RuntimeCall::Create("c1".into()),
                RuntimeCall::Start("c1".into()),
                RuntimeCall::Delete("c1".into()),
            ]
        );
        assert!(h.daemon_runtime.calls().is_empty());
        assert_eq!(h.launcher.live_shims(), 0);
    }

    #[tokio::test]
    async fn test_double_create() {
        let h = harness();

        h.manager.create(key("c1"), bundle("c1")).await.unwrap();
        let err = h.manager.create(key("c1"), bundle("c1")).await.unwrap_err();

        assert!(matches!(err, Error::AlreadyExists(_)));
        assert_eq!(h.manager.list(None).await.len(), 1);
        assert_eq!(h.launcher.launches(), 1);
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let h = harness();

        assert!(matches!(
            h.manager.start(&key("missing")).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            h.manager.delete(&key("missing")).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_creates_single_winner() {
        let h = harness();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = h.manager.clone();
            handles.push(tokio::spawn(async move {
                manager.create(key("c1"), bundle("c1")).await
            }));
        }

        let mut created = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => created += 1,
                Err(e) => assert!(matches!(e, Error::AlreadyExists(_)), "{e}"),
            }
        }
        assert_eq!(created, 1);
        assert_eq!(h.manager.list(None).await.len(), 1);
        assert_eq!(h.launcher.launches(), 1);
    }

    #[tokio::test]
    async fn test_failed_create_leaves_nothing() {
        let h = harness();
        h.shim_runtime.fail_create(true);

        let err = h.manager.create(key("c1"), bundle("c1")).await.unwrap_err();

        assert!(matches!(err, Error::RuntimeExecutionFailed { .. }));
        assert!(h.manager.list(None).await.is_empty());
        assert!(!h.state_dir.join("default/c1/shim.sock").exists());
        assert_eq!(h.launcher.live_shims(), 0);
    }

    #[tokio::test]
    async fn test_failed_launch_leaves_nothing() {
        let h = harness();
        h.launcher.fail_launch(true);

        let err = h.manager.create(key("c1"), bundle("c1")).await.unwrap_err();

        assert!(matches!(err, Error::Io(_)));
        assert!(h.manager.list(None).await.is_empty());
        assert!(!h.state_dir.join("default/c1").exists());
    }

    #[tokio::test]
    async fn test_failed_start_then_delete() {
        let h = harness();
        h.shim_runtime.fail_start(true);

        h.manager.create(key("c1"), bundle("c1")).await.unwrap();
        let err = h.manager.start(&key("c1")).await.unwrap_err();

        match err {
            Error::RuntimeExecutionFailed { exit_code, .. } => assert_eq!(exit_code, 1),
            other => panic!("unexpected error: {other:?}"),
        }
        let failed = h.manager.get(&key("c1")).await.unwrap();
        assert_eq!(failed.state, TaskState::Failed);
        assert_eq!(failed.pid, None);

        h.manager.delete(&key("c1")).await.unwrap();
        assert!(h.manager.list(None).await.is_empty());
        assert_eq!(h.launcher.live_shims(), 0);
    }

    #[tokio::test]
    async fn test_delete_created_container() {
        let h = harness();
        h.manager.create(key("c1"), bundle("c1")).await.unwrap();

        h.manager.delete(&key("c1")).await.unwrap();

        assert!(h.manager.list(None).await.is_empty());
        assert!(
            h.shim_runtime
                .calls()
                .contains(&RuntimeCall::Delete("c1".into()))
        );
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_entry() {
        let h = harness();
        h.manager.create(key("c1"), bundle("c1")).await.unwrap();
        h.manager.start(&key("c1")).await.unwrap();
        h.shim_runtime.fail_delete(true);

        let err = h.manager.delete(&key("c1")).await.unwrap_err();
        assert!(matches!(err, Error::RuntimeExecutionFailed { .. }));
        assert_eq!(
            h.manager.get(&key("c1")).await.unwrap().state,
            TaskState::Failed
        );

        h.shim_runtime.fail_delete(false);
        h.manager.delete(&key("c1")).await.unwrap();
        assert!(h.manager.list(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_shim_death_fails_entry_and_delete_cleans_up() {
        let h = harness();
        h.manager.create(key("c1"), bundle("c1")).await.unwrap();
        h.manager.start(&key("c1")).await.unwrap();

        h.launcher.crash(&key("c1"));

        let mut state = None;
        for _ in 0..100 {
            state = h.manager.get(&key("c1")).await.ok().map(|s| s.state);
            if state == Some(TaskState::Failed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state, Some(TaskState::Failed));

        let err = h.manager.start(&key("c1")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));

        h.manager.delete(&key("c1")).await.unwrap();
        assert!(h.manager.list(None).await.is_empty());
        // The shim was gone, so the daemon cleaned up through its own runtime.
        assert_eq!(
            h.daemon_runtime.calls(),
            vec![RuntimeCall::Delete("c1".into())]
        );
        assert!(!h.state_dir.join("default/c1/shim.sock").exists());
    }

    #[tokio::test]
    async fn test_cancelled_start_leaves_failed() {
        let h = harness();
        h.manager.create(key("c1"), bundle("c1")).await.unwrap();
        h.shim_runtime.delay_start(Duration::from_secs(5));

        let result =
            tokio::time::timeout(Duration::from_millis(200), h.manager.start(&key("c1"))).await;
        assert!(result.is_err());

        let snapshot = h.manager.get(&key("c1")).await.unwrap();
        assert_eq!(snapshot.state, TaskState::Failed);
        assert!(snapshot.error.unwrap().contains("starting"));
    }

    #[tokio::test]
    async fn test_list_by_namespace() {
        let h = harness();
        h.manager.create(key("c1"), bundle("c1")).await.unwrap();
        h.manager
            .create(TaskKey::new("other", "c1").unwrap(), bundle("c1"))
            .await
            .unwrap();

        assert_eq!(h.manager.list(None).await.len(), 2);
        let other = h.manager.list(Some("other")).await;
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].key.namespace(), "other");
    }
}
