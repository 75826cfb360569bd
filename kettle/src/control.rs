//! Task control: the per-container create/start/delete protocol.
//!
//! [`TaskControl`] is implemented twice: [`LocalTask`] runs inside the shim and
//! drives the OCI runtime, [`RemoteTask`](crate::client::RemoteTask) is the
//! daemon's handle on a shim over its socket.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::runtime::Runtime;
use crate::task::{TaskKey, TaskSnapshot, TaskState};

/// How long `delete` waits for the reaper to report the init exit status.
const EXIT_STATUS_WAIT: Duration = Duration::from_secs(2);

/// Result of deleting a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletedTask {
    pub pid: u32,
    /// Exit status of the container init, when it was observed.
    pub exit_status: Option<u32>,
}

#[async_trait]
pub trait TaskControl: Send + Sync {
    /// Prepare the bundle and create the container; returns the init pid.
    async fn create(&self, id: &str, bundle: &Path) -> Result<u32>;

    /// Start a created container; returns the init pid.
    async fn start(&self, id: &str) -> Result<u32>;

    /// Delete the container, killing it if it still runs.
    async fn delete(&self, id: &str) -> Result<DeletedTask>;

    async fn state(&self, id: &str) -> Result<TaskSnapshot>;

    /// Stop serving. The caller still has to confirm the process exited.
    async fn shutdown(&self) -> Result<()>;
}

/// The task a shim owns: one container, driven through the OCI runtime.
pub struct LocalTask {
    key: TaskKey,
    registry: Registry,
    runtime: Arc<dyn Runtime>,
    reap: bool,
    exit_tx: Arc<watch::Sender<Option<u32>>>,
    shutdown_tx: mpsc::Sender<()>,
}

impl LocalTask {
    pub fn new(key: TaskKey, runtime: Arc<dyn Runtime>, shutdown_tx: mpsc::Sender<()>) -> Self {
        let (exit_tx, _) = watch::channel(None);
        Self {
            key,
            registry: Registry::new(),
            runtime,
            reap: false,
            exit_tx: Arc::new(exit_tx),
            shutdown_tx,
        }
    }

    /// Wait for the container init once it is started.
    ///
    /// Only meaningful when the process is a child subreaper, so the init is
    /// re-parented to it after the runtime exits.
    pub fn with_reaper(mut self, reap: bool) -> Self {
        self.reap = reap;
        self
    }

    pub fn key(&self) -> &TaskKey {
        &self.key
    }

    fn own_key(&self, id: &str) -> Result<&TaskKey> {
        if id == self.key.id() {
            Ok(&self.key)
        } else {
            Err(Error::NotFound(format!("{}/{id}", self.key.namespace())))
        }
    }

    fn spawn_reaper(&self, pid: u32) {
        let exit_tx = self.exit_tx.clone();
        let key = self.key.clone();

        tokio::spawn(async move {
            let target = Pid::from_raw(pid as i32);
            let status = tokio::task::spawn_blocking(move || waitpid(target, None))
                .await
                .unwrap_or(Err(nix::errno::Errno::ECHILD));

            let code = match status {
                Ok(WaitStatus::Exited(_, code)) => code as u32,
                Ok(WaitStatus::Signaled(_, signal, _)) => 128 + signal as u32,
                other => {
                    debug!(key = %key, pid, status = ?other, "Not reaping container init");
                    return;
                }
            };
            info!(key = %key, pid, exit_status = code, "Container init exited");
            exit_tx.send_replace(Some(code));
        });
    }

    async fn wait_exit_status(&self) -> Option<u32> {
        if !self.reap {
            return None;
        }
        let mut rx = self.exit_tx.subscribe();
        match tokio::time::timeout(EXIT_STATUS_WAIT, rx.wait_for(Option::is_some)).await {
            Ok(Ok(status)) => *status,
            _ => None,
        }
    }
}

#[async_trait]
impl TaskControl for LocalTask {
    async fn create(&self, id: &str, bundle: &Path) -> Result<u32> {
        let key = self.own_key(id)?.clone();
        let mut guard = self.registry.insert(key, bundle.to_path_buf()).await?;

        if let Err(e) = self.runtime.generate_bundle(bundle).await {
            warn!(key = %self.key, error = %e, "Bundle preparation failed");
            self.registry.rollback(guard).await;
            return Err(e);
        }

        match self.runtime.create_container(bundle, id).await {
            Ok(pid) => {
                guard.set_pid(pid);
                guard.commit();
                info!(key = %self.key, pid, "Task created");
                Ok(pid)
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "Task create failed");
                // The runtime may have registered the container before failing.
                if let Err(de) = self.runtime.delete_container(id).await {
                    warn!(key = %self.key, error = %de, "Cleanup after failed create failed");
                }
                self.registry.rollback(guard).await;
                Err(e)
            }
        }
    }

    async fn start(&self, id: &str) -> Result<u32> {
        let key = self.own_key(id)?;
        let mut guard = self.registry.lock(key).await?;
        guard.transition(TaskState::Starting)?;

        if let Err(e) = self.runtime.start_container(id).await {
            guard.fail(e.to_string())?;
            return Err(e);
        }

        let pid = guard.pid().unwrap_or_default();
        guard.set_running(pid)?;
        if self.reap && pid != 0 {
            self.spawn_reaper(pid);
        }
        info!(key = %self.key, pid, "Task started");
        Ok(pid)
    }

    async fn delete(&self, id: &str) -> Result<DeletedTask> {
        let key = self.own_key(id)?;
        let mut guard = self.registry.lock(key).await?;
        let pid = guard.pid().unwrap_or_default();
        let was_running = guard.state() == TaskState::Running;

        match guard.state() {
            TaskState::Created | TaskState::Running => {
                guard.transition(TaskState::Stopping)?;
                if let Err(e) = self.runtime.delete_container(id).await {
                    guard.fail(e.to_string())?;
                    return Err(e);
                }
                guard.transition(TaskState::Stopped)?;
            }
            TaskState::Failed => {
                if let Err(e) = self.runtime.delete_container(id).await {
                    warn!(key = %self.key, error = %e, "Runtime cleanup of failed task failed");
                }
            }
            TaskState::Stopped => {}
            state => {
                return Err(Error::PreconditionFailed(format!(
                    "container {} is {state}",
                    self.key
                )));
            }
        }

        let exit_status = if was_running {
            self.wait_exit_status().await
        } else {
            None
        };
        guard.remove().await?;
        info!(key = %self.key, pid, exit_status = ?exit_status, "Task deleted");
        Ok(DeletedTask { pid, exit_status })
    }

    async fn state(&self, id: &str) -> Result<TaskSnapshot> {
        let key = self.own_key(id)?;
        self.registry
            .get(key)
            .await
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn shutdown(&self) -> Result<()> {
        info!(key = %self.key, "Shutdown requested");
        // A full channel means a shutdown is already pending.
        let _ = self.shutdown_tx.try_send(());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{MockRuntime, RuntimeCall};

    fn local_task(runtime: Arc<MockRuntime>) -> (LocalTask, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        let key = TaskKey::new("default", "c1").unwrap();
        (LocalTask::new(key, runtime, tx), rx)
    }

    #[tokio::test]
    async fn test_create_start_delete() {
        let runtime = Arc::new(MockRuntime::new());
        let (task, _rx) = local_task(runtime.clone());
        let bundle = Path::new("/bundles/c1");

        let created_pid = task.create("c1", bundle).await.unwrap();
        assert_eq!(
            task.state("c1").await.unwrap().state,
            TaskState::Created
        );

        let pid = task.start("c1").await.unwrap();
        assert_eq!(pid, created_pid);
        let snapshot = task.state("c1").await.unwrap();
        assert_eq!(snapshot.state, TaskState::Running);
        assert_eq!(snapshot.pid, Some(pid));

        let deleted = task.delete("c1").await.unwrap();
        assert_eq!(deleted.pid, pid);
        assert!(matches!(task.state("c1").await, Err(Error::NotFound(_))));

        assert_eq!(
            runtime.calls(),
            vec![
                RuntimeCall::GenerateBundle(bundle.to_path_buf()),
                RuntimeCall::Create("c1".into()),
                RuntimeCall::Start("c1".into()),
                RuntimeCall::Delete("c1".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_foreign_id_is_not_found() {
        let (task, _rx) = local_task(Arc::new(MockRuntime::new()));

        let err = task.create("c2", Path::new("/bundles/c2")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(ref key) if key == "default/c2"));
        assert!(matches!(task.start("c2").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_failed_create_leaves_nothing() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.fail_create(true);
        let (task, _rx) = local_task(runtime.clone());

        let err = task.create("c1", Path::new("/bundles/c1")).await.unwrap_err();

        assert!(matches!(err, Error::RuntimeExecutionFailed { .. }));
        assert!(matches!(task.state("c1").await, Err(Error::NotFound(_))));
        assert_eq!(
            runtime.calls(),
            vec![
                RuntimeCall::GenerateBundle(Path::new("/bundles/c1").to_path_buf()),
                RuntimeCall::Create("c1".into()),
                RuntimeCall::Delete("c1".into()),
            ]
        );

        runtime.fail_create(false);
        assert!(task.create("c1", Path::new("/bundles/c1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_start_then_delete() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.fail_start(true);
        let (task, _rx) = local_task(runtime.clone());

        task.create("c1", Path::new("/bundles/c1")).await.unwrap();
        let err = task.start("c1").await.unwrap_err();
        assert!(matches!(err, Error::RuntimeExecutionFailed { .. }));

        let snapshot = task.state("c1").await.unwrap();
        assert_eq!(snapshot.state, TaskState::Failed);
        assert!(snapshot.error.is_some());

        task.delete("c1").await.unwrap();
        assert!(matches!(task.state("c1").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (task, _rx) = local_task(Arc::new(MockRuntime::new()));
        task.create("c1", Path::new("/bundles/c1")).await.unwrap();
        task.start("c1").await.unwrap();

        let err = task.start("c1").await.unwrap_err();

        assert!(matches!(
            err,
            Error::InvalidStateTransition {
                current: TaskState::Running,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_shutdown_signals_server() {
        let (task, mut rx) = local_task(Arc::new(MockRuntime::new()));

        task.shutdown().await.unwrap();
        task.shutdown().await.unwrap();

        assert_eq!(rx.recv().await, Some(()));
    }
}
