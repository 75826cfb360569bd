//! In-memory task registry.
//!
//! The map lock is only held to locate, insert or remove an entry. Each entry
//! has its own async mutex, and a [`TaskGuard`] holds it for the duration of a
//! lifecycle operation, including the subprocess and RPC calls it makes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::shim::ShimProcess;
use crate::task::{TaskKey, TaskSnapshot, TaskState};

/// A registry entry. Only reachable through [`TaskGuard`] or the registry's
/// transition methods.
pub struct ContainerTask {
    key: TaskKey,
    bundle_path: PathBuf,
    state: TaskState,
    pid: Option<u32>,
    shim_socket_path: Option<PathBuf>,
    shim: Option<ShimProcess>,
    error: Option<String>,
}

impl ContainerTask {
    fn new(key: TaskKey, bundle_path: PathBuf) -> Self {
        Self {
            key,
            bundle_path,
            state: TaskState::Created,
            pid: None,
            shim_socket_path: None,
            shim: None,
            error: None,
        }
    }

    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            key: self.key.clone(),
            bundle_path: self.bundle_path.clone(),
            state: self.state,
            pid: self.pid.filter(|_| self.state == TaskState::Running),
            shim_socket_path: self.shim_socket_path.clone(),
            error: self.error.clone(),
        }
    }

    fn check_transition(&self, from: TaskState, to: TaskState) -> Result<()> {
        if self.state == TaskState::Deleted {
            return Err(Error::NotFound(self.key.to_string()));
        }
        if self.state != from || !from.can_transition_to(to) {
            return Err(Error::InvalidStateTransition {
                key: self.key.to_string(),
                from,
                to,
                current: self.state,
            });
        }
        Ok(())
    }

    fn set_state(&mut self, to: TaskState) {
        debug!(key = %self.key, from = %self.state, to = %to, "Task state transition");
        self.state = to;
    }

    fn set_failed(&mut self, reason: String) {
        warn!(key = %self.key, from = %self.state, reason = %reason, "Task failed");
        self.state = TaskState::Failed;
        self.error = Some(reason);
    }
}

type Slot = Arc<Mutex<ContainerTask>>;

/// Authoritative map of `(namespace, id)` to container task.
#[derive(Default)]
pub struct Registry {
    entries: RwLock<HashMap<TaskKey, Slot>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new `Created` entry and return it already locked.
    ///
    /// Nobody else can observe or mutate the entry until the guard is released.
    /// The creator either finishes its setup and calls [`TaskGuard::commit`],
    /// or calls [`Registry::rollback`]. A guard dropped without either leaves
    /// the entry `Failed`.
    pub async fn insert(&self, key: TaskKey, bundle_path: PathBuf) -> Result<TaskGuard<'_>> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&key) {
            return Err(Error::AlreadyExists(key.to_string()));
        }

        let slot: Slot = Arc::new(Mutex::new(ContainerTask::new(key.clone(), bundle_path)));
        // Fresh mutex, uncontended.
        let task = slot.clone().lock_owned().await;
        entries.insert(key, slot);

        Ok(TaskGuard {
            registry: self,
            task,
            provisional: true,
        })
    }

    async fn slot(&self, key: &TaskKey) -> Result<Slot> {
        self.entries
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    /// Acquire the per-key operation guard.
    pub async fn lock(&self, key: &TaskKey) -> Result<TaskGuard<'_>> {
        let task = self.slot(key).await?.lock_owned().await;
        if task.state == TaskState::Deleted {
            return Err(Error::NotFound(key.to_string()));
        }
        Ok(TaskGuard {
            registry: self,
            task,
            provisional: false,
        })
    }

    /// Read-only copy of an entry; `None` when absent or deleted.
    pub async fn get(&self, key: &TaskKey) -> Option<TaskSnapshot> {
        let slot = self.slot(key).await.ok()?;
        let task = slot.lock().await;
        (task.state != TaskState::Deleted).then(|| task.snapshot())
    }

    /// Snapshot every entry, optionally restricted to one namespace, ordered by key.
    pub async fn list(&self, namespace: Option<&str>) -> Vec<TaskSnapshot> {
        let slots: Vec<Slot> = self
            .entries
            .read()
            .await
            .iter()
            .filter(|(key, _)| namespace.is_none_or(|ns| key.namespace() == ns))
            .map(|(_, slot)| slot.clone())
            .collect();

        let mut snapshots = Vec::with_capacity(slots.len());
        for slot in slots {
            let task = slot.lock().await;
            if task.state != TaskState::Deleted {
                snapshots.push(task.snapshot());
            }
        }
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    /// Atomically move `key` from `from` to `to`.
    pub async fn transition(&self, key: &TaskKey, from: TaskState, to: TaskState) -> Result<()> {
        let slot = self.slot(key).await?;
        let mut task = slot.lock().await;
        task.check_transition(from, to)?;
        task.set_state(to);
        Ok(())
    }

    /// Atomically move `key` from `from` to `Failed`, recording `reason`.
    pub async fn fail(&self, key: &TaskKey, from: TaskState, reason: impl Into<String>) -> Result<()> {
        let slot = self.slot(key).await?;
        let mut task = slot.lock().await;
        task.check_transition(from, TaskState::Failed)?;
        task.set_failed(reason.into());
        Ok(())
    }

    /// Drop a `Stopped` or `Failed` entry.
    pub async fn remove(&self, key: &TaskKey) -> Result<()> {
        self.lock(key).await?.remove().await
    }

    /// Drop an entry whose creation did not complete, whatever its state.
    pub async fn rollback(&self, mut guard: TaskGuard<'_>) {
        debug!(key = %guard.task.key, "Rolling back task");
        guard.task.state = TaskState::Deleted;
        guard.detach().await;
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// Exclusive access to one registry entry for the length of an operation.
///
/// Dropping a guard while the entry is `Starting` or `Stopping` (for example
/// because the caller's future was cancelled) moves it to `Failed`.
pub struct TaskGuard<'a> {
    registry: &'a Registry,
    task: OwnedMutexGuard<ContainerTask>,
    /// Set for guards returned by `insert` until the creator commits.
    provisional: bool,
}

impl TaskGuard<'_> {
    pub fn key(&self) -> &TaskKey {
        &self.task.key
    }

    pub fn state(&self) -> TaskState {
        self.task.state
    }

    pub fn bundle_path(&self) -> &Path {
        &self.task.bundle_path
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.task.snapshot()
    }

    /// Mark the creation of an inserted entry as complete.
    pub fn commit(&mut self) {
        self.provisional = false;
    }

    /// Move the locked entry to `to`.
    pub fn transition(&mut self, to: TaskState) -> Result<()> {
        let from = self.task.state;
        self.task.check_transition(from, to)?;
        self.task.set_state(to);
        Ok(())
    }

    /// Container init pid, whether or not the entry is running.
    pub fn pid(&self) -> Option<u32> {
        self.task.pid
    }

    /// Record the init pid reported by the runtime on create.
    pub fn set_pid(&mut self, pid: u32) {
        self.task.pid = Some(pid);
    }

    /// `Starting -> Running`, recording the container pid.
    pub fn set_running(&mut self, pid: u32) -> Result<()> {
        self.transition(TaskState::Running)?;
        self.task.pid = Some(pid);
        Ok(())
    }

    /// Move the locked entry to `Failed`, recording `reason`.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        let from = self.task.state;
        self.task.check_transition(from, TaskState::Failed)?;
        self.task.set_failed(reason.into());
        Ok(())
    }

    /// Record the shim serving this entry. The socket path is fixed from here on.
    pub fn attach_shim(&mut self, shim: ShimProcess) {
        if self.task.shim_socket_path.is_none() {
            self.task.shim_socket_path = Some(shim.socket_path().to_path_buf());
        }
        self.task.shim = Some(shim);
    }

    pub fn shim(&self) -> Option<&ShimProcess> {
        self.task.shim.as_ref()
    }

    pub fn take_shim(&mut self) -> Option<ShimProcess> {
        self.task.shim.take()
    }

    /// Mark the entry `Deleted` and drop it from the registry.
    ///
    /// Only `Stopped` and `Failed` entries can be removed.
    pub async fn remove(mut self) -> Result<()> {
        if !self.task.state.is_removable() {
            return Err(Error::PreconditionFailed(format!(
                "container {} is {}, expected stopped or failed",
                self.task.key, self.task.state
            )));
        }
        self.task.set_state(TaskState::Deleted);
        self.detach().await;
        Ok(())
    }

    async fn detach(&mut self) {
        let mut entries = self.registry.entries.write().await;
        let ours = entries
            .get(&self.task.key)
            .is_some_and(|slot| Arc::ptr_eq(slot, OwnedMutexGuard::mutex(&self.task)));
        if ours {
            entries.remove(&self.task.key);
        }
    }
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        if self.task.state == TaskState::Deleted {
            return;
        }
        if self.provisional && self.task.state != TaskState::Failed {
            self.task.set_failed("creation interrupted".to_string());
        } else if self.task.state.is_transitional() {
            let reason = format!("operation interrupted while {}", self.task.state);
            self.task.set_failed(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> TaskKey {
        TaskKey::new("default", id).unwrap()
    }

    fn bundle() -> PathBuf {
        PathBuf::from("/bundles/c1")
    }

    async fn insert_committed(registry: &Registry, key: TaskKey) {
        registry.insert(key, bundle()).await.unwrap().commit();
    }

    #[tokio::test]
    async fn test_insert_twice() {
        let registry = Registry::new();

        insert_committed(&registry, key("c1")).await;
        let err = registry.insert(key("c1"), bundle()).await.err().unwrap();

        assert!(matches!(err, Error::AlreadyExists(_)));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_single_winner() {
        let registry = Arc::new(Registry::new());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                match registry.insert(key("c1"), bundle()).await {
                    Ok(_guard) => Ok(()),
                    Err(e) => Err(matches!(e, Error::AlreadyExists(_))),
                }
            }));
        }

        let mut ok = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => ok += 1,
                Err(already_exists) => assert!(already_exists),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_transition_checks_current_state() {
        let registry = Registry::new();
        insert_committed(&registry, key("c1")).await;

        let err = registry
            .transition(&key("c1"), TaskState::Running, TaskState::Stopping)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidStateTransition {
                current: TaskState::Created,
                ..
            }
        ));

        let err = registry
            .transition(&key("c1"), TaskState::Created, TaskState::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));

        registry
            .transition(&key("c1"), TaskState::Created, TaskState::Starting)
            .await
            .unwrap();
        assert_eq!(
            registry.get(&key("c1")).await.unwrap().state,
            TaskState::Starting
        );
    }

    #[tokio::test]
    async fn test_missing_key() {
        let registry = Registry::new();

        assert!(registry.get(&key("missing")).await.is_none());
        assert!(matches!(
            registry.lock(&key("missing")).await.err().unwrap(),
            Error::NotFound(_)
        ));
        assert!(matches!(
            registry
                .transition(&key("missing"), TaskState::Created, TaskState::Starting)
                .await
                .unwrap_err(),
            Error::NotFound(_)
        ));
        assert!(matches!(
            registry.remove(&key("missing")).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_remove_requires_terminal_state() {
        let registry = Registry::new();
        insert_committed(&registry, key("c1")).await;

        let err = registry.remove(&key("c1")).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed(_)));

        registry
            .fail(&key("c1"), TaskState::Created, "runtime exploded")
            .await
            .unwrap();
        let snapshot = registry.get(&key("c1")).await.unwrap();
        assert_eq!(snapshot.state, TaskState::Failed);
        assert_eq!(snapshot.error.as_deref(), Some("runtime exploded"));

        registry.remove(&key("c1")).await.unwrap();
        assert!(registry.get(&key("c1")).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_guard_drop_fails_transitional_entry() {
        let registry = Registry::new();
        {
            let mut guard = registry.insert(key("c1"), bundle()).await.unwrap();
            guard.commit();
            guard.transition(TaskState::Starting).unwrap();
        }

        let snapshot = registry.get(&key("c1")).await.unwrap();
        assert_eq!(snapshot.state, TaskState::Failed);
        assert!(snapshot.error.unwrap().contains("starting"));
    }

    #[tokio::test]
    async fn test_pid_only_visible_while_running() {
        let registry = Registry::new();
        {
            let mut guard = registry.insert(key("c1"), bundle()).await.unwrap();
            guard.commit();
            guard.transition(TaskState::Starting).unwrap();
            guard.set_running(4242).unwrap();
        }
        assert_eq!(registry.get(&key("c1")).await.unwrap().pid, Some(4242));

        {
            let mut guard = registry.lock(&key("c1")).await.unwrap();
            guard.transition(TaskState::Stopping).unwrap();
            guard.transition(TaskState::Stopped).unwrap();
        }
        let snapshot = registry.get(&key("c1")).await.unwrap();
        assert_eq!(snapshot.state, TaskState::Stopped);
        assert_eq!(snapshot.pid, None);
    }

    #[tokio::test]
    async fn test_uncommitted_insert_fails_entry() {
        let registry = Registry::new();
        drop(registry.insert(key("c1"), bundle()).await.unwrap());

        let snapshot = registry.get(&key("c1")).await.unwrap();
        assert_eq!(snapshot.state, TaskState::Failed);
        assert_eq!(snapshot.error.as_deref(), Some("creation interrupted"));
    }

    #[tokio::test]
    async fn test_rollback_removes_entry() {
        let registry = Registry::new();
        let guard = registry.insert(key("c1"), bundle()).await.unwrap();

        registry.rollback(guard).await;

        assert!(registry.get(&key("c1")).await.is_none());
        assert!(registry.insert(key("c1"), bundle()).await.is_ok());
    }

    #[tokio::test]
    async fn test_list_filters_by_namespace() {
        let registry = Registry::new();
        insert_committed(&registry, key("b")).await;
        insert_committed(&registry, key("a")).await;
        insert_committed(&registry, TaskKey::new("other", "c").unwrap()).await;

        let all = registry.list(None).await;
        assert_eq!(all.len(), 3);

        let ids: Vec<_> = registry
            .list(Some("default"))
            .await
            .into_iter()
            .map(|s| s.key.id().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_lock_serialises_operations() {
        let registry = Arc::new(Registry::new());
        let mut guard = registry.insert(key("c1"), bundle()).await.unwrap();
        guard.commit();
        guard.transition(TaskState::Starting).unwrap();

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get(&key("c1")).await.map(|s| s.state) })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        guard.set_running(7).unwrap();
        drop(guard);

        assert_eq!(waiter.await.unwrap(), Some(TaskState::Running));
    }
}
