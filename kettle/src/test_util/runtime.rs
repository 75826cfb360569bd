use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::runtime::Runtime;

/// First pid handed out by [`MockRuntime`].
const FIRST_PID: u32 = 40_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    GenerateBundle(PathBuf),
    Create(String),
    Start(String),
    Delete(String),
}

/// In-memory [`Runtime`] that records calls and fails on request.
#[derive(Debug)]
pub struct MockRuntime {
    calls: Mutex<Vec<RuntimeCall>>,
    next_pid: AtomicU32,
    fail_create: AtomicBool,
    fail_start: AtomicBool,
    fail_delete: AtomicBool,
    start_delay: Mutex<Option<Duration>>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            next_pid: AtomicU32::new(FIRST_PID),
            fail_create: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            start_delay: Mutex::new(None),
        }
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    /// Make `start_container` take `delay` before answering.
    pub fn delay_start(&self, delay: Duration) {
        *lock(&self.start_delay) = Some(delay);
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        lock(&self.calls).clone()
    }

    fn record(&self, call: RuntimeCall) {
        lock(&self.calls).push(call);
    }

    fn check(&self, flag: &AtomicBool, command: &str, id: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(Error::RuntimeExecutionFailed {
                command: format!("mock-runtime {command} {id}"),
                exit_code: 1,
                stderr_tail: format!("mock {command} failure for {id}"),
            });
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Runtime for MockRuntime {
    async fn generate_bundle(&self, bundle: &Path) -> Result<()> {
        self.record(RuntimeCall::GenerateBundle(bundle.to_path_buf()));
        Ok(())
    }

    async fn create_container(&self, _bundle: &Path, id: &str) -> Result<u32> {
        self.record(RuntimeCall::Create(id.to_string()));
        self.check(&self.fail_create, "create", id)?;
        Ok(self.next_pid.fetch_add(1, Ordering::SeqCst))
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.record(RuntimeCall::Start(id.to_string()));
        let delay = *lock(&self.start_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check(&self.fail_start, "start", id)
    }

    async fn delete_container(&self, id: &str) -> Result<()> {
        self.record(RuntimeCall::Delete(id.to_string()));
        self.check(&self.fail_delete, "delete", id)
    }
}
