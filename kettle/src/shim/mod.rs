//! Shim supervision.
//!
//! Every container gets its own shim process serving the task control
//! surface on `<state_dir>/<namespace>/<id>/shim.sock`. The supervisor starts
//! shims, watches them, dials them and tears them down.

mod launcher;

pub use launcher::{
    ExitFuture, LaunchedShim, ProcessLauncher, RUNTIME_ENV, RUNTIME_ROOT_ENV, RUNTIME_TIMEOUT_ENV,
    ShimExit, ShimLauncher, ShimStop,
};

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::client::{RemoteTask, connect_unix};
use crate::config::Config;
use crate::control::TaskControl;
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::task::{TaskKey, TaskState};

/// File name of the per-container socket.
pub const SHIM_SOCKET: &str = "shim.sock";

/// Pause between dial attempts.
const CONNECT_BACKOFF: Duration = Duration::from_millis(200);

/// How long `shutdown` waits for a shim to exit after acknowledging.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Attempts the watcher makes to record an unexpected exit when the state
/// keeps changing under it.
const MARK_FAILED_ATTEMPTS: usize = 3;

/// A running (or exited) shim owned by a registry entry.
pub struct ShimProcess {
    pid: Option<u32>,
    socket_path: PathBuf,
    expected_exit: Arc<AtomicBool>,
    exit_rx: watch::Receiver<Option<ShimExit>>,
    stop: Arc<dyn ShimStop>,
}

impl ShimProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    pub fn exit(&self) -> Option<ShimExit> {
        *self.exit_rx.borrow()
    }

    /// Liveness channel; holds `Some` once the shim has exited.
    pub fn subscribe(&self) -> watch::Receiver<Option<ShimExit>> {
        self.exit_rx.clone()
    }

    async fn wait_exit(&self, timeout: Duration) -> Option<ShimExit> {
        let mut rx = self.exit_rx.clone();
        match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(exit)) => *exit,
            _ => None,
        }
    }
}

pub struct ShimSupervisor {
    registry: Arc<Registry>,
    launcher: Arc<dyn ShimLauncher>,
    state_dir: PathBuf,
    connect_timeout: Duration,
    connect_attempts: u32,
    stop_timeout: Duration,
}

impl ShimSupervisor {
    pub fn new(registry: Arc<Registry>, launcher: Arc<dyn ShimLauncher>, config: &Config) -> Self {
        Self {
            registry,
            launcher,
            state_dir: config.state_dir.clone(),
            connect_timeout: config.connect_timeout,
            connect_attempts: config.connect_attempts.max(1),
            stop_timeout: config.shim_stop_timeout,
        }
    }

    pub fn socket_path(&self, key: &TaskKey) -> PathBuf {
        self.state_dir
            .join(key.namespace())
            .join(key.id())
            .join(SHIM_SOCKET)
    }

    /// Launch a shim for `key` without waiting for it to serve.
    ///
    /// A watcher task follows the process; if it exits without having been
    /// asked to, the registry entry is moved to `Failed`.
    pub async fn spawn(&self, key: &TaskKey) -> Result<ShimProcess> {
        let socket_path = self.socket_path(key);
        if let Some(dir) = socket_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        remove_file_if_exists(&socket_path).await?;

        let launched = match self.launcher.launch(key, &socket_path).await {
            Ok(launched) => launched,
            Err(e) => {
                if let Some(dir) = socket_path.parent() {
                    let _ = tokio::fs::remove_dir(dir).await;
                }
                return Err(e);
            }
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        let expected_exit = Arc::new(AtomicBool::new(false));
        tokio::spawn(watch_shim(
            self.registry.clone(),
            key.clone(),
            launched.exited,
            exit_tx,
            expected_exit.clone(),
        ));

        info!(key = %key, socket = %socket_path.display(), "Shim spawned");

        Ok(ShimProcess {
            pid: launched.pid,
            socket_path,
            expected_exit,
            exit_rx,
            stop: launched.stop,
        })
    }

    /// Dial a shim socket once.
    pub async fn route_connection(&self, socket: &Path) -> Result<RemoteTask> {
        let channel = connect_unix(socket, self.connect_timeout).await?;
        Ok(RemoteTask::new(channel, socket.to_path_buf()))
    }

    /// Dial a shim socket, retrying while the shim is unreachable.
    pub async fn connect(&self, socket: &Path) -> Result<RemoteTask> {
        let mut attempt = 1;
        loop {
            match self.route_connection(socket).await {
                Ok(task) => return Ok(task),
                Err(e) if e.is_retryable() && attempt < self.connect_attempts => {
                    debug!(
                        socket = %socket.display(),
                        attempt,
                        error = %e,
                        "Shim not reachable yet, retrying"
                    );
                    tokio::time::sleep(CONNECT_BACKOFF).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Ask a shim to stop serving over its own socket. Best effort.
    pub async fn shutdown(&self, shim: &ShimProcess) {
        shim.expected_exit.store(true, Ordering::SeqCst);
        if !shim.is_running() {
            return;
        }

        let result = match self.route_connection(&shim.socket_path).await {
            Ok(task) => task.shutdown().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                // Give the shim a moment to exit on its own before terminate
                // reaches for signals.
                let _ = shim.wait_exit(SHUTDOWN_GRACE).await;
            }
            Err(e) => debug!(pid = ?shim.pid, error = %e, "Shim shutdown request failed"),
        }
    }

    /// Stop a shim and clean up its socket.
    ///
    /// Sends a graceful stop, escalates to a kill after the grace period and
    /// only returns `Ok` once the exit has been observed.
    pub async fn terminate(&self, shim: &ShimProcess) -> Result<()> {
        shim.expected_exit.store(true, Ordering::SeqCst);

        if shim.is_running() {
            debug!(pid = ?shim.pid, "Stopping shim");
            if let Err(e) = shim.stop.stop(false) {
                warn!(pid = ?shim.pid, error = %e, "Failed to signal shim");
            }

            if shim.wait_exit(self.stop_timeout).await.is_none() {
                warn!(
                    pid = ?shim.pid,
                    timeout = ?self.stop_timeout,
                    "Shim did not exit in time, killing"
                );
                shim.stop.stop(true)?;
                if shim.wait_exit(self.stop_timeout).await.is_none() {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("shim {:?} did not exit after kill", shim.pid),
                    )));
                }
            }
        }

        remove_file_if_exists(&shim.socket_path).await?;
        if let Some(dir) = shim.socket_path.parent() {
            match tokio::fs::remove_dir(dir).await {
                Err(e) if e.kind() != io::ErrorKind::NotFound => {
                    warn!(dir = %dir.display(), error = %e, "Failed to remove shim directory");
                }
                _ => {}
            }
            // Namespace directory; fails harmlessly while other containers use it.
            if let Some(ns_dir) = dir.parent().filter(|d| *d != self.state_dir.as_path()) {
                let _ = tokio::fs::remove_dir(ns_dir).await;
            }
        }

        info!(pid = ?shim.pid, exit = ?shim.exit(), "Shim terminated");
        Ok(())
    }
}

async fn watch_shim(
    registry: Arc<Registry>,
    key: TaskKey,
    exited: ExitFuture,
    exit_tx: watch::Sender<Option<ShimExit>>,
    expected_exit: Arc<AtomicBool>,
) {
    let exit = exited.await;
    exit_tx.send_replace(Some(exit));

    if expected_exit.load(Ordering::SeqCst) {
        debug!(key = %key, %exit, "Shim exited");
        return;
    }

    warn!(key = %key, %exit, "Shim exited unexpectedly");
    mark_failed(&registry, &key, format!("shim exited unexpectedly ({exit})")).await;
}

async fn mark_failed(registry: &Registry, key: &TaskKey, reason: String) {
    for _ in 0..MARK_FAILED_ATTEMPTS {
        let Some(snapshot) = registry.get(key).await else {
            return;
        };
        if !snapshot.state.can_transition_to(TaskState::Failed) {
            return;
        }
        match registry.fail(key, snapshot.state, reason.clone()).await {
            Err(Error::InvalidStateTransition { .. }) => continue,
            _ => return,
        }
    }
}

pub(crate) async fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
