//! Shim process creation.

use std::fmt;
use std::future::Future;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::Result;
use crate::task::TaskKey;

/// Environment variable carrying the OCI runtime binary to the shim.
pub const RUNTIME_ENV: &str = "KETTLE_RUNTIME";
/// Environment variable carrying the OCI runtime `--root` to the shim.
pub const RUNTIME_ROOT_ENV: &str = "KETTLE_RUNTIME_ROOT";
/// Environment variable carrying the per-invocation runtime timeout, in
/// whole seconds, to the shim.
pub const RUNTIME_TIMEOUT_ENV: &str = "KETTLE_RUNTIME_TIMEOUT";

/// How a shim went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShimExit {
    /// Exit code, or `128 + signal` when killed by a signal.
    pub code: i32,
}

impl From<ExitStatus> for ShimExit {
    fn from(status: ExitStatus) -> Self {
        let code = status
            .code()
            .or_else(|| status.signal().map(|sig| 128 + sig))
            .unwrap_or(-1);
        Self { code }
    }
}

impl fmt::Display for ShimExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exit code {}", self.code)
    }
}

pub type ExitFuture = Pin<Box<dyn Future<Output = ShimExit> + Send>>;

/// Asks a launched shim to go away.
pub trait ShimStop: Send + Sync {
    /// Graceful stop, or immediate kill when `force` is set.
    fn stop(&self, force: bool) -> io::Result<()>;
}

/// A shim that has been started but not yet confirmed serving.
pub struct LaunchedShim {
    pub pid: Option<u32>,
    /// Resolves once the shim has exited.
    pub exited: ExitFuture,
    pub stop: Arc<dyn ShimStop>,
}

/// Starts a shim serving the task control surface on `address`.
#[async_trait]
pub trait ShimLauncher: Send + Sync {
    async fn launch(&self, key: &TaskKey, address: &Path) -> Result<LaunchedShim>;
}

/// Launches the `kettle-shim` binary as a detached child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    binary: PathBuf,
    runtime: PathBuf,
    runtime_root: Option<PathBuf>,
    runtime_timeout: Option<Duration>,
}

impl ProcessLauncher {
    pub fn new(binary: impl Into<PathBuf>, runtime: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            runtime: runtime.into(),
            runtime_root: None,
            runtime_timeout: None,
        }
    }

    pub fn with_runtime_root(mut self, root: Option<PathBuf>) -> Self {
        self.runtime_root = root;
        self
    }

    /// Bound every runtime invocation the shim makes. Rounded up to seconds.
    pub fn with_runtime_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.runtime_timeout = timeout;
        self
    }
}

#[async_trait]
impl ShimLauncher for ProcessLauncher {
    async fn launch(&self, key: &TaskKey, address: &Path) -> Result<LaunchedShim> {
        let mut command = Command::new(&self.binary);
        command
            .arg("--namespace")
            .arg(key.namespace())
            .arg("--id")
            .arg(key.id())
            .arg("--address")
            .arg(address)
            .env(RUNTIME_ENV, &self.runtime)
            .stdin(Stdio::null())
            // Own process group: a ^C aimed at the daemon must not reach the shims.
            .process_group(0);
        if let Some(root) = &self.runtime_root {
            command.env(RUNTIME_ROOT_ENV, root);
        }
        match self.runtime_timeout {
            Some(timeout) => {
                let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
                command.env(RUNTIME_TIMEOUT_ENV, secs.max(1).to_string());
            }
            None => {
                command.env_remove(RUNTIME_TIMEOUT_ENV);
            }
        }

        let mut child = command.spawn()?;
        let pid = child.id();
        info!(
            key = %key,
            pid = pid.unwrap_or_default(),
            binary = %self.binary.display(),
            "Shim launched"
        );

        let exited: ExitFuture = Box::pin(async move {
            match child.wait().await {
                Ok(status) => ShimExit::from(status),
                Err(e) => {
                    warn!(error = %e, "Failed to wait for shim");
                    ShimExit { code: -1 }
                }
            }
        });

        Ok(LaunchedShim {
            pid,
            exited,
            stop: Arc::new(SignalStop { pid }),
        })
    }
}

/// Stops a shim process by signal.
struct SignalStop {
    pid: Option<u32>,
}

impl ShimStop for SignalStop {
    fn stop(&self, force: bool) -> io::Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        let signal = if force {
            Signal::SIGKILL
        } else {
            Signal::SIGTERM
        };

        match kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
