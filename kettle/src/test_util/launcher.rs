use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::debug;

use crate::control::LocalTask;
use crate::error::{Error, Result};
use crate::proto::task::task_server::TaskServer;
use crate::runtime::Runtime;
use crate::service::TaskApi;
use crate::shim::{ExitFuture, LaunchedShim, ShimExit, ShimLauncher, ShimStop};
use crate::task::TaskKey;

/// Fake pids for in-process shims, well above anything a test signals.
const FIRST_SHIM_PID: u32 = 900_000;

/// Exit code reported for a shim killed through [`InProcessLauncher::crash`].
const CRASH_EXIT_CODE: i32 = 1;

struct ShimHandle {
    stop_tx: mpsc::UnboundedSender<i32>,
    exited: Arc<AtomicBool>,
}

/// [`ShimLauncher`] that serves each shim's task surface from a tokio task in
/// the current process, backed by a shared [`Runtime`].
pub struct InProcessLauncher {
    runtime: Arc<dyn Runtime>,
    shims: Mutex<HashMap<TaskKey, ShimHandle>>,
    launches: AtomicUsize,
    next_pid: AtomicU32,
    fail_launch: AtomicBool,
}

impl InProcessLauncher {
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        Self {
            runtime,
            shims: Mutex::new(HashMap::new()),
            launches: AtomicUsize::new(0),
            next_pid: AtomicU32::new(FIRST_SHIM_PID),
            fail_launch: AtomicBool::new(false),
        }
    }

    /// Make the next launches fail as if the shim binary were missing.
    pub fn fail_launch(&self, fail: bool) {
        self.fail_launch.store(fail, Ordering::SeqCst);
    }

    /// Number of successful launches so far.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Shims launched and not yet exited.
    pub fn live_shims(&self) -> usize {
        self.shims()
            .values()
            .filter(|h| !h.exited.load(Ordering::SeqCst))
            .count()
    }

    /// Kill the shim for `key` without going through the supervisor.
    pub fn crash(&self, key: &TaskKey) {
        if let Some(handle) = self.shims().get(key) {
            let _ = handle.stop_tx.send(CRASH_EXIT_CODE);
        }
    }

    fn shims(&self) -> MutexGuard<'_, HashMap<TaskKey, ShimHandle>> {
        self.shims.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ShimLauncher for InProcessLauncher {
    async fn launch(&self, key: &TaskKey, address: &Path) -> Result<LaunchedShim> {
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "shim binary not found",
            )));
        }

        let listener = UnixListener::bind(address)?;
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let task = LocalTask::new(key.clone(), self.runtime.clone(), shutdown_tx);

        let server = Server::builder()
            .add_service(TaskServer::new(TaskApi::new(Arc::new(task))))
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                shutdown_rx.recv().await;
            });
        let mut server = tokio::spawn(server);

        let (stop_tx, mut stop_rx) = mpsc::unbounded_channel::<i32>();
        let (exit_tx, exit_rx) = oneshot::channel();
        let exited = Arc::new(AtomicBool::new(false));

        let socket = address.to_path_buf();
        let exited_flag = exited.clone();
        let shim_key = key.clone();
        tokio::spawn(async move {
            let code = tokio::select! {
                _ = &mut server => {
                    let _ = tokio::fs::remove_file(&socket).await;
                    0
                }
                Some(code) = stop_rx.recv() => {
                    server.abort();
                    code
                }
            };
            debug!(key = %shim_key, code, "In-process shim exited");
            exited_flag.store(true, Ordering::SeqCst);
            let _ = exit_tx.send(ShimExit { code });
        });

        self.shims().insert(
            key.clone(),
            ShimHandle {
                stop_tx: stop_tx.clone(),
                exited,
            },
        );
        self.launches.fetch_add(1, Ordering::SeqCst);

        let exited: ExitFuture =
            Box::pin(async move { exit_rx.await.unwrap_or(ShimExit { code: -1 }) });

        Ok(LaunchedShim {
            pid: Some(self.next_pid.fetch_add(1, Ordering::SeqCst)),
            exited,
            stop: Arc::new(ChannelStop { stop_tx }),
        })
    }
}

struct ChannelStop {
    stop_tx: mpsc::UnboundedSender<i32>,
}

impl ShimStop for ChannelStop {
    fn stop(&self, force: bool) -> io::Result<()> {
        let code = if force { 128 + 9 } else { 128 + 15 };
        // Already exited when the receiver is gone.
        let _ = self.stop_tx.send(code);
        Ok(())
    }
}
