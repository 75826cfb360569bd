//! Per-container shim: serves the task surface for one container on its own
//! socket and drives the OCI runtime on the daemon's behalf.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kettle::TaskKey;
use kettle::control::LocalTask;
use kettle::listener::{BoundSocket, shutdown_signal};
use kettle::proto::task::task_server::TaskServer;
use kettle::runtime::OciRuntime;
use kettle::service::TaskApi;
use kettle::shim::{RUNTIME_ENV, RUNTIME_ROOT_ENV, RUNTIME_TIMEOUT_ENV};
use nix::sys::prctl;
use tokio::sync::mpsc;
use tonic::transport::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Only the daemon (same user) talks to a shim.
const SHIM_SOCKET_MODE: u32 = 0o600;

#[derive(Parser)]
#[command(name = "kettle-shim")]
#[command(about = "kettle per-container shim")]
struct Args {
    /// Namespace of the container
    #[arg(long)]
    namespace: String,

    /// Container id
    #[arg(long)]
    id: String,

    /// Socket to serve the task API on
    #[arg(long)]
    address: PathBuf,

    /// OCI runtime binary
    #[arg(long, env = RUNTIME_ENV, default_value = "runc")]
    runtime: PathBuf,

    /// Runtime state root passed as --root
    #[arg(long, env = RUNTIME_ROOT_ENV)]
    runtime_root: Option<PathBuf>,

    /// Timeout in seconds for a single runtime invocation
    #[arg(long, env = RUNTIME_TIMEOUT_ENV)]
    runtime_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Shim stdout/stderr are inherited from the daemon; keep the output plain.
    tracing_subscriber::fmt()
        .with_ansi(false)
        .with_env_filter(EnvFilter::from_default_env().add_directive("kettle=info".parse()?))
        .init();

    let args = Args::parse();
    let key = TaskKey::new(args.namespace, args.id)?;

    // The container init is re-parented to us once the runtime exits.
    prctl::set_child_subreaper(true)
        .map_err(|e| anyhow::anyhow!("Failed to set as child subreaper: {}", e))?;

    let runtime = OciRuntime::new(args.runtime)
        .with_root(args.runtime_root)
        .with_timeout(args.runtime_timeout.map(Duration::from_secs));

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
    let task = LocalTask::new(key.clone(), Arc::new(runtime), shutdown_tx).with_reaper(true);

    let mut socket = BoundSocket::bind(&args.address, SHIM_SOCKET_MODE).await?;
    info!(key = %key, address = %args.address.display(), "kettle-shim serving");

    let result = Server::builder()
        .add_service(TaskServer::new(TaskApi::new(Arc::new(task))))
        .serve_with_incoming_shutdown(socket.incoming()?, async move {
            tokio::select! {
                _ = shutdown_rx.recv() => info!("Shutdown requested"),
                res = shutdown_signal() => {
                    if let Err(e) = res {
                        error!(error = %e, "Failed to wait for shutdown signal");
                    }
                }
            }
        })
        .await;

    drop(socket);

    if let Err(e) = result {
        error!(key = %key, error = %e, "gRPC server error");
        return Err(e.into());
    }

    info!(key = %key, "kettle-shim stopped");
    Ok(())
}
