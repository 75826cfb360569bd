use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use kettle::Config;
use kettle::listener::{BoundSocket, shutdown_signal};
use kettle::proto::containers::containers_server::ContainersServer;
use kettle::service::ContainersApi;
use tonic::transport::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kettle")]
#[command(about = "kettle container lifecycle daemon")]
struct Args {
    /// Directory for per-container shim state
    #[arg(long, env = "KETTLE_STATE_DIR", default_value = "/run/kettle")]
    state_dir: PathBuf,

    /// Management socket path
    #[arg(short, long, env = "KETTLE_SOCKET", default_value = "/run/kettle/kettle.sock")]
    socket: PathBuf,

    /// Permission bits for the management socket (octal)
    #[arg(long, env = "KETTLE_SOCKET_MODE", default_value = "666", value_parser = parse_mode)]
    socket_mode: u32,

    /// OCI runtime binary (runc, youki, crun)
    #[arg(short, long, env = "KETTLE_RUNTIME", default_value = "runc")]
    runtime: PathBuf,

    /// Runtime state root passed as --root
    #[arg(long, env = "KETTLE_RUNTIME_ROOT")]
    runtime_root: Option<PathBuf>,

    /// Timeout in seconds for a single runtime invocation
    #[arg(long, env = "KETTLE_RUNTIME_TIMEOUT")]
    runtime_timeout: Option<u64>,

    /// Shim binary launched per container
    #[arg(long, env = "KETTLE_SHIM_BINARY", default_value = "kettle-shim")]
    shim_binary: PathBuf,

    /// Timeout in seconds for dialing a shim
    #[arg(long, env = "KETTLE_CONNECT_TIMEOUT", default_value_t = 10)]
    connect_timeout: u64,
}

impl Args {
    fn into_config(self) -> Config {
        Config {
            state_dir: self.state_dir,
            socket: self.socket,
            socket_mode: self.socket_mode,
            runtime: self.runtime,
            runtime_root: self.runtime_root,
            runtime_timeout: self.runtime_timeout.map(Duration::from_secs),
            shim_binary: self.shim_binary,
            connect_timeout: Duration::from_secs(self.connect_timeout),
            ..Config::default()
        }
    }
}

fn parse_mode(value: &str) -> Result<u32, String> {
    let digits = value.strip_prefix("0o").unwrap_or(value);
    match u32::from_str_radix(digits, 8) {
        Ok(mode) if mode <= 0o777 => Ok(mode),
        Ok(_) => Err(format!("mode {value} has bits outside 0777")),
        Err(e) => Err(format!("invalid octal mode {value}: {e}")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("kettle=info".parse()?))
        .init();

    let config = Args::parse().into_config();

    info!(
        socket = %config.socket.display(),
        state_dir = %config.state_dir.display(),
        runtime = %config.runtime.display(),
        "Starting kettle"
    );

    tokio::fs::create_dir_all(&config.state_dir)
        .await
        .with_context(|| format!("failed to create {}", config.state_dir.display()))?;

    let manager = kettle::default_manager(&config);
    let api = ContainersApi::new(manager);

    let mut socket = BoundSocket::bind(&config.socket, config.socket_mode)
        .await
        .with_context(|| format!("failed to bind {}", config.socket.display()))?;

    let result = Server::builder()
        .add_service(ContainersServer::new(api))
        .serve_with_incoming_shutdown(socket.incoming()?, async {
            if let Err(e) = shutdown_signal().await {
                error!(error = %e, "Failed to wait for shutdown signal");
            }
        })
        .await;

    // Shims keep running; containers outlive the daemon.
    drop(socket);

    if let Err(e) = result {
        error!(error = %e, "gRPC server error");
        return Err(e.into());
    }

    info!("kettle stopped");
    Ok(())
}
