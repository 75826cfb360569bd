use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use kettle::client::connect_unix;
use kettle::proto::containers::containers_client::ContainersClient;
use kettle::proto::containers::*;
use tabled::{Table, Tabled};
use tokio::net::UnixStream;
use tonic::transport::Channel;

#[derive(Parser)]
#[command(name = "kctl")]
#[command(about = "CLI for the kettle container daemon", long_about = None)]
struct Cli {
    /// Daemon socket
    #[arg(short, long, env = "KETTLE_SOCKET", default_value = "/run/kettle/kettle.sock")]
    socket: PathBuf,

    /// Namespace to operate in
    #[arg(short, long, default_value = kettle::DEFAULT_NAMESPACE)]
    namespace: String,

    /// Request timeout in seconds
    #[arg(short, long, default_value = "10")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a container from a bundle
    Create {
        /// Container ID
        #[arg(long)]
        id: String,

        /// Absolute path of the OCI bundle (generated when missing)
        #[arg(long)]
        bundle: PathBuf,
    },

    /// Start a created container
    Start {
        /// Container ID
        #[arg(long)]
        id: String,
    },

    /// Stop and delete a container
    Delete {
        /// Container ID
        #[arg(long)]
        id: String,
    },

    /// Show a container
    Get {
        /// Container ID
        #[arg(long)]
        id: String,
    },

    /// List containers (all namespaces with --all)
    List {
        #[arg(short, long)]
        all: bool,
    },

    /// Print the daemon version
    Version,
}

#[derive(Tabled)]
struct ContainerRow {
    #[tabled(rename = "NAMESPACE")]
    namespace: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "PID")]
    pid: String,
    #[tabled(rename = "BUNDLE")]
    bundle: String,
}

impl From<Container> for ContainerRow {
    fn from(container: Container) -> Self {
        let state = format_state(container.state());
        Self {
            namespace: container.namespace,
            id: container.id,
            state,
            pid: match container.pid {
                0 => "-".to_string(),
                pid => pid.to_string(),
            },
            bundle: container.bundle,
        }
    }
}

fn format_state(state: ContainerState) -> String {
    match state {
        ContainerState::Unspecified => "unknown".to_string(),
        ContainerState::Created => "created".to_string(),
        ContainerState::Starting => "starting".to_string(),
        ContainerState::Running => "running".to_string(),
        ContainerState::Stopping => "stopping".to_string(),
        ContainerState::Stopped => "stopped".to_string(),
        ContainerState::Deleted => "deleted".to_string(),
        ContainerState::Failed => "failed".to_string(),
    }
}

/// Fail early with a readable message when nobody listens on `socket`.
async fn check_daemon(socket: &Path) -> anyhow::Result<()> {
    if !socket.exists() {
        bail!(
            "kettle daemon not running: {} does not exist",
            socket.display()
        );
    }
    if let Err(e) = UnixStream::connect(socket).await {
        bail!(
            "kettle daemon not running: cannot connect to {}: {}",
            socket.display(),
            e
        );
    }
    Ok(())
}

async fn connect(socket: &Path, timeout: Duration) -> anyhow::Result<ContainersClient<Channel>> {
    check_daemon(socket).await?;
    let channel = connect_unix(socket, timeout).await?;
    Ok(ContainersClient::new(channel))
}

/// Turn a failed call into the daemon's own error, so kind and detail survive.
fn rpc_error(status: tonic::Status) -> anyhow::Error {
    kettle::Error::from_status(status).into()
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let timeout = Duration::from_secs(cli.timeout);
    let mut client = connect(&cli.socket, timeout).await?;
    let namespace = cli.namespace;

    let call = async {
        match cli.command {
            Commands::Create { id, bundle } => {
                let bundle = if bundle.is_absolute() {
                    bundle
                } else {
                    std::env::current_dir()
                        .context("failed to resolve bundle path")?
                        .join(bundle)
                };
                client
                    .create(CreateContainerRequest {
                        namespace,
                        container: Some(Container {
                            id: id.clone(),
                            bundle: bundle.display().to_string(),
                            ..Default::default()
                        }),
                    })
                    .await
                    .map_err(rpc_error)?;
                println!("Created container: {}", id);
            }

            Commands::Start { id } => {
                let response = client
                    .start(StartRequest {
                        namespace,
                        container_id: id.clone(),
                    })
                    .await
                    .map_err(rpc_error)?
                    .into_inner();
                println!("Started container: {} (pid {})", id, response.pid);
            }

            Commands::Delete { id } => {
                client
                    .delete(DeleteRequest {
                        namespace,
                        container_id: id.clone(),
                    })
                    .await
                    .map_err(rpc_error)?;
                println!("Deleted container: {}", id);
            }

            Commands::Get { id } => {
                let container = client
                    .get(GetRequest {
                        namespace,
                        container_id: id,
                    })
                    .await
                    .map_err(rpc_error)?
                    .into_inner();
                let shim_socket = container.shim_socket.clone();
                let error = container.error.clone();

                println!("{}", Table::new([ContainerRow::from(container)]));
                if !shim_socket.is_empty() {
                    println!("Shim socket: {}", shim_socket);
                }
                if !error.is_empty() {
                    println!("Error: {}", error);
                }
            }

            Commands::List { all } => {
                let response = client
                    .list(ListRequest {
                        namespace: if all { String::new() } else { namespace },
                    })
                    .await
                    .map_err(rpc_error)?
                    .into_inner();

                if response.containers.is_empty() {
                    println!("No containers found");
                } else {
                    let rows: Vec<ContainerRow> =
                        response.containers.into_iter().map(Into::into).collect();
                    println!("{}", Table::new(rows));
                }
            }

            Commands::Version => {
                let response = client
                    .version(VersionRequest {})
                    .await
                    .map_err(rpc_error)?
                    .into_inner();
                println!("kettle {}", response.version);
            }
        }
        anyhow::Ok(())
    };

    tokio::time::timeout(timeout, call)
        .await
        .with_context(|| format!("request timed out after {}s", timeout.as_secs()))?
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_hides_missing_pid() {
        let row = ContainerRow::from(Container {
            id: "c1".to_string(),
            namespace: "default".to_string(),
            state: ContainerState::Created as i32,
            ..Default::default()
        });
        assert_eq!(row.pid, "-");
        assert_eq!(row.state, "created");
    }

    #[tokio::test]
    async fn test_check_daemon_reports_missing_daemon() {
        let err = check_daemon(Path::new("/nonexistent/kettle.sock"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not running"));
    }
}
