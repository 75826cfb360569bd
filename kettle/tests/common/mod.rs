//! Shared test utilities for kettle integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kettle::Config;
use kettle::client::connect_unix;
use kettle::listener::BoundSocket;
use kettle::proto::containers::containers_client::ContainersClient;
use kettle::proto::containers::containers_server::ContainersServer;
use kettle::proto::containers::{
    Container, CreateContainerRequest, DeleteRequest, GetRequest, StartRequest,
};
use kettle::service::ContainersApi;
use kettle::test_util::{InProcessLauncher, MockRuntime};
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tonic::Status;
use tonic::transport::{Channel, Server};

/// Namespace used by most tests.
pub const NAMESPACE: &str = "default";

/// A daemon served on a socket in a temporary directory, with in-process shims
/// backed by mock runtimes.
pub struct TestDaemon {
    pub dir: TempDir,
    pub config: Config,
    /// Runtime driven by the shims.
    pub shim_runtime: Arc<MockRuntime>,
    /// Runtime the daemon falls back to when a shim is gone.
    pub daemon_runtime: Arc<MockRuntime>,
    pub launcher: Arc<InProcessLauncher>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<()>>,
}

impl TestDaemon {
    /// Bind the management socket and start serving.
    pub async fn spawn() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = Config {
            state_dir: dir.path().join("state"),
            socket: dir.path().join("kettle.sock"),
            connect_timeout: Duration::from_secs(2),
            connect_attempts: 3,
            shim_stop_timeout: Duration::from_secs(1),
            ..Config::default()
        };

        let shim_runtime = Arc::new(MockRuntime::new());
        let daemon_runtime = Arc::new(MockRuntime::new());
        let launcher = Arc::new(InProcessLauncher::new(shim_runtime.clone()));
        let manager = kettle::build_manager(&config, launcher.clone(), daemon_runtime.clone());

        let mut socket = BoundSocket::bind(&config.socket, config.socket_mode)
            .await
            .expect("Failed to bind daemon socket");
        let incoming = socket.incoming().expect("Listener already taken");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            Server::builder()
                .add_service(ContainersServer::new(ContainersApi::new(manager)))
                .serve_with_incoming_shutdown(incoming, async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("Server error");
            drop(socket);
        });

        Self {
            dir,
            config,
            shim_runtime,
            daemon_runtime,
            launcher,
            shutdown_tx: Some(shutdown_tx),
            server: Some(server),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.config.socket
    }

    /// A bundle directory under the temp dir.
    pub fn bundle(&self, name: &str) -> PathBuf {
        self.dir.path().join("bundles").join(name)
    }

    /// Management client connected over the daemon socket.
    pub async fn client(&self) -> ContainersClient<Channel> {
        let channel = connect_unix(self.socket(), Duration::from_secs(2))
            .await
            .expect("Failed to connect to daemon");
        ContainersClient::new(channel)
    }

    /// Stop serving and wait until the socket is gone.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(server) = self.server.take() {
            server.await.expect("Server task panicked");
        }
    }
}

pub async fn create(
    client: &mut ContainersClient<Channel>,
    id: &str,
    bundle: &Path,
) -> Result<(), Status> {
    client
        .create(CreateContainerRequest {
            namespace: NAMESPACE.to_string(),
            container: Some(Container {
                id: id.to_string(),
                bundle: bundle.display().to_string(),
                ..Default::default()
            }),
        })
        .await
        .map(|_| ())
}

pub async fn start(client: &mut ContainersClient<Channel>, id: &str) -> Result<u32, Status> {
    client
        .start(StartRequest {
            namespace: NAMESPACE.to_string(),
            container_id: id.to_string(),
        })
        .await
        .map(|r| r.into_inner().pid)
}

pub async fn delete(client: &mut ContainersClient<Channel>, id: &str) -> Result<(), Status> {
    client
        .delete(DeleteRequest {
            namespace: NAMESPACE.to_string(),
            container_id: id.to_string(),
        })
        .await
        .map(|_| ())
}

pub async fn get(client: &mut ContainersClient<Channel>, id: &str) -> Result<Container, Status> {
    client
        .get(GetRequest {
            namespace: NAMESPACE.to_string(),
            container_id: id.to_string(),
        })
        .await
        .map(|r| r.into_inner())
}
