//! gRPC clients over unix sockets.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::{Code, Status};
use tower::service_fn;
use tracing::debug;

use crate::control::{DeletedTask, TaskControl};
use crate::error::{Error, Result};
use crate::proto::task::task_client::TaskClient;
use crate::proto::task::{
    CreateTaskRequest, DeleteTaskRequest, ShutdownRequest, StartTaskRequest, StateRequest,
    TaskStatus,
};
use crate::task::{TaskKey, TaskSnapshot};

/// Open a tonic channel on a unix socket.
///
/// Fails with [`Error::ShimUnreachable`] when the socket cannot be dialed
/// within `timeout`.
pub async fn connect_unix(path: &Path, timeout: Duration) -> Result<Channel> {
    let socket = path.to_path_buf();
    let unreachable = |reason: String| Error::ShimUnreachable {
        socket: socket.clone(),
        reason,
    };

    // The URI is never resolved; the connector below dials the socket.
    let endpoint = Endpoint::try_from("http://kettle.sock")?.connect_timeout(timeout);

    let connector_path = socket.clone();
    let connecting = endpoint.connect_with_connector(service_fn(move |_: Uri| {
        let path = connector_path.clone();
        async move {
            let stream = UnixStream::connect(&path).await?;
            Ok::<_, std::io::Error>(TokioIo::new(stream))
        }
    }));

    match tokio::time::timeout(timeout, connecting).await {
        Ok(Ok(channel)) => {
            debug!(socket = %socket.display(), "Connected");
            Ok(channel)
        }
        Ok(Err(e)) => Err(unreachable(error_chain(&e))),
        Err(_) => Err(unreachable(format!("timed out after {timeout:?}"))),
    }
}

/// `Display` of an error and all its sources, joined with `: `.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Handle on a shim's task control surface.
#[derive(Clone)]
pub struct RemoteTask {
    client: TaskClient<Channel>,
    socket: PathBuf,
}

impl RemoteTask {
    pub fn new(channel: Channel, socket: PathBuf) -> Self {
        Self {
            client: TaskClient::new(channel),
            socket,
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    fn error(&self, status: Status) -> Error {
        match Error::from_status(status) {
            // A dropped connection surfaces as a bare UNAVAILABLE.
            Error::Rpc(status) if status.code() == Code::Unavailable => Error::ShimUnreachable {
                socket: self.socket.clone(),
                reason: status.message().to_string(),
            },
            other => other,
        }
    }
}

#[async_trait]
impl TaskControl for RemoteTask {
    async fn create(&self, id: &str, bundle: &Path) -> Result<u32> {
        let request = CreateTaskRequest {
            id: id.to_string(),
            bundle: bundle.to_string_lossy().into_owned(),
        };
        let response = self
            .client
            .clone()
            .create(request)
            .await
            .map_err(|s| self.error(s))?;
        Ok(response.into_inner().pid)
    }

    async fn start(&self, id: &str) -> Result<u32> {
        let request = StartTaskRequest { id: id.to_string() };
        let response = self
            .client
            .clone()
            .start(request)
            .await
            .map_err(|s| self.error(s))?;
        Ok(response.into_inner().pid)
    }

    async fn delete(&self, id: &str) -> Result<DeletedTask> {
        let request = DeleteTaskRequest { id: id.to_string() };
        let response = self
            .client
            .clone()
            .delete(request)
            .await
            .map_err(|s| self.error(s))?
            .into_inner();
        Ok(DeletedTask {
            pid: response.pid,
            exit_status: response.exit_status,
        })
    }

    async fn state(&self, id: &str) -> Result<TaskSnapshot> {
        let request = StateRequest { id: id.to_string() };
        let response = self
            .client
            .clone()
            .state(request)
            .await
            .map_err(|s| self.error(s))?
            .into_inner();

        let state = TaskStatus::try_from(response.status)
            .ok()
            .and_then(TaskStatus::to_state)
            .ok_or_else(|| {
                Error::InvalidArgument(format!("unknown task status {}", response.status))
            })?;

        Ok(TaskSnapshot {
            key: TaskKey::new(response.namespace, response.id)?,
            bundle_path: PathBuf::from(response.bundle),
            state,
            pid: (response.pid != 0).then_some(response.pid),
            shim_socket_path: Some(self.socket.clone()),
            error: (!response.error.is_empty()).then_some(response.error),
        })
    }

    async fn shutdown(&self) -> Result<()> {
        self.client
            .clone()
            .shutdown(ShutdownRequest {})
            .await
            .map_err(|s| self.error(s))?;
        Ok(())
    }
}
