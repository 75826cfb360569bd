//! Task control surface served by a shim on its per-container socket.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::info;

use crate::control::TaskControl;
use crate::error::Error;
use crate::proto::task::task_server::Task;
use crate::proto::task::{
    CreateTaskRequest, CreateTaskResponse, DeleteTaskRequest, DeleteTaskResponse,
    ShutdownRequest, ShutdownResponse, StartTaskRequest, StartTaskResponse, StateRequest,
    StateResponse,
};
use crate::task::validate_bundle_path;

pub struct TaskApi {
    task: Arc<dyn TaskControl>,
}

impl TaskApi {
    pub fn new(task: Arc<dyn TaskControl>) -> Self {
        Self { task }
    }
}

fn require_id(id: &str) -> Result<(), Status> {
    if id.is_empty() {
        return Err(Error::InvalidArgument("id is required".to_string()).into());
    }
    Ok(())
}

#[tonic::async_trait]
impl Task for TaskApi {
    async fn create(
        &self,
        request: Request<CreateTaskRequest>,
    ) -> Result<Response<CreateTaskResponse>, Status> {
        let req = request.into_inner();
        info!("API: Create id={} bundle={}", req.id, req.bundle);

        require_id(&req.id)?;
        let bundle = validate_bundle_path(&req.bundle)?;
        let pid = self.task.create(&req.id, &bundle).await?;

        Ok(Response::new(CreateTaskResponse { pid }))
    }

    async fn start(
        &self,
        request: Request<StartTaskRequest>,
    ) -> Result<Response<StartTaskResponse>, Status> {
        let req = request.into_inner();
        info!("API: Start id={}", req.id);

        require_id(&req.id)?;
        let pid = self.task.start(&req.id).await?;

        Ok(Response::new(StartTaskResponse { pid }))
    }

    async fn delete(
        &self,
        request: Request<DeleteTaskRequest>,
    ) -> Result<Response<DeleteTaskResponse>, Status> {
        let req = request.into_inner();
        info!("API: Delete id={}", req.id);

        require_id(&req.id)?;
        let deleted = self.task.delete(&req.id).await?;

        Ok(Response::new(DeleteTaskResponse {
            pid: deleted.pid,
            exit_status: deleted.exit_status,
        }))
    }

    async fn state(
        &self,
        request: Request<StateRequest>,
    ) -> Result<Response<StateResponse>, Status> {
        let req = request.into_inner();
        require_id(&req.id)?;

        let snapshot = self.task.state(&req.id).await?;
        Ok(Response::new(snapshot.into()))
    }

    async fn shutdown(
        &self,
        _request: Request<ShutdownRequest>,
    ) -> Result<Response<ShutdownResponse>, Status> {
        info!("API: Shutdown");
        self.task.shutdown().await?;
        Ok(Response::new(ShutdownResponse {}))
    }
}
