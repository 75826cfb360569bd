//! Container management surface served on the daemon socket.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::info;

use crate::error::Error;
use crate::manager::TaskManager;
use crate::proto::containers::containers_server::Containers;
use crate::proto::containers::{
    Container, CreateContainerRequest, CreateContainerResponse, DeleteRequest, DeleteResponse,
    GetRequest, ListRequest, ListResponse, StartRequest, StartResponse, VersionRequest,
    VersionResponse,
};
use crate::task::{TaskKey, validate_bundle_path, validate_identifier};

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct ContainersApi {
    manager: Arc<TaskManager>,
}

impl ContainersApi {
    pub fn new(manager: Arc<TaskManager>) -> Self {
        Self { manager }
    }
}

#[tonic::async_trait]
impl Containers for ContainersApi {
    async fn create(
        &self,
        request: Request<CreateContainerRequest>,
    ) -> Result<Response<CreateContainerResponse>, Status> {
        let req = request.into_inner();
        let container = req
            .container
            .ok_or_else(|| Error::InvalidArgument("container is required".to_string()))?;
        info!(
            "API: Create namespace={} id={} bundle={}",
            req.namespace, container.id, container.bundle
        );

        let key = TaskKey::new(req.namespace, container.id)?;
        let bundle = validate_bundle_path(&container.bundle)?;
        self.manager.create(key, bundle).await?;

        Ok(Response::new(CreateContainerResponse {}))
    }

    async fn start(
        &self,
        request: Request<StartRequest>,
    ) -> Result<Response<StartResponse>, Status> {
        let req = request.into_inner();
        info!(
            "API: Start namespace={} id={}",
            req.namespace, req.container_id
        );

        let key = TaskKey::new(req.namespace, req.container_id)?;
        let pid = self.manager.start(&key).await?;

        Ok(Response::new(StartResponse { pid }))
    }

    async fn delete(
        &self,
        request: Request<DeleteRequest>,
    ) -> Result<Response<DeleteResponse>, Status> {
        let req = request.into_inner();
        info!(
            "API: Delete namespace={} id={}",
            req.namespace, req.container_id
        );

        let key = TaskKey::new(req.namespace, req.container_id)?;
        self.manager.delete(&key).await?;

        Ok(Response::new(DeleteResponse {}))
    }

    async fn get(&self, request: Request<GetRequest>) -> Result<Response<Container>, Status> {
        let req = request.into_inner();
        let key = TaskKey::new(req.namespace, req.container_id)?;

        let snapshot = self.manager.get(&key).await?;
        Ok(Response::new(snapshot.into()))
    }

    async fn list(&self, request: Request<ListRequest>) -> Result<Response<ListResponse>, Status> {
        let req = request.into_inner();
        let namespace = if req.namespace.is_empty() {
            None
        } else {
            validate_identifier("namespace", &req.namespace)?;
            Some(req.namespace.as_str())
        };

        let containers = self
            .manager
            .list(namespace)
            .await
            .into_iter()
            .map(Container::from)
            .collect();
        Ok(Response::new(ListResponse { containers }))
    }

    async fn version(
        &self,
        _request: Request<VersionRequest>,
    ) -> Result<Response<VersionResponse>, Status> {
        Ok(Response::new(VersionResponse {
            version: VERSION.to_string(),
        }))
    }
}
