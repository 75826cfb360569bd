//! Generated protocol types and their conversions to the internal model.

pub mod containers {
    tonic::include_proto!("kettle.v1");
}

pub mod task {
    tonic::include_proto!("kettle.shim.v1");
}

use crate::task::{TaskSnapshot, TaskState};

use containers::{Container, ContainerState};
use task::TaskStatus;

impl From<TaskState> for ContainerState {
    fn from(state: TaskState) -> Self {
        match state {
            TaskState::Created => ContainerState::Created,
            TaskState::Starting => ContainerState::Starting,
            TaskState::Running => ContainerState::Running,
            TaskState::Stopping => ContainerState::Stopping,
            TaskState::Stopped => ContainerState::Stopped,
            TaskState::Deleted => ContainerState::Deleted,
            TaskState::Failed => ContainerState::Failed,
        }
    }
}

impl From<TaskState> for TaskStatus {
    fn from(state: TaskState) -> Self {
        match state {
            TaskState::Created => TaskStatus::Created,
            TaskState::Starting => TaskStatus::Starting,
            TaskState::Running => TaskStatus::Running,
            TaskState::Stopping => TaskStatus::Stopping,
            TaskState::Stopped => TaskStatus::Stopped,
            TaskState::Deleted => TaskStatus::Deleted,
            TaskState::Failed => TaskStatus::Failed,
        }
    }
}

impl TaskStatus {
    /// Internal state for a wire status; `None` for `Unspecified`.
    pub fn to_state(self) -> Option<TaskState> {
        match self {
            TaskStatus::Unspecified => None,
            TaskStatus::Created => Some(TaskState::Created),
            TaskStatus::Starting => Some(TaskState::Starting),
            TaskStatus::Running => Some(TaskState::Running),
            TaskStatus::Stopping => Some(TaskState::Stopping),
            TaskStatus::Stopped => Some(TaskState::Stopped),
            TaskStatus::Deleted => Some(TaskState::Deleted),
            TaskStatus::Failed => Some(TaskState::Failed),
        }
    }
}

impl From<TaskSnapshot> for Container {
    fn from(snapshot: TaskSnapshot) -> Self {
        Container {
            id: snapshot.key.id().to_string(),
            bundle: snapshot.bundle_path.to_string_lossy().into_owned(),
            namespace: snapshot.key.namespace().to_string(),
            state: ContainerState::from(snapshot.state) as i32,
            pid: snapshot.pid.unwrap_or_default(),
            shim_socket: snapshot
                .shim_socket_path
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
            error: snapshot.error.unwrap_or_default(),
        }
    }
}

impl From<TaskSnapshot> for task::StateResponse {
    fn from(snapshot: TaskSnapshot) -> Self {
        task::StateResponse {
            id: snapshot.key.id().to_string(),
            namespace: snapshot.key.namespace().to_string(),
            bundle: snapshot.bundle_path.to_string_lossy().into_owned(),
            status: TaskStatus::from(snapshot.state) as i32,
            pid: snapshot.pid.unwrap_or_default(),
            error: snapshot.error.unwrap_or_default(),
        }
    }
}
