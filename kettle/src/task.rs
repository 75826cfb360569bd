//! Container task identity and lifecycle states.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Namespace used when a caller does not specify one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Identifiers end up as path components of the shim socket, and unix socket
/// paths are limited to 108 bytes.
const MAX_IDENTIFIER_LEN: usize = 64;

/// Identity of a container task: `(namespace, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    namespace: String,
    id: String,
}

impl TaskKey {
    /// Build a validated key. An empty namespace selects [`DEFAULT_NAMESPACE`].
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Result<Self> {
        let mut namespace = namespace.into();
        if namespace.is_empty() {
            namespace = DEFAULT_NAMESPACE.to_string();
        }
        let id = id.into();

        validate_identifier("namespace", &namespace)?;
        validate_identifier("container id", &id)?;

        Ok(Self { namespace, id })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.id)
    }
}

/// Check that an identifier is safe to use as a single path component.
pub fn validate_identifier(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidArgument(format!("{what} is required")));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::InvalidArgument(format!(
            "{what} must be at most {MAX_IDENTIFIER_LEN} characters"
        )));
    }
    if value.starts_with('.') {
        return Err(Error::InvalidArgument(format!(
            "{what} must not start with '.'"
        )));
    }
    if let Some(c) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+')))
    {
        return Err(Error::InvalidArgument(format!(
            "{what} contains invalid character {c:?}"
        )));
    }
    Ok(())
}

/// Check that a bundle path is absolute and free of `..` components.
pub fn validate_bundle_path(bundle: &str) -> Result<PathBuf> {
    if bundle.is_empty() {
        return Err(Error::InvalidArgument("bundle path is required".to_string()));
    }
    if bundle.contains('\0') {
        return Err(Error::InvalidArgument(
            "bundle path contains a NUL byte".to_string(),
        ));
    }

    let path = Path::new(bundle);
    if !path.is_absolute() {
        return Err(Error::InvalidArgument(format!(
            "bundle path must be absolute: {bundle}"
        )));
    }
    if path.components().any(|c| c == Component::ParentDir) {
        return Err(Error::InvalidArgument(format!(
            "bundle path must not contain '..': {bundle}"
        )));
    }

    Ok(path.to_path_buf())
}

/// Lifecycle state of a container task.
///
/// ```text
/// Created   --Start-->         Starting
/// Created   --Delete-->        Stopping
/// Starting  --(runtime ok)-->  Running
/// Running   --Delete-->        Stopping
/// Stopping  --(runtime ok)-->  Stopped
/// Stopped   --Delete-->        Deleted
/// Failed    --Delete-->        Deleted
/// any live state --(error)-->  Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Deleted,
    Failed,
}

impl TaskState {
    /// Whether `next` is a valid successor of `self`.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (self, next),
            (Created, Starting)
                | (Created, Stopping)
                | (Starting, Running)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Stopped, Deleted)
                | (Failed, Deleted)
                | (Created | Starting | Running | Stopping, Failed)
        )
    }

    /// States an operation passes through while it talks to the shim or runtime.
    pub fn is_transitional(self) -> bool {
        matches!(self, TaskState::Starting | TaskState::Stopping)
    }

    /// States from which `Registry::remove` may drop the entry.
    pub fn is_removable(self) -> bool {
        matches!(self, TaskState::Stopped | TaskState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Created => "created",
            TaskState::Starting => "starting",
            TaskState::Running => "running",
            TaskState::Stopping => "stopping",
            TaskState::Stopped => "stopped",
            TaskState::Deleted => "deleted",
            TaskState::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(TaskState::Created),
            "starting" => Ok(TaskState::Starting),
            "running" => Ok(TaskState::Running),
            "stopping" => Ok(TaskState::Stopping),
            "stopped" => Ok(TaskState::Stopped),
            "deleted" => Ok(TaskState::Deleted),
            "failed" => Ok(TaskState::Failed),
            other => Err(Error::InvalidArgument(format!("unknown task state: {other}"))),
        }
    }
}

/// Read-only copy of a registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub key: TaskKey,
    pub bundle_path: PathBuf,
    pub state: TaskState,
    /// Container init pid; only present while `Running`.
    pub pid: Option<u32>,
    pub shim_socket_path: Option<PathBuf>,
    /// Reason for the last transition into `Failed`.
    pub error: Option<String>,
}
