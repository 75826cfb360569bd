//! Error types for kettle.
//!
//! Errors cross two RPC hops (shim -> daemon -> client). The kind and the
//! structured fields travel in status metadata so [`Error::from_status`] can
//! rebuild the same variant on the far side.

use std::path::PathBuf;

use thiserror::Error;
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::{Code, Status};

use crate::task::TaskState;

const KIND_KEY: &str = "x-kettle-kind";
const DETAIL_KEY: &str = "x-kettle-detail-bin";
const EXIT_CODE_KEY: &str = "x-kettle-exit-code";
const COMMAND_KEY: &str = "x-kettle-command-bin";
const SOCKET_KEY: &str = "x-kettle-socket-bin";
const FROM_KEY: &str = "x-kettle-from";
const TO_KEY: &str = "x-kettle-to";
const CURRENT_KEY: &str = "x-kettle-current";

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("container {0} already exists")]
    AlreadyExists(String),

    #[error("container {0} not found")]
    NotFound(String),

    #[error("container {key}: invalid transition {from} -> {to} (state is {current})")]
    InvalidStateTransition {
        key: String,
        from: TaskState,
        to: TaskState,
        current: TaskState,
    },

    #[error("shim at {} unreachable: {reason}", socket.display())]
    ShimUnreachable { socket: PathBuf, reason: String },

    #[error("runtime command `{command}` failed with exit code {exit_code}: {stderr_tail}")]
    RuntimeExecutionFailed {
        command: String,
        exit_code: i32,
        stderr_tail: String,
    },

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("rpc error: {0}")]
    Rpc(Status),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Only an unreachable shim is worth retrying; everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ShimUnreachable { .. })
    }

    fn kind(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "invalid_argument",
            Error::AlreadyExists(_) => "already_exists",
            Error::NotFound(_) => "not_found",
            Error::InvalidStateTransition { .. } => "invalid_state_transition",
            Error::ShimUnreachable { .. } => "shim_unreachable",
            Error::RuntimeExecutionFailed { .. } => "runtime_execution_failed",
            Error::PreconditionFailed(_) => "precondition_failed",
            Error::Io(_) | Error::Transport(_) | Error::Rpc(_) => "internal",
        }
    }

    fn code(&self) -> Code {
        match self {
            Error::InvalidArgument(_) => Code::InvalidArgument,
            Error::AlreadyExists(_) => Code::AlreadyExists,
            Error::NotFound(_) => Code::NotFound,
            Error::InvalidStateTransition { .. } => Code::Aborted,
            Error::ShimUnreachable { .. } => Code::Unavailable,
            Error::RuntimeExecutionFailed { .. } => Code::Internal,
            Error::PreconditionFailed(_) => Code::FailedPrecondition,
            Error::Io(_) | Error::Transport(_) => Code::Internal,
            Error::Rpc(status) => status.code(),
        }
    }

    /// Rebuild an error from a status produced by `From<Error> for Status`.
    ///
    /// Statuses without kettle metadata map by code; anything unrecognised is
    /// kept as [`Error::Rpc`].
    pub fn from_status(status: Status) -> Self {
        let meta = status.metadata();
        let detail = binary(meta, DETAIL_KEY);

        match ascii(meta, KIND_KEY).as_deref() {
            Some("invalid_argument") => {
                Error::InvalidArgument(detail.unwrap_or_else(|| status.message().to_string()))
            }
            Some("already_exists") => {
                Error::AlreadyExists(detail.unwrap_or_else(|| status.message().to_string()))
            }
            Some("not_found") => {
                Error::NotFound(detail.unwrap_or_else(|| status.message().to_string()))
            }
            Some("precondition_failed") => {
                Error::PreconditionFailed(detail.unwrap_or_else(|| status.message().to_string()))
            }
            Some("shim_unreachable") => Error::ShimUnreachable {
                socket: binary(meta, SOCKET_KEY).unwrap_or_default().into(),
                reason: detail.unwrap_or_else(|| status.message().to_string()),
            },
            Some("runtime_execution_failed") => Error::RuntimeExecutionFailed {
                command: binary(meta, COMMAND_KEY).unwrap_or_default(),
                exit_code: ascii(meta, EXIT_CODE_KEY)
                    .and_then(|c| c.parse().ok())
                    .unwrap_or(-1),
                stderr_tail: detail.unwrap_or_default(),
            },
            Some("invalid_state_transition") => {
                let state = |key| ascii(meta, key).and_then(|s| s.parse::<TaskState>().ok());
                match (state(FROM_KEY), state(TO_KEY), state(CURRENT_KEY)) {
                    (Some(from), Some(to), Some(current)) => Error::InvalidStateTransition {
                        key: detail.unwrap_or_default(),
                        from,
                        to,
                        current,
                    },
                    _ => Error::Rpc(status),
                }
            }
            _ => match status.code() {
                Code::InvalidArgument => Error::InvalidArgument(status.message().to_string()),
                Code::AlreadyExists => Error::AlreadyExists(status.message().to_string()),
                Code::NotFound => Error::NotFound(status.message().to_string()),
                Code::FailedPrecondition => {
                    Error::PreconditionFailed(status.message().to_string())
                }
                _ => Error::Rpc(status),
            },
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        if let Error::Rpc(status) = err {
            return status;
        }

        let mut meta = MetadataMap::new();
        meta.insert(KIND_KEY, MetadataValue::from_static(err.kind()));

        match &err {
            Error::InvalidArgument(detail)
            | Error::AlreadyExists(detail)
            | Error::NotFound(detail)
            | Error::PreconditionFailed(detail) => {
                meta.insert_bin(DETAIL_KEY, MetadataValue::from_bytes(detail.as_bytes()));
            }
            Error::InvalidStateTransition {
                key,
                from,
                to,
                current,
            } => {
                meta.insert_bin(DETAIL_KEY, MetadataValue::from_bytes(key.as_bytes()));
                meta.insert(FROM_KEY, MetadataValue::from_static(from.as_str()));
                meta.insert(TO_KEY, MetadataValue::from_static(to.as_str()));
                meta.insert(CURRENT_KEY, MetadataValue::from_static(current.as_str()));
            }
            Error::ShimUnreachable { socket, reason } => {
                meta.insert_bin(DETAIL_KEY, MetadataValue::from_bytes(reason.as_bytes()));
                meta.insert_bin(
                    SOCKET_KEY,
                    MetadataValue::from_bytes(socket.to_string_lossy().as_bytes()),
                );
            }
            Error::RuntimeExecutionFailed {
                command,
                exit_code,
                stderr_tail,
            } => {
                meta.insert_bin(DETAIL_KEY, MetadataValue::from_bytes(stderr_tail.as_bytes()));
                meta.insert_bin(COMMAND_KEY, MetadataValue::from_bytes(command.as_bytes()));
                meta.insert(EXIT_CODE_KEY, MetadataValue::from(*exit_code));
            }
            Error::Io(_) | Error::Transport(_) | Error::Rpc(_) => {}
        }

        Status::with_metadata(err.code(), err.to_string(), meta)
    }
}

fn ascii(meta: &MetadataMap, key: &str) -> Option<String> {
    meta.get(key)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn binary(meta: &MetadataMap, key: &str) -> Option<String> {
    meta.get_bin(key)
        .and_then(|v| v.to_bytes().ok())
        .map(|b| String::from_utf8_lossy(&b).into_owned())
}
