use crate::rpc::RpcError;
use cumulus_core::errors::ErrorKind;
use cumulus_storage::StorageError;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Failed to serialize invocation: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to execute command '{command}': {source}")]
    CommandFailed {
        command: String,
        source: std::io::Error,
    },

    #[error("Input object '{0}' disappeared before it could be staged.")]
    MissingInputObject(String),

    #[error("Invalid staging path '{0}'.")]
    InvalidStagingPath(String),

    #[error("Unsupported cluster endpoint '{0}'.")]
    UnsupportedEndpoint(String),
}

impl ExecutorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutorError::UnsupportedEndpoint(_)
            | ExecutorError::Storage(StorageError::UnsupportedEndpoint(_)) => {
                ErrorKind::Configuration
            }
            ExecutorError::CommandFailed { .. } => ErrorKind::Submission,
            _ => ErrorKind::Storage,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Why one attempt of a task did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{kind}: {message}")]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
    pub transient: bool,
    pub exit_code: Option<i32>,
    pub log_ref: Option<String>,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            transient: kind.is_transient(),
            exit_code: None,
            log_ref: None,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("no terminal state after {}s", after.as_secs()),
        )
    }

    pub fn remote_failure(exit_code: Option<i32>, logs: Option<String>) -> Self {
        let message = match exit_code {
            Some(code) => format!("remote command exited with code {}", code),
            None => "remote invocation reported failure".to_string(),
        };
        Self {
            exit_code,
            log_ref: logs,
            ..Self::new(ErrorKind::RemoteFailure, message)
        }
    }

    pub fn missing_output(output: &str, glob: &str) -> Self {
        Self::new(
            ErrorKind::MissingOutput,
            format!("required output '{}' matched nothing for '{}'", output, glob),
        )
    }

    pub fn propagated(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::PropagatedFailure, reason)
    }

    pub fn with_log_ref(mut self, log_ref: Option<String>) -> Self {
        if log_ref.is_some() {
            self.log_ref = log_ref;
        }
        self
    }
}

impl From<RpcError> for TaskError {
    fn from(err: RpcError) -> Self {
        TaskError::new(err.kind(), err.to_string())
    }
}

impl From<StorageError> for TaskError {
    fn from(err: StorageError) -> Self {
        Self {
            transient: err.is_transient(),
            ..TaskError::new(ErrorKind::Storage, err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_errors_keep_their_class() {
        let err: TaskError = RpcError::Status {
            code: 503,
            message: "busy".into(),
        }
        .into();
        assert_eq!(err.kind, ErrorKind::TransientExecution);
        assert!(err.is_transient());

        let err: TaskError = RpcError::Status {
            code: 401,
            message: "no".into(),
        }
        .into();
        assert_eq!(err.kind, ErrorKind::Authentication);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_storage_transience_is_preserved() {
        let err: TaskError = StorageError::Unavailable {
            endpoint: "memory://x".into(),
            reason: "offline".into(),
        }
        .into();
        assert_eq!(err.kind, ErrorKind::Storage);
        assert!(err.is_transient());

        let err: TaskError = StorageError::InvalidKey("..".into()).into();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_remote_failure_message() {
        let err = TaskError::remote_failure(Some(2), Some("/logs/stderr.log".into()));
        assert_eq!(err.to_string(), "RemoteFailure: remote command exited with code 2");
        assert_eq!(err.exit_code, Some(2));
    }
}
