use cumulus_core::errors::{ConfigError, ErrorKind, SchedulingError};
use cumulus_executor::ExecutorError;
use cumulus_storage::StorageError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Scheduling(#[from] SchedulingError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("Input '{name}' points to '{path}', which does not exist.")]
    InputNotFound { name: String, path: PathBuf },

    #[error("Failed to download output '{key}' to '{path}': {reason}")]
    Download {
        key: String,
        path: PathBuf,
        reason: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize workflow: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Config(e) => e.kind(),
            ClientError::Scheduling(e) => e.kind(),
            ClientError::InputNotFound { .. } => ErrorKind::Configuration,
            ClientError::Executor(e) => e.kind(),
            ClientError::Storage(StorageError::UnsupportedEndpoint(_)) => ErrorKind::Configuration,
            ClientError::Storage(_)
            | ClientError::Download { .. }
            | ClientError::Io(_)
            | ClientError::Json(_) => ErrorKind::Storage,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
