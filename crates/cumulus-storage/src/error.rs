use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage endpoint '{endpoint}' is unavailable: {reason}")]
    Unavailable { endpoint: String, reason: String },

    #[error("I/O error on key '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid storage key '{0}'.")]
    InvalidKey(String),

    #[error("Key '{key}' is outside the namespaces of job '{job}'.")]
    OutsideNamespace { key: String, job: String },

    #[error("Unsupported storage endpoint '{0}'. Use an absolute path, file://, or memory://.")]
    UnsupportedEndpoint(String),

    #[error("Local file '{path}' could not be read: {source}")]
    LocalFile {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Error walking directory: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("Background storage task failed: {0}")]
    Join(String),
}

impl StorageError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Unavailable { .. } => true,
            StorageError::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    pub(crate) fn io(key: &str, source: std::io::Error) -> Self {
        StorageError::Io {
            key: key.to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
