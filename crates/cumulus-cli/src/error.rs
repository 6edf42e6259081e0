use cumulus_client::{ClientError, JobStatus};
use cumulus_core::errors::{ErrorKind, SchedulingError};
use std::path::PathBuf;
use thiserror::Error;

pub const EXIT_JOB_FAILED: i32 = 1;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_INTERRUPTED: i32 = 130;

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] cumulus_core::errors::ConfigError),

    #[error(transparent)]
    Scheduling(#[from] SchedulingError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("Failed to read workflow '{path}': {reason}")]
    Workflow { path: PathBuf, reason: String },

    #[error("Job {job_id} finished with status '{status}' ({failed} of {total} steps did not succeed)")]
    JobFailed {
        job_id: String,
        status: JobStatus,
        failed: usize,
        total: usize,
    },

    #[error("The job runner stopped unexpectedly")]
    WorkerPanicked,
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) | CliError::Scheduling(_) | CliError::Workflow { .. } => {
                EXIT_USAGE
            }
            CliError::Client(e) => match e.kind() {
                ErrorKind::Configuration | ErrorKind::Scheduling => EXIT_USAGE,
                _ => EXIT_JOB_FAILED,
            },
            CliError::Json(_) => EXIT_USAGE,
            CliError::Io(_) | CliError::JobFailed { .. } | CliError::WorkerPanicked => {
                EXIT_JOB_FAILED
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cumulus_core::errors::ConfigError;

    #[test]
    fn test_exit_codes() {
        assert_eq!(CliError::from(ConfigError::NoClusters).exit_code(), 2);
        assert_eq!(
            CliError::from(ClientError::from(SchedulingError::EmptyGraph)).exit_code(),
            2
        );
        let failed = CliError::JobFailed {
            job_id: "j".into(),
            status: JobStatus::Failed,
            failed: 1,
            total: 2,
        };
        assert_eq!(failed.exit_code(), 1);
    }
}
