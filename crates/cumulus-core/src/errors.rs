use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Classification attached to every failure a user can see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Configuration,
    ClusterUnreachable,
    TransientExecution,
    Submission,
    Authentication,
    Storage,
    Timeout,
    Scheduling,
    RemoteFailure,
    MissingOutput,
    PropagatedFailure,
}

impl ErrorKind {
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::ClusterUnreachable | ErrorKind::TransientExecution
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "ConfigurationError",
            ErrorKind::ClusterUnreachable => "ClusterUnreachableError",
            ErrorKind::TransientExecution => "TransientExecutionError",
            ErrorKind::Submission => "SubmissionError",
            ErrorKind::Authentication => "AuthenticationError",
            ErrorKind::Storage => "StorageError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Scheduling => "SchedulingError",
            ErrorKind::RemoteFailure => "RemoteFailure",
            ErrorKind::MissingOutput => "MissingOutput",
            ErrorKind::PropagatedFailure => "PropagatedFailure",
        };
        write!(f, "{}", name)
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on path '{path}': {source}")]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse workflow graph: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    General(String),

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("No clusters configured. Add at least one [[clusters]] entry or pass --endpoint.")]
    NoClusters,

    #[error("Cluster '{0}' has an empty endpoint.")]
    EmptyEndpoint(String),

    #[error("Cluster '{0}' has no credentials. Provide either a token or a username and password.")]
    MissingCredentials(String),

    #[error("Cluster '{0}' has both a token and a username. Provide exactly one credential form.")]
    AmbiguousCredentials(String),

    #[error("Cluster '{0}' has a username but no password.")]
    MissingPassword(String),

    #[error("Cluster name '{0}' is used more than once.")]
    DuplicateClusterName(String),

    #[error("{count} clusters are configured but no shared storage is set. Multi-cluster jobs need a [shared_storage] endpoint reachable by every cluster.")]
    SharedStorageRequired { count: usize },

    #[error("Shared storage '{endpoint}' is unreachable: {reason}")]
    SharedStorageUnreachable { endpoint: String, reason: String },

    #[error("Step '{step}' is bound to cluster '{cluster}', which is not configured.")]
    UnknownClusterBinding { step: String, cluster: String },

    #[error("Step '{step}' is bound to both '{first}' and '{second}'.")]
    ConflictingBinding {
        step: String,
        first: String,
        second: String,
    },

    #[error("Cluster '{cluster}' binds step '{step}', which does not exist in the workflow.")]
    BindingToUnknownStep { step: String, cluster: String },

    #[error("Cluster-local storage cannot be used when {count} clusters are configured.")]
    ClusterLocalScope { count: usize },

    #[error("Cluster '{0}' has no storage configured. Set [clusters.storage] or [shared_storage].")]
    StorageNotConfigured(String),

    #[error("Unsupported endpoint '{0}'.")]
    UnsupportedEndpoint(String),

    #[error("Could not determine the configuration directory.")]
    ConfigHomeNotFound,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulingError {
    #[error("The workflow has no steps.")]
    EmptyGraph,

    #[error("Invalid {what} name '{name}': names become storage path segments and may not be empty, '.', '..' or contain '/' or '\\'.")]
    InvalidName { what: &'static str, name: String },

    #[error("Step '{0}' is declared more than once.")]
    DuplicateStep(String),

    #[error("Step '{step}' declares input '{input}' more than once.")]
    DuplicateInput { step: String, input: String },

    #[error("Step '{step}' depends on unknown step '{dependency}'.")]
    UnknownDependency { step: String, dependency: String },

    #[error("Step '{step}' reads output '{output}' of step '{source_step}', which does not declare it.")]
    UnknownStepOutput {
        step: String,
        source_step: String,
        output: String,
    },

    #[error("Step '{step}' references '$(inputs.{input})' but declares no such input.")]
    UnresolvedPlaceholder { step: String, input: String },

    #[error("Step '{step}' reads workflow input '{input}', which was not provided.")]
    MissingWorkflowInput { step: String, input: String },

    #[error("Workflow output '{output}' refers to '{step}/{step_output}', which does not exist.")]
    UnknownWorkflowOutput {
        output: String,
        step: String,
        step_output: String,
    },

    #[error("Cycle detected in the step graph involving: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

impl SchedulingError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Scheduling
    }
}
