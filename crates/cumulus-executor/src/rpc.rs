use async_trait::async_trait;
use cumulus_core::errors::ErrorKind;
use cumulus_core::model::JobId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationId(pub String);

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub cluster: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRef {
    pub name: String,
}

/// One object copied to `inputs/<input>/<path>` in the invocation's work directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedObject {
    pub key: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedInput {
    pub name: String,
    pub objects: Vec<StagedObject>,
}

/// Everything a cluster needs to run one attempt of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationPayload {
    pub job_id: JobId,
    pub step: String,
    pub attempt: u32,
    pub script: String,
    pub env: BTreeMap<String, String>,
    pub inputs: Vec<StagedInput>,
    /// Files the script writes under `outputs/` are uploaded here.
    pub output_prefix: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RemoteState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RemoteState::Succeeded | RemoteState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStatus {
    pub state: RemoteState,
    pub exit_code: Option<i32>,
    /// Log text or a reference to where the cluster keeps it.
    pub logs: Option<String>,
}

impl RemoteStatus {
    pub fn new(state: RemoteState) -> Self {
        Self {
            state,
            exit_code: None,
            logs: None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("cluster unreachable: {0}")]
    Unreachable(String),

    #[error("cluster answered HTTP {code}: {message}")]
    Status { code: u16, message: String },

    #[error("invocation '{0}' is unknown to the cluster")]
    UnknownInvocation(InvocationId),

    #[error("{0}")]
    Other(String),
}

impl RpcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::Unreachable(_) => ErrorKind::ClusterUnreachable,
            RpcError::Status { code, .. } => match code {
                401 | 403 => ErrorKind::Authentication,
                408 | 429 | 500..=599 => ErrorKind::TransientExecution,
                _ => ErrorKind::Submission,
            },
            RpcError::UnknownInvocation(_) | RpcError::Other(_) => ErrorKind::Submission,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }
}

/// Management API of one serverless cluster.
#[async_trait]
pub trait ClusterRpc: Send + Sync {
    async fn create_or_verify_service(&self, spec: &ServiceSpec) -> Result<ServiceRef, RpcError>;

    async fn invoke(
        &self,
        service: &ServiceRef,
        payload: &InvocationPayload,
    ) -> Result<InvocationId, RpcError>;

    async fn get_status(&self, id: &InvocationId) -> Result<RemoteStatus, RpcError>;

    async fn cancel(&self, id: &InvocationId) -> Result<(), RpcError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> RpcError {
        RpcError::Status {
            code,
            message: String::new(),
        }
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(status(401).kind(), ErrorKind::Authentication);
        assert_eq!(status(403).kind(), ErrorKind::Authentication);
        assert_eq!(status(404).kind(), ErrorKind::Submission);
        assert_eq!(status(422).kind(), ErrorKind::Submission);
        assert_eq!(status(503).kind(), ErrorKind::TransientExecution);
        assert!(status(502).is_transient());
        assert!(RpcError::Unreachable("down".into()).is_transient());
        assert!(!status(400).is_transient());
    }
}
