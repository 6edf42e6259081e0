mod backoff;
mod connector;
mod error;
mod manager;
mod process;
mod render;
mod rpc;
mod task;

pub use backoff::{deadline_after, retry_delay, sleep_until_deadline, Backoff};
pub use connector::{ClusterConnector, DefaultConnector};
pub use error::{ExecutorError, Result, TaskError};
pub use manager::{
    AttemptEvent, AttemptRequest, AttemptUpdate, ClusterHandle, JobContext, ManagerSettings,
    TaskExecutionManager, UpstreamOutput, WorkflowInputRef,
};
pub use process::ProcessCluster;
pub use render::{render_command, shell_quote, ResolvedInput};
pub use rpc::{
    ClusterRpc, InvocationId, InvocationPayload, RemoteState, RemoteStatus, RpcError, ServiceRef,
    ServiceSpec, StagedInput, StagedObject,
};
pub use task::{Task, TaskSpec, TaskState, Transition, TransitionError};
