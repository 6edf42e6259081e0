use crate::backoff::{deadline_after, retry_delay, sleep_until_deadline, Backoff};
use crate::error::TaskError;
use crate::render::{render_command, ResolvedInput};
use crate::rpc::{
    ClusterRpc, InvocationId, InvocationPayload, RemoteState, RemoteStatus, RpcError, ServiceRef,
    ServiceSpec, StagedInput, StagedObject,
};
use crate::task::{Task, TaskSpec, Transition};
use cumulus_core::config::ExecutionConfig;
use cumulus_core::constants::env as env_vars;
use cumulus_core::errors::ErrorKind;
use cumulus_core::graph::InputSource;
use cumulus_core::model::JobId;
use cumulus_storage::JobStorage;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use wildmatch::WildMatch;

/// Status queries may fail this many times in a row before the attempt is
/// reported as failed.
const MAX_CONSECUTIVE_POLL_ERRORS: u32 = 3;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub task_timeout: Duration,
    pub poll_interval: Duration,
    pub poll_max_interval: Duration,
    pub retry_delay: Duration,
    pub cancel_grace: Duration,
}

impl From<&ExecutionConfig> for ManagerSettings {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            task_timeout: config.task_timeout(),
            poll_interval: config.poll_interval(),
            poll_max_interval: config.poll_max_interval(),
            retry_delay: config.retry_delay(),
            cancel_grace: config.cancel_grace(),
        }
    }
}

/// Where the orchestrator staged a workflow-level input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowInputRef {
    File { key: String, file_name: String },
    Directory { prefix: String },
}

pub struct JobContext {
    pub job_id: JobId,
    pub storage: JobStorage,
    pub workflow_inputs: BTreeMap<String, WorkflowInputRef>,
}

/// A connected cluster. The service is verified at most once per job.
pub struct ClusterHandle {
    pub index: usize,
    pub name: String,
    pub service: String,
    pub rpc: Arc<dyn ClusterRpc>,
    verified: OnceCell<ServiceRef>,
}

impl ClusterHandle {
    pub fn new(index: usize, name: String, service: String, rpc: Arc<dyn ClusterRpc>) -> Self {
        Self {
            index,
            name,
            service,
            rpc,
            verified: OnceCell::new(),
        }
    }

    pub async fn service(&self) -> Result<&ServiceRef, RpcError> {
        self.verified
            .get_or_try_init(|| async {
                let spec = ServiceSpec {
                    name: self.service.clone(),
                    cluster: self.name.clone(),
                };
                let service = self.rpc.create_or_verify_service(&spec).await?;
                tracing::info!(
                    "Service '{}' ready on cluster '{}'",
                    service.name,
                    self.name
                );
                Ok(service)
            })
            .await
    }
}

/// Keys an upstream step produced for one output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamOutput {
    pub prefix: String,
    pub keys: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AttemptRequest {
    pub spec: Arc<TaskSpec>,
    pub attempt: u32,
    /// Step-sourced inputs, by input name.
    pub upstream: BTreeMap<String, UpstreamOutput>,
    pub delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptUpdate {
    Submitted(InvocationId),
    Running,
    Succeeded {
        outputs: BTreeMap<String, Vec<String>>,
        exit_code: Option<i32>,
        log_ref: Option<String>,
    },
    Errored(TaskError),
    TimedOut(TaskError),
}

#[derive(Debug, Clone)]
pub struct AttemptEvent {
    pub step_index: usize,
    pub attempt: u32,
    pub update: AttemptUpdate,
}

pub struct TaskExecutionManager {
    ctx: Arc<JobContext>,
    clusters: Vec<Arc<ClusterHandle>>,
    settings: ManagerSettings,
}

fn basename(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

fn staged_file(name: &str, key: String, file_name: &str) -> ResolvedInput {
    ResolvedInput::Staged {
        input: StagedInput {
            name: name.to_string(),
            objects: vec![StagedObject {
                key,
                path: file_name.to_string(),
            }],
        },
        file: true,
    }
}

fn staged_dir(name: &str, prefix: &str, keys: Vec<String>) -> ResolvedInput {
    let objects = keys
        .into_iter()
        .map(|key| StagedObject {
            path: key.strip_prefix(prefix).unwrap_or(&key).to_string(),
            key,
        })
        .collect();
    ResolvedInput::Staged {
        input: StagedInput {
            name: name.to_string(),
            objects,
        },
        file: false,
    }
}

impl TaskExecutionManager {
    pub fn new(
        ctx: Arc<JobContext>,
        clusters: Vec<Arc<ClusterHandle>>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            ctx,
            clusters,
            settings,
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn storage(&self) -> &JobStorage {
        &self.ctx.storage
    }

    fn cluster(&self, index: usize) -> Result<&Arc<ClusterHandle>, TaskError> {
        self.clusters.get(index).ok_or_else(|| {
            TaskError::new(
                ErrorKind::Configuration,
                format!("no cluster with index {}", index),
            )
        })
    }

    async fn resolve_inputs(
        &self,
        spec: &TaskSpec,
        upstream: &BTreeMap<String, UpstreamOutput>,
    ) -> Result<BTreeMap<String, ResolvedInput>, TaskError> {
        let storage = &self.ctx.storage;
        let mut resolved = BTreeMap::new();

        for binding in &spec.step.inputs {
            let name = binding.name.as_str();
            let input = match &binding.source {
                InputSource::Value { value } => ResolvedInput::Value(value.clone()),
                InputSource::Workflow { input } => match self.ctx.workflow_inputs.get(input) {
                    Some(WorkflowInputRef::File { key, file_name }) => {
                        staged_file(name, key.clone(), file_name)
                    }
                    Some(WorkflowInputRef::Directory { prefix }) => {
                        let keys = storage.list(prefix).await?;
                        staged_dir(name, prefix, keys)
                    }
                    None => {
                        return Err(TaskError::new(
                            ErrorKind::Scheduling,
                            format!("workflow input '{}' was not staged", input),
                        ))
                    }
                },
                InputSource::Step { step, output } => {
                    let Some(up) = upstream.get(name) else {
                        return Err(TaskError::new(
                            ErrorKind::Scheduling,
                            format!("output '{}' of step '{}' is not available", output, step),
                        ));
                    };
                    match up.keys.as_slice() {
                        [single] => staged_file(name, single.clone(), basename(single)),
                        _ => staged_dir(name, &up.prefix, up.keys.clone()),
                    }
                }
                InputSource::File { path } => self.stage_local_input(name, path).await?,
            };
            resolved.insert(name.to_string(), input);
        }

        Ok(resolved)
    }

    /// Uploads a local file or directory unless the cluster can already see it.
    async fn stage_local_input(&self, name: &str, path: &Path) -> Result<ResolvedInput, TaskError> {
        let storage = &self.ctx.storage;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string());
        let key = storage.input_key(name, &file_name);
        let prefix = storage.input_prefix(name);

        if storage.exists(&key).await? {
            return Ok(staged_file(name, key, &file_name));
        }
        let existing = storage.list(&prefix).await?;
        if !existing.is_empty() {
            return Ok(staged_dir(name, &prefix, existing));
        }

        let meta = tokio::fs::metadata(path).await.map_err(|e| {
            TaskError::new(
                ErrorKind::Submission,
                format!("local input '{}' cannot be read: {}", path.display(), e),
            )
        })?;
        if meta.is_dir() {
            let keys = storage.put_dir(&prefix, path).await?;
            tracing::debug!("Uploaded {} files for input '{}'", keys.len(), name);
            Ok(staged_dir(name, &prefix, keys))
        } else {
            let size = storage.put_file(&key, path).await?;
            tracing::debug!("Uploaded '{}' ({} bytes) to '{}'", path.display(), size, key);
            Ok(staged_file(name, key, &file_name))
        }
    }

    /// Renders the command, stages inputs and invokes the assigned cluster.
    pub async fn submit(&self, req: &AttemptRequest) -> Result<InvocationId, TaskError> {
        let spec = &req.spec;
        let cluster = self.cluster(spec.cluster_index)?;
        let storage = &self.ctx.storage;

        let resolved = self.resolve_inputs(spec, &req.upstream).await?;
        let script = render_command(&spec.step, &resolved)?;

        let output_prefix = storage.output_prefix(&spec.step.name);
        let cleared = storage.clear_prefix(&output_prefix).await?;
        if cleared > 0 {
            tracing::debug!(
                "Cleared {} stale objects under '{}' before attempt {}",
                cleared,
                output_prefix,
                req.attempt
            );
        }

        let service = cluster.service().await?;

        let mut env = spec.step.env.clone();
        env.insert(env_vars::JOB_ID.to_string(), self.ctx.job_id.to_string());
        env.insert(env_vars::STEP.to_string(), spec.step.name.clone());
        env.insert(env_vars::ATTEMPT.to_string(), req.attempt.to_string());

        let payload = InvocationPayload {
            job_id: self.ctx.job_id.clone(),
            step: spec.step.name.clone(),
            attempt: req.attempt,
            script,
            env,
            inputs: resolved
                .into_values()
                .filter_map(|r| match r {
                    ResolvedInput::Staged { input, .. } => Some(input),
                    ResolvedInput::Value(_) => None,
                })
                .collect(),
            output_prefix,
        };

        let id = cluster.rpc.invoke(service, &payload).await?;
        tracing::info!(
            "Step '{}' attempt {} submitted to '{}' as {}",
            spec.step.name,
            req.attempt,
            cluster.name,
            id
        );
        Ok(id)
    }

    /// One status query, no waiting.
    pub async fn poll(&self, cluster: usize, id: &InvocationId) -> Result<RemoteStatus, TaskError> {
        let cluster = self.cluster(cluster)?;
        Ok(cluster.rpc.get_status(id).await?)
    }

    /// Proposes another attempt for transient errors while the budget lasts.
    pub fn retry(&self, task: &Task, error: TaskError) -> Transition {
        if error.is_transient() && task.retries_left() {
            Transition::Retry(error)
        } else {
            Transition::Failed(error)
        }
    }

    pub fn retry_delay_for(&self, task: &Task) -> Duration {
        retry_delay(
            self.settings.retry_delay,
            task.retry_count.saturating_sub(1),
            self.settings.poll_max_interval,
        )
    }

    /// Matches every declared output glob against the step's output prefix.
    pub async fn collect(&self, spec: &TaskSpec) -> Result<BTreeMap<String, Vec<String>>, TaskError> {
        let storage = &self.ctx.storage;
        let prefix = storage.output_prefix(&spec.step.name);
        let keys = storage.list(&prefix).await?;

        let mut collected = BTreeMap::new();
        for output in &spec.step.outputs {
            let pattern = WildMatch::new(&output.glob);
            let matched: Vec<String> = keys
                .iter()
                .filter(|key| {
                    let rel = key.strip_prefix(&prefix).unwrap_or(key);
                    pattern.matches(rel) || pattern.matches(basename(rel))
                })
                .cloned()
                .collect();
            if matched.is_empty() && output.required {
                return Err(TaskError::missing_output(&output.name, &output.glob));
            }
            collected.insert(output.name.clone(), matched);
        }
        Ok(collected)
    }

    /// Best-effort remote cancellation bounded by the cancel grace period.
    pub async fn cancel(&self, cluster: usize, id: &InvocationId) -> bool {
        let Some(handle) = self.clusters.get(cluster) else {
            return false;
        };
        match tokio::time::timeout(self.settings.cancel_grace, handle.rpc.cancel(id)).await {
            Ok(Ok(())) => {
                tracing::info!("Cancelled invocation {} on '{}'", id, handle.name);
                true
            }
            Ok(Err(e)) => {
                tracing::warn!("Failed to cancel {} on '{}': {}", id, handle.name, e);
                false
            }
            Err(_) => {
                tracing::warn!(
                    "Cancel of {} on '{}' did not answer within {:?}",
                    id,
                    handle.name,
                    self.settings.cancel_grace
                );
                false
            }
        }
    }

    async fn finish_success(&self, spec: &TaskSpec, status: RemoteStatus) -> AttemptUpdate {
        match self.collect(spec).await {
            Ok(outputs) => AttemptUpdate::Succeeded {
                outputs,
                exit_code: status.exit_code,
                log_ref: status.logs,
            },
            Err(e) => AttemptUpdate::Errored(e.with_log_ref(status.logs)),
        }
    }

    /// Polls with backoff until the invocation is terminal or the task
    /// timeout passes. `None` means the attempt was cancelled locally; the
    /// invocation has then been asked to stop as well.
    async fn track(
        &self,
        spec: &TaskSpec,
        id: &InvocationId,
        cancel: &CancellationToken,
        emit: &impl Fn(AttemptUpdate),
    ) -> Option<AttemptUpdate> {
        let timeout = self.settings.task_timeout;
        let deadline = deadline_after(timeout);
        let mut backoff = Backoff::new(self.settings.poll_interval, self.settings.poll_max_interval);
        let mut running = false;
        let mut poll_errors = 0;

        loop {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.cancel(spec.cluster_index, id).await;
                    return None;
                }
                _ = sleep_until_deadline(deadline) => break,
                polled = self.poll(spec.cluster_index, id) => polled,
            };

            match polled {
                Ok(status) => {
                    poll_errors = 0;
                    if status.state != RemoteState::Pending && !running {
                        running = true;
                        emit(AttemptUpdate::Running);
                    }
                    match status.state {
                        RemoteState::Succeeded => {
                            return Some(self.finish_success(spec, status).await)
                        }
                        RemoteState::Failed => {
                            return Some(AttemptUpdate::Errored(TaskError::remote_failure(
                                status.exit_code,
                                status.logs,
                            )))
                        }
                        RemoteState::Pending | RemoteState::Running => {}
                    }
                }
                Err(e) if e.is_transient() && poll_errors + 1 < MAX_CONSECUTIVE_POLL_ERRORS => {
                    poll_errors += 1;
                    tracing::warn!(
                        "Status query for step '{}' failed ({}/{}): {}",
                        spec.step.name,
                        poll_errors,
                        MAX_CONSECUTIVE_POLL_ERRORS,
                        e
                    );
                }
                Err(e) => return Some(AttemptUpdate::Errored(e)),
            }

            let wake = match (deadline_after(backoff.next_delay()), deadline) {
                (Some(wake), Some(deadline)) => Some(wake.min(deadline)),
                (wake, deadline) => wake.or(deadline),
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.cancel(spec.cluster_index, id).await;
                    return None;
                }
                _ = sleep_until_deadline(wake) => {}
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                break;
            }
        }

        tracing::warn!(
            "Step '{}' exceeded its timeout of {:?}; cancelling {}",
            spec.step.name,
            timeout,
            id
        );
        self.cancel(spec.cluster_index, id).await;
        Some(AttemptUpdate::TimedOut(TaskError::timeout(timeout)))
    }

    /// Drives one attempt end to end and reports progress over `events`.
    pub async fn run_attempt(
        self: Arc<Self>,
        req: AttemptRequest,
        events: UnboundedSender<AttemptEvent>,
        cancel: CancellationToken,
    ) {
        let step_index = req.spec.step_index;
        let attempt = req.attempt;
        let emit = |update: AttemptUpdate| {
            let _ = events.send(AttemptEvent {
                step_index,
                attempt,
                update,
            });
        };

        if !req.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(req.delay) => {}
            }
        }

        let submitted = tokio::select! {
            _ = cancel.cancelled() => return,
            submitted = self.submit(&req) => submitted,
        };
        let id = match submitted {
            Ok(id) => id,
            Err(e) => {
                emit(AttemptUpdate::Errored(e));
                return;
            }
        };
        emit(AttemptUpdate::Submitted(id.clone()));

        if let Some(update) = self.track(&req.spec, &id, &cancel, &emit).await {
            emit(update);
        }
    }
}
