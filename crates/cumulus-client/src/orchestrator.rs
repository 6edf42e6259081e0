use crate::error::{ClientError, Result};
use crate::events::{EventSink, JobEvent};
use crate::registry::ClusterRegistry;
use crate::scheduler::{JobOutcome, JobStatus, Scheduler, SchedulerSettings};
use chrono::{DateTime, Utc};
use cumulus_core::config::{Config, ExecutionConfig};
use cumulus_core::constants::files;
use cumulus_core::errors::{ConfigError, ErrorKind, SchedulingError};
use cumulus_core::graph::{InputSource, StepGraph};
use cumulus_core::model::{ClusterConfig, JobId, StorageConfig};
use cumulus_executor::{
    ClusterConnector, ClusterHandle, JobContext, ManagerSettings, Task, TaskExecutionManager,
    TaskState, WorkflowInputRef,
};
use cumulus_storage::{JobStorage, StorageScope};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use uuid::Uuid;

/// Everything needed to run one workflow.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub graph: StepGraph,
    /// Workflow inputs by name, local files or directories.
    pub inputs: BTreeMap<String, PathBuf>,
    pub clusters: Vec<ClusterConfig>,
    pub shared_storage: Option<StorageConfig>,
    pub placement: BTreeMap<String, String>,
    pub execution: ExecutionConfig,
    pub output_dir: PathBuf,
    /// The workflow document as the user wrote it, kept next to the graph.
    pub workflow_file: Option<PathBuf>,
}

impl JobRequest {
    pub fn new(graph: StepGraph, config: &Config, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            graph,
            inputs: BTreeMap::new(),
            clusters: config.clusters.clone(),
            shared_storage: config.shared_storage.clone(),
            placement: config.placement.clone(),
            execution: config.execution.clone(),
            output_dir: output_dir.into(),
            workflow_file: None,
        }
    }

    pub fn with_workflow_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.workflow_file = Some(path.into());
        self
    }

    pub fn with_input(mut self, name: &str, path: impl Into<PathBuf>) -> Self {
        self.inputs.insert(name.to_string(), path.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputFile {
    pub name: String,
    pub step: String,
    pub key: String,
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub step: String,
    pub cluster: String,
    pub state: TaskState,
    pub attempts: u32,
    pub retries: u32,
    pub exit_code: Option<i32>,
    pub error_kind: Option<ErrorKind>,
    pub message: Option<String>,
    pub log_ref: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Task> for StepReport {
    fn from(task: &Task) -> Self {
        Self {
            step: task.step().to_string(),
            cluster: task.spec.cluster_name.clone(),
            state: task.state,
            attempts: task.attempts,
            retries: task.retry_count,
            exit_code: task.exit_code,
            error_kind: task.error.as_ref().map(|e| e.kind),
            message: task.error.as_ref().map(|e| e.message.clone()),
            log_ref: task
                .log_ref
                .clone()
                .or_else(|| task.error.as_ref().and_then(|e| e.log_ref.clone())),
            submitted_at: task.submitted_at,
            finished_at: task.finished_at,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupSummary {
    pub deleted: usize,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outputs: Vec<OutputFile>,
    /// In topological order.
    pub steps: Vec<StepReport>,
    pub assignments: BTreeMap<String, String>,
    pub cleanup: CleanupSummary,
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Succeeded
    }

    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.step == name)
    }
}

/// Runs whole jobs: validate, stage, schedule, download, clean up.
pub struct Orchestrator {
    connector: Arc<dyn ClusterConnector>,
    events: EventSink,
}

impl Orchestrator {
    pub fn new(connector: Arc<dyn ClusterConnector>) -> Self {
        Self {
            connector,
            events: EventSink::default(),
        }
    }

    pub fn with_events(mut self, sender: Sender<JobEvent>) -> Self {
        self.events = EventSink::new(Some(sender));
        self
    }

    /// Every check that must pass before any cluster or storage call.
    pub fn validate(request: &JobRequest) -> Result<ClusterRegistry> {
        request.execution.validate()?;
        request.graph.validate()?;

        let registry = ClusterRegistry::new(
            request.clusters.clone(),
            request.shared_storage.clone(),
            &request.placement,
        )?;
        registry.validate_for(&request.graph)?;
        registry.storage()?;

        for input in request.graph.workflow_inputs() {
            let Some(path) = request.inputs.get(input) else {
                let step = request
                    .graph
                    .steps
                    .iter()
                    .find(|s| {
                        s.inputs.iter().any(
                            |b| matches!(&b.source, InputSource::Workflow { input: i } if i == input),
                        )
                    })
                    .map(|s| s.name.clone())
                    .unwrap_or_default();
                return Err(SchedulingError::MissingWorkflowInput {
                    step,
                    input: input.to_string(),
                }
                .into());
            };
            if !path.exists() {
                return Err(ClientError::InputNotFound {
                    name: input.to_string(),
                    path: path.clone(),
                });
            }
        }

        let used = request.graph.workflow_inputs();
        for name in request.inputs.keys() {
            if !used.contains(name.as_str()) {
                tracing::warn!("Input '{}' is not read by any step", name);
            }
        }

        Ok(registry)
    }

    pub async fn run_job(&self, request: JobRequest) -> Result<JobResult> {
        let started_at = Utc::now();
        let registry = Self::validate(&request)?;
        self.events.send(JobEvent::Validated {
            steps: request.graph.steps.len(),
            clusters: registry.len(),
        });

        let (storage_config, scope) = registry.storage()?;
        let store = self.connector.open_store(&storage_config)?;
        if let Err(e) = store.probe().await {
            return Err(match scope {
                StorageScope::Shared => ConfigError::SharedStorageUnreachable {
                    endpoint: storage_config.endpoint.clone(),
                    reason: e.to_string(),
                }
                .into(),
                StorageScope::ClusterLocal { .. } => e.into(),
            });
        }

        let handles = registry
            .clusters()
            .iter()
            .enumerate()
            .map(|(index, cluster)| {
                let rpc = self.connector.connect(cluster, store.clone())?;
                Ok(Arc::new(ClusterHandle::new(
                    index,
                    cluster.name.clone(),
                    cluster.service.clone(),
                    rpc,
                )))
            })
            .collect::<Result<Vec<_>>>()?;

        let job_id = JobId(Uuid::new_v4().to_string());
        tracing::info!(
            "Starting job {} with {} steps on {} cluster(s), storage {} ({})",
            job_id,
            request.graph.steps.len(),
            registry.len(),
            store.describe(),
            scope
        );
        let storage = JobStorage::new(store, job_id.clone(), scope);

        let executed = self.execute(&request, &registry, &storage, handles).await;

        let report = storage.purge().await;
        for (key, reason) in &report.failed {
            tracing::warn!("Failed to delete '{}': {}", key, reason);
        }
        tracing::info!(
            "Removed {} objects of job {}",
            report.deleted,
            job_id.short_id()
        );
        self.events.send(JobEvent::CleanedUp {
            deleted: report.deleted,
            failed: report.failed.len(),
        });

        let (outcome, outputs) = executed?;
        let steps = outcome
            .order
            .iter()
            .map(|&i| StepReport::from(&outcome.tasks[i]))
            .collect();

        Ok(JobResult {
            job_id,
            status: outcome.status,
            started_at,
            finished_at: Utc::now(),
            outputs,
            steps,
            assignments: outcome.assignments,
            cleanup: CleanupSummary {
                deleted: report.deleted,
                failed: report.failed.into_iter().map(|(key, _)| key).collect(),
            },
        })
    }

    async fn execute(
        &self,
        request: &JobRequest,
        registry: &ClusterRegistry,
        storage: &JobStorage,
        handles: Vec<Arc<ClusterHandle>>,
    ) -> Result<(JobOutcome, Vec<OutputFile>)> {
        let workflow_inputs = self.stage(request, storage).await?;

        let ctx = Arc::new(JobContext {
            job_id: storage.job().clone(),
            storage: storage.clone(),
            workflow_inputs,
        });
        let manager = Arc::new(TaskExecutionManager::new(
            ctx,
            handles,
            ManagerSettings::from(&request.execution),
        ));

        let names = registry.clusters().iter().map(|c| c.name.clone()).collect();
        let mut table = registry.assignment_table();
        let outcome = Scheduler::new(
            &request.graph,
            manager,
            names,
            SchedulerSettings::from(&request.execution),
            self.events.clone(),
        )
        .run(&mut table)
        .await?;

        let outputs = if outcome.status == JobStatus::Succeeded {
            self.download(&request.graph, &outcome, storage, &request.output_dir)
                .await?
        } else {
            Vec::new()
        };
        Ok((outcome, outputs))
    }

    /// Uploads the workflow document and every workflow input.
    async fn stage(
        &self,
        request: &JobRequest,
        storage: &JobStorage,
    ) -> Result<BTreeMap<String, WorkflowInputRef>> {
        storage
            .put(
                &storage.mount_key(files::WORKFLOW),
                serde_json::to_vec_pretty(&request.graph)?,
            )
            .await?;
        if let Some(path) = &request.workflow_file {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| files::WORKFLOW.to_string());
            let key = storage.mount_key(&format!("{}/{}", files::SOURCE_DIR, name));
            storage.put_file(&key, path).await?;
        }

        let used = request.graph.workflow_inputs();
        let wanted: Vec<_> = request
            .inputs
            .iter()
            .filter(|(name, _)| used.contains(name.as_str()))
            .collect();
        self.events.send(JobEvent::StagingInputs {
            job_id: storage.job().clone(),
            total: wanted.len(),
        });

        let mut staged = BTreeMap::new();
        for (name, path) in wanted {
            let (reference, objects) = stage_input(storage, name, path).await?;
            tracing::info!("Staged input '{}' ({} objects)", name, objects);
            self.events.send(JobEvent::InputStaged {
                name: name.clone(),
                objects,
            });
            staged.insert(name.clone(), reference);
        }
        Ok(staged)
    }

    async fn download(
        &self,
        graph: &StepGraph,
        outcome: &JobOutcome,
        storage: &JobStorage,
        output_dir: &Path,
    ) -> Result<Vec<OutputFile>> {
        let wanted = graph.top_level_outputs();
        fs_err::create_dir_all(output_dir)?;

        let found: Vec<Vec<String>> = wanted
            .iter()
            .map(|output| {
                outcome
                    .task(&output.step)
                    .and_then(|task| task.outputs.get(&output.output))
                    .cloned()
                    .unwrap_or_default()
            })
            .collect();
        let labels: Vec<String> = wanted
            .iter()
            .map(|output| {
                let shared = wanted.iter().filter(|o| o.name == output.name).count() > 1;
                if shared {
                    format!("{}/{}", output.step, output.name)
                } else {
                    output.name.clone()
                }
            })
            .collect();
        let relative: Vec<Vec<String>> = wanted
            .iter()
            .zip(&found)
            .map(|(output, keys)| {
                let prefix = storage.output_prefix(&output.step);
                keys.iter()
                    .map(|key| key.strip_prefix(&prefix).unwrap_or(key).to_string())
                    .collect()
            })
            .collect();
        let nested = nest_outputs(&labels, &relative);

        let mut planned = Vec::new();
        for (i, output) in wanted.iter().enumerate() {
            let dir = if nested[i] {
                output_dir.join(&labels[i])
            } else {
                output_dir.to_path_buf()
            };
            for (key, rel) in found[i].iter().zip(&relative[i]) {
                planned.push((output, key.clone(), dir.join(rel)));
            }
        }
        self.events.send(JobEvent::DownloadingOutputs {
            total: planned.len(),
        });

        let mut files = Vec::with_capacity(planned.len());
        for (output, key, path) in planned {
            let data = storage
                .get_to_file(&key, &path)
                .await?
                .ok_or_else(|| ClientError::Download {
                    key: key.clone(),
                    path: path.clone(),
                    reason: "object no longer exists".to_string(),
                })?;
            let sha256 = format!("{:x}", Sha256::digest(&data));
            tracing::info!("Downloaded '{}' -> '{}'", key, path.display());
            self.events.send(JobEvent::OutputDownloaded {
                name: output.name.clone(),
                path: path.clone(),
            });
            files.push(OutputFile {
                name: output.name.clone(),
                step: output.step.clone(),
                key,
                path,
                size: data.len() as u64,
                sha256,
            });
        }
        Ok(files)
    }
}

async fn stage_input(
    storage: &JobStorage,
    name: &str,
    path: &Path,
) -> Result<(WorkflowInputRef, usize)> {
    let meta = tokio::fs::metadata(path).await.map_err(|_| ClientError::InputNotFound {
        name: name.to_string(),
        path: path.to_path_buf(),
    })?;
    if meta.is_dir() {
        let prefix = storage.input_prefix(name);
        let keys = storage.put_dir(&prefix, path).await?;
        Ok((WorkflowInputRef::Directory { prefix }, keys.len()))
    } else {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string());
        let key = storage.input_key(name, &file_name);
        let size = storage.put_file(&key, path).await?;
        tracing::debug!("Uploaded '{}' ({} bytes)", path.display(), size);
        Ok((WorkflowInputRef::File { key, file_name }, 1))
    }
}

/// Which outputs are downloaded into a directory named after them. An
/// output with exactly one file keeps it at the top of the output directory
/// unless another output claims the same path.
fn nest_outputs(labels: &[String], files: &[Vec<String>]) -> Vec<bool> {
    let mut nested: Vec<bool> = files.iter().map(|f| f.len() > 1).collect();
    loop {
        let mut claimed: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dirs = BTreeSet::new();
        for (i, rels) in files.iter().enumerate() {
            if nested[i] {
                dirs.insert(head(&labels[i]));
            } else if let Some(rel) = rels.first() {
                *claimed.entry(rel.as_str()).or_default() += 1;
            }
        }
        let mut changed = false;
        for (i, rels) in files.iter().enumerate() {
            let Some(rel) = rels.first().filter(|_| !nested[i]) else {
                continue;
            };
            if claimed.get(rel.as_str()).is_some_and(|n| *n > 1) || dirs.contains(head(rel)) {
                nested[i] = true;
                changed = true;
            }
        }
        if !changed {
            return nested;
        }
    }
}

fn head(path: &str) -> &str {
    path.split('/').next().unwrap_or(path)
}
