use crate::error::{ExecutorError, Result};
use crate::rpc::{
    ClusterRpc, InvocationId, InvocationPayload, RemoteState, RemoteStatus, RpcError, ServiceRef,
    ServiceSpec,
};
use async_trait::async_trait;
use cumulus_core::constants::{dirs, logs, schemes};
use cumulus_storage::ObjectStore;
use std::collections::{BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::fs::{File, OpenOptions};
use tokio::process::Command as TokioCommand;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

const INVOCATION_FILE: &str = "invocation.json";

struct InvocationRecord {
    status: RemoteStatus,
    cancel: CancellationToken,
}

type Records = Arc<Mutex<HashMap<InvocationId, InvocationRecord>>>;

/// A cluster that runs each invocation as a local `sh -c` process in its
/// own work directory under `local://<work-root>`.
///
/// Staged inputs and outputs are removed when the process exits; the work
/// directory keeps only the logs and `invocation.json`.
pub struct ProcessCluster {
    work_root: PathBuf,
    store: Arc<dyn ObjectStore>,
    records: Records,
    services: Mutex<BTreeSet<String>>,
    counter: AtomicU64,
}

impl ProcessCluster {
    pub fn new(work_root: impl Into<PathBuf>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            work_root: work_root.into(),
            store,
            records: Arc::new(Mutex::new(HashMap::new())),
            services: Mutex::new(BTreeSet::new()),
            counter: AtomicU64::new(0),
        }
    }

    pub fn from_endpoint(endpoint: &str, store: Arc<dyn ObjectStore>) -> Result<Self> {
        let raw = endpoint
            .strip_prefix(schemes::LOCAL)
            .ok_or_else(|| ExecutorError::UnsupportedEndpoint(endpoint.to_string()))?;
        if raw.is_empty() {
            return Err(ExecutorError::UnsupportedEndpoint(endpoint.to_string()));
        }
        Ok(Self::new(shellexpand::tilde(raw).into_owned(), store))
    }

    pub fn work_root(&self) -> &Path {
        &self.work_root
    }

    fn set_status(records: &Records, id: &InvocationId, status: RemoteStatus) {
        let mut records = records.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(record) = records.get_mut(id) {
            record.status = status;
        }
    }
}

fn safe_relative(path: &str) -> Result<PathBuf> {
    let candidate = Path::new(path);
    let ok = !path.is_empty()
        && candidate
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !ok {
        return Err(ExecutorError::InvalidStagingPath(path.to_string()));
    }
    Ok(candidate.to_path_buf())
}

async fn create_log_files(dir: &Path) -> Result<(File, File)> {
    let stdout_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(logs::STDOUT))
        .await?;
    let stderr_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(logs::STDERR))
        .await?;
    Ok((stdout_file, stderr_file))
}

async fn materialize_inputs(
    store: &dyn ObjectStore,
    payload: &InvocationPayload,
    workdir: &Path,
) -> Result<()> {
    for input in &payload.inputs {
        let input_dir = workdir.join(dirs::INPUTS).join(safe_relative(&input.name)?);
        tokio::fs::create_dir_all(&input_dir).await?;
        for object in &input.objects {
            let dest = input_dir.join(safe_relative(&object.path)?);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let data = store
                .get(&object.key)
                .await?
                .ok_or_else(|| ExecutorError::MissingInputObject(object.key.clone()))?;
            tokio::fs::write(&dest, data).await?;
        }
    }
    Ok(())
}

async fn upload_outputs(store: &dyn ObjectStore, outputs_dir: &Path, prefix: &str) -> Result<usize> {
    let root = outputs_dir.to_path_buf();
    let files = tokio::task::spawn_blocking(move || {
        WalkDir::new(&root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                let rel = e.path().strip_prefix(&root).ok()?;
                let rel = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                Some((rel, e.path().to_path_buf()))
            })
            .collect::<Vec<_>>()
    })
    .await
    .map_err(|e| ExecutorError::Io(std::io::Error::other(e.to_string())))?;

    let prefix = prefix.trim_end_matches('/');
    for (rel, path) in &files {
        let data = tokio::fs::read(path).await?;
        store.put(&format!("{}/{}", prefix, rel), data).await?;
    }
    Ok(files.len())
}

/// Runs the script and returns its exit code, or `None` when cancelled.
async fn execute_script(
    store: Arc<dyn ObjectStore>,
    payload: &InvocationPayload,
    workdir: &Path,
    cancel: &CancellationToken,
) -> Result<Option<i32>> {
    tokio::fs::create_dir_all(workdir.join(dirs::OUTPUTS)).await?;
    tokio::fs::write(
        workdir.join(INVOCATION_FILE),
        serde_json::to_vec_pretty(payload)?,
    )
    .await?;
    materialize_inputs(store.as_ref(), payload, workdir).await?;

    let (stdout_log, stderr_log) = create_log_files(workdir).await?;
    let mut cmd = TokioCommand::new("sh");
    cmd.arg("-c")
        .arg(&payload.script)
        .current_dir(workdir)
        .envs(&payload.env)
        .stdout(stdout_log.into_std().await)
        .stderr(stderr_log.into_std().await)
        .kill_on_drop(true);

    tracing::info!(
        "Executing step '{}' attempt {} in '{}'",
        payload.step,
        payload.attempt,
        workdir.display()
    );
    tracing::debug!("[CMD] sh -c {}", payload.script);

    let mut child = cmd.spawn().map_err(|e| ExecutorError::CommandFailed {
        command: payload.script.clone(),
        source: e,
    })?;

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Ok(None);
        }
    };
    let code = status.code().unwrap_or(1);

    if code == 0 {
        let uploaded =
            upload_outputs(store.as_ref(), &workdir.join(dirs::OUTPUTS), &payload.output_prefix)
                .await?;
        tracing::debug!("Uploaded {} output files for '{}'", uploaded, payload.step);
    }
    for staged in [dirs::INPUTS, dirs::OUTPUTS] {
        let _ = tokio::fs::remove_dir_all(workdir.join(staged)).await;
    }
    Ok(Some(code))
}

#[async_trait]
impl ClusterRpc for ProcessCluster {
    async fn create_or_verify_service(
        &self,
        spec: &ServiceSpec,
    ) -> std::result::Result<ServiceRef, RpcError> {
        tokio::fs::create_dir_all(&self.work_root)
            .await
            .map_err(|e| RpcError::Unreachable(format!("{}: {}", self.work_root.display(), e)))?;
        let mut services = self.services.lock().unwrap_or_else(|p| p.into_inner());
        if services.insert(spec.name.clone()) {
            tracing::debug!("Registered local service '{}'", spec.name);
        }
        Ok(ServiceRef {
            name: spec.name.clone(),
        })
    }

    async fn invoke(
        &self,
        service: &ServiceRef,
        payload: &InvocationPayload,
    ) -> std::result::Result<InvocationId, RpcError> {
        let known = self
            .services
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&service.name);
        if !known {
            return Err(RpcError::Status {
                code: 404,
                message: format!("service '{}' does not exist", service.name),
            });
        }

        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let id = InvocationId(format!("{}-{}-{}", payload.step, payload.attempt, n));
        let workdir = self
            .work_root
            .join(payload.job_id.as_str())
            .join(&id.0);
        let cancel = CancellationToken::new();

        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(
                id.clone(),
                InvocationRecord {
                    status: RemoteStatus::new(RemoteState::Pending),
                    cancel: cancel.clone(),
                },
            );

        let records = self.records.clone();
        let store = self.store.clone();
        let payload = payload.clone();
        let task_id = id.clone();
        tokio::spawn(async move {
            Self::set_status(&records, &task_id, RemoteStatus::new(RemoteState::Running));
            let stderr_ref = workdir.join(logs::STDERR).display().to_string();
            let status = match execute_script(store, &payload, &workdir, &cancel).await {
                Ok(Some(0)) => RemoteStatus {
                    state: RemoteState::Succeeded,
                    exit_code: Some(0),
                    logs: Some(stderr_ref),
                },
                Ok(Some(code)) => RemoteStatus {
                    state: RemoteState::Failed,
                    exit_code: Some(code),
                    logs: Some(stderr_ref),
                },
                Ok(None) => RemoteStatus {
                    state: RemoteState::Failed,
                    exit_code: None,
                    logs: Some("cancelled".to_string()),
                },
                Err(e) => {
                    tracing::error!("Invocation {} failed: {}", task_id, e);
                    RemoteStatus {
                        state: RemoteState::Failed,
                        exit_code: None,
                        logs: Some(e.to_string()),
                    }
                }
            };
            Self::set_status(&records, &task_id, status);
        });

        Ok(id)
    }

    /// A terminal status is reported once; the record is dropped after that.
    async fn get_status(&self, id: &InvocationId) -> std::result::Result<RemoteStatus, RpcError> {
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        let status = records
            .get(id)
            .map(|r| r.status.clone())
            .ok_or_else(|| RpcError::UnknownInvocation(id.clone()))?;
        if status.state.is_terminal() {
            records.remove(id);
        }
        Ok(status)
    }

    async fn cancel(&self, id: &InvocationId) -> std::result::Result<(), RpcError> {
        let records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        let record = records
            .get(id)
            .ok_or_else(|| RpcError::UnknownInvocation(id.clone()))?;
        record.cancel.cancel();
        Ok(())
    }
}
