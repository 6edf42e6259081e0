use crate::{ObjectStore, Result, StorageError};
use cumulus_core::constants::prefixes;
use cumulus_core::model::JobId;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Area {
    Input,
    Output,
    Mount,
}

impl Area {
    pub fn prefix(self) -> &'static str {
        match self {
            Area::Input => prefixes::INPUT,
            Area::Output => prefixes::OUTPUT,
            Area::Mount => prefixes::MOUNT,
        }
    }

    pub const ALL: [Area; 3] = [Area::Input, Area::Output, Area::Mount];
}

/// Where a job's objects live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageScope {
    /// The endpoint every configured cluster can reach.
    Shared,
    /// The object store of the only configured cluster.
    ClusterLocal { cluster: String },
}

impl fmt::Display for StorageScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageScope::Shared => write!(f, "shared"),
            StorageScope::ClusterLocal { cluster } => write!(f, "local to '{}'", cluster),
        }
    }
}

/// A logical key inside one job's namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageLocation {
    pub area: Area,
    pub job: JobId,
    pub path: String,
}

impl StorageLocation {
    pub fn key(&self) -> String {
        if self.path.is_empty() {
            format!("{}/{}/", self.area.prefix(), self.job)
        } else {
            format!("{}/{}/{}", self.area.prefix(), self.job, self.path)
        }
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PurgeReport {
    pub deleted: usize,
    pub failed: Vec<(String, String)>,
}

/// A store restricted to one job's `input/`, `output/` and `mount/` namespaces.
#[derive(Clone)]
pub struct JobStorage {
    store: Arc<dyn ObjectStore>,
    job: JobId,
    scope: StorageScope,
}

impl fmt::Debug for JobStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobStorage")
            .field("store", &self.store.describe())
            .field("job", &self.job)
            .field("scope", &self.scope)
            .finish()
    }
}

impl JobStorage {
    pub fn new(store: Arc<dyn ObjectStore>, job: JobId, scope: StorageScope) -> Self {
        Self { store, job, scope }
    }

    pub fn job(&self) -> &JobId {
        &self.job
    }

    pub fn scope(&self) -> &StorageScope {
        &self.scope
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn location(&self, area: Area, path: impl Into<String>) -> StorageLocation {
        StorageLocation {
            area,
            job: self.job.clone(),
            path: path.into(),
        }
    }

    pub fn namespace(&self, area: Area) -> String {
        self.location(area, "").key()
    }

    pub fn input_prefix(&self, input: &str) -> String {
        format!("{}/", self.location(Area::Input, input).key())
    }

    pub fn input_key(&self, input: &str, file: &str) -> String {
        self.location(Area::Input, format!("{}/{}", input, file))
            .key()
    }

    pub fn output_prefix(&self, step: &str) -> String {
        format!("{}/", self.location(Area::Output, step).key())
    }

    pub fn mount_key(&self, file: &str) -> String {
        self.location(Area::Mount, file).key()
    }

    fn check(&self, key: &str) -> Result<()> {
        let inside = Area::ALL
            .iter()
            .any(|area| key.starts_with(&self.namespace(*area)));
        if !inside {
            return Err(StorageError::OutsideNamespace {
                key: key.to_string(),
                job: self.job.to_string(),
            });
        }
        Ok(())
    }

    pub async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.check(key)?;
        self.store.put(key, data).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check(key)?;
        self.store.get(key).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.check(key)?;
        self.store.exists(key).await
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.check(prefix)?;
        self.store.list(prefix).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.check(key)?;
        self.store.delete(key).await
    }

    pub async fn put_file(&self, key: &str, path: &Path) -> Result<u64> {
        self.check(key)?;
        let data = tokio::fs::read(path)
            .await
            .map_err(|source| StorageError::LocalFile {
                path: path.to_path_buf(),
                source,
            })?;
        let size = data.len() as u64;
        self.store.put(key, data).await?;
        Ok(size)
    }

    /// Uploads every file under `dir`, keyed by its path relative to `dir`.
    pub async fn put_dir(&self, prefix: &str, dir: &Path) -> Result<Vec<String>> {
        let root = dir.to_path_buf();
        let files = tokio::task::spawn_blocking(move || -> Result<Vec<(String, PathBuf)>> {
            let mut files = Vec::new();
            for entry in WalkDir::new(&root).sort_by_file_name() {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let rel = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                files.push((rel, entry.path().to_path_buf()));
            }
            Ok(files)
        })
        .await
        .map_err(|e| StorageError::Join(e.to_string()))??;

        let prefix = prefix.trim_end_matches('/');
        let mut keys = Vec::with_capacity(files.len());
        for (rel, path) in files {
            let key = format!("{}/{}", prefix, rel);
            self.put_file(&key, &path).await?;
            keys.push(key);
        }
        Ok(keys)
    }

    /// Downloads `key` into `dest`; `Ok(None)` when the object is missing.
    pub async fn get_to_file(&self, key: &str, dest: &Path) -> Result<Option<Vec<u8>>> {
        let Some(data) = self.get(key).await? else {
            return Ok(None);
        };
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::LocalFile {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(dest, &data)
            .await
            .map_err(|source| StorageError::LocalFile {
                path: dest.to_path_buf(),
                source,
            })?;
        Ok(Some(data))
    }

    /// Deletes every object under `prefix`; returns how many were removed.
    pub async fn clear_prefix(&self, prefix: &str) -> Result<usize> {
        let keys = self.list(prefix).await?;
        for key in &keys {
            self.store.delete(key).await?;
        }
        Ok(keys.len())
    }

    /// Best-effort removal of every object the job created.
    pub async fn purge(&self) -> PurgeReport {
        let mut report = PurgeReport::default();
        for area in Area::ALL {
            let namespace = self.namespace(area);
            let keys = match self.store.list(&namespace).await {
                Ok(keys) => keys,
                Err(e) => {
                    report.failed.push((namespace, e.to_string()));
                    continue;
                }
            };
            for key in keys {
                match self.store.delete(&key).await {
                    Ok(()) => report.deleted += 1,
                    Err(e) => report.failed.push((key, e.to_string())),
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryObjectStore;

    fn storage(job: &str) -> (Arc<MemoryObjectStore>, JobStorage) {
        let store = Arc::new(MemoryObjectStore::new("job-tests"));
        let js = JobStorage::new(store.clone(), JobId(job.into()), StorageScope::Shared);
        (store, js)
    }

    #[test]
    fn test_key_layout() {
        let (_, js) = storage("j1");
        assert_eq!(js.input_key("reads", "a.fq"), "input/j1/reads/a.fq");
        assert_eq!(js.input_prefix("reads"), "input/j1/reads/");
        assert_eq!(js.output_prefix("align"), "output/j1/align/");
        assert_eq!(js.mount_key("workflow.json"), "mount/j1/workflow.json");
        assert_eq!(js.namespace(Area::Output), "output/j1/");
    }

    #[tokio::test]
    async fn test_rejects_foreign_namespace() {
        let (store, js) = storage("j1");
        store.put("output/j2/a/x", b"x".to_vec()).await.unwrap();
        assert!(matches!(
            js.get("output/j2/a/x").await,
            Err(StorageError::OutsideNamespace { .. })
        ));
        assert!(matches!(
            js.put("elsewhere/j1/x", vec![]).await,
            Err(StorageError::OutsideNamespace { .. })
        ));
    }

    #[tokio::test]
    async fn test_job_prefix_does_not_match_longer_job_id() {
        let (store, js) = storage("j1");
        store.put("output/j10/a/x", b"x".to_vec()).await.unwrap();
        assert!(js.list("output/j1/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_purge_leaves_other_jobs() {
        let (store, js) = storage("j1");
        js.put(&js.input_key("in", "f"), b"1".to_vec()).await.unwrap();
        js.put(&js.mount_key("workflow.json"), b"{}".to_vec())
            .await
            .unwrap();
        js.put("output/j1/s/o", b"2".to_vec()).await.unwrap();
        store.put("output/other/s/o", b"3".to_vec()).await.unwrap();

        let report = js.purge().await;
        assert_eq!(report.deleted, 3);
        assert!(report.failed.is_empty());
        assert_eq!(
            store.snapshot().await.keys().cloned().collect::<Vec<_>>(),
            vec!["output/other/s/o".to_string()]
        );
    }

    #[tokio::test]
    async fn test_purge_reports_failures_without_error() {
        let (store, js) = storage("j1");
        js.put("mount/j1/f", b"1".to_vec()).await.unwrap();
        store.set_offline(true);
        let report = js.purge().await;
        assert_eq!(report.deleted, 0);
        assert_eq!(report.failed.len(), 3);
    }
}
