use cumulus_core::graph::StepGraph;
use std::fs;
use std::path::{Path, PathBuf};

/// A throwaway directory tree for one test: a work root for local clusters,
/// a filesystem object store, an output directory and a config home.
pub struct TestContext {
    pub _temp_dir: tempfile::TempDir,
    pub test_root: PathBuf,
    pub work_dir: PathBuf,
    pub store_dir: PathBuf,
    pub output_dir: PathBuf,
    pub config_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl TestContext {
    pub fn new() -> Self {
        let temp_dir = tempfile::Builder::new()
            .prefix("cumulus-test-")
            .tempdir()
            .expect("Failed to create temp dir");
        let test_root = temp_dir.path().to_path_buf();

        let work_dir = test_root.join("work");
        let store_dir = test_root.join("store");
        let output_dir = test_root.join("out");
        let config_dir = test_root.join("config");
        let cache_dir = test_root.join("cache");
        for dir in [&work_dir, &store_dir, &config_dir, &cache_dir] {
            fs::create_dir_all(dir).expect("Failed to create test dir");
        }
        fs::create_dir_all(config_dir.join("cumulus")).expect("Failed to create config subdir");

        Self {
            _temp_dir: temp_dir,
            test_root,
            work_dir,
            store_dir,
            output_dir,
            config_dir,
            cache_dir,
        }
    }

    pub fn local_endpoint(&self) -> String {
        format!("local://{}", self.work_dir.display())
    }

    pub fn store_endpoint(&self) -> String {
        format!("file://{}", self.store_dir.display())
    }

    /// A config with one local cluster whose storage is the test store.
    pub fn local_config(&self) -> String {
        format!(
            r#"
[execution]
timeout_seconds = 30
max_retries = 0
poll_interval_ms = 20
poll_max_interval_ms = 100
retry_delay_ms = 10

[[clusters]]
name = "local"
endpoint = "{}"
token = "local-token"

[clusters.storage]
endpoint = "{}"
"#,
            self.local_endpoint(),
            self.store_endpoint()
        )
    }

    pub fn write_config(&self, content: &str) -> PathBuf {
        let path = self.config_dir.join("cumulus").join("config.toml");
        fs::write(&path, content).expect("Failed to write config");
        path
    }

    pub fn write_workflow(&self, graph: &StepGraph) -> PathBuf {
        let path = self.test_root.join("workflow.json");
        let json = serde_json::to_string_pretty(graph).expect("Failed to serialize graph");
        fs::write(&path, json).expect("Failed to write workflow");
        path
    }

    pub fn write_input(&self, name: &str, content: &str) -> PathBuf {
        let path = self.test_root.join("inputs").join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create input dir");
        }
        fs::write(&path, content).expect("Failed to write input");
        path
    }

    pub fn output(&self, name: &str) -> PathBuf {
        self.output_dir.join(name)
    }

    pub fn read_output(&self, name: &str) -> String {
        fs::read_to_string(self.output(name))
            .unwrap_or_else(|e| panic!("Failed to read output '{}': {}", name, e))
    }

    /// Files left in the object store, relative to its root.
    pub fn stored_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        collect_files(&self.store_dir, &self.store_dir, &mut files);
        files.sort();
        files
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out);
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_path_buf());
        }
    }
}
