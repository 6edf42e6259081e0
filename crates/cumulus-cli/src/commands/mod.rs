use crate::cli::{ClusterArgs, ExecutionArgs};
use crate::error::CliError;
use cumulus_client::JobRequest;
use cumulus_core::config::{load_config, Config};
use cumulus_core::graph::StepGraph;
use cumulus_core::model::{ClusterConfig, ConcurrencyMode, Credentials, StorageConfig};
use std::path::{Path, PathBuf};

pub mod clusters;
pub mod run;
pub mod validate;

/// Loads the config file and layers the command-line flags on top.
pub fn resolve_config(
    path: Option<&Path>,
    cluster: &ClusterArgs,
    execution: &ExecutionArgs,
) -> Result<Config, CliError> {
    let mut config = load_config(path)?;
    apply_cluster_args(&mut config, cluster)?;
    apply_execution_args(&mut config, execution);
    config.execution.validate()?;
    Ok(config)
}

pub fn apply_cluster_args(config: &mut Config, args: &ClusterArgs) -> Result<(), CliError> {
    let Some(endpoint) = &args.endpoint else {
        if let Some(storage) = &args.storage {
            config.shared_storage = Some(StorageConfig::new(storage.clone()));
        }
        return Ok(());
    };

    let name = args
        .cluster_name
        .clone()
        .unwrap_or_else(|| cumulus_core::model::derive_cluster_name(endpoint));
    let credentials = Credentials::from_parts(
        &name,
        args.token.clone(),
        args.username.clone(),
        args.password.clone(),
    )?;
    let mut cluster = ClusterConfig::new(Some(name), endpoint.clone(), credentials)?;
    cluster.verify_tls = !args.disable_ssl;
    if let Some(storage) = &args.storage {
        cluster = cluster.with_storage(StorageConfig::new(storage.clone()));
    }

    if !config.clusters.is_empty() {
        tracing::info!(
            "--endpoint replaces {} configured cluster(s)",
            config.clusters.len()
        );
    }
    if !config.placement.is_empty() {
        tracing::warn!(
            "Ignoring {} [placement] binding(s): they name configured clusters",
            config.placement.len()
        );
        config.placement.clear();
    }
    config.clusters = vec![cluster];
    Ok(())
}

pub fn apply_execution_args(config: &mut Config, args: &ExecutionArgs) {
    let exec = &mut config.execution;
    if let Some(timeout) = args.timeout {
        exec.timeout_seconds = timeout;
    }
    if let Some(limit) = args.job_timeout {
        exec.job_timeout_seconds = Some(limit);
    }
    if let Some(retries) = args.max_retries {
        exec.max_retries = retries;
    }
    if args.serial {
        exec.mode = ConcurrencyMode::Sequential;
    }
    if let Some(n) = args.parallel {
        exec.mode = ConcurrencyMode::Parallel;
        exec.concurrency_ceiling = Some(n);
    }
    if let Some(policy) = args.on_error {
        exec.on_error = policy;
    }
}

pub fn read_workflow(path: &Path) -> Result<StepGraph, CliError> {
    let content = std::fs::read_to_string(path).map_err(|e| CliError::Workflow {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    StepGraph::from_json(&content).map_err(|e| CliError::Workflow {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

pub fn build_request(
    graph: StepGraph,
    config: &Config,
    inputs: &[(String, PathBuf)],
    output_dir: &Path,
) -> JobRequest {
    inputs
        .iter()
        .fold(JobRequest::new(graph, config, output_dir), |req, (name, path)| {
            req.with_input(name, path)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cumulus_core::model::OnError;

    #[test]
    fn test_endpoint_replaces_configured_clusters() {
        let mut config = cumulus_core::config::parse_config(
            r#"
[[clusters]]
name = "a"
endpoint = "https://a.example.org"
token = "x"

[placement]
prep = "a"
"#,
        )
        .unwrap();
        let args = ClusterArgs {
            endpoint: Some("https://oscar.example.org".into()),
            username: Some("u".into()),
            password: Some("p".into()),
            disable_ssl: true,
            storage: Some("memory://cli".into()),
            ..ClusterArgs::default()
        };

        apply_cluster_args(&mut config, &args).unwrap();

        assert_eq!(config.clusters.len(), 1);
        let cluster = &config.clusters[0];
        assert_eq!(cluster.name, "cluster-oscar.example.org");
        assert!(!cluster.verify_tls);
        assert_eq!(
            cluster.storage.as_ref().map(|s| s.endpoint.as_str()),
            Some("memory://cli")
        );
        assert!(config.placement.is_empty());
    }

    #[test]
    fn test_endpoint_without_credentials_is_rejected() {
        let mut config = Config::default();
        let args = ClusterArgs {
            endpoint: Some("https://oscar.example.org".into()),
            ..ClusterArgs::default()
        };
        assert!(matches!(
            apply_cluster_args(&mut config, &args),
            Err(CliError::Config(_))
        ));
    }

    #[test]
    fn test_storage_alone_sets_shared_storage() {
        let mut config = Config::default();
        let args = ClusterArgs {
            storage: Some("file:///srv/store".into()),
            ..ClusterArgs::default()
        };
        apply_cluster_args(&mut config, &args).unwrap();
        assert_eq!(
            config.shared_storage.map(|s| s.endpoint),
            Some("file:///srv/store".to_string())
        );
    }

    #[test]
    fn test_execution_flags_override_config() {
        let mut config = Config::default();
        let args = ExecutionArgs {
            timeout: Some(5),
            max_retries: Some(0),
            parallel: Some(3),
            on_error: Some(OnError::Continue),
            ..ExecutionArgs::default()
        };
        apply_execution_args(&mut config, &args);
        assert_eq!(config.execution.timeout_seconds, 5);
        assert_eq!(config.execution.max_retries, 0);
        assert_eq!(config.execution.effective_concurrency(), 3);
        assert!(config.execution.continue_on_error());

        apply_execution_args(
            &mut config,
            &ExecutionArgs {
                serial: true,
                ..ExecutionArgs::default()
            },
        );
        assert_eq!(config.execution.effective_concurrency(), 1);
    }
}
