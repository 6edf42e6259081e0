use crate::constants::{defaults, dirs, files};
use crate::errors::ConfigError;
use crate::model::{ClusterConfig, ConcurrencyMode, OnError, StorageConfig};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub shared_storage: Option<StorageConfig>,
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
    /// Job-level bindings, step name to cluster name.
    #[serde(default)]
    pub placement: BTreeMap<String, String>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionConfig {
    pub timeout_seconds: u64,
    pub job_timeout_seconds: Option<u64>,
    pub max_retries: u32,
    pub concurrency_ceiling: Option<usize>,
    pub mode: ConcurrencyMode,
    pub on_error: OnError,
    pub poll_interval_ms: u64,
    pub poll_max_interval_ms: u64,
    pub retry_delay_ms: u64,
    pub cancel_grace_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: defaults::TIMEOUT_SECONDS,
            job_timeout_seconds: None,
            max_retries: defaults::MAX_RETRIES,
            concurrency_ceiling: None,
            mode: ConcurrencyMode::default(),
            on_error: OnError::default(),
            poll_interval_ms: defaults::POLL_INTERVAL_MS,
            poll_max_interval_ms: defaults::POLL_MAX_INTERVAL_MS,
            retry_delay_ms: defaults::RETRY_DELAY_MS,
            cancel_grace_ms: defaults::CANCEL_GRACE_MS,
        }
    }
}

impl ExecutionConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_seconds.map(Duration::from_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_max_interval(&self) -> Duration {
        Duration::from_millis(self.poll_max_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn continue_on_error(&self) -> bool {
        self.on_error == OnError::Continue
    }

    /// Number of tasks allowed in flight at once.
    pub fn effective_concurrency(&self) -> usize {
        match self.mode {
            ConcurrencyMode::Sequential => 1,
            ConcurrencyMode::Parallel => self
                .concurrency_ceiling
                .unwrap_or_else(num_cpus::get)
                .max(1),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "execution.timeout_seconds".into(),
                reason: "must be greater than zero".into(),
            });
        }
        if self.job_timeout_seconds == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "execution.job_timeout_seconds".into(),
                reason: "must be greater than zero".into(),
            });
        }
        if self.concurrency_ceiling == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "execution.concurrency_ceiling".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "execution.poll_interval_ms".into(),
                reason: "must be greater than zero".into(),
            });
        }
        if self.poll_max_interval_ms < self.poll_interval_ms {
            return Err(ConfigError::InvalidValue {
                field: "execution.poll_max_interval_ms".into(),
                reason: format!(
                    "must not be smaller than poll_interval_ms ({})",
                    self.poll_interval_ms
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub max_files: usize,
    pub max_age_days: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            max_files: defaults::LOG_MAX_FILES,
            max_age_days: defaults::LOG_MAX_AGE_DAYS,
        }
    }
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix(dirs::APP);
    let config_home = xdg_dirs
        .get_config_home()
        .ok_or(ConfigError::ConfigHomeNotFound)?;
    Ok(config_home.join(files::CONFIG))
}

pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(content)?;
    config.execution.validate()?;
    Ok(config)
}

/// Loads `path`, or the XDG default. A missing default file yields defaults;
/// a missing explicit file is an error.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let (path, explicit) = match path {
        Some(p) => (expand_path(p), true),
        None => (default_config_path()?, false),
    };

    if !path.exists() {
        if explicit {
            return Err(ConfigError::PathIo {
                path,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
            });
        }
        tracing::debug!(
            "No configuration file at '{}', using defaults.",
            path.display()
        );
        return Ok(Config::default());
    }

    let content = fs::read_to_string(&path).map_err(|source| ConfigError::PathIo {
        path: path.clone(),
        source,
    })?;
    tracing::debug!("Loaded configuration from '{}'", path.display());
    parse_config(&content)
}

pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&raw).into_owned())
}
