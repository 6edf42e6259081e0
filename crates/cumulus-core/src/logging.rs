use crate::config::LoggingConfig;
use crate::constants::{dirs, env as env_vars, logs};
use crate::errors::ConfigError;
use chrono::{Local, NaiveDate, TimeZone};
use std::env;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tracing::Level;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl From<u8> for LogLevel {
    fn from(val: u8) -> Self {
        match val {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

static DEFAULT_LOG_LEVEL: Mutex<LogLevel> = Mutex::new(LogLevel::Info);

pub fn set_log_level(level: LogLevel) {
    if let Ok(mut default_level) = DEFAULT_LOG_LEVEL.lock() {
        *default_level = level;
    }
}

pub fn set_log_level_from_env() {
    if let Ok(level) = env::var(env_vars::LOG_LEVEL) {
        match level.to_uppercase().as_str() {
            "TRACE" => set_log_level(LogLevel::Trace),
            "DEBUG" => set_log_level(LogLevel::Debug),
            "INFO" => set_log_level(LogLevel::Info),
            "WARN" => set_log_level(LogLevel::Warn),
            "ERROR" => set_log_level(LogLevel::Error),
            _ => {}
        }
    }
}

fn default_log_level() -> LogLevel {
    DEFAULT_LOG_LEVEL
        .lock()
        .map(|level| *level)
        .unwrap_or(LogLevel::Info)
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_log_level().as_filter()))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

struct LocalTimeFormatter;

impl FormatTime for LocalTimeFormatter {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S"))
    }
}

/// Session files are named `<prefix><YYYY-MM-DD>_<HH-MM-SS>_<pid>.log`.
fn session_file_date(path: &Path, prefix: &str) -> Option<NaiveDate> {
    let name = path.file_name()?.to_str()?;
    let date = name.strip_prefix(prefix)?.split('_').next()?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

fn rotate_logs(log_dir: &Path, prefix: &str, config: &LoggingConfig) -> Result<(), ConfigError> {
    fs::create_dir_all(log_dir)?;

    let mut entries: Vec<PathBuf> = fs::read_dir(log_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(prefix) && n.ends_with(".log"))
        })
        .collect();
    entries.sort();

    if config.max_files > 0 && entries.len() > config.max_files {
        let excess = entries.len() - config.max_files;
        for path in entries.drain(0..excess) {
            let _ = fs::remove_file(path);
        }
    }

    if config.max_age_days > 0 {
        let max_age = Duration::from_secs(config.max_age_days * 24 * 60 * 60);
        let now = SystemTime::now();
        for path in &entries {
            let Some(date) = session_file_date(path, prefix) else {
                continue;
            };
            let Some(midnight) = date
                .and_hms_opt(0, 0, 0)
                .and_then(|dt| Local.from_local_datetime(&dt).earliest())
            else {
                continue;
            };
            let expired = now
                .duration_since(SystemTime::from(midnight))
                .is_ok_and(|age| age > max_age);
            if expired {
                let _ = fs::remove_file(path);
            }
        }
    }

    Ok(())
}

fn init_file_subscriber(log_path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(Mutex::new(log_file))
        .with_timer(LocalTimeFormatter)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_level(true);

    let registry = tracing_subscriber::registry()
        .with(env_filter())
        .with(file_layer);

    let result = if env::var(env_vars::LOG_TEE).is_ok() {
        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_timer(LocalTimeFormatter)
            .with_ansi(false)
            .with_target(false)
            .with_level(true);
        registry.with(stderr_layer).try_init()
    } else {
        registry.try_init()
    };
    if let Err(e) = result {
        return Err(ConfigError::General(format!(
            "Failed to install logger: {}",
            e
        )));
    }

    tracing::info!("--- Logger Initialized ---");
    Ok(())
}

/// Writes the session log under `$XDG_CACHE_HOME/cumulus/logs` and points
/// `cumulus.log` at it.
pub fn init_session_logger(config: &LoggingConfig) -> Result<PathBuf, ConfigError> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix(dirs::APP);
    let cache_home = xdg_dirs.get_cache_home().ok_or_else(|| {
        ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Could not find cache home directory",
        ))
    })?;
    init_session_logger_in(&cache_home, config)
}

pub fn init_session_logger_in(
    cache_home: &Path,
    config: &LoggingConfig,
) -> Result<PathBuf, ConfigError> {
    let logs_dir = cache_home.join(dirs::LOGS);
    rotate_logs(&logs_dir, logs::SESSION_PREFIX, config)?;

    let filename = format!(
        "{}{}_{}.log",
        logs::SESSION_PREFIX,
        Local::now().format("%Y-%m-%d_%H-%M-%S"),
        std::process::id()
    );
    let log_path = logs_dir.join(&filename);
    init_file_subscriber(&log_path)?;

    let link = cache_home.join(logs::SESSION_LINK);
    let _ = fs::remove_file(&link);
    #[cfg(unix)]
    {
        let _ = std::os::unix::fs::symlink(Path::new(dirs::LOGS).join(&filename), &link);
    }

    Ok(log_path)
}

pub fn init_stderr_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .with_timer(LocalTimeFormatter)
        .with_ansi(true)
        .with_target(false)
        .with_level(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::fs::File;
    use tempfile::tempdir;

    #[test]
    fn test_rotate_logs_max_files() {
        let dir = tempdir().unwrap();
        let path = dir.path();

        let filenames = [
            "cumulus_2024-01-01_10-00-00_1.log",
            "cumulus_2024-01-02_10-00-00_1.log",
            "cumulus_2024-01-03_10-00-00_1.log",
            "cumulus_2024-01-04_10-00-00_1.log",
        ];
        for name in &filenames {
            File::create(path.join(name)).unwrap();
        }
        File::create(path.join("notes.txt")).unwrap();

        let config = LoggingConfig {
            max_files: 2,
            max_age_days: 0,
        };
        rotate_logs(path, "cumulus_", &config).unwrap();

        assert!(!path.join(filenames[0]).exists());
        assert!(!path.join(filenames[1]).exists());
        assert!(path.join(filenames[2]).exists());
        assert!(path.join(filenames[3]).exists());
        assert!(path.join("notes.txt").exists(), "foreign files are kept");
    }

    #[test]
    fn test_rotate_logs_max_age() {
        let dir = tempdir().unwrap();
        let path = dir.path();
        let now = Local::now();

        let fresh = format!("cumulus_{}_10-00-00_1.log", now.format("%Y-%m-%d"));
        let stale = format!(
            "cumulus_{}_10-00-00_1.log",
            (now - ChronoDuration::days(30)).format("%Y-%m-%d")
        );
        File::create(path.join(&fresh)).unwrap();
        File::create(path.join(&stale)).unwrap();

        let config = LoggingConfig {
            max_files: 0,
            max_age_days: 7,
        };
        rotate_logs(path, "cumulus_", &config).unwrap();

        assert!(path.join(&fresh).exists());
        assert!(!path.join(&stale).exists());
    }

    #[test]
    fn test_session_file_date() {
        let date = session_file_date(
            Path::new("/tmp/cumulus_2024-03-05_01-02-03_99.log"),
            "cumulus_",
        );
        assert_eq!(date, NaiveDate::from_ymd_opt(2024, 3, 5));
        assert_eq!(session_file_date(Path::new("other.log"), "cumulus_"), None);
    }

    #[test]
    fn test_log_level_from_u8() {
        assert_eq!(LogLevel::from(0), LogLevel::Error);
        assert_eq!(LogLevel::from(9), LogLevel::Trace);
        assert_eq!(Level::from(LogLevel::Warn), Level::WARN);
    }
}
