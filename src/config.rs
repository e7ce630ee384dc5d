//! Orchestrator configuration.
//!
//! Configuration sources (highest priority first):
//! 1. Command-line flags (each with an `ATC_*` environment fallback)
//! 2. Environment variables for paths (ATC_HOME, ATC_DATABASE)
//! 3. Config file (.atc/config.yaml)
//! 4. Defaults (~/.atc)
//!
//! Config file discovery:
//! - Searches current directory and parents for .atc/config.yaml
//! - Relative paths in the file are resolved against the .atc/ directory
//!
//! The resolved [`Config`] is built once at startup and handed to every
//! component; nothing reads configuration from globals.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub intervals: IntervalsConfig,
    #[serde(default)]
    pub build_lease_ttl_seconds: Option<u64>,
    #[serde(default)]
    pub noop: Option<bool>,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub static_worker: Option<StaticWorkerConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .atc/)
    pub home: Option<String>,
    /// SQLite database file (relative to .atc/)
    pub database: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IntervalsConfig {
    pub check_seconds: Option<u64>,
    pub scheduler_seconds: Option<u64>,
    pub sync_seconds: Option<u64>,
    pub tracker_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerConfig {
    pub dial_timeout_seconds: Option<u64>,
    pub keepalive_idle_seconds: Option<u64>,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetryConfig {
    pub base_seconds: Option<u64>,
    pub max_seconds: Option<u64>,
    pub budget_seconds: Option<u64>,
}

/// A worker registered at startup that never expires
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StaticWorkerConfig {
    pub name: String,
    pub addr: String,
    #[serde(default)]
    pub resource_types: Vec<String>,
    #[serde(default)]
    pub team: Option<String>,
}

/// Resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Absolute path to the state directory
    pub home: PathBuf,
    /// Path to the SQLite database
    pub database: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Default resource check interval
    pub check_interval: Duration,
    pub scheduler_interval: Duration,
    pub sync_interval: Duration,
    pub tracker_interval: Duration,
    /// TTL of `build:<id>` leases, renewed every third of it
    pub build_lease_ttl: Duration,
    /// Compute everything, dispatch and check nothing
    pub noop: bool,
    pub worker: WorkerSettings,
    pub static_worker: Option<StaticWorkerConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub dial_timeout: Duration,
    /// Idle time before TCP keep-alive starts. Count and spacing of the
    /// keep-alive packets follow the kernel.
    pub keepalive_idle: Duration,
    pub retry: RetrySettings,
}

/// Exponential backoff for worker calls
#[derive(Debug, Clone, PartialEq)]
pub struct RetrySettings {
    pub base: Duration,
    pub max: Duration,
    /// Total time spent retrying before giving up
    pub budget: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            keepalive_idle: Duration::from_secs(10),
            retry: RetrySettings::default(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(16),
            budget: Duration::from_secs(300),
        }
    }
}

impl Config {
    /// Defaults rooted at `home`
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            database: home.join("atc.db"),
            home,
            config_file: None,
            check_interval: Duration::from_secs(60),
            scheduler_interval: Duration::from_secs(10),
            sync_interval: Duration::from_secs(10),
            tracker_interval: Duration::from_secs(10),
            build_lease_ttl: Duration::from_secs(30),
            noop: false,
            worker: WorkerSettings::default(),
            static_worker: None,
        }
    }

    /// Load configuration from the environment and the nearest config file
    pub fn load() -> Result<Self> {
        let config_file = find_config_file();
        resolve(config_file.as_deref())
    }

    /// Make sure the state directory exists
    pub fn ensure_home(&self) -> Result<()> {
        std::fs::create_dir_all(&self.home)
            .with_context(|| format!("Failed to create {}", self.home.display()))?;
        if let Some(parent) = self.database.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Ok(())
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".atc").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn seconds(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_secs).unwrap_or(default)
}

/// Build the configuration from an optional config file plus environment
fn resolve(config_path: Option<&Path>) -> Result<Config> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".atc");

    let file = match config_path {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };
    let atc_dir = config_path
        .and_then(|p| p.parent())
        .unwrap_or(Path::new("."));

    let home = if let Ok(env_home) = std::env::var("ATC_HOME") {
        PathBuf::from(env_home)
    } else if let Some(ref home_path) = file.paths.home {
        resolve_path(atc_dir, home_path)
    } else {
        default_home
    };

    let mut config = Config::with_home(home);
    config.config_file = config_path.map(Path::to_path_buf);

    if let Ok(env_db) = std::env::var("ATC_DATABASE") {
        config.database = PathBuf::from(env_db);
    } else if let Some(ref db_path) = file.paths.database {
        config.database = resolve_path(atc_dir, db_path);
    }

    let intervals = &file.intervals;
    config.check_interval = seconds(intervals.check_seconds, config.check_interval);
    config.scheduler_interval = seconds(intervals.scheduler_seconds, config.scheduler_interval);
    config.sync_interval = seconds(intervals.sync_seconds, config.sync_interval);
    config.tracker_interval = seconds(intervals.tracker_seconds, config.tracker_interval);
    config.build_lease_ttl = seconds(file.build_lease_ttl_seconds, config.build_lease_ttl);
    config.noop = file.noop.unwrap_or(false);

    let worker = &file.worker;
    let defaults = WorkerSettings::default();
    config.worker = WorkerSettings {
        dial_timeout: seconds(worker.dial_timeout_seconds, defaults.dial_timeout),
        keepalive_idle: seconds(worker.keepalive_idle_seconds, defaults.keepalive_idle),
        retry: RetrySettings {
            base: seconds(worker.retry.base_seconds, defaults.retry.base),
            max: seconds(worker.retry.max_seconds, defaults.retry.max),
            budget: seconds(worker.retry.budget_seconds, defaults.retry.budget),
        },
    };
    config.static_worker = file.static_worker;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::with_home("/srv/atc");

        assert_eq!(config.database, PathBuf::from("/srv/atc/atc.db"));
        assert_eq!(config.check_interval, Duration::from_secs(60));
        assert_eq!(config.scheduler_interval, Duration::from_secs(10));
        assert_eq!(config.worker.dial_timeout, Duration::from_secs(5));
        assert_eq!(config.worker.keepalive_idle, Duration::from_secs(10));
        assert_eq!(config.worker.retry.max, Duration::from_secs(16));
        assert_eq!(config.worker.retry.budget, Duration::from_secs(300));
        assert!(!config.noop);
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let atc_dir = temp.path().join(".atc");
        std::fs::create_dir_all(&atc_dir).unwrap();

        let config_path = atc_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
paths:
  database: state/atc.db
intervals:
  check_seconds: 30
  sync_seconds: 2
noop: true
worker:
  keepalive_idle_seconds: 20
  retry:
    budget_seconds: 60
static_worker:
  name: local
  addr: http://127.0.0.1:7777
  resource_types: [git, time]
"#
        )
        .unwrap();

        let parsed = load_config_file(&config_path).unwrap();
        assert_eq!(parsed.paths.database.as_deref(), Some("state/atc.db"));
        assert_eq!(parsed.intervals.check_seconds, Some(30));

        let config = resolve(Some(&config_path)).unwrap();
        assert_eq!(config.check_interval, Duration::from_secs(30));
        assert_eq!(config.sync_interval, Duration::from_secs(2));
        assert_eq!(config.tracker_interval, Duration::from_secs(10));
        assert_eq!(config.worker.retry.budget, Duration::from_secs(60));
        assert_eq!(config.worker.keepalive_idle, Duration::from_secs(20));
        assert_eq!(config.worker.retry.base, Duration::from_secs(1));
        assert!(config.noop);
        assert_eq!(config.config_file.as_deref(), Some(config_path.as_path()));

        let worker = config.static_worker.unwrap();
        assert_eq!(worker.name, "local");
        assert_eq!(worker.resource_types, vec!["git", "time"]);
        assert!(worker.team.is_none());
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project/.atc");

        assert_eq!(
            resolve_path(&base, "./state"),
            PathBuf::from("/home/user/project/.atc/state")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
