//! Configuration management for the sync agent.
//!
//! Loads configuration from a TOML file with environment variable overrides
//! (`CLOUDSYNC__TASKS__MAX_CONCURRENT=8`). Loaded once at startup.

use crate::dispatch::RetryPolicy;
use crate::fs::walker::DEFAULT_MAX_DEPTH;
use crate::model::Backup;
use crate::utils::errors::{AgentError, Result};
use crate::watch::WatcherOptions;
use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub backups: Vec<BackupConfig>,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub watcher: WatcherConfig,

    #[serde(default)]
    pub tasks: TaskConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Unique agent identifier
    #[serde(default = "default_agent_id")]
    pub id: String,

    /// Working directory for the index and default mirror
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    pub name: String,
    pub root: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_index_kind")]
    pub kind: IndexKind,

    /// Database file (default: `<data_dir>/index.db`)
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RemoteConfig {
    /// Objects are files under `root/<backup>/`
    Mirror { root: PathBuf },

    /// Backup server reached over HTTP
    Http {
        url: String,

        /// Pre-shared key or JWT token
        #[serde(default)]
        token: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Watch directories created after startup
    #[serde(default = "default_true")]
    pub recursive: bool,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum directory depth below a backup root
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Change events buffered per bus subscriber
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Event workers feeding the engine
    #[serde(default = "default_event_workers")]
    pub event_workers: usize,

    /// Remote operations running at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Time running tasks get to finish on shutdown
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_api_host")]
    pub host: String,

    #[serde(default = "default_api_port")]
    pub port: u16,
}

// Default values
fn default_agent_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "cloudsync-agent-01".to_string())
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/cloudsync-agent")
}

fn default_index_kind() -> IndexKind {
    IndexKind::Sqlite
}

fn default_true() -> bool {
    true
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    3000
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

fn default_bus_capacity() -> usize {
    crate::events::DEFAULT_BUS_CAPACITY
}

fn default_event_workers() -> usize {
    4
}

fn default_max_concurrent() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_api_host() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    9991
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: default_agent_id(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            kind: default_index_kind(),
            path: None,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig::Mirror {
            root: default_data_dir().join("mirror"),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            recursive: true,
            initial_delay_ms: default_initial_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            max_depth: default_max_depth(),
            bus_capacity: default_bus_capacity(),
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            event_workers: default_event_workers(),
            max_concurrent: default_max_concurrent(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            agent: AgentConfig::default(),
            backups: Vec::new(),
            index: IndexConfig::default(),
            remote: RemoteConfig::default(),
            watcher: WatcherConfig::default(),
            tasks: TaskConfig::default(),
            log: LogConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl WatcherConfig {
    pub fn options(&self) -> WatcherOptions {
        WatcherOptions {
            recursive: self.recursive,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_depth: self.max_depth,
        }
    }
}

impl TaskConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply `CLOUDSYNC__*`
    /// environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml))
            .add_source(
                Environment::with_prefix("CLOUDSYNC")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Parse configuration from TOML text, without environment overrides
    pub fn from_toml(text: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Reject configurations the agent cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.backups.is_empty() {
            return Err(AgentError::Config("at least one backup must be configured".into()));
        }

        let mut names = HashSet::new();
        for backup in &self.backups {
            if backup.name.trim().is_empty() {
                return Err(AgentError::Config("backup names must not be empty".into()));
            }
            if !names.insert(backup.name.as_str()) {
                return Err(AgentError::Config(format!(
                    "duplicate backup name: {}",
                    backup.name
                )));
            }
            if !backup.root.is_absolute() {
                return Err(AgentError::Config(format!(
                    "backup {} root must be absolute: {}",
                    backup.name,
                    backup.root.display()
                )));
            }
        }

        if self.tasks.max_attempts == 0 {
            return Err(AgentError::Config("tasks.max_attempts must be at least 1".into()));
        }
        if self.watcher.poll_interval_ms == 0 {
            return Err(AgentError::Config("watcher.poll_interval_ms must be positive".into()));
        }
        if let RemoteConfig::Http { url, .. } = &self.remote {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(AgentError::Config(format!("invalid remote url: {}", url)));
            }
        }

        Ok(())
    }

    /// Configured backups, in declaration order
    pub fn backups(&self) -> Vec<Backup> {
        self.backups
            .iter()
            .map(|b| Backup::new(b.name.clone(), b.root.clone()))
            .collect()
    }

    pub fn index_path(&self) -> PathBuf {
        self.index
            .path
            .clone()
            .unwrap_or_else(|| self.agent.data_dir.join("index.db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[agent]
id = "nas-01"
data_dir = "/srv/cloudsync"

[[backups]]
name = "photos"
root = "/data/photos"

[[backups]]
name = "docs"
root = "/data/docs"

[index]
kind = "memory"

[remote]
kind = "http"
url = "https://backup.example.com"
token = "secret"

[watcher]
poll_interval_ms = 500

[tasks]
max_concurrent = 8
"#;

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_toml(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.agent.id, "nas-01");
        assert_eq!(
            config.backups(),
            vec![
                Backup::new("photos", "/data/photos"),
                Backup::new("docs", "/data/docs"),
            ]
        );
        assert_eq!(config.index.kind, IndexKind::Memory);
        assert!(matches!(config.remote, RemoteConfig::Http { ref token, .. } if token == "secret"));
        assert_eq!(config.watcher.options().poll_interval, Duration::from_millis(500));
        assert_eq!(config.watcher.initial_delay_ms, 1000);
        assert_eq!(config.tasks.max_concurrent, 8);
        assert_eq!(config.tasks.max_attempts, 5);
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = Config::from_toml(
            r#"
[[backups]]
name = "photos"
root = "/data/photos"
"#,
        )
        .unwrap();

        assert_eq!(config.index.kind, IndexKind::Sqlite);
        assert_eq!(config.index_path(), PathBuf::from("/var/lib/cloudsync-agent/index.db"));
        assert!(matches!(config.remote, RemoteConfig::Mirror { .. }));
        assert!(config.watcher.recursive);
        assert_eq!(config.watcher.max_depth, 10_000);
        assert_eq!(config.tasks.retry_policy().max_backoff, Duration::from_secs(30));
        assert_eq!(config.api.port, 9991);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_validation_rejects_bad_backups() {
        let mut config = Config::default();
        assert!(config.validate().is_err());

        config.backups.push(BackupConfig {
            name: "photos".into(),
            root: PathBuf::from("relative/photos"),
        });
        assert!(config.validate().is_err());

        config.backups[0].root = PathBuf::from("/data/photos");
        config.validate().unwrap();

        config.backups.push(BackupConfig {
            name: "photos".into(),
            root: PathBuf::from("/data/other"),
        });
        assert!(matches!(config.validate(), Err(AgentError::Config(_))));
    }

    #[test]
    fn test_from_file_reads_toml() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("agent.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.backups.len(), 2);
    }
}
