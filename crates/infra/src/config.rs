//! Service configuration.
//!
//! Loaded from the TOML file named by `LCBACKUP_CONFIG` (all keys optional),
//! then overridden by `DATABASE_URL` and `LCBACKUP_BIND`.
//!
//! ```toml
//! bind = "0.0.0.0:8080"
//!
//! [runner]
//! workers = 2
//! poll_interval_ms = 500
//! lock_ttl_secs = 600
//! retain_finished_secs = 604800
//!
//! [database]
//! url = "postgres://localhost/moodle"
//! table_prefix = "mdl_"
//!
//! [storage]
//! blob_root = "/var/lib/lcbackup/blobs"
//!
//! [archive]
//! command = ["/usr/local/bin/course-archiver"]
//!
//! [[courses]]
//! id = 42
//! shortname = "BIO101"
//! fullname = "Introductory Biology"
//!
//! [upload]
//! bucket = "course-backups"
//! region = "ap-southeast-2"
//! key_prefix = "lifecycle/"
//! credentials = { mode = "ambient" }
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};

use lcbackup_core::{Course, S3Settings};

use crate::jobs::RunnerConfig;

pub const CONFIG_ENV: &str = "LCBACKUP_CONFIG";
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";
pub const BIND_ENV: &str = "LCBACKUP_BIND";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {message}")]
    Io { path: PathBuf, message: String },
    #[error("cannot parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bind: String,
    pub runner: RunnerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub archive: ArchiveConfig,
    /// Default remote store for step instances that name none.
    pub upload: Option<S3Settings>,
    /// Seed of the in-memory course directory, used without a database.
    pub courses: Vec<Course>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            runner: RunnerConfig::default(),
            database: DatabaseConfig::default(),
            storage: StorageConfig::default(),
            archive: ArchiveConfig::default(),
            upload: None,
            courses: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// In-memory stores when unset.
    pub url: Option<String>,
    pub max_connections: u32,
    /// Prefix of the host's tables (`<prefix>course`).
    pub table_prefix: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
            table_prefix: "mdl_".to_string(),
        }
    }
}

impl DatabaseConfig {
    pub fn course_table(&self) -> String {
        format!("{}course", self.table_prefix)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Blobs stay in memory when unset.
    pub blob_root: Option<PathBuf>,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Archive engine command line; the built-in manifest engine when empty.
    pub command: Vec<String>,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "restore_timeout_secs")]
    pub restore_timeout: Duration,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            restore_timeout: Duration::from_secs(600),
        }
    }
}

impl AppConfig {
    /// Load from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        Self::load_with(path.as_deref(), |key| std::env::var(key).ok())
    }

    /// Load from `path` (if any) with `env` as the override source.
    pub fn load_with(path: Option<&Path>, env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })?;
                Self::from_toml(&raw)?
            }
            None => Self::default(),
        };

        if let Some(url) = env(DATABASE_URL_ENV).filter(|v| !v.trim().is_empty()) {
            config.database.url = Some(url);
        }
        if let Some(bind) = env(BIND_ENV).filter(|v| !v.trim().is_empty()) {
            config.bind = bind;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("bind address {:?}: {e}", self.bind)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr()?;

        let runner = &self.runner;
        if runner.workers == 0 {
            return Err(ConfigError::Invalid("runner.workers must be at least 1".to_string()));
        }
        if runner.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("runner.poll_interval_ms must be positive".to_string()));
        }
        if runner.purge_interval.is_zero() {
            return Err(ConfigError::Invalid("runner.purge_interval_secs must be positive".to_string()));
        }
        if runner.lock_ttl <= runner.archive_timeout + runner.upload_timeout {
            return Err(ConfigError::Invalid(
                "runner.lock_ttl_secs must exceed archive_timeout_secs + upload_timeout_secs".to_string(),
            ));
        }

        let prefix = &self.database.table_prefix;
        if !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(ConfigError::Invalid(format!("database.table_prefix {prefix:?} is not an identifier")));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::Invalid("database.max_connections must be at least 1".to_string()));
        }
        if self.database.url.is_some() && self.archive.command.is_empty() {
            return Err(ConfigError::Invalid(
                "archive.command is required when database.url is set".to_string(),
            ));
        }
        if let Some(course) = self.courses.iter().find(|c| c.id.ensure_valid().is_err()) {
            return Err(ConfigError::Invalid(format!("courses: invalid course id {}", course.id)));
        }

        if let Some(upload) = &self.upload {
            upload
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("upload: {e}")))?;
        }
        Ok(())
    }
}
