//! Substrate configuration with hierarchical merging.
//!
//! Precedence (lowest to highest): programmatic defaults, the global
//! config file at `~/.config/apiary/config.yaml`, then `APIARY_*`
//! environment variables.

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::services::deferred::DeferredConfig;
use crate::services::lock::LockConfig;
use crate::services::mailbox::MailConfig;
use crate::services::memory::MemoryConfig;
use crate::services::reservations::ReservationConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(u32),

    #[error("Invalid max_inbox_limit: {0}. Must be at least 1")]
    InvalidInboxLimit(i64),

    #[error("Invalid ttl_seconds: {0}. Must be positive")]
    InvalidTtl(i64),

    #[error("Invalid poll_interval_ms: {0}. Must be positive")]
    InvalidPollInterval(u64),

    #[error("Configuration extraction failed: {0}")]
    ExtractionFailed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the shared embedded database file.
    pub path: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path().to_string_lossy().into_owned(),
            max_connections: 5,
            min_connections: 1,
        }
    }
}

impl DatabaseConfig {
    pub fn url(&self) -> String {
        if self.path == ":memory:" || self.path.starts_with("sqlite:") {
            self.path.clone()
        } else {
            format!("sqlite://{}", self.path)
        }
    }
}

/// Connection details for the optional inference service.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InferenceSettings {
    pub host: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub inference: InferenceSettings,
    pub mail: MailConfig,
    pub reservations: ReservationConfig,
    pub lock: LockConfig,
    pub deferred: DeferredConfig,
    pub memory: MemoryConfig,
}

/// Configuration loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load() -> Result<Config, ConfigError> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(default_config_dir().join("config.yaml")))
            .merge(Env::prefixed("APIARY_").split("__"))
            .extract()
            .map_err(|e| ConfigError::ExtractionFailed(e.to_string()))?;
        Self::validate(&config)?;
        Ok(config)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .map_err(|e| ConfigError::ExtractionFailed(e.to_string()))?;
        Self::validate(&config)?;
        Ok(config)
    }

    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if config.database.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(
                config.database.max_connections,
            ));
        }
        if config.mail.max_inbox_limit < 1 {
            return Err(ConfigError::InvalidInboxLimit(config.mail.max_inbox_limit));
        }
        if config.reservations.default_ttl_seconds <= 0 {
            return Err(ConfigError::InvalidTtl(config.reservations.default_ttl_seconds));
        }
        if config.lock.ttl_seconds <= 0 {
            return Err(ConfigError::InvalidTtl(config.lock.ttl_seconds));
        }
        if config.deferred.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidPollInterval(
                config.deferred.poll_interval_ms,
            ));
        }
        Ok(())
    }
}

pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("apiary")
}

pub fn default_database_path() -> PathBuf {
    default_config_dir().join("core.db")
}

/// Move a legacy project-local database to the global path. The old
/// artifact is kept, renamed `<name>.backup-<millis>`. Returns whether a
/// migration happened.
pub fn auto_migrate_legacy_database(
    legacy_path: &Path,
    global_path: &Path,
) -> std::io::Result<bool> {
    if !legacy_path.exists() || global_path.exists() {
        return Ok(false);
    }
    if let Some(parent) = global_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(legacy_path, global_path)?;

    let name = legacy_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "core.db".to_string());
    let backup = legacy_path.with_file_name(format!(
        "{name}.backup-{}",
        chrono::Utc::now().timestamp_millis()
    ));
    std::fs::rename(legacy_path, &backup)?;
    tracing::info!(
        from = %legacy_path.display(),
        to = %global_path.display(),
        backup = %backup.display(),
        "migrated legacy database"
    );
    Ok(true)
}
