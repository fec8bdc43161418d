//! Typed configuration.
//!
//! Loaded once at startup from environment variables or a TOML file, and
//! validated before anything is opened. Unset values take their defaults;
//! malformed ones fail fast.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::queue::{Database, QueueConfig};
use crate::scheduler::SchedulerConfig;
use crate::telemetry::TelemetryConfig;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// SQLite file. `None` means a private in-memory database.
    pub database_path: Option<PathBuf>,
    pub tick_interval_ms: u64,
    pub batch_limit: usize,
    pub commit_hook: bool,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            tick_interval_ms: 100,
            batch_limit: 10,
            commit_hook: true,
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let config = Self {
            database_path: var("ROWQ_DATABASE_PATH").map(PathBuf::from),
            tick_interval_ms: match var("ROWQ_TICK_INTERVAL_MS") {
                Some(v) => parse_var("ROWQ_TICK_INTERVAL_MS", &v)?,
                None => defaults.tick_interval_ms,
            },
            batch_limit: match var("ROWQ_BATCH_LIMIT") {
                Some(v) => parse_var("ROWQ_BATCH_LIMIT", &v)?,
                None => defaults.batch_limit,
            },
            commit_hook: match var("ROWQ_COMMIT_HOOK") {
                Some(v) => parse_flag("ROWQ_COMMIT_HOOK", &v)?,
                None => defaults.commit_hook,
            },
            otel_endpoint: var("OTEL_ENDPOINT"),
            log_level: var("LOG_LEVEL").unwrap_or(defaults.log_level),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| Error::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<()> {
        self.scheduler_config().validate()
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            batch_limit: self.batch_limit,
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            database: match &self.database_path {
                Some(path) => Database::File(path.clone()),
                None => Database::Memory,
            },
            commit_hook: self.commit_hook,
            scheduler: self.scheduler_config(),
        }
    }

    pub fn telemetry_config(&self, service_name: &str) -> TelemetryConfig {
        TelemetryConfig {
            endpoint: self.otel_endpoint.clone(),
            service_name: service_name.to_string(),
            log_level: self.log_level.clone(),
        }
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("{name}={value:?}: {e}")))
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{name}={value:?}: expected a boolean"))),
    }
}
