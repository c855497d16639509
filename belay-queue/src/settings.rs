//! File and environment configuration.
//!
//! ```toml
//! [store]
//! redis_url = "redis://localhost:6379"
//! key_prefix = "belay"
//!
//! [queue]
//! max_run_time = "4h"
//!
//! [queue.retry]
//! max_attempts = 25
//!
//! [worker]
//! queues = ["sms", "default"]
//! concurrency = 4
//! poll_interval = "5s"
//!
//! [reaper]
//! lock_timeout = "4h"
//! ```
//!
//! Every value can be overridden from the environment: `BELAY_REDIS_URL`,
//! `BELAY_KEY_PREFIX`, `BELAY_QUEUES` (comma separated), `BELAY_CONCURRENCY`,
//! `BELAY_MAX_ATTEMPTS`, `BELAY_MAX_RUN_TIME`, `BELAY_LOCK_TIMEOUT` and
//! `BELAY_POLL_INTERVAL`.

use crate::error::QueueResult;
use crate::queue::{Queue, QueueConfig};
use crate::reaper::ReaperConfig;
use crate::worker::WorkerConfig;
use humantime_serde::re::humantime;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Settings errors.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The settings file is not valid TOML for these settings.
    #[error("Failed to parse settings: {0}")]
    Parse(String),

    /// An environment override has an invalid value.
    #[error("Invalid value for {var}: {message}")]
    Env {
        /// Variable name
        var: String,
        /// What was wrong
        message: String,
    },

    /// The combined settings are inconsistent.
    #[error("Validation error: {0}")]
    Invalid(String),
}

/// Where jobs are stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Redis URL; the in-memory store is used when unset
    pub redis_url: Option<String>,

    /// Prefix for Redis keys
    pub key_prefix: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: "belay".to_string(),
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Store selection
    pub store: StoreSettings,
    /// Queue behavior
    pub queue: QueueConfig,
    /// Worker pool
    pub worker: WorkerConfig,
    /// Reaper
    pub reaper: ReaperConfig,
}

impl Settings {
    /// Parse settings from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, SettingsError> {
        toml::from_str(content).map_err(|e| SettingsError::Parse(e.to_string()))
    }

    /// Read settings from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Defaults, then `BELAY_*` overrides, validated.
    pub fn from_env() -> Result<Self, SettingsError> {
        let mut settings = Self::default();
        settings.apply_env()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `BELAY_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), SettingsError> {
        self.apply_vars(|var| std::env::var(var).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_vars<F>(&mut self, lookup: F) -> Result<(), SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("BELAY_REDIS_URL") {
            self.store.redis_url = Some(url);
        }
        if let Some(prefix) = lookup("BELAY_KEY_PREFIX") {
            self.store.key_prefix = prefix;
        }
        if let Some(queues) = lookup("BELAY_QUEUES") {
            self.worker.queues = queues
                .split(',')
                .map(str::trim)
                .filter(|queue| !queue.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(raw) = lookup("BELAY_CONCURRENCY") {
            self.worker.concurrency = parse_number("BELAY_CONCURRENCY", &raw)?;
        }
        if let Some(raw) = lookup("BELAY_MAX_ATTEMPTS") {
            self.queue.retry.max_attempts = parse_number("BELAY_MAX_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = lookup("BELAY_MAX_RUN_TIME") {
            self.queue.max_run_time = parse_duration("BELAY_MAX_RUN_TIME", &raw)?;
        }
        if let Some(raw) = lookup("BELAY_LOCK_TIMEOUT") {
            self.reaper.lock_timeout = parse_duration("BELAY_LOCK_TIMEOUT", &raw)?;
        }
        if let Some(raw) = lookup("BELAY_POLL_INTERVAL") {
            self.worker.poll_interval = parse_duration("BELAY_POLL_INTERVAL", &raw)?;
        }
        Ok(())
    }

    /// Check that the settings can run together.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.worker.concurrency == 0 {
            return Err(SettingsError::Invalid(
                "worker.concurrency must be at least 1".into(),
            ));
        }
        if self.worker.poll_interval.is_zero() {
            return Err(SettingsError::Invalid(
                "worker.poll_interval must be greater than zero".into(),
            ));
        }
        if self.queue.retry.max_attempts == 0 {
            return Err(SettingsError::Invalid(
                "queue.retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.reaper.lock_timeout < self.queue.max_run_time {
            return Err(SettingsError::Invalid(format!(
                "reaper.lock_timeout ({}) must not be shorter than queue.max_run_time ({})",
                humantime::format_duration(self.reaper.lock_timeout),
                humantime::format_duration(self.queue.max_run_time)
            )));
        }
        if self.store.key_prefix.is_empty() {
            return Err(SettingsError::Invalid(
                "store.key_prefix must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Open the configured store and wrap it in a queue.
    pub async fn build_queue(&self) -> QueueResult<Queue> {
        let queue = match &self.store.redis_url {
            #[cfg(feature = "redis")]
            Some(url) => {
                let config = crate::store::RedisStoreConfig::new(url.clone())
                    .with_key_prefix(self.store.key_prefix.clone());
                Queue::new(crate::store::RedisStore::with_config(config).await?)
            }
            #[cfg(not(feature = "redis"))]
            Some(_) => {
                return Err(crate::error::QueueError::Config(
                    "a Redis URL is set but the `redis` feature is disabled".into(),
                ));
            }
            None => Queue::in_memory(),
        };

        Ok(queue.with_config(self.queue.clone()))
    }
}

fn parse_number<T: FromStr>(var: &str, raw: &str) -> Result<T, SettingsError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| SettingsError::Env {
        var: var.to_string(),
        message: e.to_string(),
    })
}

fn parse_duration(var: &str, raw: &str) -> Result<Duration, SettingsError> {
    humantime::parse_duration(raw.trim()).map_err(|e| SettingsError::Env {
        var: var.to_string(),
        message: e.to_string(),
    })
}
