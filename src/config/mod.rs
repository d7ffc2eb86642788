//! Configuration module for addonsync.
//!
//! Handles loading and saving the TOML configuration file, which carries the
//! network/breaker tuning knobs, the push debounce window, the known game
//! installations and the per-provider enabled flags.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::addons::types::Installation;
use crate::net::NetSettings;

/// Default hard timeout for one HTTP call.
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = crate::net::DEFAULT_HTTP_TIMEOUT_MS;

/// Default breaker reset timeout.
pub const DEFAULT_RESET_TIMEOUT_MS: u64 = crate::net::breaker::DEFAULT_RESET_TIMEOUT_MS;

/// Default breaker failure threshold.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = crate::net::breaker::DEFAULT_FAILURE_THRESHOLD;

/// Default push debounce window.
pub const DEFAULT_PUSH_DEBOUNCE_MS: u64 = crate::addons::push::DEFAULT_PUSH_DEBOUNCE_MS;

/// Default bound on concurrent provider fetches per sync.
pub const DEFAULT_FETCH_CONCURRENCY: usize = crate::addons::sync::DEFAULT_FETCH_CONCURRENCY;

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// TOML parse/serialize error.
    #[error("Config parse error: {0}")]
    Parse(String),
}

fn default_http_timeout_ms() -> u64 {
    DEFAULT_HTTP_TIMEOUT_MS
}

fn default_reset_timeout_ms() -> u64 {
    DEFAULT_RESET_TIMEOUT_MS
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

fn default_push_debounce_ms() -> u64 {
    DEFAULT_PUSH_DEBOUNCE_MS
}

fn default_fetch_concurrency() -> usize {
    DEFAULT_FETCH_CONCURRENCY
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Hard timeout for one HTTP call, in milliseconds.
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,

    /// Breaker reset timeout, in milliseconds.
    #[serde(default = "default_reset_timeout_ms")]
    pub breaker_reset_timeout_ms: u64,

    /// Consecutive failures that open a breaker.
    #[serde(default = "default_failure_threshold")]
    pub breaker_failure_threshold: u32,

    /// Quiet window for coalescing push bursts, in milliseconds.
    #[serde(default = "default_push_debounce_ms")]
    pub push_debounce_ms: u64,

    /// Bound on concurrent provider fetches per sync.
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,

    /// Known game installations.
    #[serde(default, rename = "installation")]
    pub installations: Vec<Installation>,

    /// Per-provider enabled flags; unknown providers default to enabled.
    #[serde(default)]
    pub providers: HashMap<String, bool>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
            breaker_reset_timeout_ms: DEFAULT_RESET_TIMEOUT_MS,
            breaker_failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            push_debounce_ms: DEFAULT_PUSH_DEBOUNCE_MS,
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            installations: Vec::new(),
            providers: HashMap::new(),
        }
    }
}

impl Config {
    /// Returns the default config file path (~/.addonsync/config.toml).
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        crate::addons::addonsync_dir().map(|d| d.join("config.toml"))
    }

    /// Loads the configuration from a file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Loads the configuration, falling back to defaults when the file is
    /// missing or unreadable.
    #[must_use]
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(ConfigError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!("[CONFIG] Failed to load '{}': {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Saves the configuration to a file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Returns true unless configuration disables the provider.
    #[must_use]
    pub fn provider_enabled(&self, name: &str) -> bool {
        *self.providers.get(name).unwrap_or(&true)
    }

    /// The hard HTTP timeout as a duration.
    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    /// The push debounce window as a duration.
    #[must_use]
    pub fn push_debounce(&self) -> Duration {
        Duration::from_millis(self.push_debounce_ms)
    }

    /// Network settings derived from this configuration.
    #[must_use]
    pub fn net_settings(&self) -> NetSettings {
        NetSettings {
            http_timeout: self.http_timeout(),
            reset_timeout: Duration::from_millis(self.breaker_reset_timeout_ms),
            failure_threshold: self.breaker_failure_threshold,
        }
    }
}
