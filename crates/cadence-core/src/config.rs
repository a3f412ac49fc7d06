//! Configuration for the job engine.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CADENCE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/cadence/config.toml
//!   3. ~/.config/cadence/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::protocol::LogLevel;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub dispatcher: DispatcherConfig,
    pub jobs: JobDefaults,
    pub broker: BrokerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Name of the background execution thread.
    pub thread_name: String,
    /// Send INIT on broker start so the GPU context is created before the
    /// first job needs it.
    pub prewarm_gpu: bool,
}

/// Defaults applied to submissions that do not set their own flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobDefaults {
    pub enable_gpu: bool,
    pub strict_gpu: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Capacity of the debug log channel. Slow subscribers lose the oldest records.
    pub log_capacity: usize,
    /// Minimum LOG level forwarded to subscribers.
    pub log_level: LogLevel,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            thread_name: "cadence-dispatcher".to_string(),
            prewarm_gpu: false,
        }
    }
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            enable_gpu: true,
            strict_gpu: false,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            log_capacity: 256,
            log_level: LogLevel::Debug,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("cadence")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| v == "true" || v == "1")
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl EngineConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_file(&Self::file_path())?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse the file at `path`, or return defaults if it does not exist.
    pub fn load_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CADENCE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&EngineConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply CADENCE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_flag("CADENCE_DISPATCHER__PREWARM_GPU") {
            self.dispatcher.prewarm_gpu = v;
        }
        if let Some(v) = env_flag("CADENCE_JOBS__ENABLE_GPU") {
            self.jobs.enable_gpu = v;
        }
        if let Some(v) = env_flag("CADENCE_JOBS__STRICT_GPU") {
            self.jobs.strict_gpu = v;
        }
        if let Ok(v) = std::env::var("CADENCE_BROKER__LOG_LEVEL") {
            if let Ok(level) = v.parse() {
                self.broker.log_level = level;
            }
        }
    }
}
