//! TOML configuration for Suricate.
//!
//! Layered the usual way: an explicit `--config` path, then the
//! `SURICATE_CONFIG` environment variable, then the standard system
//! location, then compiled-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const CONFIG_ENV: &str = "SURICATE_CONFIG";
pub const PASSPHRASE_ENV: &str = "SURICATE_SECRET_PASSPHRASE";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/suricate/suricate.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the suricate process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuricateConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SuricateConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded suricate configuration");
        Ok(config)
    }

    /// Try `SURICATE_CONFIG`, then the system location, then defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "SURICATE_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Resolve the configuration for a CLI invocation. An explicit path must
    /// load; the fallbacks are best effort. Environment overrides are applied
    /// last.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => Self::load_or_default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(passphrase) = std::env::var(PASSPHRASE_ENV) {
            if !passphrase.is_empty() {
                self.secrets.passphrase = passphrase;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding widgets, dashboards and instance state.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/suricate.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Pool sizes and timing policy of the execution scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of scripts running at once.
    pub execution_pool_size: usize,
    /// Maximum number of watchdogs supervising executions at once.
    pub watchdog_pool_size: usize,
    /// Delay used for immediate scheduling (dashboard load, reload).
    pub immediate_delay_secs: u64,
    /// Jitter window applied when a stopped widget is attached again.
    pub first_attach_jitter_min_secs: u64,
    pub first_attach_jitter_max_secs: u64,
    /// Lower bound for every widget timeout.
    pub timeout_floor_secs: u64,
    /// Attempts at persisting a result before falling back to a reschedule.
    pub retry_attempts: u32,
    pub retry_backoff_min_secs: u64,
    pub retry_backoff_max_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            execution_pool_size: 60,
            watchdog_pool_size: 60,
            immediate_delay_secs: 1,
            first_attach_jitter_min_secs: 30,
            first_attach_jitter_max_secs: 120,
            timeout_floor_secs: crate::execution::DEFAULT_TIMEOUT_FLOOR_SECS,
            retry_attempts: 10,
            retry_backoff_min_secs: 1,
            retry_backoff_max_secs: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn immediate_delay(&self) -> Duration {
        Duration::from_secs(self.immediate_delay_secs)
    }

    pub fn retry_backoff(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.retry_backoff_min_secs),
            Duration::from_secs(self.retry_backoff_max_secs),
        )
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Interpreter used to run widget scripts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub interpreter: String,
    /// Arguments placed before the script body.
    pub args: Vec<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            interpreter: "sh".to_string(),
            args: vec!["-c".to_string()],
        }
    }
}

// ---------------------------------------------------------------------------
// Secrets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// Passphrase the parameter encryption key is derived from.
    pub passphrase: String,
}

impl SecretsConfig {
    pub const DEFAULT_PASSPHRASE: &'static str = "change-me";

    pub fn is_default(&self) -> bool {
        self.passphrase == Self::DEFAULT_PASSPHRASE
    }
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            passphrase: Self::DEFAULT_PASSPHRASE.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
