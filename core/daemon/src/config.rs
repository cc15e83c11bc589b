//! Runtime configuration for meetlog-daemon.
//!
//! Loaded from `~/.meetlog/daemon/config.toml` unless a path is given. A
//! missing file yields defaults; a present but malformed file is an error.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_CONFIG_RELATIVE_PATH: &str = ".meetlog/daemon/config.toml";

/// Upper bound for every second-valued window (one week).
pub const MAX_WINDOW_SECS: i64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub users: HashMap<String, UserEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    pub sweep_interval_secs: u64,
    /// Soft threshold: registered sessions silent for longer are finalized.
    pub stale_threshold_secs: i64,
    /// Hard threshold: in-progress records with no registry entry are
    /// finalized once their stored last-seen is older than this.
    pub hard_threshold_secs: i64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 120,
            stale_threshold_secs: 5 * 60,
            hard_threshold_secs: 10 * 60,
        }
    }
}

impl MonitorConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn stale_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_threshold_secs)
    }

    pub fn hard_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.hard_threshold_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcilerConfig {
    pub write_attempts: u32,
    pub backoff_step_ms: u64,
    pub backoff_max_ms: u64,
    pub tombstone_ttl_secs: i64,
}

impl ReconcilerConfig {
    pub fn tombstone_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.tombstone_ttl_secs)
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            write_attempts: 3,
            backoff_step_ms: 50,
            backoff_max_ms: 500,
            tombstone_ttl_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserEntry {
    pub display_name: String,
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let monitor = &self.monitor;
        if monitor.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "monitor.sweep_interval_secs must be positive".to_string(),
            ));
        }
        if monitor.stale_threshold_secs <= 0 {
            return Err(ConfigError::Invalid(
                "monitor.stale_threshold_secs must be positive".to_string(),
            ));
        }
        if monitor.hard_threshold_secs > MAX_WINDOW_SECS {
            return Err(ConfigError::Invalid(format!(
                "monitor.hard_threshold_secs must not exceed {MAX_WINDOW_SECS}"
            )));
        }
        if monitor.hard_threshold_secs <= monitor.stale_threshold_secs {
            return Err(ConfigError::Invalid(
                "monitor.hard_threshold_secs must exceed stale_threshold_secs".to_string(),
            ));
        }
        if self.reconciler.write_attempts == 0 {
            return Err(ConfigError::Invalid(
                "reconciler.write_attempts must be at least 1".to_string(),
            ));
        }
        if self.reconciler.tombstone_ttl_secs < 0 {
            return Err(ConfigError::Invalid(
                "reconciler.tombstone_ttl_secs must not be negative".to_string(),
            ));
        }
        if self.reconciler.tombstone_ttl_secs > MAX_WINDOW_SECS {
            return Err(ConfigError::Invalid(format!(
                "reconciler.tombstone_ttl_secs must not exceed {MAX_WINDOW_SECS}"
            )));
        }
        Ok(())
    }
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
    Ok(home.join(DEFAULT_CONFIG_RELATIVE_PATH))
}

pub fn load_config(path: Option<PathBuf>) -> Result<DaemonConfig, ConfigError> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(DaemonConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|source| ConfigError::Read {
        path: config_path.clone(),
        source,
    })?;
    let config = toml::from_str::<DaemonConfig>(&content).map_err(|source| ConfigError::Parse {
        path: config_path.clone(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}
