// SPDX-License-Identifier: GPL-3.0-only

//! Daemon configuration.
//!
//! Read from a TOML file named by `--config` or `NASOS_STORAGE_CONFIG`;
//! every key has a default, so a missing file is not an error unless it
//! was named explicitly.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_ENV: &str = "NASOS_STORAGE_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub state_dir: PathBuf,
    pub transactions_dir: Option<PathBuf>,
    pub pool_options_path: Option<PathBuf>,
    pub poll_interval_ms: u64,
    pub max_polls: u32,
    pub fast_complete: bool,
    pub stream_poll_interval_ms: u64,
    pub stream_max_secs: u64,
    pub sysfs_root: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/nasos/storage"),
            transactions_dir: None,
            pool_options_path: None,
            poll_interval_ms: 5_000,
            max_polls: 720,
            fast_complete: false,
            stream_poll_interval_ms: 500,
            stream_max_secs: 600,
            sysfs_root: PathBuf::from("/sys"),
        }
    }
}

/// Polling knobs handed to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub poll_interval: Duration,
    pub max_polls: u32,
    pub fast_complete: bool,
}

/// Bounds of a log-tail stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    pub poll_interval: Duration,
    pub max_duration: Duration,
}

impl ServiceConfig {
    /// Load from an explicit path, else from `$NASOS_STORAGE_CONFIG`, else defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match std::env::var_os(CONFIG_ENV) {
                Some(path) if Path::new(&path).exists() => Self::from_file(Path::new(&path))?,
                _ => Self::default(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 || self.stream_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll intervals must be non-zero".to_string(),
            ));
        }
        if self.max_polls == 0 || self.stream_max_secs == 0 {
            return Err(ConfigError::Invalid(
                "max_polls and stream_max_secs must be non-zero".to_string(),
            ));
        }
        for path in [
            Some(&self.state_dir),
            self.transactions_dir.as_ref(),
            self.pool_options_path.as_ref(),
            Some(&self.sysfs_root),
        ]
        .into_iter()
        .flatten()
        {
            if !path.is_absolute() {
                return Err(ConfigError::Invalid(format!(
                    "path must be absolute: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    pub fn transactions_dir(&self) -> PathBuf {
        self.transactions_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("transactions"))
    }

    pub fn pool_options_path(&self) -> PathBuf {
        self.pool_options_path
            .clone()
            .unwrap_or_else(|| self.state_dir.join("pool-options.json"))
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_polls: self.max_polls,
            fast_complete: self.fast_complete,
        }
    }

    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            poll_interval: Duration::from_millis(self.stream_poll_interval_ms),
            max_duration: Duration::from_secs(self.stream_max_secs),
        }
    }
}
