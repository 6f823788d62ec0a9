//! Uploader configuration.
//!
//! Read from `$XDG_CONFIG_HOME/mitt/uploader.json`. Every field is optional;
//! a missing file yields the defaults and an unparsable one is logged and
//! replaced by the defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use mitt_transfer::{DEFAULT_MAX_PARTS, DEFAULT_PART_SIZE};

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Backoff policy for transient failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Attempts per operation, including the first one.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay_ms: 500,
            max_delay_ms: 8_000,
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retrying after failed attempt `attempt` (1-based), with
    /// ±25% jitter so parallel parts do not retry in lockstep.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let ms = self.initial_delay_ms as f64 * self.backoff_factor.powi(exp);
        let capped = ms.min(self.max_delay_ms as f64);
        let jitter = capped * 0.25;
        let offset: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
        let with_jitter = (capped + jitter * offset).max(1.0);
        Duration::from_secs_f64(with_jitter / 1000.0)
    }
}

/// Post-completion thumbnail settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThumbnailConfig {
    pub enabled: bool,
    pub ffmpeg_path: String,
    /// Position of the extracted frame, in seconds from the start.
    pub offset_secs: f64,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ffmpeg_path: "ffmpeg".into(),
            offset_secs: 1.0,
        }
    }
}

/// Top-level uploader configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploaderConfig {
    pub api_base_url: String,
    pub part_size: u64,
    pub max_parts: u32,
    /// Parts on the wire at once.
    pub concurrency: usize,
    pub part_timeout_secs: u64,
    pub retry: RetryConfig,
    /// Ask the server which parts it already has before re-sending on retry.
    pub resume_from_server: bool,
    pub thumbnail: ThumbnailConfig,
    /// Directory for the active-upload mirror. Defaults to the config dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000/api".into(),
            part_size: DEFAULT_PART_SIZE,
            max_parts: DEFAULT_MAX_PARTS,
            concurrency: 3,
            part_timeout_secs: 300,
            retry: RetryConfig::default(),
            resume_from_server: true,
            thumbnail: ThumbnailConfig::default(),
            state_dir: None,
        }
    }
}

impl UploaderConfig {
    /// Loads configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        match default_config_path() {
            Some(path) => Self::load_from(&path),
            None => {
                warn!("no config directory available, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Loads configuration from `path`, falling back to defaults if the file
    /// is missing or malformed.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(path = %path.display(), "no uploader config, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        match serde_json::from_str::<Self>(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse uploader config, using defaults"
                );
                Ok(Self::default())
            }
        }
    }

    /// Rejects values the coordinator cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("apiBaseUrl is empty".into()));
        }
        if self.part_size == 0 {
            return Err(ConfigError::Invalid("partSize must be positive".into()));
        }
        if self.max_parts == 0 {
            return Err(ConfigError::Invalid("maxParts must be positive".into()));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be positive".into()));
        }
        if self.part_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "partTimeoutSecs must be positive".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.maxAttempts must be positive".into(),
            ));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(ConfigError::Invalid(
                "retry.backoffFactor must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Timeout for one part transfer.
    pub fn part_timeout(&self) -> Duration {
        Duration::from_secs(self.part_timeout_secs)
    }

    /// Directory holding the active-upload mirror.
    pub fn resolved_state_dir(&self) -> Option<PathBuf> {
        self.state_dir
            .clone()
            .or_else(|| config_dir().map(|d| d.join("mitt")))
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("mitt").join("uploader.json"))
}

/// Returns the platform-specific config directory.
fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".config"))
    }
}
