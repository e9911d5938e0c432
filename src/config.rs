use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::derivation::{DerivationTable, FormulaError};
use crate::fusion::{validate_alpha, FusionWeights, DEFAULT_ALPHA};
use crate::producer::ProducerConfig;
use crate::supervisor::PipelineConfig;

/// Shortest allowed scheduler period
pub const MIN_UPDATE_PERIOD_MS: u64 = 10;
pub const MAX_UPDATE_PERIOD_MS: u64 = 3_600_000;

/// Rejected configuration or runtime control value
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid fusion weights: {0}")]
    InvalidWeights(String),
    #[error("Smoothing alpha must be in (0, 1], got {0}")]
    InvalidAlpha(f64),
    #[error("Update period must be {MIN_UPDATE_PERIOD_MS}..={MAX_UPDATE_PERIOD_MS} ms, got {0} ms")]
    InvalidPeriod(u64),
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("Invalid formula table: {0}")]
    Formula(#[from] FormulaError),
}

pub fn validate_update_period(period_ms: u64) -> Result<(), ConfigError> {
    if (MIN_UPDATE_PERIOD_MS..=MAX_UPDATE_PERIOD_MS).contains(&period_ms) {
        Ok(())
    } else {
        Err(ConfigError::InvalidPeriod(period_ms))
    }
}

/// Whole milliseconds, saturating instead of truncating
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Persisted pipeline settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub schema_version: u32,

    // Broadcast cadence
    pub update_period_ms: u64,

    // Fusion tuning
    pub smoothing_alpha: f64,
    pub video_weight: f64,
    pub audio_weight: f64,
    pub video_enabled: bool,
    pub audio_enabled: bool,

    // Producer failure policy
    pub failure_threshold: u32,
    pub retry_delay_ms: u64,
    pub max_backoff_ms: u64,

    // Video capture
    pub video_fps: u32,
    /// Infer on every Nth frame; derived from fps and period when unset
    pub video_stride: Option<u32>,

    // Audio capture
    pub audio_sample_rate: u32,
    pub audio_chunk_ms: u32,

    // Lifecycle and subscribers
    pub stop_timeout_ms: u64,
    pub subscriber_timeout_ms: u64,
    pub subscriber_capacity: usize,

    /// Replacement derivation table (JSON); reference formulas when unset
    pub formula_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema_version: 1,
            update_period_ms: 500,
            smoothing_alpha: DEFAULT_ALPHA,
            video_weight: 0.5,
            audio_weight: 0.5,
            video_enabled: true,
            audio_enabled: true,
            failure_threshold: 5,
            retry_delay_ms: 100,
            max_backoff_ms: 2000,
            video_fps: 30,
            video_stride: None,
            audio_sample_rate: 16000,
            audio_chunk_ms: 1000,
            stop_timeout_ms: 2000,
            subscriber_timeout_ms: 50,
            subscriber_capacity: 16,
            formula_path: None,
        }
    }
}

impl Config {
    /// Get the default config directory
    pub fn config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".emotionfusion"))
    }

    /// Get the config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location or return default
    pub fn load_or_default() -> Self {
        match Self::config_path().and_then(|path| Self::load(&path)) {
            Ok(config) => config,
            Err(e) => {
                debug!("Failed to load config, using default: {}", e);
                Self::default()
            }
        }
    }

    /// Load config from file, or default when the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path).context("Failed to read config file")?;
            serde_json::from_str(&content).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content).context("Failed to write config file")
    }

    /// Frame stride: explicit value, or enough frames to cover one update period
    pub fn effective_video_stride(&self) -> u32 {
        self.video_stride.unwrap_or_else(|| {
            let frames_per_period = self.video_fps as u64 * self.update_period_ms / 1000;
            frames_per_period.max(1) as u32
        })
    }

    /// Check every field, collecting all problems
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if let Err(e) = validate_update_period(self.update_period_ms) {
            errors.push(e);
        }
        if let Err(e) = validate_alpha(self.smoothing_alpha) {
            errors.push(e);
        }
        if let Err(e) = FusionWeights::new(self.video_weight, self.audio_weight) {
            errors.push(e);
        }
        if self.failure_threshold == 0 {
            errors.push(ConfigError::InvalidValue {
                field: "failure_threshold",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_backoff_ms < self.retry_delay_ms {
            errors.push(ConfigError::InvalidValue {
                field: "max_backoff_ms",
                reason: format!("must be >= retry_delay_ms ({})", self.retry_delay_ms),
            });
        }
        if self.video_stride == Some(0) {
            errors.push(ConfigError::InvalidValue {
                field: "video_stride",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.audio_sample_rate == 0 || self.audio_chunk_ms == 0 {
            errors.push(ConfigError::InvalidValue {
                field: "audio_chunk_ms",
                reason: "sample rate and chunk duration must be positive".to_string(),
            });
        }
        if self.subscriber_capacity == 0 {
            errors.push(ConfigError::InvalidValue {
                field: "subscriber_capacity",
                reason: "must be at least 1".to_string(),
            });
        }

        errors
    }

    /// Build the runtime configuration, loading the formula table if one is set
    pub fn to_pipeline_config(&self) -> Result<PipelineConfig> {
        let errors = self.validate();
        if !errors.is_empty() {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            anyhow::bail!("Invalid configuration: {}", messages.join("; "));
        }

        let derivation = match &self.formula_path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read formula table {:?}", path))?;
                DerivationTable::from_json(&content)
                    .with_context(|| format!("Failed to load formula table {:?}", path))?
            }
            None => DerivationTable::reference(),
        };

        let producer = |stride: u32| ProducerConfig {
            stride,
            failure_threshold: self.failure_threshold,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            ..ProducerConfig::default()
        };

        Ok(PipelineConfig {
            update_period: Duration::from_millis(self.update_period_ms),
            weights: FusionWeights::new(self.video_weight, self.audio_weight)?,
            alpha: self.smoothing_alpha,
            video_enabled: self.video_enabled,
            audio_enabled: self.audio_enabled,
            video: producer(self.effective_video_stride()),
            audio: producer(1),
            audio_target_samples: (self.audio_sample_rate as usize * self.audio_chunk_ms as usize)
                / 1000,
            stop_timeout: Duration::from_millis(self.stop_timeout_ms),
            subscriber_timeout: Duration::from_millis(self.subscriber_timeout_ms),
            subscriber_capacity: self.subscriber_capacity,
            derivation,
        })
    }
}
