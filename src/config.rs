//! Engine configuration.
//! `WakeConfig` is the host-owned user setting (enabled, sensitivity,
//! continuous mode). `EngineTuning` holds the timing and model-geometry
//! knobs that normally stay at their defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::{EMBEDDING_DIM, MEL_BINS};

/// User-facing settings supplied by the host.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WakeConfig {
    pub enabled: bool,
    /// Detection fires only when the score is strictly above this value.
    pub sensitivity: f32,
    /// Keep listening after a detection instead of ending the session.
    pub continuous_mode: bool,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sensitivity: 0.5,
            continuous_mode: true,
        }
    }
}

impl WakeConfig {
    /// Load settings from a JSON file. Missing fields take their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: WakeConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.sensitivity) {
            return Err(ConfigError::Sensitivity(self.sensitivity));
        }
        Ok(())
    }
}

/// Timing and geometry knobs for the engine.
#[derive(Debug, Clone)]
pub struct EngineTuning {
    /// Target length of one recording take.
    pub take_duration: Duration,
    /// Extra time a stopped take may spend producing its artifact.
    pub take_grace: Duration,
    /// Wait between a failed take and the next attempt.
    pub retry_backoff: Duration,
    /// Consecutive transient capture failures tolerated before `Error`.
    pub max_take_retries: u32,
    /// Width of one feature vector.
    pub mel_bins: usize,
    /// Width of one embedding vector.
    pub embedding_dim: usize,
    /// Accept feature models that emit several `mel_bins` rows per
    /// sub-frame (stock melspectrogram exports). Off: exactly one row.
    pub multi_row_features: bool,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            take_duration: Duration::from_millis(500),
            take_grace: Duration::from_secs(1),
            retry_backoff: Duration::from_millis(200),
            max_take_retries: 10,
            mel_bins: MEL_BINS,
            embedding_dim: EMBEDDING_DIM,
            multi_row_features: false,
        }
    }
}
