//! Runtime-adjustable fusion parameters.
//!
//! Written by the control surface, read by the scheduler once per tick, so a
//! change takes effect on the next fusion cycle.

use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::info;

use crate::config::{duration_ms, validate_update_period, ConfigError};
use crate::fusion::{FusionEngine, FusionWeights};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tuning {
    pub engine: FusionEngine,
    pub update_period: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            engine: FusionEngine::default(),
            update_period: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SharedTuning {
    inner: Arc<RwLock<Tuning>>,
}

impl SharedTuning {
    pub fn new(tuning: Tuning) -> Self {
        Self {
            inner: Arc::new(RwLock::new(tuning)),
        }
    }

    pub fn get(&self) -> Tuning {
        *self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn update(&self, f: impl FnOnce(&mut Tuning) -> Result<(), ConfigError>) -> Result<(), ConfigError> {
        let mut tuning = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let mut next = *tuning;
        f(&mut next)?;
        *tuning = next;
        Ok(())
    }

    pub fn set_weights(&self, video: f64, audio: f64) -> Result<(), ConfigError> {
        let weights = FusionWeights::new(video, audio)?;
        self.update(|t| {
            t.engine = FusionEngine::new(weights, t.engine.alpha())?;
            Ok(())
        })?;
        info!("Fusion weights set to video={} audio={}", video, audio);
        Ok(())
    }

    pub fn set_alpha(&self, alpha: f64) -> Result<(), ConfigError> {
        self.update(|t| {
            t.engine = FusionEngine::new(t.engine.weights(), alpha)?;
            Ok(())
        })?;
        info!("Smoothing alpha set to {}", alpha);
        Ok(())
    }

    pub fn set_update_period(&self, period: Duration) -> Result<(), ConfigError> {
        validate_update_period(duration_ms(period))?;
        self.update(|t| {
            t.update_period = period;
            Ok(())
        })?;
        info!("Update period set to {} ms", period.as_millis());
        Ok(())
    }
}
