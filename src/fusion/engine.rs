use serde::{Deserialize, Serialize};

use super::state::{FusionState, ModalitySample, SmoothedProfile};
use crate::config::ConfigError;
use crate::emotion::{EmotionVector, Modality};

/// Default smoothing factor (heavy smoothing)
pub const DEFAULT_ALPHA: f64 = 0.3;

/// Relative weights of the two modalities for keys both of them report
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    pub video: f64,
    pub audio: f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            video: 0.5,
            audio: 0.5,
        }
    }
}

impl FusionWeights {
    pub fn new(video: f64, audio: f64) -> Result<Self, ConfigError> {
        let weights = Self { video, audio };
        weights.validate()?;
        Ok(weights)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid = |w: f64| w.is_finite() && w >= 0.0;
        if !valid(self.video) || !valid(self.audio) {
            return Err(ConfigError::InvalidWeights(format!(
                "weights must be finite and non-negative (video={}, audio={})",
                self.video, self.audio
            )));
        }
        if self.video + self.audio <= 0.0 {
            return Err(ConfigError::InvalidWeights(
                "at least one weight must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Weights rescaled to sum to 1
    pub fn normalized(&self) -> (f64, f64) {
        let total = self.video + self.audio;
        if total > 0.0 {
            (self.video / total, self.audio / total)
        } else {
            (0.5, 0.5)
        }
    }
}

/// Which modalities may contribute to the next fusion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveModalities {
    pub video: bool,
    pub audio: bool,
}

impl ActiveModalities {
    pub const BOTH: Self = Self {
        video: true,
        audio: true,
    };

    pub fn only(modality: Modality) -> Self {
        Self {
            video: modality == Modality::Video,
            audio: modality == Modality::Audio,
        }
    }

    /// Read the enabled/acquired/degraded flags from `state`
    pub fn from_state(state: &FusionState) -> Self {
        Self {
            video: state.is_active(Modality::Video),
            audio: state.is_active(Modality::Audio),
        }
    }

    pub fn contains(&self, modality: Modality) -> bool {
        match modality {
            Modality::Video => self.video,
            Modality::Audio => self.audio,
        }
    }
}

/// Weighted raw fusion plus per-key exponential smoothing
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionEngine {
    weights: FusionWeights,
    alpha: f64,
}

impl Default for FusionEngine {
    fn default() -> Self {
        Self {
            weights: FusionWeights::default(),
            alpha: DEFAULT_ALPHA,
        }
    }
}

impl FusionEngine {
    pub fn new(weights: FusionWeights, alpha: f64) -> Result<Self, ConfigError> {
        weights.validate()?;
        validate_alpha(alpha)?;
        Ok(Self { weights, alpha })
    }

    pub fn weights(&self) -> FusionWeights {
        self.weights
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Combine the latest samples into a raw vector.
    ///
    /// A modality contributes only if it is in `active` and has produced a
    /// sample. Keys reported by a single contributing modality pass through
    /// unweighted; keys reported by both are `wv*video + wa*audio` with the
    /// weights renormalized to 1. Keys of a non-contributing modality are
    /// absent from the result.
    pub fn fuse(
        &self,
        video: Option<&ModalitySample>,
        audio: Option<&ModalitySample>,
        active: ActiveModalities,
    ) -> EmotionVector {
        let video = video.filter(|_| active.video).map(|s| &s.vector);
        let audio = audio.filter(|_| active.audio).map(|s| &s.vector);

        match (video, audio) {
            (None, None) => EmotionVector::new(),
            (Some(v), None) => v.clone(),
            (None, Some(a)) => a.clone(),
            (Some(v), Some(a)) => {
                let (wv, wa) = self.weights.normalized();
                let mut raw = EmotionVector::new();
                for (key, score) in v.iter() {
                    match a.try_get(key) {
                        Some(other) => raw.set(key, wv * score + wa * other),
                        None => raw.set(key, score),
                    }
                }
                for (key, score) in a.iter() {
                    if !v.contains(key) {
                        raw.set(key, score);
                    }
                }
                raw
            }
        }
    }

    /// Apply one EMA step for every key in `raw`. Keys absent from `raw`
    /// keep their previous smoothed value.
    pub(crate) fn smooth(&self, profile: &mut SmoothedProfile, raw: &EmotionVector) {
        for (key, score) in raw.iter() {
            let next = if profile.seen.insert(key.to_string()) {
                score
            } else {
                self.alpha * score + (1.0 - self.alpha) * profile.values.get(key)
            };
            profile.values.set(key, next);
        }
    }

    /// Read both samples, fuse them and fold the result into the smoothed
    /// profile. Returns a copy of the updated profile.
    pub fn cycle(&self, state: &FusionState) -> EmotionVector {
        let (video, audio) = state.latest_pair();
        let active = ActiveModalities::from_state(state);
        let raw = self.fuse(video.as_ref(), audio.as_ref(), active);
        state.with_smoothed(|profile| {
            self.smooth(profile, &raw);
            profile.values.clone()
        })
    }
}

pub fn validate_alpha(alpha: f64) -> Result<(), ConfigError> {
    if alpha.is_finite() && alpha > 0.0 && alpha <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidAlpha(alpha))
    }
}
