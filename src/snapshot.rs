use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::emotion::{all_emotions, EmotionVector, Modality};
use crate::fusion::{FusionState, ModalityStatus};

/// Threshold the chat consumer uses for "high" emotions
pub const HIGH_EMOTION_THRESHOLD: f64 = 0.6;

/// Immutable emission unit, one per scheduler tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub pipeline_id: Uuid,
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    /// All 28 emotions: smoothed basic plus derived
    pub emotions: EmotionVector,
    /// An enabled modality is not contributing (unavailable or failing)
    pub degraded: bool,
    pub video: ModalityStatus,
    pub audio: ModalityStatus,
}

impl Snapshot {
    /// Assemble from the smoothed basic vector and this tick's composites
    pub fn assemble(
        pipeline_id: Uuid,
        sequence_number: u64,
        smoothed: &EmotionVector,
        derived: &EmotionVector,
        state: &FusionState,
    ) -> Self {
        let mut emotions = smoothed.complete_over(all_emotions());
        emotions.extend_from(derived);

        let video = state.status(Modality::Video);
        let audio = state.status(Modality::Audio);
        let lacking = |s: &ModalityStatus| s.enabled && !s.is_active();

        Self {
            pipeline_id,
            sequence_number,
            timestamp: Utc::now(),
            emotions,
            degraded: lacking(&video) || lacking(&audio),
            video,
            audio,
        }
    }

    pub fn get(&self, emotion: &str) -> f64 {
        self.emotions.get(emotion)
    }

    pub fn modality(&self, modality: Modality) -> &ModalityStatus {
        match modality {
            Modality::Video => &self.video,
            Modality::Audio => &self.audio,
        }
    }

    /// Modalities that contributed to this snapshot
    pub fn active_modalities(&self) -> Vec<Modality> {
        Modality::ALL
            .into_iter()
            .filter(|m| self.modality(*m).is_active())
            .collect()
    }

    pub fn dominant(&self) -> Option<(&str, f64)> {
        self.emotions.dominant()
    }

    /// Emotions above `threshold`, highest first
    pub fn high_emotions(&self, threshold: f64) -> Vec<(&str, f64)> {
        self.emotions.above(threshold)
    }
}
