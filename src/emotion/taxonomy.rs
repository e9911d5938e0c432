use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Emotions reported by the facial-expression classifier
pub const VISUAL_EMOTIONS: [&str; 7] = [
    "happy", "sad", "angry", "fear", "surprise", "disgust", "neutral",
];

/// Emotions reported by the speech-emotion classifier
pub const VOCAL_EMOTIONS: [&str; 11] = [
    "calm",
    "excited",
    "frustrated",
    "engaged",
    "confused",
    "anxious",
    "confident",
    "interested",
    "bored",
    "curious",
    "stressed",
];

/// Composite emotions, in evaluation order of the reference formula table
pub const DERIVED_EMOTIONS: [&str; 10] = [
    "receptiveness",
    "awareness",
    "trust",
    "anticipation",
    "relaxed",
    "skeptical",
    "distracted",
    "enthusiastic",
    "contemplative",
    "alert",
];

pub const BASIC_EMOTION_COUNT: usize = VISUAL_EMOTIONS.len() + VOCAL_EMOTIONS.len();
pub const EMOTION_COUNT: usize = BASIC_EMOTION_COUNT + DERIVED_EMOTIONS.len();

/// The 18 measured emotions: visual first, then vocal
pub fn basic_emotions() -> impl Iterator<Item = &'static str> {
    VISUAL_EMOTIONS.iter().chain(VOCAL_EMOTIONS.iter()).copied()
}

/// All 28 emotions in canonical order (visual, vocal, derived)
pub fn all_emotions() -> impl Iterator<Item = &'static str> {
    basic_emotions().chain(DERIVED_EMOTIONS.iter().copied())
}

/// Which modality measures `key`, if it is a basic emotion
pub fn modality_of(key: &str) -> Option<Modality> {
    if VISUAL_EMOTIONS.contains(&key) {
        Some(Modality::Video)
    } else if VOCAL_EMOTIONS.contains(&key) {
        Some(Modality::Audio)
    } else {
        None
    }
}

/// Sensor modality feeding the fusion core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Video,
    Audio,
}

impl Modality {
    pub const ALL: [Modality; 2] = [Modality::Video, Modality::Audio];

    /// Basic emotion keys this modality produces
    pub fn keys(&self) -> &'static [&'static str] {
        match self {
            Self::Video => &VISUAL_EMOTIONS,
            Self::Audio => &VOCAL_EMOTIONS,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Unknown modality: {0}")]
pub struct ParseModalityError(pub String);

impl std::str::FromStr for Modality {
    type Err = ParseModalityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "video" | "face" | "visual" => Ok(Self::Video),
            "audio" | "speech" | "vocal" => Ok(Self::Audio),
            _ => Err(ParseModalityError(s.to_string())),
        }
    }
}
