//! Boundary to the emotion classifiers.
//!
//! Adapters are black boxes: the video adapter returns the 7 visual keys,
//! the audio adapter the 11 vocal keys. Producers clamp and restrict
//! whatever comes back, so a misbehaving adapter cannot leak foreign keys
//! or out-of-range scores into fusion.

use thiserror::Error;

use crate::emotion::EmotionVector;
use crate::source::{AudioChunk, VideoFrame};

/// Video adapter failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DetectionError {
    #[error("No face detected")]
    NoFace,
    #[error("Face model failed: {0}")]
    Model(String),
}

/// Audio adapter failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InferenceError {
    #[error("Silent or empty audio input")]
    Silent,
    #[error("Malformed audio input: {0}")]
    Malformed(String),
    #[error("Speech model failed: {0}")]
    Model(String),
}

pub trait VideoInferenceAdapter: Send + Sync {
    fn infer(&self, frame: &VideoFrame) -> Result<EmotionVector, DetectionError>;
}

pub trait AudioInferenceAdapter: Send + Sync {
    fn infer(&self, chunk: &AudioChunk) -> Result<EmotionVector, InferenceError>;
}

impl<F> VideoInferenceAdapter for F
where
    F: Fn(&VideoFrame) -> Result<EmotionVector, DetectionError> + Send + Sync,
{
    fn infer(&self, frame: &VideoFrame) -> Result<EmotionVector, DetectionError> {
        self(frame)
    }
}

impl<F> AudioInferenceAdapter for F
where
    F: Fn(&AudioChunk) -> Result<EmotionVector, InferenceError> + Send + Sync,
{
    fn infer(&self, chunk: &AudioChunk) -> Result<EmotionVector, InferenceError> {
        self(chunk)
    }
}
