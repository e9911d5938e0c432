//! In-process devices and adapters.
//!
//! The oscillating inputs drive the demo binary without camera, microphone
//! or models: frames and chunks are paced like real hardware and the
//! adapters turn them into slowly varying emotion scores. The scripted and
//! failing variants let tests steer a pipeline precisely.

use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::adapter::{AudioInferenceAdapter, DetectionError, InferenceError, VideoInferenceAdapter};
use crate::emotion::{map_speech_labels, normalize_face_scores, EmotionVector, Modality};
use crate::source::{
    AcquisitionError, AudioChunk, AudioDevice, ChunkSource, FrameSource, MediaSource,
    SourceError, VideoDevice, VideoFrame,
};
use crate::supervisor::PipelineInputs;

const FRAME_WIDTH: u32 = 32;
const FRAME_HEIGHT: u32 = 24;

/// Camera delivering frames at a fixed rate whose brightness oscillates
#[derive(Debug, Clone)]
pub struct OscillatingVideoDevice {
    pub fps: u32,
}

impl VideoDevice for OscillatingVideoDevice {
    fn open(&self) -> Result<Box<dyn FrameSource>, AcquisitionError> {
        Ok(Box::new(OscillatingCamera {
            interval: Duration::from_secs_f64(1.0 / self.fps.max(1) as f64),
            index: 0,
        }))
    }
}

struct OscillatingCamera {
    interval: Duration,
    index: u64,
}

impl MediaSource for OscillatingCamera {
    fn name(&self) -> &str {
        "synthetic-camera"
    }
}

impl FrameSource for OscillatingCamera {
    fn next_frame(&mut self) -> Result<VideoFrame, SourceError> {
        thread::sleep(self.interval);
        self.index += 1;
        let brightness = 0.5 + 0.5 * (self.index as f64 * 0.05).sin();
        let value = (brightness * 255.0) as u8;
        Ok(VideoFrame {
            width: FRAME_WIDTH,
            height: FRAME_HEIGHT,
            pixels: vec![value; (FRAME_WIDTH * FRAME_HEIGHT * 3) as usize],
            index: self.index,
        })
    }
}

/// Microphone delivering sine tones whose loudness oscillates
#[derive(Debug, Clone)]
pub struct OscillatingAudioDevice {
    pub sample_rate: u32,
    pub chunk: Duration,
}

impl AudioDevice for OscillatingAudioDevice {
    fn open(&self) -> Result<Box<dyn ChunkSource>, AcquisitionError> {
        Ok(Box::new(OscillatingMicrophone {
            sample_rate: self.sample_rate,
            chunk: self.chunk,
            index: 0,
        }))
    }
}

struct OscillatingMicrophone {
    sample_rate: u32,
    chunk: Duration,
    index: u64,
}

impl MediaSource for OscillatingMicrophone {
    fn name(&self) -> &str {
        "synthetic-microphone"
    }
}

impl ChunkSource for OscillatingMicrophone {
    fn next_chunk(&mut self) -> Result<AudioChunk, SourceError> {
        thread::sleep(self.chunk);
        self.index += 1;
        let amplitude = 0.5 + 0.4 * (self.index as f64 * 0.3).sin();
        let len = (self.sample_rate as f64 * self.chunk.as_secs_f64()) as usize;
        let samples = (0..len)
            .map(|i| {
                let t = i as f64 / self.sample_rate.max(1) as f64;
                (amplitude * (TAU * 220.0 * t).sin()) as f32
            })
            .collect();
        Ok(AudioChunk {
            samples,
            sample_rate: self.sample_rate,
        })
    }
}

/// Face "model" reading the frame's brightness as mood
#[derive(Debug, Clone, Copy, Default)]
pub struct BrightnessFaceAdapter;

impl VideoInferenceAdapter for BrightnessFaceAdapter {
    fn infer(&self, frame: &VideoFrame) -> Result<EmotionVector, DetectionError> {
        if frame.pixels.is_empty() {
            return Err(DetectionError::NoFace);
        }
        let mean = frame.pixels.iter().map(|p| *p as f64).sum::<f64>() / frame.pixels.len() as f64;
        let mood = mean / 255.0;
        let percentages = [
            ("happy", 90.0 * mood),
            ("neutral", 90.0 * (1.0 - mood)),
            ("surprise", 30.0 * mood * mood),
            ("sad", 10.0 * (1.0 - mood)),
            ("angry", 5.0),
            ("fear", 5.0),
            ("disgust", 2.0),
        ];
        Ok(normalize_face_scores(percentages))
    }
}

/// Speech "model" reading the chunk's loudness as arousal
#[derive(Debug, Clone, Copy, Default)]
pub struct LoudnessSpeechAdapter;

impl AudioInferenceAdapter for LoudnessSpeechAdapter {
    fn infer(&self, chunk: &AudioChunk) -> Result<EmotionVector, InferenceError> {
        if chunk.samples.is_empty() {
            return Err(InferenceError::Silent);
        }
        let mean_square =
            chunk.samples.iter().map(|s| (*s as f64).powi(2)).sum::<f64>() / chunk.samples.len() as f64;
        // A full-scale sine has an RMS of 1/sqrt(2)
        let arousal = (mean_square.sqrt() * std::f64::consts::SQRT_2).clamp(0.0, 1.0);
        Ok(map_speech_labels([
            ("happy", arousal),
            ("calm", 1.0 - arousal),
            ("neutral", 0.3),
            ("surprise", arousal * 0.5),
            ("angry", arousal * 0.2),
            ("fear", 0.1),
        ]))
    }
}

/// Devices and adapters for a self-contained pipeline
pub fn inputs(fps: u32, sample_rate: u32, chunk: Duration) -> PipelineInputs {
    PipelineInputs {
        video_device: Arc::new(OscillatingVideoDevice { fps }),
        video_adapter: Arc::new(BrightnessFaceAdapter),
        audio_device: Arc::new(OscillatingAudioDevice { sample_rate, chunk }),
        audio_adapter: Arc::new(LoudnessSpeechAdapter),
    }
}

/// Quickly paced inputs for tests: 200 fps, 10 ms chunks at 16 kHz
pub fn fast_inputs() -> PipelineInputs {
    inputs(200, 16000, Duration::from_millis(10))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FailingVideoDevice;

impl VideoDevice for FailingVideoDevice {
    fn open(&self) -> Result<Box<dyn FrameSource>, AcquisitionError> {
        Err(SourceError::Unavailable {
            modality: Modality::Video,
            reason: "no camera attached".to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FailingAudioDevice;

impl AudioDevice for FailingAudioDevice {
    fn open(&self) -> Result<Box<dyn ChunkSource>, AcquisitionError> {
        Err(SourceError::Unavailable {
            modality: Modality::Audio,
            reason: "no microphone attached".to_string(),
        })
    }
}

/// Adapter returning a caller-controlled vector, or failing on demand.
/// Usable for either modality.
#[derive(Debug, Default)]
pub struct ScriptedAdapter {
    vector: Mutex<EmotionVector>,
    failing: AtomicBool,
    delay: Mutex<Duration>,
    calls: AtomicU64,
}

impl ScriptedAdapter {
    pub fn new(vector: EmotionVector) -> Arc<Self> {
        Arc::new(Self {
            vector: Mutex::new(vector),
            ..Self::default()
        })
    }

    pub fn set_vector(&self, vector: EmotionVector) {
        *self.vector.lock().unwrap_or_else(|e| e.into_inner()) = vector;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make each inference take `delay`
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn respond(&self) -> Option<EmotionVector> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if self.failing.load(Ordering::SeqCst) {
            None
        } else {
            Some(self.vector.lock().unwrap_or_else(|e| e.into_inner()).clone())
        }
    }
}

impl VideoInferenceAdapter for ScriptedAdapter {
    fn infer(&self, _frame: &VideoFrame) -> Result<EmotionVector, DetectionError> {
        self.respond().ok_or(DetectionError::NoFace)
    }
}

impl AudioInferenceAdapter for ScriptedAdapter {
    fn infer(&self, _chunk: &AudioChunk) -> Result<EmotionVector, InferenceError> {
        self.respond()
            .ok_or_else(|| InferenceError::Model("scripted failure".to_string()))
    }
}
