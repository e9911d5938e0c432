use std::sync::Arc;
use std::thread;

use super::{run_producer, Capture, ProducerConfig, ProducerError, ProducerHandle, StopToken};
use crate::adapter::{AudioInferenceAdapter, InferenceError};
use crate::emotion::{EmotionVector, Modality};
use crate::fusion::FusionState;
use crate::source::{AudioChunk, ChunkSource, SourceError, SourceSlot};

/// Microphone chunks through the speech-emotion adapter
pub struct AudioCapture {
    source: SourceSlot<dyn ChunkSource>,
    adapter: Arc<dyn AudioInferenceAdapter>,
    /// Samples per chunk handed to the adapter (0 = pass through)
    target_samples: usize,
}

impl AudioCapture {
    pub fn new(
        source: SourceSlot<dyn ChunkSource>,
        adapter: Arc<dyn AudioInferenceAdapter>,
        target_samples: usize,
    ) -> Self {
        Self {
            source,
            adapter,
            target_samples,
        }
    }
}

impl Capture for AudioCapture {
    type Item = AudioChunk;

    fn modality(&self) -> Modality {
        Modality::Audio
    }

    fn acquire(&mut self) -> Option<Result<AudioChunk, SourceError>> {
        self.source.with(|source| source.next_chunk())
    }

    fn infer(&mut self, mut chunk: AudioChunk) -> Result<EmotionVector, ProducerError> {
        if chunk.samples.is_empty() {
            return Err(InferenceError::Silent.into());
        }
        if self.target_samples > 0 {
            chunk.fit_to(self.target_samples);
        }
        Ok(self.adapter.infer(&chunk)?)
    }

    fn release(&mut self) {
        self.source.release();
    }
}

/// Start the audio producer thread
pub fn spawn_audio_producer(
    source: SourceSlot<dyn ChunkSource>,
    adapter: Arc<dyn AudioInferenceAdapter>,
    target_samples: usize,
    state: Arc<FusionState>,
    config: ProducerConfig,
    stop: StopToken,
) -> ProducerHandle {
    let release_slot = source.clone();
    let capture = AudioCapture::new(source, adapter, target_samples);
    let thread = thread::spawn(move || run_producer(capture, state, config, stop));
    ProducerHandle::new(
        Modality::Audio,
        thread,
        Box::new(move || release_slot.try_release()),
    )
}
