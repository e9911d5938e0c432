use std::sync::Arc;
use std::thread;

use super::{run_producer, Capture, ProducerConfig, ProducerError, ProducerHandle, StopToken};
use crate::adapter::VideoInferenceAdapter;
use crate::emotion::{EmotionVector, Modality};
use crate::fusion::FusionState;
use crate::source::{FrameSource, SourceError, SourceSlot, VideoFrame};

/// Camera frames through the facial-expression adapter
pub struct VideoCapture {
    source: SourceSlot<dyn FrameSource>,
    adapter: Arc<dyn VideoInferenceAdapter>,
}

impl VideoCapture {
    pub fn new(source: SourceSlot<dyn FrameSource>, adapter: Arc<dyn VideoInferenceAdapter>) -> Self {
        Self { source, adapter }
    }
}

impl Capture for VideoCapture {
    type Item = VideoFrame;

    fn modality(&self) -> Modality {
        Modality::Video
    }

    fn acquire(&mut self) -> Option<Result<VideoFrame, SourceError>> {
        self.source.with(|source| source.next_frame())
    }

    fn infer(&mut self, frame: VideoFrame) -> Result<EmotionVector, ProducerError> {
        Ok(self.adapter.infer(&frame)?)
    }

    fn release(&mut self) {
        self.source.release();
    }
}

/// Start the video producer thread
pub fn spawn_video_producer(
    source: SourceSlot<dyn FrameSource>,
    adapter: Arc<dyn VideoInferenceAdapter>,
    state: Arc<FusionState>,
    config: ProducerConfig,
    stop: StopToken,
) -> ProducerHandle {
    let release_slot = source.clone();
    let capture = VideoCapture::new(source, adapter);
    let thread = thread::spawn(move || run_producer(capture, state, config, stop));
    ProducerHandle::new(
        Modality::Video,
        thread,
        Box::new(move || release_slot.try_release()),
    )
}
