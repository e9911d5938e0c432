//! Boundary to the capture hardware.
//!
//! A device is opened once per run (at Starting) and yields a source that
//! producers read from. Reads may block, bounded by the source's own timeout.

use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::emotion::Modality;

/// Failure to open or read a capture source
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("{modality} source unavailable: {reason}")]
    Unavailable { modality: Modality, reason: String },
    #[error("Read from {modality} source timed out")]
    Timeout { modality: Modality },
    #[error("{modality} source closed")]
    Closed { modality: Modality },
    #[error("Read from {modality} source failed: {reason}")]
    Read { modality: Modality, reason: String },
}

/// A source that could not be acquired at start
pub type AcquisitionError = SourceError;

impl SourceError {
    pub fn modality(&self) -> Modality {
        match self {
            Self::Unavailable { modality, .. }
            | Self::Timeout { modality }
            | Self::Closed { modality }
            | Self::Read { modality, .. } => *modality,
        }
    }
}

/// One camera frame (packed RGB)
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    /// Frame index since the source was opened
    pub index: u64,
}

/// One chunk of mono PCM samples
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioChunk {
    /// Pad with silence or truncate to exactly `target` samples
    pub fn fit_to(&mut self, target: usize) {
        self.samples.resize(target, 0.0);
    }
}

/// Common behaviour of open capture sources
pub trait MediaSource: Send {
    fn name(&self) -> &str;

    /// Give the underlying device back. Called once, on stop.
    fn release(&mut self) {}
}

pub trait FrameSource: MediaSource {
    fn next_frame(&mut self) -> Result<VideoFrame, SourceError>;
}

pub trait ChunkSource: MediaSource {
    fn next_chunk(&mut self) -> Result<AudioChunk, SourceError>;
}

/// Opens a camera
pub trait VideoDevice: Send + Sync {
    fn open(&self) -> Result<Box<dyn FrameSource>, AcquisitionError>;
}

/// Opens a microphone
pub trait AudioDevice: Send + Sync {
    fn open(&self) -> Result<Box<dyn ChunkSource>, AcquisitionError>;
}

/// An acquired source shared between its producer and the supervisor.
///
/// The producer locks the slot for each read. On a stop timeout the
/// supervisor takes the source out of the slot and releases it, after which
/// the producer sees an empty slot and exits.
pub struct SourceSlot<S: ?Sized + MediaSource> {
    inner: Arc<Mutex<Option<Box<S>>>>,
}

impl<S: ?Sized + MediaSource> Clone for SourceSlot<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: ?Sized + MediaSource> SourceSlot<S> {
    pub fn new(source: Box<S>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(source))),
        }
    }

    /// Run `f` against the source. Returns None once the source was released.
    pub fn with<R>(&self, f: impl FnOnce(&mut S) -> R) -> Option<R> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_mut().map(|source| f(source))
    }

    /// Take the source out and release it, waiting for any in-flight read
    pub fn release(&self) -> bool {
        let taken = self.inner.lock().unwrap_or_else(|e| e.into_inner()).take();
        Self::release_taken(taken)
    }

    /// Release without waiting. Fails when a read currently holds the slot;
    /// the source is then released when that read returns and the producer
    /// exits.
    pub fn try_release(&self) -> bool {
        match self.inner.try_lock() {
            Ok(mut guard) => Self::release_taken(guard.take()),
            Err(std::sync::TryLockError::Poisoned(e)) => Self::release_taken(e.into_inner().take()),
            Err(std::sync::TryLockError::WouldBlock) => false,
        }
    }

    fn release_taken(taken: Option<Box<S>>) -> bool {
        match taken {
            Some(mut source) => {
                source.release();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        frames: u64,
        released: Arc<AtomicUsize>,
    }

    impl MediaSource for CountingSource {
        fn name(&self) -> &str {
            "counting"
        }

        fn release(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl FrameSource for CountingSource {
        fn next_frame(&mut self) -> Result<VideoFrame, SourceError> {
            self.frames += 1;
            Ok(VideoFrame {
                width: 1,
                height: 1,
                pixels: vec![0; 3],
                index: self.frames,
            })
        }
    }

    #[test]
    fn test_slot_release_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let slot: SourceSlot<dyn FrameSource> = SourceSlot::new(Box::new(CountingSource {
            frames: 0,
            released: released.clone(),
        }));

        let frame = slot.with(|s| s.next_frame()).unwrap().unwrap();
        assert_eq!(frame.index, 1);

        assert!(slot.release());
        assert!(!slot.release());
        assert!(slot.with(|s| s.next_frame()).is_none());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_try_release_while_reading_fails() {
        let released = Arc::new(AtomicUsize::new(0));
        let slot: SourceSlot<dyn FrameSource> = SourceSlot::new(Box::new(CountingSource {
            frames: 0,
            released: released.clone(),
        }));
        let other = slot.clone();

        slot.with(|_| assert!(!other.try_release()));
        assert!(other.try_release());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_chunk_fit_to() {
        let mut chunk = AudioChunk {
            samples: vec![0.5; 10],
            sample_rate: 10,
        };
        chunk.fit_to(4);
        assert_eq!(chunk.samples, vec![0.5; 4]);
        chunk.fit_to(6);
        assert_eq!(chunk.samples, vec![0.5, 0.5, 0.5, 0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_error_modality() {
        let err = SourceError::Timeout {
            modality: Modality::Audio,
        };
        assert_eq!(err.modality(), Modality::Audio);
        assert!(err.to_string().contains("audio"));
    }
}
