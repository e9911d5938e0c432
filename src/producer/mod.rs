//! Producer threads.
//!
//! Each modality runs one OS thread that loops until its [`StopToken`]
//! fires: acquire an item, optionally skip it under the stride, run the
//! adapter and overwrite the modality's slot in [`FusionState`]. Failures
//! never leave the thread; they are logged, counted and retried with a
//! delay, and the modality is flagged degraded after enough of them in a
//! row.

mod audio;
mod video;

pub use audio::{spawn_audio_producer, AudioCapture};
pub use video::{spawn_video_producer, VideoCapture};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::adapter::{DetectionError, InferenceError};
use crate::emotion::{EmotionVector, Modality};
use crate::fusion::FusionState;
use crate::source::SourceError;

/// One failed producer cycle
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProducerError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("Video inference failed: {0}")]
    Detection(#[from] DetectionError),
    #[error("Audio inference failed: {0}")]
    Inference(#[from] InferenceError),
}

/// Cooperative cancellation shared by producers and the scheduler.
///
/// `wait` sleeps until the timeout elapses or `stop` is called, whichever
/// comes first, so stopping never waits out a full retry delay or tick.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    inner: Arc<StopInner>,
}

#[derive(Debug, Default)]
struct StopInner {
    stopped: AtomicBool,
    lock: Mutex<()>,
    signal: Condvar,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        let _guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.signal.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Sleep for `timeout` unless stopped first. Returns true if stopped.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }

    /// Sleep until `deadline` unless stopped first. Returns true if stopped.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if self.is_stopped() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = match self.inner.signal.wait_timeout(guard, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
    }
}

/// Loop settings for one producer
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerConfig {
    /// Run inference on every Nth acquired item (1 = every item)
    pub stride: u32,
    /// Consecutive failures before the modality is flagged degraded
    pub failure_threshold: u32,
    /// Pause after a failure while still healthy
    pub retry_delay: Duration,
    /// Upper bound of the exponential backoff while degraded
    pub max_backoff: Duration,
    /// Poll interval while the modality is disabled
    pub idle_poll: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            stride: 1,
            failure_threshold: 5,
            retry_delay: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            idle_poll: Duration::from_millis(50),
        }
    }
}

/// What a producer needs to know about its modality's capture path
pub trait Capture: Send {
    type Item;

    fn modality(&self) -> Modality;

    /// Read the next item. None once the source has been released.
    fn acquire(&mut self) -> Option<Result<Self::Item, SourceError>>;

    fn infer(&mut self, item: Self::Item) -> Result<EmotionVector, ProducerError>;

    /// Hand the source back; called once when the loop exits
    fn release(&mut self) {}
}

/// Counters returned when a producer thread exits
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerReport {
    pub samples_published: u64,
    pub failures: u64,
    pub skipped_items: u64,
    pub degraded_transitions: u32,
}

/// Running producer thread plus a way to force its source closed
pub struct ProducerHandle {
    modality: Modality,
    thread: JoinHandle<ProducerReport>,
    release: Box<dyn Fn() -> bool + Send + Sync>,
}

impl ProducerHandle {
    pub(crate) fn new(
        modality: Modality,
        thread: JoinHandle<ProducerReport>,
        release: Box<dyn Fn() -> bool + Send + Sync>,
    ) -> Self {
        Self {
            modality,
            thread,
            release,
        }
    }

    pub fn modality(&self) -> Modality {
        self.modality
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Release the source if no read is in flight
    pub fn force_release(&self) -> bool {
        (self.release)()
    }

    /// Wait for the thread. None if it panicked.
    pub fn join(self) -> Option<ProducerReport> {
        match self.thread.join() {
            Ok(report) => Some(report),
            Err(_) => {
                warn!("{} producer thread panicked", self.modality);
                None
            }
        }
    }
}

/// Producer loop body, run on the producer's own thread
pub fn run_producer<C: Capture>(
    mut capture: C,
    state: Arc<FusionState>,
    config: ProducerConfig,
    stop: StopToken,
) -> ProducerReport {
    let modality = capture.modality();
    let stride = config.stride.max(1) as u64;
    let threshold = config.failure_threshold.max(1);
    let mut report = ProducerReport::default();
    let mut backoff = config.retry_delay;
    let mut position: u64 = 0;

    info!("{} producer started (stride {})", modality, stride);

    while !stop.is_stopped() {
        if !state.is_enabled(modality) {
            stop.wait(config.idle_poll);
            continue;
        }

        let result = match capture.acquire() {
            None => {
                info!("{} source released, producer exiting", modality);
                break;
            }
            Some(Ok(item)) => {
                position += 1;
                if (position - 1) % stride != 0 {
                    report.skipped_items += 1;
                    continue;
                }
                capture.infer(item)
            }
            Some(Err(e)) => Err(ProducerError::from(e)),
        };

        match result {
            Ok(vector) => {
                if stop.is_stopped() {
                    break;
                }
                // Disabled while this item was in flight
                if !state.is_enabled(modality) {
                    continue;
                }
                let keys = modality.keys().iter().copied();
                let sequence = state.publish(modality, vector.restrict_to(keys));
                report.samples_published += 1;
                backoff = config.retry_delay;
                if state.record_success(modality) {
                    info!("{} modality recovered", modality);
                }
                debug!("{} sample {} published", modality, sequence);
            }
            Err(e) => {
                if stop.is_stopped() {
                    break;
                }
                if !state.is_enabled(modality) {
                    continue;
                }
                report.failures += 1;
                if state.consecutive_failures(modality) == 0 {
                    warn!("{} producer cycle failed: {}", modality, e);
                } else {
                    debug!("{} producer cycle failed: {}", modality, e);
                }

                if state.record_failure(modality, threshold) {
                    report.degraded_transitions += 1;
                    warn!(
                        "{} modality degraded after {} consecutive failures",
                        modality, threshold
                    );
                }

                let delay = if state.is_degraded(modality) {
                    let delay = backoff;
                    backoff = (backoff * 2).min(config.max_backoff);
                    delay
                } else {
                    config.retry_delay
                };
                stop.wait(delay);
            }
        }
    }

    capture.release();
    info!(
        "{} producer stopped: {} samples, {} failures, {} skipped",
        modality, report.samples_published, report.failures, report.skipped_items
    );
    report
}
