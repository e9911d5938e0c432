//! Pipeline lifecycle: `Idle -> Starting -> Running -> Stopping -> Idle`.
//!
//! [`Pipeline`] owns the devices, adapters and the current run's threads.
//! `start` and `stop` are serialized by a lifecycle lock, so a caller never
//! observes a half-finished transition; both are idempotent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapter::{AudioInferenceAdapter, VideoInferenceAdapter};
use crate::broadcast::{BroadcastScheduler, Broadcaster, SchedulerStats, Subscription, TickContext};
use crate::config::{duration_ms, validate_update_period, ConfigError};
use crate::controls::{SharedTuning, Tuning};
use crate::derivation::DerivationTable;
use crate::emotion::{Modality, EMOTION_COUNT};
use crate::fusion::{FusionEngine, FusionState, FusionWeights, ModalityStatus, DEFAULT_ALPHA};
use crate::producer::{
    spawn_audio_producer, spawn_video_producer, ProducerConfig, ProducerHandle, ProducerReport,
    StopToken,
};
use crate::snapshot::Snapshot;
use crate::source::{AcquisitionError, AudioDevice, ChunkSource, FrameSource, SourceSlot, VideoDevice};

/// Pipeline lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Idle,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Pipeline error types
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    #[error("No modality could be acquired (video: {video}; audio: {audio})")]
    StartFailure {
        video: AcquisitionError,
        audio: AcquisitionError,
    },
    #[error("Shutdown exceeded {timeout_ms} ms; still running: {pending}")]
    StopTimeout { timeout_ms: u64, pending: String },
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}

/// Runtime configuration of one pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub update_period: Duration,
    pub weights: FusionWeights,
    pub alpha: f64,
    pub video_enabled: bool,
    pub audio_enabled: bool,
    pub video: ProducerConfig,
    pub audio: ProducerConfig,
    /// Samples per audio chunk handed to the adapter (0 = as delivered)
    pub audio_target_samples: usize,
    pub stop_timeout: Duration,
    pub subscriber_timeout: Duration,
    pub subscriber_capacity: usize,
    pub derivation: DerivationTable,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            update_period: Duration::from_millis(500),
            weights: FusionWeights::default(),
            alpha: DEFAULT_ALPHA,
            video_enabled: true,
            audio_enabled: true,
            video: ProducerConfig {
                stride: 15,
                ..ProducerConfig::default()
            },
            audio: ProducerConfig::default(),
            audio_target_samples: 16000,
            stop_timeout: Duration::from_secs(2),
            subscriber_timeout: Duration::from_millis(50),
            subscriber_capacity: 16,
            derivation: DerivationTable::reference(),
        }
    }
}

/// External collaborators a pipeline runs on
#[derive(Clone)]
pub struct PipelineInputs {
    pub video_device: Arc<dyn VideoDevice>,
    pub video_adapter: Arc<dyn VideoInferenceAdapter>,
    pub audio_device: Arc<dyn AudioDevice>,
    pub audio_adapter: Arc<dyn AudioInferenceAdapter>,
}

/// Status reported to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub pipeline_id: Uuid,
    pub state: PipelineState,
    pub running: bool,
    /// Running without every enabled modality
    pub degraded: bool,
    pub video: ModalityStatus,
    pub audio: ModalityStatus,
    pub emotion_count: usize,
    pub last_sequence: u64,
    pub ticks: u64,
    pub skipped_ticks: u64,
    pub subscribers: usize,
    pub update_period_ms: u64,
    pub weights: FusionWeights,
    pub alpha: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Summary of a stop call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StopReport {
    /// False when the pipeline was already idle
    pub was_running: bool,
    /// Threads that missed the stop timeout and were detached
    pub timed_out: Vec<String>,
    pub video: Option<ProducerReport>,
    pub audio: Option<ProducerReport>,
    pub ticks: u64,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.timed_out.is_empty()
    }
}

/// Threads and tokens of one Running period
struct Run {
    stop: StopToken,
    producers: Vec<ProducerHandle>,
    scheduler: BroadcastScheduler,
    stats: Arc<SchedulerStats>,
    started_at: DateTime<Utc>,
}

/// One independent fusion pipeline instance
pub struct Pipeline {
    id: Uuid,
    config: PipelineConfig,
    inputs: PipelineInputs,
    derivation: Arc<DerivationTable>,
    tuning: SharedTuning,
    broadcaster: Arc<Broadcaster>,
    sequence: Arc<AtomicU64>,
    video_enabled: AtomicBool,
    audio_enabled: AtomicBool,
    /// Held for the whole of start and stop
    run: Mutex<Option<Run>>,
    state: Mutex<PipelineState>,
    fusion: Mutex<Arc<FusionState>>,
    last_stats: Mutex<Arc<SchedulerStats>>,
    last_error: Mutex<Option<PipelineError>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, inputs: PipelineInputs) -> Result<Self, PipelineError> {
        validate_update_period(duration_ms(config.update_period))?;
        let engine = FusionEngine::new(config.weights, config.alpha)?;

        let id = Uuid::new_v4();
        debug!("Created pipeline {}", id);
        Ok(Self {
            id,
            derivation: Arc::new(config.derivation.clone()),
            tuning: SharedTuning::new(Tuning {
                engine,
                update_period: config.update_period,
            }),
            broadcaster: Arc::new(Broadcaster::new(config.subscriber_timeout)),
            sequence: Arc::new(AtomicU64::new(0)),
            video_enabled: AtomicBool::new(config.video_enabled),
            audio_enabled: AtomicBool::new(config.audio_enabled),
            run: Mutex::new(None),
            state: Mutex::new(PipelineState::Idle),
            fusion: Mutex::new(Arc::new(FusionState::new(
                config.video_enabled,
                config.audio_enabled,
            ))),
            last_stats: Mutex::new(Arc::new(SchedulerStats::default())),
            last_error: Mutex::new(None),
            config,
            inputs,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.state() == PipelineState::Running
    }

    fn set_state(&self, next: PipelineState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        debug!("Pipeline {}: {} -> {}", self.id, *state, next);
        *state = next;
    }

    fn fusion_state(&self) -> Arc<FusionState> {
        Arc::clone(&self.fusion.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn enabled_flag(&self, modality: Modality) -> &AtomicBool {
        match modality {
            Modality::Video => &self.video_enabled,
            Modality::Audio => &self.audio_enabled,
        }
    }

    fn record_error(&self, err: &PipelineError) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err.clone());
    }

    /// Acquire sources and start producers and the scheduler.
    ///
    /// Succeeds if at least one modality could be acquired; the other is
    /// then reported degraded. A no-op while already running.
    pub fn start(&self) -> Result<(), PipelineError> {
        let mut run = self.run.lock().unwrap_or_else(|e| e.into_inner());
        if run.is_some() {
            debug!("Pipeline {} already running, start ignored", self.id);
            return Ok(());
        }

        self.set_state(PipelineState::Starting);
        info!("Starting pipeline {}", self.id);

        // Built under the fusion lock so a concurrent toggle lands in the new run
        let fusion = {
            let mut current = self.fusion.lock().unwrap_or_else(|e| e.into_inner());
            let fresh = Arc::new(FusionState::new(
                self.video_enabled.load(Ordering::SeqCst),
                self.audio_enabled.load(Ordering::SeqCst),
            ));
            *current = Arc::clone(&fresh);
            fresh
        };

        let video = self.inputs.video_device.open();
        let audio = self.inputs.audio_device.open();

        let (video, audio) = match (video, audio) {
            (Err(video), Err(audio)) => {
                let err = PipelineError::StartFailure { video, audio };
                error!("Pipeline {} failed to start: {}", self.id, err);
                self.record_error(&err);
                fusion.reset();
                self.set_state(PipelineState::Idle);
                return Err(err);
            }
            (video, audio) => (video, audio),
        };

        let stop = StopToken::new();
        let mut producers = Vec::with_capacity(2);

        match video {
            Ok(source) => {
                info!("Video source '{}' acquired", source.name());
                fusion.set_acquired(Modality::Video, true);
                producers.push(spawn_video_producer(
                    SourceSlot::<dyn FrameSource>::new(source),
                    Arc::clone(&self.inputs.video_adapter),
                    Arc::clone(&fusion),
                    self.config.video.clone(),
                    stop.clone(),
                ));
            }
            Err(e) => warn!("Video unavailable, running audio only: {}", e),
        }

        match audio {
            Ok(source) => {
                info!("Audio source '{}' acquired", source.name());
                fusion.set_acquired(Modality::Audio, true);
                producers.push(spawn_audio_producer(
                    SourceSlot::<dyn ChunkSource>::new(source),
                    Arc::clone(&self.inputs.audio_adapter),
                    self.config.audio_target_samples,
                    Arc::clone(&fusion),
                    self.config.audio.clone(),
                    stop.clone(),
                ));
            }
            Err(e) => warn!("Audio unavailable, running video only: {}", e),
        }

        let stats = Arc::new(SchedulerStats::default());
        *self.last_stats.lock().unwrap_or_else(|e| e.into_inner()) = Arc::clone(&stats);

        self.broadcaster.open();
        let scheduler = BroadcastScheduler::spawn(
            TickContext {
                pipeline_id: self.id,
                state: Arc::clone(&fusion),
                tuning: self.tuning.clone(),
                derivation: Arc::clone(&self.derivation),
                broadcaster: Arc::clone(&self.broadcaster),
                sequence: Arc::clone(&self.sequence),
                stats: Arc::clone(&stats),
            },
            stop.clone(),
        );

        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *run = Some(Run {
            stop,
            producers,
            scheduler,
            stats,
            started_at: Utc::now(),
        });
        self.set_state(PipelineState::Running);

        let degraded = Modality::ALL
            .into_iter()
            .any(|m| fusion.is_enabled(m) && !fusion.is_acquired(m));
        info!(
            "Pipeline {} running{}",
            self.id,
            if degraded { " (degraded: single modality)" } else { "" }
        );
        Ok(())
    }

    /// Stop producers and the scheduler, release sources and reset state.
    ///
    /// Always ends in Idle. Threads that miss the stop timeout are detached
    /// after their sources are force-released. A no-op while idle.
    pub fn stop(&self) -> StopReport {
        let mut guard = self.run.lock().unwrap_or_else(|e| e.into_inner());
        let Some(run) = guard.take() else {
            debug!("Pipeline {} not running, stop ignored", self.id);
            return StopReport::default();
        };

        self.set_state(PipelineState::Stopping);
        info!("Stopping pipeline {}", self.id);

        let deadline = Instant::now() + self.config.stop_timeout;
        run.stop.stop();
        // No emission can start after this returns
        self.broadcaster.close();

        let mut report = StopReport {
            was_running: true,
            ..StopReport::default()
        };

        let all_finished = |run: &Run| {
            run.scheduler.is_finished() && run.producers.iter().all(|p| p.is_finished())
        };
        while !all_finished(&run) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }

        if run.scheduler.is_finished() {
            run.scheduler.join();
        } else {
            report.timed_out.push("scheduler".to_string());
        }

        for producer in run.producers {
            let modality = producer.modality();
            if producer.is_finished() {
                producer.force_release();
                let producer_report = producer.join();
                match modality {
                    Modality::Video => report.video = producer_report,
                    Modality::Audio => report.audio = producer_report,
                }
            } else {
                if !producer.force_release() {
                    warn!(
                        "{} source busy in a read; it is released when the read returns",
                        modality
                    );
                }
                report.timed_out.push(format!("{} producer", modality));
            }
        }
        report.ticks = run.stats.ticks();

        if !report.timed_out.is_empty() {
            let err = PipelineError::StopTimeout {
                timeout_ms: duration_ms(self.config.stop_timeout),
                pending: report.timed_out.join(", "),
            };
            warn!("Pipeline {}: {}", self.id, err);
            self.record_error(&err);
        }

        self.fusion_state().reset();
        self.set_state(PipelineState::Idle);
        info!(
            "Pipeline {} stopped after {} ticks (ran since {})",
            self.id, report.ticks, run.started_at
        );
        report
    }

    /// Subscribe to snapshots. Subscriptions survive restarts.
    pub fn subscribe(&self, name: &str) -> Subscription {
        self.broadcaster
            .subscribe(name, self.config.subscriber_capacity)
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.broadcaster.unsubscribe(subscription.id())
    }

    /// Toggle a modality without touching the other one. Takes effect on
    /// the next producer iteration and fusion cycle.
    pub fn set_modality_enabled(&self, modality: Modality, enabled: bool) {
        {
            let fusion = self.fusion.lock().unwrap_or_else(|e| e.into_inner());
            self.enabled_flag(modality).store(enabled, Ordering::SeqCst);
            fusion.set_enabled(modality, enabled);
        }
        info!(
            "{} modality {}",
            modality,
            if enabled { "enabled" } else { "disabled" }
        );
    }

    pub fn is_modality_enabled(&self, modality: Modality) -> bool {
        self.enabled_flag(modality).load(Ordering::SeqCst)
    }

    pub fn set_weights(&self, video: f64, audio: f64) -> Result<(), ConfigError> {
        self.tuning.set_weights(video, audio)
    }

    pub fn set_smoothing_alpha(&self, alpha: f64) -> Result<(), ConfigError> {
        self.tuning.set_alpha(alpha)
    }

    pub fn set_update_period(&self, period: Duration) -> Result<(), ConfigError> {
        self.tuning.set_update_period(period)
    }

    /// Snapshot of the current smoothed state, computed on demand.
    /// Neither smoothing nor the sequence counter advance.
    pub fn current_snapshot(&self) -> Snapshot {
        let fusion = self.fusion_state();
        let smoothed = fusion.smoothed();
        let derived = self.derivation.derive(&smoothed);
        Snapshot::assemble(
            self.id,
            self.sequence.load(Ordering::SeqCst),
            &smoothed,
            &derived,
            &fusion,
        )
    }

    pub fn status(&self) -> PipelineStatus {
        let state = self.state();
        let fusion = self.fusion_state();
        let video = fusion.status(Modality::Video);
        let audio = fusion.status(Modality::Audio);
        let stats = Arc::clone(&self.last_stats.lock().unwrap_or_else(|e| e.into_inner()));
        let tuning = self.tuning.get();
        let started_at = self
            .run
            .try_lock()
            .ok()
            .and_then(|run| run.as_ref().map(|r| r.started_at));
        let lacking = |s: &ModalityStatus| s.enabled && !s.is_active();

        PipelineStatus {
            pipeline_id: self.id,
            state,
            running: state == PipelineState::Running,
            degraded: state == PipelineState::Running && (lacking(&video) || lacking(&audio)),
            video,
            audio,
            emotion_count: EMOTION_COUNT,
            last_sequence: self.sequence.load(Ordering::SeqCst),
            ticks: stats.ticks(),
            skipped_ticks: stats.skipped_ticks(),
            subscribers: self.broadcaster.subscriber_count(),
            update_period_ms: duration_ms(tuning.update_period),
            weights: tuning.engine.weights(),
            alpha: tuning.engine.alpha(),
            started_at,
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .as_ref()
                .map(|e| e.to_string()),
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{fast_inputs, FailingAudioDevice, FailingVideoDevice};

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            update_period: Duration::from_millis(20),
            video: ProducerConfig {
                stride: 1,
                ..ProducerConfig::default()
            },
            audio_target_samples: 160,
            ..PipelineConfig::default()
        }
    }

    fn pipeline(inputs: PipelineInputs) -> Pipeline {
        Pipeline::new(fast_config(), inputs).unwrap()
    }

    #[test]
    fn test_starts_idle() {
        let p = pipeline(fast_inputs());
        let status = p.status();
        assert_eq!(status.state, PipelineState::Idle);
        assert!(!status.running);
        assert_eq!(status.emotion_count, 28);
        assert!(status.started_at.is_none());
    }

    #[test]
    fn test_start_and_stop() {
        let p = pipeline(fast_inputs());
        p.start().unwrap();
        assert_eq!(p.state(), PipelineState::Running);
        let status = p.status();
        assert!(status.video.acquired && status.audio.acquired);
        assert!(!status.degraded);
        assert!(status.started_at.is_some());

        let report = p.stop();
        assert!(report.was_running);
        assert!(report.is_clean());
        assert_eq!(p.state(), PipelineState::Idle);
        assert!(!p.status().video.acquired);
    }

    #[test]
    fn test_stop_while_idle_is_noop() {
        let p = pipeline(fast_inputs());
        let report = p.stop();
        assert!(!report.was_running);
        assert_eq!(p.state(), PipelineState::Idle);
    }

    #[test]
    fn test_restart_after_stop() {
        let p = pipeline(fast_inputs());
        p.start().unwrap();
        p.stop();
        p.start().unwrap();
        assert!(p.is_running());
        p.stop();
    }

    #[test]
    fn test_both_sources_failing_is_start_failure() {
        let inputs = PipelineInputs {
            video_device: Arc::new(FailingVideoDevice),
            audio_device: Arc::new(FailingAudioDevice),
            ..fast_inputs()
        };
        let p = pipeline(inputs);

        let err = p.start().unwrap_err();
        assert!(matches!(err, PipelineError::StartFailure { .. }));
        assert_eq!(p.state(), PipelineState::Idle);
        assert!(p.status().last_error.is_some());
    }

    #[test]
    fn test_single_source_failure_runs_degraded() {
        let inputs = PipelineInputs {
            video_device: Arc::new(FailingVideoDevice),
            ..fast_inputs()
        };
        let p = pipeline(inputs);

        p.start().unwrap();
        let status = p.status();
        assert!(status.running);
        assert!(status.degraded);
        assert!(!status.video.acquired);
        assert!(status.audio.acquired);
        p.stop();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = PipelineConfig {
            alpha: 0.0,
            ..fast_config()
        };
        let result = Pipeline::new(config, fast_inputs());
        assert!(matches!(
            result,
            Err(PipelineError::InvalidConfig(ConfigError::InvalidAlpha(_)))
        ));
    }

    #[test]
    fn test_controls_reflected_in_status() {
        let p = pipeline(fast_inputs());
        p.set_weights(0.7, 0.3).unwrap();
        p.set_smoothing_alpha(0.9).unwrap();
        p.set_update_period(Duration::from_millis(250)).unwrap();
        p.set_modality_enabled(Modality::Audio, false);

        let status = p.status();
        assert_eq!(status.weights.video, 0.7);
        assert_eq!(status.alpha, 0.9);
        assert_eq!(status.update_period_ms, 250);
        assert!(!status.audio.enabled);
        assert!(!p.is_modality_enabled(Modality::Audio));
        assert!(p.set_smoothing_alpha(1.2).is_err());
    }

    #[test]
    fn test_current_snapshot_does_not_advance_sequence() {
        let p = pipeline(fast_inputs());
        let snapshot = p.current_snapshot();
        assert_eq!(snapshot.sequence_number, 0);
        assert_eq!(snapshot.emotions.len(), 28);
        assert_eq!(snapshot.get("distracted"), 1.0);
        assert_eq!(p.current_snapshot().sequence_number, 0);
    }

    #[test]
    fn test_toggle_during_restart_reaches_new_run() {
        let p = pipeline(fast_inputs());
        std::thread::scope(|scope| {
            let toggler = scope.spawn(|| {
                for i in 0..200 {
                    p.set_modality_enabled(Modality::Video, i % 2 == 0);
                    thread::sleep(Duration::from_micros(200));
                }
            });
            loop {
                p.start().unwrap();
                if toggler.is_finished() {
                    break;
                }
                p.stop();
            }
        });

        // The last toggle disabled video, whether it landed before or during this run's start
        assert!(p.is_running());
        assert!(!p.is_modality_enabled(Modality::Video));
        assert!(!p.status().video.enabled);
        p.stop();
    }
}
