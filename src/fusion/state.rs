//! Shared store between producers and the broadcast scheduler.
//!
//! Three independent field groups, each with its own short critical section:
//! the per-modality sample slots, the smoothed profile, and the per-modality
//! health flags (atomics). No lock is ever held across inference or emission.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::emotion::{all_emotions, EmotionVector, Modality};

/// One producer's latest inference result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModalitySample {
    pub vector: EmotionVector,
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time view of one modality's health
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModalityStatus {
    pub enabled: bool,
    pub acquired: bool,
    pub degraded: bool,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub samples_published: u64,
}

impl ModalityStatus {
    /// Whether this modality currently contributes to fusion
    pub fn is_active(&self) -> bool {
        self.enabled && self.acquired && !self.degraded
    }
}

#[derive(Debug, Default)]
struct ModalityHealth {
    enabled: AtomicBool,
    acquired: AtomicBool,
    degraded: AtomicBool,
    consecutive_failures: AtomicU32,
    total_failures: AtomicU64,
}

impl ModalityHealth {
    fn new(enabled: bool) -> Self {
        let health = Self::default();
        health.enabled.store(enabled, Ordering::SeqCst);
        health
    }
}

#[derive(Debug, Default)]
struct SampleSlots {
    video: Option<ModalitySample>,
    audio: Option<ModalitySample>,
}

impl SampleSlots {
    fn slot(&mut self, modality: Modality) -> &mut Option<ModalitySample> {
        match modality {
            Modality::Video => &mut self.video,
            Modality::Audio => &mut self.audio,
        }
    }
}

/// Smoothed profile plus the set of keys that have completed their first
/// smoothing step
#[derive(Debug, Clone)]
pub(crate) struct SmoothedProfile {
    pub(crate) values: EmotionVector,
    pub(crate) seen: BTreeSet<String>,
}

impl Default for SmoothedProfile {
    fn default() -> Self {
        Self {
            values: EmotionVector::zeroed(all_emotions()),
            seen: BTreeSet::new(),
        }
    }
}

/// Latest samples, smoothed output and modality flags for one pipeline instance
#[derive(Debug)]
pub struct FusionState {
    samples: Mutex<SampleSlots>,
    smoothed: Mutex<SmoothedProfile>,
    video: ModalityHealth,
    audio: ModalityHealth,
}

impl FusionState {
    pub fn new(video_enabled: bool, audio_enabled: bool) -> Self {
        Self {
            samples: Mutex::new(SampleSlots::default()),
            smoothed: Mutex::new(SmoothedProfile::default()),
            video: ModalityHealth::new(video_enabled),
            audio: ModalityHealth::new(audio_enabled),
        }
    }

    fn health(&self, modality: Modality) -> &ModalityHealth {
        match modality {
            Modality::Video => &self.video,
            Modality::Audio => &self.audio,
        }
    }

    /// Overwrite `modality`'s slot with a new sample (last-value semantics).
    /// Returns the sample's sequence number.
    pub fn publish(&self, modality: Modality, vector: EmotionVector) -> u64 {
        let mut slots = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        let slot = slots.slot(modality);
        let sequence_number = slot.as_ref().map_or(1, |s| s.sequence_number + 1);
        *slot = Some(ModalitySample {
            vector,
            sequence_number,
            timestamp: Utc::now(),
        });
        sequence_number
    }

    pub fn latest(&self, modality: Modality) -> Option<ModalitySample> {
        let mut slots = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        slots.slot(modality).clone()
    }

    /// Copy out both slots under one lock
    pub fn latest_pair(&self) -> (Option<ModalitySample>, Option<ModalitySample>) {
        let slots = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        (slots.video.clone(), slots.audio.clone())
    }

    /// Current smoothed profile (all 28 keys, zero before any sample)
    pub fn smoothed(&self) -> EmotionVector {
        self.smoothed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values
            .clone()
    }

    /// Keep this cycle's composites next to the smoothed basic values
    pub fn store_derived(&self, derived: &EmotionVector) {
        self.with_smoothed(|profile| profile.values.extend_from(derived));
    }

    pub(crate) fn with_smoothed<R>(&self, f: impl FnOnce(&mut SmoothedProfile) -> R) -> R {
        let mut profile = self.smoothed.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut profile)
    }

    pub fn set_enabled(&self, modality: Modality, enabled: bool) {
        self.health(modality).enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self, modality: Modality) -> bool {
        self.health(modality).enabled.load(Ordering::SeqCst)
    }

    pub fn set_acquired(&self, modality: Modality, acquired: bool) {
        self.health(modality).acquired.store(acquired, Ordering::SeqCst);
    }

    pub fn is_acquired(&self, modality: Modality) -> bool {
        self.health(modality).acquired.load(Ordering::SeqCst)
    }

    pub fn is_degraded(&self, modality: Modality) -> bool {
        self.health(modality).degraded.load(Ordering::SeqCst)
    }

    /// Whether samples from `modality` take part in fusion
    pub fn is_active(&self, modality: Modality) -> bool {
        self.is_enabled(modality) && self.is_acquired(modality) && !self.is_degraded(modality)
    }

    /// Count one failed cycle. Flips the degraded flag once the consecutive
    /// count reaches `threshold`; returns true only on that transition.
    pub fn record_failure(&self, modality: Modality, threshold: u32) -> bool {
        let health = self.health(modality);
        health.total_failures.fetch_add(1, Ordering::SeqCst);
        let consecutive = health.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        consecutive >= threshold && !health.degraded.swap(true, Ordering::SeqCst)
    }

    /// Reset the failure streak. Returns true if the modality was degraded.
    pub fn record_success(&self, modality: Modality) -> bool {
        let health = self.health(modality);
        health.consecutive_failures.store(0, Ordering::SeqCst);
        health.degraded.swap(false, Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self, modality: Modality) -> u32 {
        self.health(modality).consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn status(&self, modality: Modality) -> ModalityStatus {
        let health = self.health(modality);
        ModalityStatus {
            enabled: health.enabled.load(Ordering::SeqCst),
            acquired: health.acquired.load(Ordering::SeqCst),
            degraded: health.degraded.load(Ordering::SeqCst),
            consecutive_failures: health.consecutive_failures.load(Ordering::SeqCst),
            total_failures: health.total_failures.load(Ordering::SeqCst),
            samples_published: self.latest(modality).map_or(0, |s| s.sequence_number),
        }
    }

    /// Return to the zero value. Enable flags are left as they are.
    pub fn reset(&self) {
        {
            let mut slots = self.samples.lock().unwrap_or_else(|e| e.into_inner());
            *slots = SampleSlots::default();
        }
        self.with_smoothed(|profile| *profile = SmoothedProfile::default());
        for modality in Modality::ALL {
            let health = self.health(modality);
            health.acquired.store(false, Ordering::SeqCst);
            health.degraded.store(false, Ordering::SeqCst);
            health.consecutive_failures.store(0, Ordering::SeqCst);
            health.total_failures.store(0, Ordering::SeqCst);
        }
    }
}

impl Default for FusionState {
    fn default() -> Self {
        Self::new(true, true)
    }
}
