// End-to-end scenarios for the fusion pipeline
// Producers, scheduler and supervisor run on real threads against paced
// synthetic devices; scripted adapters control what each modality reports.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use crate::broadcast::Subscription;
    use crate::emotion::{EmotionVector, Modality};
    use crate::fusion::{FusionEngine, FusionState, FusionWeights};
    use crate::producer::ProducerConfig;
    use crate::snapshot::Snapshot;
    use crate::source::{
        AcquisitionError, FrameSource, MediaSource, SourceError, VideoDevice, VideoFrame,
    };
    use crate::supervisor::{Pipeline, PipelineConfig, PipelineError, PipelineInputs, PipelineState};
    use crate::synthetic::{fast_inputs, FailingAudioDevice, FailingVideoDevice, ScriptedAdapter};

    const WAIT: Duration = Duration::from_secs(5);

    fn vector(pairs: &[(&str, f64)]) -> EmotionVector {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    fn producer_config() -> ProducerConfig {
        ProducerConfig {
            stride: 1,
            failure_threshold: 5,
            retry_delay: Duration::from_millis(2),
            max_backoff: Duration::from_millis(10),
            idle_poll: Duration::from_millis(2),
        }
    }

    // No smoothing, fast ticks, every frame inferred
    fn test_config() -> PipelineConfig {
        PipelineConfig {
            update_period: Duration::from_millis(20),
            alpha: 1.0,
            video: producer_config(),
            audio: producer_config(),
            audio_target_samples: 0,
            subscriber_timeout: Duration::from_millis(5),
            subscriber_capacity: 64,
            ..PipelineConfig::default()
        }
    }

    struct Harness {
        pipeline: Pipeline,
        video: Arc<ScriptedAdapter>,
        audio: Arc<ScriptedAdapter>,
    }

    fn harness(video: EmotionVector, audio: EmotionVector, config: PipelineConfig) -> Harness {
        let video = ScriptedAdapter::new(video);
        let audio = ScriptedAdapter::new(audio);
        let inputs = PipelineInputs {
            video_adapter: video.clone(),
            audio_adapter: audio.clone(),
            ..fast_inputs()
        };
        Harness {
            pipeline: Pipeline::new(config, inputs).unwrap(),
            video,
            audio,
        }
    }

    fn next_matching(
        sub: &mut Subscription,
        pred: impl Fn(&Snapshot) -> bool,
    ) -> Option<Snapshot> {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if let Some(snapshot) = sub.recv_timeout(Duration::from_millis(50)) {
                if pred(&snapshot) {
                    return Some(snapshot);
                }
            }
        }
        None
    }

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    /// First snapshot fused after both modalities had published
    fn settled(sub: &mut Subscription) -> Snapshot {
        let both = |s: &Snapshot| s.video.samples_published > 0 && s.audio.samples_published > 0;
        let first = next_matching(sub, both).unwrap();
        next_matching(sub, |s| s.sequence_number > first.sequence_number).unwrap()
    }

    #[test]
    fn test_enthusiastic_from_both_modalities() {
        let h = harness(
            vector(&[("happy", 0.8)]),
            vector(&[("excited", 0.6)]),
            test_config(),
        );
        let mut sub = h.pipeline.subscribe("test");
        h.pipeline.start().unwrap();

        let snapshot = settled(&mut sub);
        assert_eq!(snapshot.get("happy"), 0.8);
        assert_eq!(snapshot.get("excited"), 0.6);
        assert!((snapshot.get("enthusiastic") - 0.70).abs() < 1e-9);
        assert_eq!(snapshot.emotions.len(), 28);
        assert!(!snapshot.degraded);

        h.pipeline.stop();
    }

    #[test]
    fn test_every_snapshot_has_distracted_complementing_engaged() {
        let h = harness(
            vector(&[("happy", 0.3)]),
            vector(&[("engaged", 0.37)]),
            PipelineConfig {
                alpha: 0.3,
                ..test_config()
            },
        );
        let mut sub = h.pipeline.subscribe("test");
        h.pipeline.start().unwrap();

        let mut seen = 0;
        while seen < 10 {
            let snapshot = sub.recv_timeout(WAIT).unwrap();
            assert_eq!(snapshot.get("distracted") + snapshot.get("engaged"), 1.0);
            assert!(snapshot.emotions.iter().all(|(_, v)| (0.0..=1.0).contains(&v)));
            seen += 1;
        }
        h.pipeline.stop();
    }

    #[test]
    fn test_disabling_audio_freezes_vocal_keys() {
        let h = harness(
            vector(&[("happy", 0.8)]),
            vector(&[("excited", 0.6)]),
            test_config(),
        );
        let mut sub = h.pipeline.subscribe("test");
        h.pipeline.start().unwrap();
        settled(&mut sub);

        h.pipeline.set_modality_enabled(Modality::Audio, false);
        h.audio.set_vector(vector(&[("excited", 0.1)]));
        h.video.set_vector(vector(&[("happy", 0.2)]));

        let snapshot = next_matching(&mut sub, |s| s.get("happy") == 0.2).unwrap();
        assert_eq!(snapshot.get("excited"), 0.6);
        assert!((snapshot.get("enthusiastic") - 0.4).abs() < 1e-9);
        assert!(!snapshot.audio.enabled);
        // Switched off on purpose, so not degraded
        assert!(!snapshot.degraded);

        // Later snapshots keep the frozen value
        let later = next_matching(&mut sub, |s| s.sequence_number > snapshot.sequence_number + 2)
            .unwrap();
        assert_eq!(later.get("excited"), 0.6);

        // Re-enabling resumes updates
        h.pipeline.set_modality_enabled(Modality::Audio, true);
        assert!(next_matching(&mut sub, |s| s.get("excited") == 0.1).is_some());
        h.pipeline.stop();
    }

    #[test]
    fn test_consecutive_audio_failures_degrade_then_recover() {
        let h = harness(
            vector(&[("happy", 0.8)]),
            vector(&[("excited", 0.6)]),
            test_config(),
        );
        let mut sub = h.pipeline.subscribe("test");
        h.pipeline.start().unwrap();
        settled(&mut sub);

        h.audio.set_failing(true);
        assert!(wait_for(|| h.pipeline.status().audio.degraded));
        let snapshot = next_matching(&mut sub, |s| s.audio.degraded).unwrap();
        assert!(snapshot.degraded);
        assert!(snapshot.audio.consecutive_failures >= 5);
        assert_eq!(snapshot.active_modalities(), vec![Modality::Video]);
        // Stale-but-valid: the last good audio value is retained
        assert_eq!(snapshot.get("excited"), 0.6);
        assert!(h.pipeline.status().degraded);

        // Still retried in the background; the next success clears the flag
        h.audio.set_vector(vector(&[("excited", 0.2)]));
        h.audio.set_failing(false);
        let recovered = next_matching(&mut sub, |s| !s.audio.degraded && s.get("excited") == 0.2);
        assert!(recovered.is_some());
        h.pipeline.stop();
    }

    #[test]
    fn test_degraded_modality_weight_renormalized_to_other() {
        // Overlapping keys cannot come out of the producers, so drive the
        // shared state directly
        let state = FusionState::default();
        state.set_acquired(Modality::Video, true);
        state.set_acquired(Modality::Audio, true);
        state.publish(Modality::Video, vector(&[("engaged", 0.9)]));
        state.publish(Modality::Audio, vector(&[("engaged", 0.1)]));
        let engine = FusionEngine::new(FusionWeights::new(0.5, 0.5).unwrap(), 1.0).unwrap();

        assert!((engine.cycle(&state).get("engaged") - 0.5).abs() < 1e-9);

        for _ in 0..5 {
            state.record_failure(Modality::Audio, 5);
        }
        assert!((engine.cycle(&state).get("engaged") - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_stop_mid_inference_emits_nothing_afterwards() {
        let config = PipelineConfig {
            stop_timeout: Duration::from_secs(2),
            ..test_config()
        };
        let h = harness(vector(&[("happy", 0.5)]), vector(&[("calm", 0.5)]), config);
        h.video.set_delay(Duration::from_millis(150));
        h.audio.set_delay(Duration::from_millis(150));
        let mut sub = h.pipeline.subscribe("test");
        h.pipeline.start().unwrap();
        assert!(next_matching(&mut sub, |s| s.sequence_number >= 3).is_some());

        let started = Instant::now();
        let report = h.pipeline.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(report.is_clean());
        let last_sequence = h.pipeline.status().last_sequence;

        std::thread::sleep(Duration::from_millis(100));
        let late: Vec<u64> = sub.drain().iter().map(|s| s.sequence_number).collect();
        assert!(late.iter().all(|seq| *seq <= last_sequence));
        assert_eq!(h.pipeline.status().last_sequence, last_sequence);
        assert_eq!(h.pipeline.state(), PipelineState::Idle);
    }

    /// Camera whose reads block far longer than the stop timeout
    struct StallingCamera;

    impl MediaSource for StallingCamera {
        fn name(&self) -> &str {
            "stalling-camera"
        }
    }

    impl FrameSource for StallingCamera {
        fn next_frame(&mut self) -> Result<VideoFrame, SourceError> {
            std::thread::sleep(Duration::from_millis(800));
            Err(SourceError::Timeout {
                modality: Modality::Video,
            })
        }
    }

    struct StallingVideoDevice;

    impl VideoDevice for StallingVideoDevice {
        fn open(&self) -> Result<Box<dyn FrameSource>, AcquisitionError> {
            Ok(Box::new(StallingCamera))
        }
    }

    #[test]
    fn test_stop_timeout_forces_completion() {
        let video = ScriptedAdapter::new(vector(&[("happy", 0.5)]));
        let inputs = PipelineInputs {
            video_device: Arc::new(StallingVideoDevice),
            video_adapter: video,
            ..fast_inputs()
        };
        let config = PipelineConfig {
            stop_timeout: Duration::from_millis(100),
            ..test_config()
        };
        let pipeline = Pipeline::new(config, inputs).unwrap();
        pipeline.start().unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        let report = pipeline.stop();
        assert!(started.elapsed() < Duration::from_millis(600));
        assert_eq!(report.timed_out, vec!["video producer".to_string()]);
        assert!(report.audio.is_some());

        let status = pipeline.status();
        assert_eq!(status.state, PipelineState::Idle);
        assert!(status.last_error.unwrap().contains("Shutdown exceeded"));

        // A fresh run is unaffected by the detached thread
        pipeline.start().unwrap();
        assert!(pipeline.is_running());
        pipeline.stop();
    }

    #[test]
    fn test_detached_producer_leaves_idle_state_untouched() {
        let inputs = PipelineInputs {
            video_device: Arc::new(StallingVideoDevice),
            ..fast_inputs()
        };
        let config = PipelineConfig {
            stop_timeout: Duration::from_millis(100),
            ..test_config()
        };
        let pipeline = Pipeline::new(config, inputs).unwrap();
        pipeline.start().unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let report = pipeline.stop();
        assert_eq!(report.timed_out, vec!["video producer".to_string()]);
        let idle = pipeline.status().video;
        assert_eq!(idle.total_failures, 0);

        // The stalled read fails after the producer was detached
        std::thread::sleep(Duration::from_millis(1200));
        let later = pipeline.status().video;
        assert_eq!(later.consecutive_failures, 0);
        assert_eq!(later.total_failures, 0);
        assert_eq!(later, idle);
    }

    #[test]
    fn test_second_start_is_noop() {
        let h = harness(vector(&[("happy", 0.5)]), vector(&[("calm", 0.5)]), test_config());
        h.pipeline.start().unwrap();
        let started_at = h.pipeline.status().started_at;

        h.pipeline.start().unwrap();
        assert_eq!(h.pipeline.status().started_at, started_at);

        let before = h.pipeline.status().ticks;
        std::thread::sleep(Duration::from_millis(200));
        let ticks = h.pipeline.status().ticks - before;
        // One 20 ms timer, not two
        assert!(ticks <= 13, "got {} ticks", ticks);
        h.pipeline.stop();
    }

    #[test]
    fn test_stop_from_another_thread() {
        let h = harness(vector(&[("happy", 0.5)]), vector(&[("calm", 0.5)]), test_config());
        let pipeline = Arc::new(h.pipeline);
        pipeline.start().unwrap();

        let other = Arc::clone(&pipeline);
        let report = std::thread::spawn(move || other.stop()).join().unwrap();
        assert!(report.was_running);
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    #[test]
    fn test_start_failure_then_idle() {
        let inputs = PipelineInputs {
            video_device: Arc::new(FailingVideoDevice),
            audio_device: Arc::new(FailingAudioDevice),
            ..fast_inputs()
        };
        let pipeline = Pipeline::new(test_config(), inputs).unwrap();
        match pipeline.start() {
            Err(PipelineError::StartFailure { video, audio }) => {
                assert_eq!(video.modality(), Modality::Video);
                assert_eq!(audio.modality(), Modality::Audio);
            }
            other => panic!("expected StartFailure, got {:?}", other),
        }
        assert_eq!(pipeline.state(), PipelineState::Idle);
        assert!(!pipeline.stop().was_running);
    }

    #[test]
    fn test_single_modality_snapshot_flagged_degraded() {
        let video = ScriptedAdapter::new(vector(&[("happy", 0.8)]));
        let inputs = PipelineInputs {
            audio_device: Arc::new(FailingAudioDevice),
            video_adapter: video,
            ..fast_inputs()
        };
        let pipeline = Pipeline::new(test_config(), inputs).unwrap();
        let mut sub = pipeline.subscribe("test");
        pipeline.start().unwrap();

        let snapshot = next_matching(&mut sub, |s| s.get("happy") == 0.8).unwrap();
        assert!(snapshot.degraded);
        assert!(!snapshot.audio.acquired);
        // Absent audio is 0, never missing
        assert_eq!(snapshot.get("excited"), 0.0);
        assert_eq!(snapshot.emotions.len(), 28);
        pipeline.stop();
    }

    #[test]
    fn test_runtime_alpha_change_applies_next_cycle() {
        let h = harness(vector(&[("happy", 0.8)]), vector(&[("calm", 0.5)]), test_config());
        let mut sub = h.pipeline.subscribe("test");
        h.pipeline.start().unwrap();
        let snapshot = settled(&mut sub);
        assert_eq!(snapshot.get("happy"), 0.8);

        h.pipeline.set_smoothing_alpha(0.5).unwrap();
        // Skip any tick that may have read the old alpha
        let after = h.pipeline.status().last_sequence + 1;
        let applied = next_matching(&mut sub, |s| s.sequence_number > after).unwrap();
        assert_eq!(applied.get("happy"), 0.8);

        h.video.set_vector(vector(&[("happy", 0.0)]));
        let moved = next_matching(&mut sub, |s| s.get("happy") < 0.8).unwrap();
        assert!((moved.get("happy") - 0.4).abs() < 1e-9);
        h.pipeline.stop();
    }

    #[test]
    fn test_runtime_period_change() {
        let h = harness(vector(&[("happy", 0.5)]), vector(&[("calm", 0.5)]), test_config());
        h.pipeline.start().unwrap();
        h.pipeline.set_update_period(Duration::from_millis(200)).unwrap();
        // Let the 20 ms boundary already scheduled pass
        std::thread::sleep(Duration::from_millis(60));

        let before = h.pipeline.status().ticks;
        std::thread::sleep(Duration::from_millis(300));
        let ticks = h.pipeline.status().ticks - before;
        assert!(ticks <= 3, "got {} ticks", ticks);
        h.pipeline.stop();
    }

    #[test]
    fn test_independent_instances_do_not_share_state() {
        let a = harness(vector(&[("happy", 0.9)]), vector(&[("calm", 0.5)]), test_config());
        let b = harness(vector(&[("happy", 0.1)]), vector(&[("calm", 0.5)]), test_config());
        let mut sub_a = a.pipeline.subscribe("a");
        let mut sub_b = b.pipeline.subscribe("b");
        a.pipeline.start().unwrap();
        b.pipeline.start().unwrap();

        let snap_a = settled(&mut sub_a);
        let snap_b = settled(&mut sub_b);
        assert_eq!(snap_a.get("happy"), 0.9);
        assert_eq!(snap_b.get("happy"), 0.1);
        assert_ne!(snap_a.pipeline_id, snap_b.pipeline_id);

        a.pipeline.stop();
        assert!(b.pipeline.is_running());
        b.pipeline.stop();
    }

    #[test]
    fn test_stop_resets_fusion_state() {
        let h = harness(vector(&[("happy", 0.8)]), vector(&[("calm", 0.5)]), test_config());
        let mut sub = h.pipeline.subscribe("test");
        h.pipeline.start().unwrap();
        settled(&mut sub);
        assert_eq!(h.pipeline.current_snapshot().get("happy"), 0.8);

        h.pipeline.stop();
        let idle = h.pipeline.current_snapshot();
        assert_eq!(idle.get("happy"), 0.0);
        assert_eq!(idle.video.samples_published, 0);

        // Sequence numbers keep increasing across restarts
        let last = h.pipeline.status().last_sequence;
        h.pipeline.start().unwrap();
        let next = sub.recv_timeout(WAIT).unwrap();
        assert!(next.sequence_number > last);
        h.pipeline.stop();
    }

    #[test]
    fn test_slow_subscriber_does_not_stall_others() {
        let h = harness(vector(&[("happy", 0.5)]), vector(&[("calm", 0.5)]), test_config());
        let _stuck = h.pipeline.subscribe("stuck");
        let mut live = h.pipeline.subscribe("live");
        h.pipeline.start().unwrap();

        // The stuck subscriber's queue (64) fills and it starts missing ticks
        let deadline = Instant::now() + WAIT;
        let mut received = 0;
        while h.pipeline.status().ticks <= 80 && Instant::now() < deadline {
            received += live.drain().len();
            std::thread::sleep(Duration::from_millis(5));
        }
        received += live.drain().len();
        assert!(received >= 75, "live subscriber got {}", received);
        assert_eq!(h.pipeline.status().subscribers, 2);
        h.pipeline.stop();
    }
}
