//! Real-time fusion of facial and vocal emotion scores.
//!
//! Two producer threads (video, audio) feed their latest classifier output
//! into a per-pipeline [`FusionState`]. A scheduler thread fuses the two,
//! smooths the result, derives composite emotions and pushes an immutable
//! [`Snapshot`] to subscribers at a fixed cadence. [`Pipeline`] owns the
//! start/stop lifecycle and the runtime controls.

pub mod adapter;
pub mod broadcast;
pub mod config;
pub mod controls;
pub mod derivation;
pub mod emotion;
pub mod fusion;
pub mod producer;
pub mod snapshot;
pub mod source;
pub mod supervisor;
pub mod synthetic;

mod pipeline_tests;

pub use adapter::{AudioInferenceAdapter, DetectionError, InferenceError, VideoInferenceAdapter};
pub use broadcast::{Broadcaster, EmitReport, Subscription};
pub use config::{Config, ConfigError};
pub use derivation::{Combine, DerivationTable, DerivedFormula, FormulaError, Term};
pub use emotion::{EmotionVector, Modality};
pub use fusion::{FusionEngine, FusionState, FusionWeights, ModalitySample, ModalityStatus};
pub use producer::{ProducerConfig, ProducerError, ProducerReport, StopToken};
pub use snapshot::Snapshot;
pub use source::{
    AcquisitionError, AudioChunk, AudioDevice, ChunkSource, FrameSource, MediaSource,
    SourceError, VideoDevice, VideoFrame,
};
pub use supervisor::{
    Pipeline, PipelineConfig, PipelineError, PipelineInputs, PipelineState, PipelineStatus,
    StopReport,
};
