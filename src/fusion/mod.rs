//! Fusion core: the shared per-pipeline state and the fuse/smooth engine.

mod engine;
mod state;

pub use engine::{validate_alpha, ActiveModalities, FusionEngine, FusionWeights, DEFAULT_ALPHA};
pub use state::{FusionState, ModalitySample, ModalityStatus};
