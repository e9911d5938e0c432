//! Emotion taxonomy and score vectors.
//!
//! Every score that crosses a module boundary lives in an [`EmotionVector`],
//! which clamps to `[0, 1]` on every write. The fixed taxonomy has three
//! groups:
//!
//! - **Visual** (7) - produced by the facial-expression adapter
//! - **Vocal** (11) - produced by the speech-emotion adapter
//! - **Derived** (10) - composites computed by [`crate::derivation`]

mod mapping;
mod taxonomy;
mod vector;

pub use mapping::{map_speech_labels, normalize_face_scores};
pub use taxonomy::{
    all_emotions, basic_emotions, modality_of, Modality, ParseModalityError,
    BASIC_EMOTION_COUNT, DERIVED_EMOTIONS, EMOTION_COUNT, VISUAL_EMOTIONS, VOCAL_EMOTIONS,
};
pub use vector::{clamp_score, EmotionVector};
