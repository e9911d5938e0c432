//! Helpers for inference adapters that wrap off-the-shelf classifiers.
//!
//! Speech-emotion models emit a small label set (angry, calm, happy, ...)
//! rather than the 11-key vocal taxonomy; face models usually report
//! percentages. These functions turn such raw outputs into taxonomy vectors.

use std::collections::HashMap;

use super::taxonomy::{VISUAL_EMOTIONS, VOCAL_EMOTIONS};
use super::vector::EmotionVector;

/// Map raw speech-classifier labels onto the vocal taxonomy.
///
/// Labels are matched case-insensitively. Vocal labels the model emits
/// directly (calm, excited, frustrated, ...) are copied first, then the
/// heuristic mappings from the basic speech labels are applied on top.
pub fn map_speech_labels<K: AsRef<str>>(raw: impl IntoIterator<Item = (K, f64)>) -> EmotionVector {
    let raw: HashMap<String, f64> = raw
        .into_iter()
        .map(|(k, v)| (k.as_ref().to_lowercase(), v))
        .collect();

    let mut mapped: HashMap<&'static str, f64> = VOCAL_EMOTIONS.iter().map(|k| (*k, 0.0)).collect();
    for key in VOCAL_EMOTIONS {
        if let Some(score) = raw.get(key) {
            mapped.insert(key, *score);
        }
    }

    if let Some(&angry) = raw.get("angry") {
        bump(&mut mapped, "frustrated", angry * 0.7);
        bump(&mut mapped, "stressed", angry * 0.5);
    }
    if let Some(&calm) = raw.get("calm") {
        mapped.insert("calm", calm);
        mapped.insert("confident", calm * 0.6);
    }
    if let Some(&happy) = raw.get("happy") {
        mapped.insert("excited", happy * 0.7);
        mapped.insert("engaged", happy * 0.5);
        mapped.insert("interested", happy * 0.6);
    }
    if let Some(&neutral) = raw.get("neutral") {
        mapped.insert("bored", neutral * 0.4);
    }
    if let Some(&surprise) = raw.get("surprise") {
        mapped.insert("curious", surprise * 0.8);
        bump(&mut mapped, "interested", surprise * 0.6);
    }
    if let Some(&fear) = raw.get("fear") {
        mapped.insert("anxious", fear * 0.9);
        mapped.insert("confused", fear * 0.4);
    }

    mapped.into_iter().collect()
}

fn bump(mapped: &mut HashMap<&'static str, f64>, key: &'static str, candidate: f64) {
    let entry = mapped.entry(key).or_insert(0.0);
    *entry = entry.max(candidate);
}

/// Convert face-classifier percentages (0-100) to the 7 visual keys.
/// Labels outside the visual taxonomy are dropped; missing ones become 0.
pub fn normalize_face_scores<K: AsRef<str>>(raw: impl IntoIterator<Item = (K, f64)>) -> EmotionVector {
    let scaled = EmotionVector::from_percentages(
        raw.into_iter()
            .map(|(k, v)| (k.as_ref().to_lowercase(), v)),
    );
    scaled.restrict_to(VISUAL_EMOTIONS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_speech_mapping_covers_vocal_taxonomy() {
        let mapped = map_speech_labels([("neutral", 1.0)]);
        assert_eq!(mapped.len(), VOCAL_EMOTIONS.len());
        assert!(close(mapped.get("bored"), 0.4));
        assert_eq!(mapped.get("calm"), 0.0);
    }

    #[test]
    fn test_speech_mapping_heuristics() {
        let mapped = map_speech_labels([
            ("Angry", 0.5),
            ("calm", 0.5),
            ("happy", 0.4),
            ("surprise", 0.5),
            ("fear", 0.2),
        ]);
        assert!(close(mapped.get("frustrated"), 0.35));
        assert!(close(mapped.get("stressed"), 0.25));
        assert!(close(mapped.get("calm"), 0.5));
        assert!(close(mapped.get("confident"), 0.3));
        assert!(close(mapped.get("excited"), 0.28));
        assert!(close(mapped.get("engaged"), 0.2));
        // max(0.4 * 0.6, 0.5 * 0.6)
        assert!(close(mapped.get("interested"), 0.3));
        assert!(close(mapped.get("curious"), 0.4));
        assert!(close(mapped.get("anxious"), 0.18));
        assert!(close(mapped.get("confused"), 0.08));
    }

    #[test]
    fn test_direct_frustration_survives_weaker_anger() {
        let mapped = map_speech_labels([("frustrated", 0.9), ("angry", 0.1)]);
        assert!(close(mapped.get("frustrated"), 0.9));
    }

    #[test]
    fn test_face_percentages() {
        let v = normalize_face_scores([("happy", 80.0), ("Sad", 20.0), ("contempt", 50.0)]);
        assert_eq!(v.len(), VISUAL_EMOTIONS.len());
        assert!(close(v.get("happy"), 0.8));
        assert!(close(v.get("sad"), 0.2));
        assert!(!v.contains("contempt"));
        assert_eq!(v.get("neutral"), 0.0);
    }
}
