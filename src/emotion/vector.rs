use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Clamp a score into `[0, 1]`. NaN becomes 0.
pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// Mapping from emotion name to a score in `[0, 1]`
///
/// Scores are clamped on every write (including deserialization), so a
/// vector can never hold an out-of-range or NaN value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, f64>", into = "BTreeMap<String, f64>")]
pub struct EmotionVector {
    scores: BTreeMap<String, f64>,
}

impl EmotionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A vector holding every key in `keys` at 0
    pub fn zeroed<'a>(keys: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            scores: keys.into_iter().map(|k| (k.to_string(), 0.0)).collect(),
        }
    }

    /// Build from percentage scores (0-100), as reported by face classifiers
    pub fn from_percentages<K: Into<String>>(scores: impl IntoIterator<Item = (K, f64)>) -> Self {
        scores
            .into_iter()
            .map(|(k, v)| (k, v / 100.0))
            .collect()
    }

    /// Score for `key`, 0 when absent
    pub fn get(&self, key: &str) -> f64 {
        self.scores.get(key).copied().unwrap_or(0.0)
    }

    pub fn try_get(&self, key: &str) -> Option<f64> {
        self.scores.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.scores.contains_key(key)
    }

    /// Store a clamped score
    pub fn set(&mut self, key: impl Into<String>, score: f64) {
        self.scores.insert(key.into(), clamp_score(score));
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.scores.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Copy of this vector where every key in `keys` is present (missing ones at 0)
    pub fn complete_over<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> Self {
        let mut out = self.clone();
        for key in keys {
            out.scores.entry(key.to_string()).or_insert(0.0);
        }
        out
    }

    /// Copy of this vector holding only the keys in `keys` (missing ones at 0)
    pub fn restrict_to<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            scores: keys
                .into_iter()
                .map(|k| (k.to_string(), self.get(k)))
                .collect(),
        }
    }

    /// Overwrite this vector's entries with those of `other`
    pub fn extend_from(&mut self, other: &EmotionVector) {
        for (k, v) in other.iter() {
            self.scores.insert(k.to_string(), v);
        }
    }

    /// Highest-scoring emotion. Ties resolve to the alphabetically first key.
    pub fn dominant(&self) -> Option<(&str, f64)> {
        self.iter().fold(None, |best, (k, v)| match best {
            Some((_, best_v)) if best_v >= v => best,
            _ => Some((k, v)),
        })
    }

    /// Emotions scoring strictly above `threshold`, highest first
    pub fn above(&self, threshold: f64) -> Vec<(&str, f64)> {
        let mut high: Vec<(&str, f64)> = self.iter().filter(|(_, v)| *v > threshold).collect();
        high.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        high
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for EmotionVector {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        let mut vector = Self::new();
        for (k, v) in iter {
            vector.set(k, v);
        }
        vector
    }
}

impl From<BTreeMap<String, f64>> for EmotionVector {
    fn from(scores: BTreeMap<String, f64>) -> Self {
        scores.into_iter().collect()
    }
}

impl From<EmotionVector> for BTreeMap<String, f64> {
    fn from(vector: EmotionVector) -> Self {
        vector.scores
    }
}
