//! Composite emotions computed from the smoothed basic vector.
//!
//! Formulas form an ordered, declarative table. A formula may reference any
//! basic emotion or a composite defined earlier in the same table (e.g.
//! `alert` uses `awareness`), so one in-order pass evaluates everything.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

use crate::emotion::{clamp_score, modality_of, EmotionVector};

/// Errors raised when building a formula table
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FormulaError {
    #[error("Formula name is empty")]
    EmptyName,
    #[error("Formula '{0}' is defined more than once")]
    DuplicateName(String),
    #[error("Formula '{0}' would overwrite a measured emotion")]
    ShadowsBasic(String),
    #[error("Formula '{0}' has no terms")]
    NoTerms(String),
    #[error("Formula '{formula}' has a non-finite weight for '{source_key}'")]
    InvalidWeight { formula: String, source_key: String },
    #[error("Formula '{formula}' references unknown or later-defined emotion '{source_key}'")]
    UnknownSource { formula: String, source_key: String },
    #[error("Failed to parse formula table: {0}")]
    Parse(String),
}

/// How the terms of a formula are combined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Combine {
    #[default]
    WeightedSum,
    Max,
    Min,
}

/// One weighted input of a formula
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Term {
    pub source: String,
    pub weight: f64,
    #[serde(default)]
    pub invert: bool,
}

impl Term {
    pub fn new(source: impl Into<String>, weight: f64) -> Self {
        Self {
            source: source.into(),
            weight,
            invert: false,
        }
    }

    pub fn inverted(source: impl Into<String>, weight: f64) -> Self {
        Self {
            invert: true,
            ..Self::new(source, weight)
        }
    }

    /// `weight * x`, or `weight * (1 - x)` when inverted
    fn apply(&self, value: f64) -> f64 {
        let x = if self.invert { 1.0 - value } else { value };
        self.weight * x
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedFormula {
    pub name: String,
    pub terms: Vec<Term>,
    #[serde(default)]
    pub combine: Combine,
}

impl DerivedFormula {
    pub fn weighted_sum(name: impl Into<String>, terms: Vec<Term>) -> Self {
        Self {
            name: name.into(),
            terms,
            combine: Combine::WeightedSum,
        }
    }

    /// Evaluate against `lookup`, clamping the result to `[0, 1]`.
    /// Max and min apply each term's weight and inversion first.
    pub fn evaluate(&self, lookup: impl Fn(&str) -> f64) -> f64 {
        let values = self.terms.iter().map(|t| t.apply(lookup(&t.source)));
        let combined = match self.combine {
            Combine::WeightedSum => values.sum(),
            Combine::Max => values.fold(f64::NEG_INFINITY, f64::max),
            Combine::Min => values.fold(f64::INFINITY, f64::min),
        };
        clamp_score(combined)
    }
}

/// Ordered, validated set of composite formulas
#[derive(Debug, Clone, PartialEq)]
pub struct DerivationTable {
    formulas: Vec<DerivedFormula>,
}

impl Default for DerivationTable {
    fn default() -> Self {
        Self::reference()
    }
}

impl DerivationTable {
    /// The reference formulas
    pub fn reference() -> Self {
        use Term as T;
        let f = DerivedFormula::weighted_sum;
        Self {
            formulas: vec![
                f("receptiveness", vec![T::new("engaged", 0.5), T::new("happy", 0.5)]),
                f("awareness", vec![T::new("engaged", 0.5), T::new("interested", 0.5)]),
                f(
                    "trust",
                    vec![T::new("calm", 0.4), T::new("happy", 0.3), T::new("confident", 0.3)],
                ),
                f("anticipation", vec![T::new("excited", 0.5), T::new("curious", 0.5)]),
                f("relaxed", vec![T::new("calm", 0.5), T::new("neutral", 0.5)]),
                f("skeptical", vec![T::new("confused", 0.5), T::new("neutral", 0.5)]),
                f("distracted", vec![T::inverted("engaged", 1.0)]),
                f("enthusiastic", vec![T::new("excited", 0.5), T::new("happy", 0.5)]),
                f("contemplative", vec![T::new("neutral", 0.5), T::new("interested", 0.5)]),
                f("alert", vec![T::new("awareness", 0.5), T::new("surprise", 0.5)]),
            ],
        }
    }

    /// Validate and wrap a replacement table
    pub fn new(formulas: Vec<DerivedFormula>) -> Result<Self, FormulaError> {
        let mut defined: HashSet<&str> = HashSet::new();
        for formula in &formulas {
            let name = formula.name.as_str();
            if name.is_empty() {
                return Err(FormulaError::EmptyName);
            }
            if modality_of(name).is_some() {
                return Err(FormulaError::ShadowsBasic(name.to_string()));
            }
            if defined.contains(name) {
                return Err(FormulaError::DuplicateName(name.to_string()));
            }
            if formula.terms.is_empty() {
                return Err(FormulaError::NoTerms(name.to_string()));
            }
            for term in &formula.terms {
                if !term.weight.is_finite() {
                    return Err(FormulaError::InvalidWeight {
                        formula: name.to_string(),
                        source_key: term.source.clone(),
                    });
                }
                let known =
                    modality_of(&term.source).is_some() || defined.contains(term.source.as_str());
                if !known {
                    return Err(FormulaError::UnknownSource {
                        formula: name.to_string(),
                        source_key: term.source.clone(),
                    });
                }
            }
            defined.insert(name);
        }
        Ok(Self { formulas })
    }

    /// Load a table from a JSON array of formulas
    pub fn from_json(json: &str) -> Result<Self, FormulaError> {
        let formulas: Vec<DerivedFormula> =
            serde_json::from_str(json).map_err(|e| FormulaError::Parse(e.to_string()))?;
        Self::new(formulas)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.formulas)
    }

    pub fn formulas(&self) -> &[DerivedFormula] {
        &self.formulas
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.formulas.iter().map(|f| f.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.formulas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formulas.is_empty()
    }

    /// Compute every composite from `basic` in table order
    pub fn derive(&self, basic: &EmotionVector) -> EmotionVector {
        let mut derived: BTreeMap<&str, f64> = BTreeMap::new();
        for formula in &self.formulas {
            let value = formula.evaluate(|key| {
                derived
                    .get(key)
                    .copied()
                    .unwrap_or_else(|| basic.get(key))
            });
            derived.insert(formula.name.as_str(), value);
        }
        derived.into_iter().collect()
    }
}
