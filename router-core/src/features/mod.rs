//! Feature extraction
//!
//! Turns `(query embedding, candidate)` into a fixed-length [`FeatureVector`]
//! for the inference model.
//!
//! # Layout
//!
//! ```text
//! slot | signal      | raw range | source
//! -----|-------------|-----------|--------------------------------------
//!  0   | similarity  | [0, 1]    | cosine(query, candidate.embedding)
//!  1   | recency     | (0, 1]    | exp(-decay × age_hours)
//!  2   | frequency   | [0, 1]    | ln(1 + access_count) / ln(1 + saturation)
//!  3   | success     | [0, 1]    | candidate.success_rate
//!  4   | metadata    | [0, 1]    | request/candidate metadata match
//! ```
//!
//! Each raw signal is multiplied by its [`FeatureWeights`] entry. The slot
//! order is part of the model contract and never changes.

pub mod extractor;
pub mod similarity;

pub use extractor::{
    frequency_score, metadata_score, recency_score, FeatureExtractor,
};
pub use similarity::cosine_similarity;

use serde::{Deserialize, Serialize};

use crate::error::{RouterError, RouterResult};

/// Number of signals in every feature vector.
pub const SIGNAL_COUNT: usize = 5;

/// One feature signal and its fixed slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    /// Cosine similarity between query and candidate
    Similarity,
    /// Exponential decay of candidate age
    Recency,
    /// Log-scaled access count
    Frequency,
    /// Stored success rate
    Success,
    /// Metadata match score
    Metadata,
}

impl Signal {
    /// All signals in slot order.
    pub const ALL: [Signal; SIGNAL_COUNT] = [
        Signal::Similarity,
        Signal::Recency,
        Signal::Frequency,
        Signal::Success,
        Signal::Metadata,
    ];

    /// Slot index in the feature vector.
    pub fn index(self) -> usize {
        match self {
            Self::Similarity => 0,
            Self::Recency => 1,
            Self::Frequency => 2,
            Self::Success => 3,
            Self::Metadata => 4,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Similarity => write!(f, "similarity"),
            Self::Recency => write!(f, "recency"),
            Self::Frequency => write!(f, "frequency"),
            Self::Success => write!(f, "success"),
            Self::Metadata => write!(f, "metadata"),
        }
    }
}

/// Weighted signals for one candidate, in slot order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector([f32; SIGNAL_COUNT]);

impl FeatureVector {
    /// Wrap already-weighted values.
    pub fn new(values: [f32; SIGNAL_COUNT]) -> Self {
        Self(values)
    }

    /// Value in the slot of `signal`.
    pub fn get(&self, signal: Signal) -> f32 {
        self.0[signal.index()]
    }

    /// All values in slot order.
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Always [`SIGNAL_COUNT`].
    pub fn len(&self) -> usize {
        SIGNAL_COUNT
    }

    /// Never empty; present for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Sum of the weighted signals.
    pub fn total(&self) -> f32 {
        self.0.iter().sum()
    }
}

/// Per-signal weights.
///
/// Recommended to sum to 1.0; this is logged, not enforced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureWeights {
    pub similarity: f32,
    pub recency: f32,
    pub frequency: f32,
    pub success: f32,
    pub metadata: f32,
}

impl Default for FeatureWeights {
    fn default() -> Self {
        Self {
            similarity: 0.40,
            recency: 0.20,
            frequency: 0.15,
            success: 0.15,
            metadata: 0.10,
        }
    }
}

impl FeatureWeights {
    /// Weights in slot order.
    pub fn as_array(&self) -> [f32; SIGNAL_COUNT] {
        [
            self.similarity,
            self.recency,
            self.frequency,
            self.success,
            self.metadata,
        ]
    }

    /// Weight for one signal.
    pub fn weight(&self, signal: Signal) -> f32 {
        self.as_array()[signal.index()]
    }

    /// Sum of all weights.
    pub fn total(&self) -> f32 {
        self.as_array().iter().sum()
    }

    /// Reject negative or non-finite weights.
    pub fn validate(&self) -> RouterResult<()> {
        for signal in Signal::ALL {
            let w = self.weight(signal);
            if !w.is_finite() || w < 0.0 {
                return Err(RouterError::Config(format!(
                    "feature weight '{signal}' must be finite and non-negative, got {w}"
                )));
            }
        }
        Ok(())
    }
}

/// How request metadata is compared against candidate metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataMatch {
    /// Fraction of request keys present on the candidate.
    #[default]
    KeyOverlap,
    /// Fraction of request key/value pairs equal on the candidate.
    ExactValue,
    /// Signal always 0.
    Disabled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_slots_are_dense_and_ordered() {
        for (i, signal) in Signal::ALL.iter().enumerate() {
            assert_eq!(signal.index(), i);
        }
    }

    #[test]
    fn test_default_weights_sum_to_one() {
        assert!((FeatureWeights::default().total() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_weights_reject_negative() {
        let w = FeatureWeights {
            recency: -0.1,
            ..Default::default()
        };
        let err = w.validate().unwrap_err();
        assert!(err.to_string().contains("recency"));
    }

    #[test]
    fn test_weights_reject_nan() {
        let w = FeatureWeights {
            metadata: f32::NAN,
            ..Default::default()
        };
        assert!(w.validate().is_err());
    }

    #[test]
    fn test_weights_partial_toml() {
        let w: FeatureWeights = toml::from_str("similarity = 0.7").unwrap();
        assert_eq!(w.similarity, 0.7);
        assert_eq!(w.recency, 0.20);
    }

    #[test]
    fn test_feature_vector_accessors() {
        let fv = FeatureVector::new([0.1, 0.2, 0.3, 0.4, 0.5]);
        assert_eq!(fv.len(), SIGNAL_COUNT);
        assert_eq!(fv.get(Signal::Frequency), 0.3);
        assert!((fv.total() - 1.5).abs() < 1e-6);
    }
}
