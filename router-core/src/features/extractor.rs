//! Multi-signal feature extractor.
//!
//! Extraction is pure: the wall-clock `now` is passed in by the caller, so the
//! same inputs always give the same vector. Batch extraction allocates its
//! own output per call and never shares scratch space between calls.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::similarity::cosine_similarity;
use super::{FeatureVector, FeatureWeights, MetadataMatch, Signal, SIGNAL_COUNT};
use crate::error::RouterResult;
use crate::types::{Candidate, Embedding, Metadata};

const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// Stateless extractor holding the weights and signal tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureExtractor {
    weights: FeatureWeights,
    recency_decay_per_hour: f64,
    frequency_saturation: u64,
    metadata_match: MetadataMatch,
}

impl FeatureExtractor {
    /// Extractor with the given weights and default signal tuning
    /// (decay 0.05/hour, frequency saturation 1000, key-overlap metadata).
    pub fn new(weights: FeatureWeights) -> Self {
        Self {
            weights,
            recency_decay_per_hour: 0.05,
            frequency_saturation: 1000,
            metadata_match: MetadataMatch::KeyOverlap,
        }
    }

    /// Set the recency decay rate (per hour of candidate age).
    pub fn with_recency_decay(mut self, per_hour: f64) -> Self {
        self.recency_decay_per_hour = per_hour;
        self
    }

    /// Set the access count at which the frequency signal saturates.
    pub fn with_frequency_saturation(mut self, saturation: u64) -> Self {
        self.frequency_saturation = saturation;
        self
    }

    /// Set the metadata match policy.
    pub fn with_metadata_match(mut self, policy: MetadataMatch) -> Self {
        self.metadata_match = policy;
        self
    }

    /// Configured weights.
    pub fn weights(&self) -> &FeatureWeights {
        &self.weights
    }

    /// Unweighted signals in slot order, each in [0, 1].
    ///
    /// # Errors
    ///
    /// `DimensionMismatch` when the embeddings differ in length.
    pub fn raw_signals(
        &self,
        query: &Embedding,
        candidate: &Candidate,
        request_metadata: &Metadata,
        now: DateTime<Utc>,
    ) -> RouterResult<[f32; SIGNAL_COUNT]> {
        let similarity =
            cosine_similarity(query.as_slice(), candidate.embedding.as_slice())?.max(0.0);

        let mut raw = [0.0_f32; SIGNAL_COUNT];
        raw[Signal::Similarity.index()] = similarity;
        raw[Signal::Recency.index()] =
            recency_score(candidate.created_at, now, self.recency_decay_per_hour);
        raw[Signal::Frequency.index()] =
            frequency_score(candidate.access_count, self.frequency_saturation);
        raw[Signal::Success.index()] = unit(candidate.success_rate);
        raw[Signal::Metadata.index()] =
            metadata_score(self.metadata_match, request_metadata, &candidate.metadata);
        Ok(raw)
    }

    /// Weighted feature vector for one candidate.
    ///
    /// # Errors
    ///
    /// `DimensionMismatch` when the embeddings differ in length.
    pub fn extract(
        &self,
        query: &Embedding,
        candidate: &Candidate,
        request_metadata: &Metadata,
        now: DateTime<Utc>,
    ) -> RouterResult<FeatureVector> {
        let raw = self.raw_signals(query, candidate, request_metadata, now)?;
        let weights = self.weights.as_array();
        let mut out = [0.0_f32; SIGNAL_COUNT];
        for (slot, (value, weight)) in out.iter_mut().zip(raw.iter().zip(weights.iter())) {
            *slot = value * weight;
        }
        Ok(FeatureVector::new(out))
    }

    /// One result per candidate, in input order.
    pub fn extract_batch(
        &self,
        query: &Embedding,
        candidates: &[Candidate],
        request_metadata: &Metadata,
        now: DateTime<Utc>,
    ) -> Vec<RouterResult<FeatureVector>> {
        candidates
            .iter()
            .map(|c| self.extract(query, c, request_metadata, now))
            .collect()
    }
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new(FeatureWeights::default())
    }
}

/// `exp(-decay × age_hours)`; timestamps in the future count as age zero.
pub fn recency_score(created_at: DateTime<Utc>, now: DateTime<Utc>, decay_per_hour: f64) -> f32 {
    let age_ms = (now - created_at).num_milliseconds().max(0) as f64;
    let score = (-decay_per_hour.max(0.0) * age_ms / MILLIS_PER_HOUR).exp();
    unit(score as f32)
}

/// `ln(1 + count) / ln(1 + saturation)`, clamped to [0, 1].
pub fn frequency_score(access_count: u64, saturation: u64) -> f32 {
    let denom = (1.0 + saturation.max(1) as f64).ln();
    let score = (1.0 + access_count as f64).ln() / denom;
    unit(score as f32)
}

/// Metadata agreement in [0, 1]. Empty request metadata scores 0.
pub fn metadata_score(policy: MetadataMatch, request: &Metadata, candidate: &Metadata) -> f32 {
    if request.is_empty() {
        return 0.0;
    }
    let matches = match policy {
        MetadataMatch::Disabled => return 0.0,
        MetadataMatch::KeyOverlap => request
            .keys()
            .filter(|k| candidate.contains_key(*k))
            .count(),
        MetadataMatch::ExactValue => request
            .iter()
            .filter(|(k, v)| candidate.get(*k).is_some_and(|cv: &Value| cv == *v))
            .count(),
    };
    matches as f32 / request.len() as f32
}

fn unit(v: f32) -> f32 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
