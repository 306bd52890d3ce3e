//! Core request/response types for the routing pipeline
//!
//! Candidates are produced by an external store and are read-only here.
//! Requests and responses are plain data so they serialize cleanly for
//! whatever transport sits in front of the router.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::circuit_breaker::CircuitState;
use crate::error::CandidateError;
use crate::resilience::DegradationLevel;

/// Opaque key/value metadata attached to candidates and requests
pub type Metadata = HashMap<String, serde_json::Value>;

/// Dense embedding vector.
///
/// The dimension is fixed per deployment; every pair of embeddings that is
/// compared must agree on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    /// Wrap raw values.
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    /// An embedding of `dim` copies of `value`.
    pub fn filled(dim: usize, value: f32) -> Self {
        Self(vec![value; dim])
    }

    /// Number of components.
    pub fn dim(&self) -> usize {
        self.0.len()
    }

    /// Borrow the components.
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Euclidean norm.
    pub fn norm(&self) -> f32 {
        self.0.iter().map(|v| v * v).sum::<f32>().sqrt()
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

/// A routing target as stored by the candidate source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    /// Stable identifier
    pub id: String,
    /// Candidate embedding, same dimension as query embeddings
    pub embedding: Embedding,
    /// Free-form metadata compared against request metadata
    #[serde(default)]
    pub metadata: Metadata,
    /// When the candidate was created
    pub created_at: DateTime<Utc>,
    /// How many times the candidate has been served
    #[serde(default)]
    pub access_count: u64,
    /// Historical success rate in [0, 1]
    #[serde(default)]
    pub success_rate: f32,
}

impl Candidate {
    /// Create a candidate created now, never accessed, with no track record.
    pub fn new(id: impl Into<String>, embedding: impl Into<Embedding>) -> Self {
        Self {
            id: id.into(),
            embedding: embedding.into(),
            metadata: Metadata::new(),
            created_at: Utc::now(),
            access_count: 0,
            success_rate: 0.0,
        }
    }

    /// Set the creation timestamp
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Set the access count
    pub fn with_access_count(mut self, access_count: u64) -> Self {
        self.access_count = access_count;
        self
    }

    /// Set the historical success rate
    pub fn with_success_rate(mut self, success_rate: f32) -> Self {
        self.success_rate = success_rate;
        self
    }

    /// Add one metadata entry
    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// One inbound routing call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRequest {
    /// Caller-supplied correlation id; generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    /// Embedding of the incoming query
    pub query_embedding: Embedding,
    /// Candidates to score, in caller order
    pub candidates: Vec<Candidate>,
    /// Metadata matched against candidate metadata
    #[serde(default)]
    pub request_metadata: Metadata,
}

impl RoutingRequest {
    /// Create a request with no metadata.
    pub fn new(query_embedding: impl Into<Embedding>, candidates: Vec<Candidate>) -> Self {
        Self {
            request_id: None,
            query_embedding: query_embedding.into(),
            candidates,
            request_metadata: Metadata::new(),
        }
    }

    /// Set the correlation id
    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Add one request metadata entry
    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.request_metadata.insert(key.into(), value.into());
        self
    }
}

/// Where a decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// Full pipeline: features → model → uncertainty
    Model,
    /// Circuit open: fallback policy, model not consulted
    Fallback,
}

impl std::fmt::Display for DecisionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Model => write!(f, "model"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// Routing outcome for a single candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Candidate this decision is about
    pub candidate_id: String,
    /// Calibrated confidence in [0, 1]
    pub confidence: f32,
    /// Dispatch to the cheap path
    pub use_lightweight: bool,
    /// Non-negative uncertainty of the confidence estimate
    pub uncertainty: f32,
    /// Raw model score; `None` when the model was bypassed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_score: Option<f32>,
    /// Which path produced the decision
    pub source: DecisionSource,
}

/// Terminal output of one routing call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingResponse {
    /// Correlation id (caller's or generated)
    pub request_id: Uuid,
    /// Decisions in input candidate order, excluded candidates omitted
    pub decisions: Vec<RoutingDecision>,
    /// Time spent in inference and uncertainty estimation
    pub inference_time_micros: u64,
    /// Time spent in feature extraction
    pub feature_time_micros: u64,
    /// Number of candidates that produced a decision
    pub candidates_processed: usize,
    /// True when the circuit was open and the model was skipped
    pub bypassed: bool,
    /// Overall service level of this response
    pub degradation: DegradationLevel,
    /// Candidates excluded from `decisions`, with the reason
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<CandidateError>,
    /// Version of the model that scored this request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<u64>,
    /// Breaker state observed when the request was admitted
    pub breaker_state: CircuitState,
}

impl RoutingResponse {
    /// An empty response for a request with no candidates.
    pub fn empty(request_id: Uuid, breaker_state: CircuitState) -> Self {
        Self {
            request_id,
            decisions: Vec::new(),
            inference_time_micros: 0,
            feature_time_micros: 0,
            candidates_processed: 0,
            bypassed: false,
            degradation: DegradationLevel::Full,
            errors: Vec::new(),
            model_version: None,
            breaker_state,
        }
    }

    /// Decision for a candidate id, if one was produced.
    pub fn decision_for(&self, candidate_id: &str) -> Option<&RoutingDecision> {
        self.decisions
            .iter()
            .find(|d| d.candidate_id == candidate_id)
    }

    /// Number of decisions that chose the lightweight path.
    pub fn lightweight_count(&self) -> usize {
        self.decisions.iter().filter(|d| d.use_lightweight).count()
    }

    /// Whether the response is anything less than a full-pipeline answer.
    pub fn is_degraded(&self) -> bool {
        self.degradation != DegradationLevel::Full
    }
}
