//! Router error types
//!
//! One taxonomy for the whole decision pipeline. Per-candidate failures are
//! wrapped in [`CandidateError`] and reported inside the response; only
//! pipeline-wide failures reach the caller as `Err`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for router operations
pub type RouterResult<T> = Result<T, RouterError>;

/// Errors that can occur while routing, scoring or reloading
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouterError {
    /// Two embeddings that must be compared have different lengths
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// No model has been published into the model slot yet
    #[error("no inference model loaded")]
    ModelNotLoaded,

    /// Conformal calibration requested without enough calibration pairs
    #[error("calibration unavailable: have {have} samples, need {need}")]
    CalibrationUnavailable { have: usize, need: usize },

    /// The circuit breaker is open and the pipeline was bypassed
    #[error("circuit breaker open")]
    CircuitOpen,

    /// Another reload is still building its model
    #[error("model reload already in progress")]
    ReloadInProgress,

    /// Weights failed shape or value validation
    #[error("invalid model weights: {0}")]
    InvalidWeights(String),

    /// The model produced an unusable result
    #[error("inference failed: {0}")]
    Inference(String),

    /// A configuration value is missing or out of range
    #[error("configuration error: {0}")]
    Config(String),
}

impl RouterError {
    /// Machine-readable error code, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DimensionMismatch { .. } => "DIMENSION_MISMATCH",
            Self::ModelNotLoaded => "MODEL_NOT_LOADED",
            Self::CalibrationUnavailable { .. } => "CALIBRATION_UNAVAILABLE",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::ReloadInProgress => "RELOAD_IN_PROGRESS",
            Self::InvalidWeights(_) => "INVALID_WEIGHTS",
            Self::Inference(_) => "INFERENCE_FAILED",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Whether this error reflects a pipeline fault that the circuit breaker
    /// should count. Bad caller data (dimension mismatch) does not.
    pub fn is_pipeline_fault(&self) -> bool {
        matches!(self, Self::ModelNotLoaded | Self::Inference(_))
    }
}

/// A per-candidate failure recorded in a [`crate::RoutingResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateError {
    /// Id of the excluded candidate
    pub candidate_id: String,
    /// Position of the candidate in the request
    pub index: usize,
    /// Machine-readable code (see [`RouterError::code`])
    pub code: String,
    /// Human-readable message
    pub message: String,
}

impl CandidateError {
    /// Build a record from the error that excluded the candidate.
    pub fn new(candidate_id: impl Into<String>, index: usize, error: &RouterError) -> Self {
        Self {
            candidate_id: candidate_id.into(),
            index,
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}
