//! # router-core
//!
//! Low-latency, confidence-gated request routing. For each candidate the
//! router extracts a small feature vector, scores it with a gated low-rank
//! recurrent model and decides whether the cheap path is safe:
//!
//! ```text
//! RoutingRequest
//!   → FeatureExtractor   (similarity, recency, frequency, success, metadata)
//!   → InferenceModel     (full precision or pruned int8)
//!   → UncertaintyEstimator
//!   → RoutingDecision    (use_lightweight, confidence, uncertainty)
//! ```
//!
//! A [`CircuitBreaker`] guards the pipeline; while it is open every candidate
//! is answered by the configured [`FallbackPolicy`] and the model is skipped.
//!
//! ```rust,ignore
//! use router_core::{ModelWeights, Router, RouterConfig, RoutingRequest};
//!
//! let router = Router::with_weights(RouterConfig::default(), ModelWeights::heuristic())?;
//! let response = router.route(&RoutingRequest::new(query, candidates))?;
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

use tracing_subscriber::EnvFilter;

pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod features;
pub mod model;
pub mod resilience;
pub mod router;
pub mod telemetry;
pub mod types;
pub mod uncertainty;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerStats, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RouterConfig;
pub use error::{CandidateError, RouterError, RouterResult};
pub use features::{FeatureExtractor, FeatureVector, FeatureWeights, MetadataMatch, SIGNAL_COUNT};
pub use model::{
    InferenceModel, LoadedModel, ModelInfo, ModelMode, ModelSlot, ModelWeights,
    QuantizationConfig, QUANTIZATION_TOLERANCE,
};
pub use resilience::{DegradationLevel, FallbackPolicy, LatencyBudget};
pub use router::Router;
pub use telemetry::{MetricsSnapshot, RouterMetrics};
pub use types::{
    Candidate, DecisionSource, Embedding, Metadata, RoutingDecision, RoutingRequest,
    RoutingResponse,
};
pub use uncertainty::{Estimate, EstimateMethod, UncertaintyConfig, UncertaintyEstimator, UncertaintyMode};

/// Install the global tracing subscriber.
///
/// `LOG_FORMAT=json` selects JSON output with span context; anything else
/// gives human-readable output. Filtering follows `RUST_LOG`.
///
/// # Errors
///
/// [`RouterError::Config`] if a global subscriber is already installed.
pub fn init_tracing() -> RouterResult<()> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_default();

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| RouterError::Config(format!("tracing init failed: {e}")))
}
