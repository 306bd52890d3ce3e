//! Span helpers and counters for the routing pipeline.
//!
//! Spans use dot-notation field names so they export cleanly to any
//! OpenTelemetry-style collector.
//!
//! ```text
//! router.route        (one per routing call)
//!   └─ router.bypass  (breaker open, fallback decisions)
//! router.reload       (model reload)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let span = telemetry::route_span(&request_id, 12);
//! let _guard = span.enter();
//! // ... score candidates ...
//! telemetry::record_route_result(&span, &response);
//! ```

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::Span;
use uuid::Uuid;

use crate::types::RoutingResponse;

// ── Span Name Constants ──────────────────────────────────────────────

/// One routing call end-to-end.
pub const SPAN_ROUTE: &str = "router.route";

/// Fallback path taken while the breaker is open.
pub const SPAN_BYPASS: &str = "router.bypass";

/// Model reload.
pub const SPAN_RELOAD: &str = "router.reload";

// ── Field Name Constants ─────────────────────────────────────────────

pub const FIELD_REQUEST_ID: &str = "router.request_id";
pub const FIELD_CANDIDATES: &str = "router.candidates";
pub const FIELD_DECISIONS: &str = "router.decisions";
pub const FIELD_LIGHTWEIGHT: &str = "router.lightweight";
pub const FIELD_BYPASSED: &str = "router.bypassed";
pub const FIELD_DEGRADATION: &str = "router.degradation";
pub const FIELD_MODEL_VERSION: &str = "router.model.version";
pub const FIELD_MODEL_MODE: &str = "router.model.mode";
pub const FIELD_FEATURE_US: &str = "router.feature_us";
pub const FIELD_INFERENCE_US: &str = "router.inference_us";
pub const FIELD_BREAKER_STATE: &str = "router.breaker.state";

// ── Span Builders ────────────────────────────────────────────────────

/// Root span for one routing call.
///
/// Filled later via [`record_route_result`].
pub fn route_span(request_id: &Uuid, candidates: usize) -> Span {
    tracing::info_span!(
        "router.route",
        "router.request_id" = %request_id,
        "router.candidates" = candidates,
        "router.decisions" = tracing::field::Empty,
        "router.lightweight" = tracing::field::Empty,
        "router.bypassed" = tracing::field::Empty,
        "router.degradation" = tracing::field::Empty,
        "router.model.version" = tracing::field::Empty,
        "router.feature_us" = tracing::field::Empty,
        "router.inference_us" = tracing::field::Empty,
        "router.breaker.state" = tracing::field::Empty,
    )
}

/// Record the outcome of a routing call on its span.
pub fn record_route_result(span: &Span, response: &RoutingResponse) {
    span.record("router.decisions", response.decisions.len());
    span.record("router.lightweight", response.lightweight_count());
    span.record("router.bypassed", response.bypassed);
    span.record(
        "router.degradation",
        tracing::field::display(response.degradation),
    );
    if let Some(version) = response.model_version {
        span.record("router.model.version", version);
    }
    span.record("router.feature_us", response.feature_time_micros);
    span.record("router.inference_us", response.inference_time_micros);
    span.record(
        "router.breaker.state",
        tracing::field::display(response.breaker_state),
    );
}

/// Child span for the fallback path.
pub fn bypass_span(policy: &str) -> Span {
    tracing::warn_span!("router.bypass", "router.fallback.policy" = policy)
}

/// Span for one model reload.
pub fn reload_span(mode: &str) -> Span {
    tracing::info_span!(
        "router.reload",
        "router.model.mode" = mode,
        "router.model.version" = tracing::field::Empty,
    )
}

/// Record the published version on a reload span.
pub fn record_reload_result(span: &Span, version: u64) {
    span.record("router.model.version", version);
}

// ── Counters ─────────────────────────────────────────────────────────

/// Lock-free counters for the routing pipeline.
#[derive(Debug, Default)]
pub struct RouterMetrics {
    requests: AtomicU64,
    bypassed_requests: AtomicU64,
    decisions: AtomicU64,
    lightweight_decisions: AtomicU64,
    powerful_decisions: AtomicU64,
    fallback_decisions: AtomicU64,
    candidate_errors: AtomicU64,
    model_invocations: AtomicU64,
    pipeline_failures: AtomicU64,
    budget_overruns: AtomicU64,
    reloads: AtomicU64,
    calibration_fallbacks: AtomicU64,
}

impl RouterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bypass(&self) {
        self.bypassed_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one decision and which path it chose.
    pub fn record_decision(&self, use_lightweight: bool, fallback: bool) {
        self.decisions.fetch_add(1, Ordering::Relaxed);
        if use_lightweight {
            self.lightweight_decisions.fetch_add(1, Ordering::Relaxed);
        } else {
            self.powerful_decisions.fetch_add(1, Ordering::Relaxed);
        }
        if fallback {
            self.fallback_decisions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_candidate_error(&self) {
        self.candidate_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_model_invocation(&self) {
        self.model_invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pipeline_failure(&self) {
        self.pipeline_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_budget_overrun(&self) {
        self.budget_overruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reload(&self) {
        self.reloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_calibration_fallback(&self) {
        self.calibration_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn model_invocations(&self) -> u64 {
        self.model_invocations.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            bypassed_requests: self.bypassed_requests.load(Ordering::Relaxed),
            decisions: self.decisions.load(Ordering::Relaxed),
            lightweight_decisions: self.lightweight_decisions.load(Ordering::Relaxed),
            powerful_decisions: self.powerful_decisions.load(Ordering::Relaxed),
            fallback_decisions: self.fallback_decisions.load(Ordering::Relaxed),
            candidate_errors: self.candidate_errors.load(Ordering::Relaxed),
            model_invocations: self.model_invocations.load(Ordering::Relaxed),
            pipeline_failures: self.pipeline_failures.load(Ordering::Relaxed),
            budget_overruns: self.budget_overruns.load(Ordering::Relaxed),
            reloads: self.reloads.load(Ordering::Relaxed),
            calibration_fallbacks: self.calibration_fallbacks.load(Ordering::Relaxed),
        }
    }
}

/// Serializable copy of [`RouterMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub bypassed_requests: u64,
    pub decisions: u64,
    pub lightweight_decisions: u64,
    pub powerful_decisions: u64,
    pub fallback_decisions: u64,
    pub candidate_errors: u64,
    pub model_invocations: u64,
    pub pipeline_failures: u64,
    pub budget_overruns: u64,
    pub reloads: u64,
    pub calibration_fallbacks: u64,
}

impl MetricsSnapshot {
    /// Share of decisions that went to the lightweight path.
    pub fn lightweight_ratio(&self) -> f64 {
        if self.decisions == 0 {
            0.0
        } else {
            self.lightweight_decisions as f64 / self.decisions as f64
        }
    }
}
