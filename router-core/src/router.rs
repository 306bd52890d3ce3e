//! Router orchestrator
//!
//! Runs the per-request decision pipeline:
//!
//! ```text
//! route(request)
//!   ├─ no candidates            → empty response
//!   ├─ breaker open             → fallback policy, model skipped
//!   ├─ no model loaded          → breaker failure, Err(ModelNotLoaded)
//!   └─ per candidate, in order:
//!        features → infer → uncertainty → decision
//!      then report pipeline health to the breaker
//! ```
//!
//! A `Router` is `Send + Sync` and meant to be shared behind an `Arc`.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::RouterConfig;
use crate::error::{CandidateError, RouterError, RouterResult};
use crate::features::FeatureExtractor;
use crate::model::{ModelInfo, ModelSlot, ModelWeights};
use crate::resilience::{DegradationLevel, LatencyBudget};
use crate::telemetry::{self, MetricsSnapshot, RouterMetrics};
use crate::types::{
    Candidate, DecisionSource, RoutingDecision, RoutingRequest, RoutingResponse,
};
use crate::uncertainty::{Estimate, EstimateMethod, UncertaintyEstimator};

/// Confidence-gated router shared by all request handlers.
#[derive(Debug)]
pub struct Router {
    config: RouterConfig,
    extractor: FeatureExtractor,
    model: ModelSlot,
    uncertainty: UncertaintyEstimator,
    breaker: Arc<CircuitBreaker>,
    budget: LatencyBudget,
    metrics: RouterMetrics,
}

impl Router {
    /// Router with no model loaded and its own breaker.
    pub fn new(config: RouterConfig) -> RouterResult<Self> {
        let breaker = Arc::new(CircuitBreaker::new(
            config.circuit_breaker_threshold,
            config.circuit_breaker_recovery_timeout,
        ));
        Self::with_breaker(config, breaker)
    }

    /// Router using an externally owned breaker.
    ///
    /// The breaker's own threshold and timeout apply; the config's breaker
    /// fields are ignored.
    pub fn with_breaker(config: RouterConfig, breaker: Arc<CircuitBreaker>) -> RouterResult<Self> {
        config.validate()?;
        Ok(Self {
            extractor: config.feature_extractor(),
            model: ModelSlot::empty(),
            uncertainty: UncertaintyEstimator::new(config.decision_boundary, config.uncertainty),
            budget: config.latency_budget(),
            breaker,
            metrics: RouterMetrics::new(),
            config,
        })
    }

    /// Router with `weights` already loaded as version 1.
    pub fn with_weights(config: RouterConfig, weights: ModelWeights) -> RouterResult<Self> {
        let router = Self::new(config)?;
        router.reload_model(weights)?;
        Ok(router)
    }

    /// Route every candidate in `request`.
    ///
    /// # Errors
    ///
    /// `ModelNotLoaded` when the breaker admits the call but no model has
    /// been published. Per-candidate failures are reported in
    /// [`RoutingResponse::errors`] instead.
    pub fn route(&self, request: &RoutingRequest) -> RouterResult<RoutingResponse> {
        let started = Instant::now();
        let request_id = request.request_id.unwrap_or_else(Uuid::new_v4);
        let span = telemetry::route_span(&request_id, request.candidates.len());
        let _guard = span.enter();
        self.metrics.record_request();

        if request.candidates.is_empty() {
            let response = RoutingResponse::empty(request_id, self.breaker.status());
            telemetry::record_route_result(&span, &response);
            return Ok(response);
        }

        let state = self.breaker.status();
        if state == CircuitState::Open {
            let response = self.route_bypassed(request, request_id);
            telemetry::record_route_result(&span, &response);
            return Ok(response);
        }

        let Some(model) = self.model.current() else {
            self.breaker.record_failure();
            self.metrics.record_pipeline_failure();
            warn!(%request_id, "route called before any model was loaded");
            return Err(RouterError::ModelNotLoaded);
        };

        let now = Utc::now();
        let mut decisions = Vec::with_capacity(request.candidates.len());
        let mut errors = Vec::new();
        let mut pipeline_failed = false;
        let mut feature_time = Duration::ZERO;
        let mut inference_time = Duration::ZERO;

        for (index, candidate) in request.candidates.iter().enumerate() {
            let t0 = Instant::now();
            let features = self.extractor.extract(
                &request.query_embedding,
                candidate,
                &request.request_metadata,
                now,
            );
            feature_time += t0.elapsed();

            let features = match features {
                Ok(f) => f,
                Err(e) => {
                    self.exclude(candidate, index, &e, &mut errors);
                    continue;
                }
            };

            let t1 = Instant::now();
            self.metrics.record_model_invocation();
            let scored = model
                .infer(&features)
                .map(|score| (score, self.uncertainty.estimate(score)));
            inference_time += t1.elapsed();

            match scored {
                Ok((score, estimate)) => decisions.push(self.decide(candidate, score, estimate)),
                Err(e) => {
                    pipeline_failed |= e.is_pipeline_fault();
                    self.exclude(candidate, index, &e, &mut errors);
                }
            }
        }

        let elapsed = started.elapsed();
        let over_budget = self.budget.is_exceeded(elapsed);
        if over_budget {
            self.metrics.record_budget_overrun();
            warn!(
                %request_id,
                elapsed_us = micros(elapsed),
                budget_us = self.budget.budget_micros,
                "routing exceeded latency budget"
            );
        }
        if pipeline_failed {
            self.metrics.record_pipeline_failure();
        }
        if pipeline_failed || over_budget {
            self.breaker.record_failure();
        } else {
            self.breaker.record_success();
        }

        let response = RoutingResponse {
            request_id,
            candidates_processed: decisions.len(),
            degradation: DegradationLevel::for_pipeline(errors.len()),
            decisions,
            inference_time_micros: micros(inference_time),
            feature_time_micros: micros(feature_time),
            bypassed: false,
            errors,
            model_version: Some(model.version),
            breaker_state: state,
        };
        telemetry::record_route_result(&span, &response);
        debug!(
            %request_id,
            decisions = response.decisions.len(),
            excluded = response.errors.len(),
            "routing complete"
        );
        Ok(response)
    }

    /// Build and publish a new model from `weights`. Returns its version.
    ///
    /// # Errors
    ///
    /// `ReloadInProgress` when another reload is building; `InvalidWeights`
    /// when validation fails. The active model is unchanged on error.
    pub fn reload_model(&self, weights: ModelWeights) -> RouterResult<u64> {
        let mode = self.config.model_mode();
        let span = telemetry::reload_span(&mode.to_string());
        let _guard = span.enter();

        match self.model.load(&weights, mode, &self.config.quantization) {
            Ok(version) => {
                self.metrics.record_reload();
                telemetry::record_reload_result(&span, version);
                info!(version, %mode, "model reloaded");
                Ok(version)
            }
            Err(e) => {
                warn!(error = %e, %mode, "model reload rejected");
                Err(e)
            }
        }
    }

    /// Current breaker state.
    pub fn status(&self) -> CircuitState {
        self.breaker.status()
    }

    /// Description of the active model.
    pub fn model_info(&self) -> Option<ModelInfo> {
        self.model.current().map(|m| m.info())
    }

    /// Feed an observed `(score, outcome)` pair to the conformal calibration
    /// set. Returns false when the pair was ignored.
    pub fn record_calibration(&self, score: f32, outcome: bool) -> bool {
        self.uncertainty.record(score, outcome)
    }

    /// Report how a routed request fared downstream.
    pub fn report_outcome(&self, success: bool) -> CircuitState {
        if success {
            self.breaker.record_success()
        } else {
            self.breaker.record_failure()
        }
    }

    /// Point-in-time copy of the routing counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// The breaker guarding the model path. Shared when the router was built
    /// with [`Router::with_breaker`].
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Validated configuration this router was built with.
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    fn route_bypassed(&self, request: &RoutingRequest, request_id: Uuid) -> RoutingResponse {
        let policy = self.config.fallback_policy;
        let span = telemetry::bypass_span(policy.label());
        let _guard = span.enter();
        self.metrics.record_bypass();
        warn!(%request_id, policy = policy.label(), "circuit open, routing via fallback");

        let expected = request.query_embedding.dim();
        let mut decisions = Vec::with_capacity(request.candidates.len());
        let mut errors = Vec::new();
        for (index, candidate) in request.candidates.iter().enumerate() {
            let actual = candidate.embedding.dim();
            if actual != expected {
                let e = RouterError::DimensionMismatch { expected, actual };
                self.exclude(candidate, index, &e, &mut errors);
                continue;
            }
            let decision = policy.decide(candidate);
            self.metrics.record_decision(decision.use_lightweight, true);
            decisions.push(decision);
        }

        RoutingResponse {
            request_id,
            candidates_processed: decisions.len(),
            decisions,
            inference_time_micros: 0,
            feature_time_micros: 0,
            bypassed: true,
            degradation: DegradationLevel::Bypassed,
            errors,
            model_version: None,
            breaker_state: CircuitState::Open,
        }
    }

    fn decide(&self, candidate: &Candidate, score: f32, estimate: Estimate) -> RoutingDecision {
        if estimate.method == EstimateMethod::BaselineFallback {
            self.metrics.record_calibration_fallback();
        }
        let use_lightweight = score >= self.config.decision_boundary
            && estimate.confidence >= self.config.confidence_threshold
            && estimate.uncertainty <= self.config.max_uncertainty;
        self.metrics.record_decision(use_lightweight, false);

        RoutingDecision {
            candidate_id: candidate.id.clone(),
            confidence: estimate.confidence,
            use_lightweight,
            uncertainty: estimate.uncertainty,
            raw_score: Some(score),
            source: DecisionSource::Model,
        }
    }

    fn exclude(
        &self,
        candidate: &Candidate,
        index: usize,
        error: &RouterError,
        errors: &mut Vec<CandidateError>,
    ) {
        self.metrics.record_candidate_error();
        debug!(candidate = %candidate.id, index, code = error.code(), "candidate excluded");
        errors.push(CandidateError::new(candidate.id.clone(), index, error));
    }
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::resilience::FallbackPolicy;
    use crate::types::Embedding;

    fn strong_candidate(id: &str) -> Candidate {
        Candidate::new(id, vec![0.5; 16])
            .with_access_count(10)
            .with_success_rate(0.95)
    }

    fn request(candidates: Vec<Candidate>) -> RoutingRequest {
        RoutingRequest::new(Embedding::filled(16, 0.5), candidates)
    }

    fn loaded() -> Router {
        Router::with_weights(RouterConfig::default(), ModelWeights::heuristic()).unwrap()
    }

    #[test]
    fn test_router_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Router>();
    }

    #[test]
    fn test_strong_candidate_goes_lightweight() {
        let router = loaded();
        let resp = router.route(&request(vec![strong_candidate("a")])).unwrap();
        let d = &resp.decisions[0];
        assert!(d.use_lightweight);
        assert!(d.confidence >= 0.85);
        assert_eq!(d.source, DecisionSource::Model);
        assert_eq!(resp.model_version, Some(1));
        assert_eq!(resp.degradation, DegradationLevel::Full);
    }

    #[test]
    fn test_confident_low_score_goes_powerful() {
        let router = loaded();
        let weak = Candidate::new("weak", vec![-0.5; 16])
            .with_created_at(Utc::now() - chrono::Duration::days(365));
        let resp = router.route(&request(vec![weak])).unwrap();
        let d = &resp.decisions[0];
        assert!(!d.use_lightweight);
        assert!(d.raw_score.unwrap() < 0.5);
        assert!(d.confidence > 0.9);
    }

    #[test]
    fn test_request_id_preserved() {
        let router = loaded();
        let id = Uuid::new_v4();
        let resp = router
            .route(&request(vec![strong_candidate("a")]).with_request_id(id))
            .unwrap();
        assert_eq!(resp.request_id, id);
    }

    #[test]
    fn test_model_not_loaded_counts_as_failure() {
        let router = Router::new(RouterConfig::default()).unwrap();
        let err = router.route(&request(vec![strong_candidate("a")])).unwrap_err();
        assert_eq!(err, RouterError::ModelNotLoaded);
        assert_eq!(router.breaker().failure_count(), 1);
        assert_eq!(router.metrics().pipeline_failures, 1);
    }

    #[test]
    fn test_empty_request_skips_breaker() {
        let router = Router::new(RouterConfig::default()).unwrap();
        let resp = router.route(&request(vec![])).unwrap();
        assert!(resp.decisions.is_empty());
        assert_eq!(router.breaker().stats().total_failures, 0);
        assert_eq!(router.breaker().stats().total_successes, 0);
    }

    #[test]
    fn test_dimension_mismatch_is_not_a_pipeline_failure() {
        let router = loaded();
        let resp = router
            .route(&request(vec![
                strong_candidate("a"),
                Candidate::new("short", vec![0.5; 3]),
            ]))
            .unwrap();
        assert_eq!(resp.decisions.len(), 1);
        assert_eq!(resp.errors.len(), 1);
        assert_eq!(resp.errors[0].index, 1);
        assert_eq!(resp.degradation, DegradationLevel::Partial);
        assert_eq!(router.breaker().failure_count(), 0);
        assert_eq!(router.metrics().candidate_errors, 1);
    }

    #[test]
    fn test_bypass_uses_fallback_policy() {
        let config = RouterConfig {
            fallback_policy: FallbackPolicy::SuccessRate {
                min_success_rate: 0.9,
            },
            ..Default::default()
        };
        let router = Router::with_weights(config, ModelWeights::heuristic()).unwrap();
        router.breaker().trip();

        let resp = router
            .route(&request(vec![
                strong_candidate("good"),
                strong_candidate("meh").with_success_rate(0.5),
            ]))
            .unwrap();
        assert!(resp.bypassed);
        assert_eq!(resp.degradation, DegradationLevel::Bypassed);
        assert!(resp.decisions[0].use_lightweight);
        assert!(!resp.decisions[1].use_lightweight);
        assert_eq!(resp.decisions[0].source, DecisionSource::Fallback);
        assert_eq!(router.metrics().model_invocations, 0);
        assert_eq!(router.metrics().fallback_decisions, 2);
    }

    #[test]
    fn test_latency_budget_overrun_feeds_breaker() {
        let clock = Arc::new(ManualClock::new());
        let breaker = Arc::new(CircuitBreaker::with_clock(
            1,
            Duration::from_secs(30),
            clock,
        ));
        let config = RouterConfig {
            latency_budget_micros: 1,
            ..Default::default()
        };
        let router = Router::with_breaker(config, breaker).unwrap();
        router.reload_model(ModelWeights::heuristic()).unwrap();

        let many: Vec<_> = (0..64).map(|i| strong_candidate(&format!("c{i}"))).collect();
        let resp = router.route(&request(many)).unwrap();
        assert_eq!(resp.decisions.len(), 64);
        assert_eq!(router.metrics().budget_overruns, 1);
        assert_eq!(router.status(), CircuitState::Open);
    }

    #[test]
    fn test_report_outcome_drives_breaker() {
        let breaker = Arc::new(CircuitBreaker::new(2, Duration::from_secs(30)));
        let router = Router::with_breaker(RouterConfig::default(), breaker).unwrap();
        router.report_outcome(false);
        assert_eq!(router.report_outcome(false), CircuitState::Open);
    }

    #[test]
    fn test_reload_bumps_version_and_info() {
        let router = loaded();
        assert_eq!(router.model_info().unwrap().version, 1);
        assert_eq!(router.reload_model(ModelWeights::heuristic()).unwrap(), 2);
        let mut bad = ModelWeights::heuristic();
        bad.steps = 99;
        assert!(router.reload_model(bad).is_err());
        assert_eq!(router.model_info().unwrap().version, 2);
        assert_eq!(router.metrics().reloads, 2);
    }

    #[test]
    fn test_conformal_fallback_counted() {
        let mut config = RouterConfig::default();
        config.uncertainty.mode = crate::uncertainty::UncertaintyMode::Conformal;
        let router = Router::with_weights(config, ModelWeights::heuristic()).unwrap();
        router.route(&request(vec![strong_candidate("a")])).unwrap();
        assert_eq!(router.metrics().calibration_fallbacks, 1);
        assert!(router.record_calibration(0.99, true));
    }

    #[test]
    fn test_calibrated_conformal_narrows_confidence() {
        let mut config = RouterConfig::default();
        config.uncertainty.mode = crate::uncertainty::UncertaintyMode::Conformal;
        config.uncertainty.min_calibration_samples = 10;
        let conformal = Router::with_weights(config, ModelWeights::heuristic()).unwrap();
        // residual 0.1 on every pair puts the quantile at 0.1
        for _ in 0..20 {
            assert!(conformal.record_calibration(0.9, true));
        }

        let req = request(vec![strong_candidate("a")]);
        let calibrated = conformal.route(&req).unwrap();
        let baseline = loaded().route(&req).unwrap();
        let (c, b) = (&calibrated.decisions[0], &baseline.decisions[0]);

        assert!((c.raw_score.unwrap() - b.raw_score.unwrap()).abs() < 1e-3);
        assert!(
            c.confidence < b.confidence - 0.1,
            "conformal {} vs baseline {}",
            c.confidence,
            b.confidence
        );
        assert!((c.confidence + c.uncertainty - 1.0).abs() < 1e-6);
        assert_eq!(conformal.metrics().calibration_fallbacks, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = RouterConfig {
            confidence_threshold: 2.0,
            ..Default::default()
        };
        assert!(Router::new(config).is_err());
    }
}
