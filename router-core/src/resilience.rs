//! Degraded-mode routing
//!
//! When the breaker is open the router still answers, but through a fallback
//! policy that never touches the model. Responses carry a
//! [`DegradationLevel`] so callers can tell a full answer from a degraded one.
//!
//! # Design
//!
//! ```text
//! route()
//!   ├─ pipeline ran for every candidate → DegradationLevel::Full
//!   ├─ some candidates excluded         → DegradationLevel::Partial
//!   └─ breaker open, fallback policy    → DegradationLevel::Bypassed
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::{Candidate, DecisionSource, RoutingDecision};

/// How much of the decision pipeline served a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    /// Every candidate went through features → model → uncertainty.
    Full,
    /// Some candidates were excluded with a recorded error.
    Partial,
    /// Circuit open, fallback policy only.
    Bypassed,
}

impl DegradationLevel {
    /// Level for a pipeline run that excluded `excluded` candidates.
    pub fn for_pipeline(excluded: usize) -> Self {
        if excluded == 0 {
            Self::Full
        } else {
            Self::Partial
        }
    }
}

impl std::fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Partial => write!(f, "partial"),
            Self::Bypassed => write!(f, "bypassed"),
        }
    }
}

/// Decision policy used while the circuit is open.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Send everything to the powerful path.
    AlwaysPowerful,
    /// Trust the candidate's stored track record: lightweight only when its
    /// success rate is at least `min_success_rate`.
    SuccessRate {
        /// Minimum stored success rate for the lightweight path
        min_success_rate: f32,
    },
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self::AlwaysPowerful
    }
}

impl FallbackPolicy {
    /// Decide for one candidate without invoking the model.
    pub fn decide(&self, candidate: &Candidate) -> RoutingDecision {
        let (confidence, use_lightweight) = match self {
            Self::AlwaysPowerful => (0.0, false),
            Self::SuccessRate { min_success_rate } => {
                let rate = sanitize_unit(candidate.success_rate);
                (rate, rate >= *min_success_rate)
            }
        };

        RoutingDecision {
            candidate_id: candidate.id.clone(),
            confidence,
            use_lightweight,
            uncertainty: 1.0 - confidence,
            raw_score: None,
            source: DecisionSource::Fallback,
        }
    }

    /// Short label for logs and spans.
    pub fn label(&self) -> &'static str {
        match self {
            Self::AlwaysPowerful => "always_powerful",
            Self::SuccessRate { .. } => "success_rate",
        }
    }
}

/// Wall-clock budget for one routing call.
///
/// A zero budget is unlimited. Overruns do not abort the call; the router
/// reports them to the breaker as failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LatencyBudget {
    /// Maximum wall-clock time in microseconds (0 = unlimited).
    pub budget_micros: u64,
}

impl LatencyBudget {
    /// Budget of `budget_micros` microseconds.
    pub fn new(budget_micros: u64) -> Self {
        Self { budget_micros }
    }

    /// No limit.
    pub fn unlimited() -> Self {
        Self { budget_micros: 0 }
    }

    /// Whether the budget has a limit at all.
    pub fn is_limited(&self) -> bool {
        self.budget_micros > 0
    }

    /// Whether `elapsed` overruns the budget.
    pub fn is_exceeded(&self, elapsed: Duration) -> bool {
        self.is_limited() && elapsed.as_micros() > u128::from(self.budget_micros)
    }
}

fn sanitize_unit(v: f32) -> f32 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(rate: f32) -> Candidate {
        Candidate::new("c", vec![1.0, 0.0]).with_success_rate(rate)
    }

    #[test]
    fn test_degradation_level_ordering() {
        assert!(DegradationLevel::Full < DegradationLevel::Partial);
        assert!(DegradationLevel::Partial < DegradationLevel::Bypassed);
    }

    #[test]
    fn test_degradation_level_display() {
        assert_eq!(DegradationLevel::Full.to_string(), "full");
        assert_eq!(DegradationLevel::Partial.to_string(), "partial");
        assert_eq!(DegradationLevel::Bypassed.to_string(), "bypassed");
    }

    #[test]
    fn test_degradation_for_pipeline() {
        assert_eq!(DegradationLevel::for_pipeline(0), DegradationLevel::Full);
        assert_eq!(DegradationLevel::for_pipeline(2), DegradationLevel::Partial);
    }

    #[test]
    fn test_always_powerful_fallback() {
        let d = FallbackPolicy::AlwaysPowerful.decide(&candidate(0.99));
        assert!(!d.use_lightweight);
        assert_eq!(d.confidence, 0.0);
        assert_eq!(d.uncertainty, 1.0);
        assert_eq!(d.raw_score, None);
        assert_eq!(d.source, DecisionSource::Fallback);
    }

    #[test]
    fn test_success_rate_fallback() {
        let policy = FallbackPolicy::SuccessRate {
            min_success_rate: 0.9,
        };
        assert!(policy.decide(&candidate(0.95)).use_lightweight);
        assert!(!policy.decide(&candidate(0.5)).use_lightweight);

        let nan = policy.decide(&candidate(f32::NAN));
        assert!(!nan.use_lightweight);
        assert_eq!(nan.confidence, 0.0);
    }

    #[test]
    fn test_fallback_policy_serde() {
        let policy: FallbackPolicy =
            serde_json::from_str(r#"{"kind":"success_rate","min_success_rate":0.8}"#).unwrap();
        assert_eq!(
            policy,
            FallbackPolicy::SuccessRate {
                min_success_rate: 0.8
            }
        );
        assert_eq!(policy.label(), "success_rate");
    }

    #[test]
    fn test_latency_budget() {
        let unlimited = LatencyBudget::unlimited();
        assert!(!unlimited.is_exceeded(Duration::from_secs(10)));
        assert!(!unlimited.is_limited());

        let budget = LatencyBudget::new(500);
        assert!(!budget.is_exceeded(Duration::from_micros(500)));
        assert!(budget.is_exceeded(Duration::from_micros(501)));
        assert!(budget.is_limited());
    }
}
