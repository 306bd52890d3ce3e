//! Router configuration
//!
//! Every field has a default, so an empty TOML document is a valid config.
//! Values can be overridden from the environment:
//!
//! | Variable                      | Field                              |
//! |-------------------------------|------------------------------------|
//! | `ROUTER_CONFIDENCE_THRESHOLD` | `confidence_threshold`             |
//! | `ROUTER_MAX_UNCERTAINTY`      | `max_uncertainty`                  |
//! | `ROUTER_CB_THRESHOLD`         | `circuit_breaker_threshold`        |
//! | `ROUTER_CB_RECOVERY_MS`       | `circuit_breaker_recovery_timeout` |
//! | `ROUTER_QUANTIZATION`         | `quantization_enabled`             |

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{RouterError, RouterResult};
use crate::features::{FeatureExtractor, FeatureWeights, MetadataMatch};
use crate::model::{ModelMode, QuantizationConfig};
use crate::resilience::{FallbackPolicy, LatencyBudget};
use crate::uncertainty::UncertaintyConfig;

pub const ENV_CONFIDENCE_THRESHOLD: &str = "ROUTER_CONFIDENCE_THRESHOLD";
pub const ENV_MAX_UNCERTAINTY: &str = "ROUTER_MAX_UNCERTAINTY";
pub const ENV_CB_THRESHOLD: &str = "ROUTER_CB_THRESHOLD";
pub const ENV_CB_RECOVERY_MS: &str = "ROUTER_CB_RECOVERY_MS";
pub const ENV_QUANTIZATION: &str = "ROUTER_QUANTIZATION";

/// Construction-time settings for a [`crate::Router`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Minimum confidence for the lightweight path
    pub confidence_threshold: f32,
    /// Maximum uncertainty for the lightweight path
    pub max_uncertainty: f32,
    /// Raw score separating lightweight from powerful
    pub decision_boundary: f32,
    pub feature_weights: FeatureWeights,
    pub recency_decay_per_hour: f64,
    /// Access count at which the frequency signal reaches 1.0
    pub frequency_saturation: u64,
    pub metadata_match: MetadataMatch,
    /// Consecutive failures before the breaker opens
    pub circuit_breaker_threshold: u32,
    /// Open time before a trial call is admitted (milliseconds on the wire)
    #[serde(with = "duration_ms")]
    pub circuit_breaker_recovery_timeout: Duration,
    pub quantization_enabled: bool,
    pub quantization: QuantizationConfig,
    pub uncertainty: UncertaintyConfig,
    pub fallback_policy: FallbackPolicy,
    /// Per-call budget in microseconds, 0 = unlimited
    pub latency_budget_micros: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.85,
            max_uncertainty: 0.15,
            decision_boundary: 0.5,
            feature_weights: FeatureWeights::default(),
            recency_decay_per_hour: 0.05,
            frequency_saturation: 1000,
            metadata_match: MetadataMatch::KeyOverlap,
            circuit_breaker_threshold: 5,
            circuit_breaker_recovery_timeout: Duration::from_secs(30),
            quantization_enabled: false,
            quantization: QuantizationConfig::default(),
            uncertainty: UncertaintyConfig::default(),
            fallback_policy: FallbackPolicy::AlwaysPowerful,
            latency_budget_micros: 0,
        }
    }
}

impl RouterConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(toml_str: &str) -> RouterResult<Self> {
        let config: Self = toml::from_str(toml_str)
            .map_err(|e| RouterError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> RouterResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            RouterError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "loading router config");
        Self::from_toml_str(&text)
    }

    /// Serialize back to TOML.
    pub fn to_toml_string(&self) -> RouterResult<String> {
        toml::to_string(self).map_err(|e| RouterError::Config(format!("cannot serialize: {e}")))
    }

    /// Apply `ROUTER_*` environment overrides, then validate.
    pub fn apply_env_overrides(&mut self) -> RouterResult<()> {
        self.apply_overrides_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup, then validate.
    pub fn apply_overrides_with<F>(&mut self, lookup: F) -> RouterResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_CONFIDENCE_THRESHOLD) {
            self.confidence_threshold = parse_env(ENV_CONFIDENCE_THRESHOLD, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_UNCERTAINTY) {
            self.max_uncertainty = parse_env(ENV_MAX_UNCERTAINTY, &v)?;
        }
        if let Some(v) = lookup(ENV_CB_THRESHOLD) {
            self.circuit_breaker_threshold = parse_env(ENV_CB_THRESHOLD, &v)?;
        }
        if let Some(v) = lookup(ENV_CB_RECOVERY_MS) {
            self.circuit_breaker_recovery_timeout =
                Duration::from_millis(parse_env(ENV_CB_RECOVERY_MS, &v)?);
        }
        if let Some(v) = lookup(ENV_QUANTIZATION) {
            self.quantization_enabled = match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(RouterError::Config(format!(
                        "{ENV_QUANTIZATION} must be a boolean, got '{other}'"
                    )))
                }
            };
        }
        self.validate()
    }

    /// Check ranges. Weights that do not sum to 1.0 only warn.
    pub fn validate(&self) -> RouterResult<()> {
        unit_range("confidence_threshold", self.confidence_threshold)?;
        unit_range("max_uncertainty", self.max_uncertainty)?;
        if !(self.decision_boundary > 0.0 && self.decision_boundary < 1.0) {
            return Err(RouterError::Config(format!(
                "decision_boundary must be in (0, 1), got {}",
                self.decision_boundary
            )));
        }
        self.feature_weights.validate()?;
        if (self.feature_weights.total() - 1.0).abs() > 1e-3 {
            warn!(
                total = self.feature_weights.total(),
                "feature weights do not sum to 1.0"
            );
        }
        if !self.recency_decay_per_hour.is_finite() || self.recency_decay_per_hour < 0.0 {
            return Err(RouterError::Config(format!(
                "recency_decay_per_hour must be finite and non-negative, got {}",
                self.recency_decay_per_hour
            )));
        }
        if self.frequency_saturation == 0 {
            return Err(RouterError::Config(
                "frequency_saturation must be positive".into(),
            ));
        }
        if self.circuit_breaker_threshold == 0 {
            return Err(RouterError::Config(
                "circuit_breaker_threshold must be at least 1".into(),
            ));
        }
        if let FallbackPolicy::SuccessRate { min_success_rate } = self.fallback_policy {
            unit_range("fallback_policy.min_success_rate", min_success_rate)?;
        }
        self.quantization.validate()?;
        self.uncertainty.validate()?;
        Ok(())
    }

    pub fn model_mode(&self) -> ModelMode {
        ModelMode::from_quantization(self.quantization_enabled)
    }

    pub fn latency_budget(&self) -> LatencyBudget {
        LatencyBudget::new(self.latency_budget_micros)
    }

    /// Feature extractor configured from this config.
    pub fn feature_extractor(&self) -> FeatureExtractor {
        FeatureExtractor::new(self.feature_weights)
            .with_recency_decay(self.recency_decay_per_hour)
            .with_frequency_saturation(self.frequency_saturation)
            .with_metadata_match(self.metadata_match)
    }
}

fn unit_range(name: &str, v: f32) -> RouterResult<()> {
    if v.is_finite() && (0.0..=1.0).contains(&v) {
        Ok(())
    } else {
        Err(RouterError::Config(format!("{name} must be in [0, 1], got {v}")))
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> RouterResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| RouterError::Config(format!("{key}='{value}': {e}")))
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
