//! Uncertainty estimation
//!
//! Maps a raw model score to `(confidence, uncertainty)` around a decision
//! boundary `b`:
//!
//! ```text
//! baseline:   u = 1 − |s − b| / max(b, 1 − b)
//! conformal:  u = 1 − max(|s − b| − q̂, 0) / max(b, 1 − b)
//! confidence = 1 − u
//! ```
//!
//! `q̂` is the `⌈(n+1)(1−α)⌉`-th smallest nonconformity score `|outcome − s|`
//! in a bounded calibration set. The calibration set is optional; until it
//! holds `min_calibration_samples` pairs the estimator answers with the
//! baseline and marks the estimate accordingly.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

use crate::error::{RouterError, RouterResult};

/// Estimation method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UncertaintyMode {
    /// Distance from the boundary only
    #[default]
    Baseline,
    /// Distance from the boundary shrunk by a calibrated quantile
    Conformal,
}

/// Uncertainty estimator settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UncertaintyConfig {
    pub mode: UncertaintyMode,
    /// Target miscoverage rate α
    pub miscoverage: f32,
    /// Pairs needed before conformal estimates are produced
    pub min_calibration_samples: usize,
    /// Ring buffer capacity; oldest pairs are evicted first
    pub calibration_capacity: usize,
}

impl Default for UncertaintyConfig {
    fn default() -> Self {
        Self {
            mode: UncertaintyMode::Baseline,
            miscoverage: 0.10,
            min_calibration_samples: 50,
            calibration_capacity: 1000,
        }
    }
}

impl UncertaintyConfig {
    pub fn validate(&self) -> RouterResult<()> {
        if !(self.miscoverage > 0.0 && self.miscoverage < 1.0) {
            return Err(RouterError::Config(format!(
                "uncertainty.miscoverage must be in (0, 1), got {}",
                self.miscoverage
            )));
        }
        if self.calibration_capacity == 0 {
            return Err(RouterError::Config(
                "uncertainty.calibration_capacity must be positive".into(),
            ));
        }
        if self.min_calibration_samples > self.calibration_capacity {
            return Err(RouterError::Config(format!(
                "uncertainty.min_calibration_samples ({}) exceeds calibration_capacity ({})",
                self.min_calibration_samples, self.calibration_capacity
            )));
        }
        Ok(())
    }
}

/// Which formula produced an estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateMethod {
    Baseline,
    Conformal,
    /// Conformal mode was requested but calibration is not ready
    BaselineFallback,
}

/// Result of one estimation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub confidence: f32,
    pub uncertainty: f32,
    pub method: EstimateMethod,
}

impl Estimate {
    fn from_uncertainty(uncertainty: f32, method: EstimateMethod) -> Self {
        let uncertainty = if uncertainty.is_finite() {
            uncertainty.clamp(0.0, 1.0)
        } else {
            1.0
        };
        Self {
            confidence: 1.0 - uncertainty,
            uncertainty,
            method,
        }
    }
}

/// Bounded ring of nonconformity scores with a cached quantile.
#[derive(Debug, Clone)]
pub struct CalibrationSet {
    capacity: usize,
    miscoverage: f32,
    ring: VecDeque<f32>,
    sorted: Vec<f32>,
    quantile: f32,
}

impl CalibrationSet {
    pub fn new(capacity: usize, miscoverage: f32) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            miscoverage,
            ring: VecDeque::with_capacity(capacity),
            sorted: Vec::with_capacity(capacity),
            quantile: 1.0,
        }
    }

    /// Add a `(score, outcome)` pair. Non-finite scores are ignored.
    pub fn record(&mut self, score: f32, outcome: bool) -> bool {
        if !score.is_finite() {
            return false;
        }
        let target = if outcome { 1.0 } else { 0.0 };
        let residual = (target - score).abs();

        if self.ring.len() == self.capacity {
            if let Some(evicted) = self.ring.pop_front() {
                if let Ok(pos) = self.sorted.binary_search_by(|v| v.total_cmp(&evicted)) {
                    self.sorted.remove(pos);
                }
            }
        }
        self.ring.push_back(residual);
        let pos = self
            .sorted
            .binary_search_by(|v| v.total_cmp(&residual))
            .unwrap_or_else(|p| p);
        self.sorted.insert(pos, residual);
        self.quantile = conformal_quantile(&self.sorted, self.miscoverage);
        true
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Cached `q̂` for the current contents.
    pub fn quantile(&self) -> f32 {
        self.quantile
    }

    pub fn clear(&mut self) {
        self.ring.clear();
        self.sorted.clear();
        self.quantile = 1.0;
    }
}

/// `⌈(n+1)(1−α)⌉`-th smallest value of `sorted`, or 1.0 when that rank
/// exceeds `n`.
pub fn conformal_quantile(sorted: &[f32], miscoverage: f32) -> f32 {
    let n = sorted.len();
    let rank = ((n as f64 + 1.0) * (1.0 - miscoverage as f64)).ceil() as usize;
    if rank == 0 || rank > n {
        return 1.0;
    }
    sorted[rank - 1]
}

/// Thread-safe estimator shared by all routing calls.
#[derive(Debug)]
pub struct UncertaintyEstimator {
    boundary: f32,
    config: UncertaintyConfig,
    calibration: RwLock<CalibrationSet>,
}

impl UncertaintyEstimator {
    pub fn new(boundary: f32, config: UncertaintyConfig) -> Self {
        Self {
            boundary,
            config,
            calibration: RwLock::new(CalibrationSet::new(
                config.calibration_capacity,
                config.miscoverage,
            )),
        }
    }

    pub fn boundary(&self) -> f32 {
        self.boundary
    }

    pub fn mode(&self) -> UncertaintyMode {
        self.config.mode
    }

    /// Estimate for a raw score in [0, 1].
    pub fn estimate(&self, score: f32) -> Estimate {
        if !score.is_finite() {
            return Estimate::from_uncertainty(1.0, EstimateMethod::Baseline);
        }
        match self.config.mode {
            UncertaintyMode::Baseline => self.baseline(score, EstimateMethod::Baseline),
            UncertaintyMode::Conformal => match self.calibrated_quantile() {
                Ok(q) => {
                    let margin = ((score - self.boundary).abs() - q).max(0.0);
                    Estimate::from_uncertainty(
                        1.0 - margin / self.half_width(),
                        EstimateMethod::Conformal,
                    )
                }
                Err(e) => {
                    debug!(error = %e, "conformal estimate unavailable, using baseline");
                    self.baseline(score, EstimateMethod::BaselineFallback)
                }
            },
        }
    }

    /// Current `q̂`.
    ///
    /// # Errors
    ///
    /// `CalibrationUnavailable` below `min_calibration_samples` pairs.
    pub fn calibrated_quantile(&self) -> RouterResult<f32> {
        let set = self.calibration.read();
        let need = self.config.min_calibration_samples.max(1);
        if set.len() < need {
            return Err(RouterError::CalibrationUnavailable {
                have: set.len(),
                need,
            });
        }
        Ok(set.quantile())
    }

    /// Feed one observed `(score, outcome)` pair.
    pub fn record(&self, score: f32, outcome: bool) -> bool {
        self.calibration.write().record(score, outcome)
    }

    pub fn calibration_len(&self) -> usize {
        self.calibration.read().len()
    }

    fn baseline(&self, score: f32, method: EstimateMethod) -> Estimate {
        let margin = (score - self.boundary).abs();
        Estimate::from_uncertainty(1.0 - margin / self.half_width(), method)
    }

    fn half_width(&self) -> f32 {
        self.boundary.max(1.0 - self.boundary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conformal(min: usize, cap: usize) -> UncertaintyEstimator {
        UncertaintyEstimator::new(
            0.5,
            UncertaintyConfig {
                mode: UncertaintyMode::Conformal,
                miscoverage: 0.1,
                min_calibration_samples: min,
                calibration_capacity: cap,
            },
        )
    }

    #[test]
    fn test_baseline_extremes() {
        let est = UncertaintyEstimator::new(0.5, UncertaintyConfig::default());
        let at_boundary = est.estimate(0.5);
        assert_eq!(at_boundary.uncertainty, 1.0);
        assert_eq!(at_boundary.confidence, 0.0);

        let sure_yes = est.estimate(1.0);
        assert_eq!(sure_yes.uncertainty, 0.0);
        assert_eq!(sure_yes.confidence, 1.0);

        let sure_no = est.estimate(0.0);
        assert_eq!(sure_no.confidence, 1.0);
        assert_eq!(sure_no.method, EstimateMethod::Baseline);
    }

    #[test]
    fn test_baseline_asymmetric_boundary() {
        let est = UncertaintyEstimator::new(0.8, UncertaintyConfig::default());
        // half width = 0.8
        let e = est.estimate(0.0);
        assert!((e.confidence - 1.0).abs() < 1e-6);
        let e = est.estimate(1.0);
        assert!((e.confidence - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_non_finite_score_is_maximally_uncertain() {
        let est = UncertaintyEstimator::new(0.5, UncertaintyConfig::default());
        let e = est.estimate(f32::NAN);
        assert_eq!(e.uncertainty, 1.0);
        assert_eq!(e.confidence, 0.0);
    }

    #[test]
    fn test_conformal_falls_back_without_calibration() {
        let est = conformal(10, 100);
        assert_eq!(
            est.calibrated_quantile().unwrap_err(),
            RouterError::CalibrationUnavailable { have: 0, need: 10 }
        );
        let e = est.estimate(0.95);
        assert_eq!(e.method, EstimateMethod::BaselineFallback);
        assert!((e.confidence - 0.9).abs() < 1e-5);
    }

    #[test]
    fn test_conformal_quantile_rank() {
        // n = 9, α = 0.1 → rank ⌈10 × 0.9⌉ = 9 → largest
        let sorted: Vec<f32> = (1..=9).map(|i| i as f32 / 10.0).collect();
        assert!((conformal_quantile(&sorted, 0.1) - 0.9).abs() < 1e-6);
        // n = 19 → rank 18
        let sorted: Vec<f32> = (1..=19).map(|i| i as f32 / 100.0).collect();
        assert!((conformal_quantile(&sorted, 0.1) - 0.18).abs() < 1e-6);
        // rank beyond n
        assert_eq!(conformal_quantile(&[0.1, 0.2], 0.1), 1.0);
        assert_eq!(conformal_quantile(&[], 0.1), 1.0);
    }

    #[test]
    fn test_conformal_shrinks_margin() {
        let est = conformal(10, 100);
        // residual |1 − 0.9| = 0.1 for every pair
        for _ in 0..20 {
            est.record(0.9, true);
        }
        let q = est.calibrated_quantile().unwrap();
        assert!((q - 0.1).abs() < 1e-6);

        let e = est.estimate(1.0);
        assert_eq!(e.method, EstimateMethod::Conformal);
        // margin = 0.5 − 0.1 = 0.4 → u = 0.2
        assert!((e.uncertainty - 0.2).abs() < 1e-5);

        let baseline = UncertaintyEstimator::new(0.5, UncertaintyConfig::default());
        assert!(e.confidence < baseline.estimate(1.0).confidence);
    }

    #[test]
    fn test_calibration_ring_evicts_oldest() {
        let mut set = CalibrationSet::new(3, 0.1);
        set.record(0.0, true); // residual 1.0
        set.record(0.9, true);
        set.record(0.8, true);
        set.record(0.7, true);
        assert_eq!(set.len(), 3);
        // the 1.0 residual is gone; rank ⌈4 × 0.9⌉ = 4 > 3 → 1.0
        assert_eq!(set.quantile(), 1.0);
        assert!(!set.record(f32::NAN, true));
        assert_eq!(set.len(), 3);
        set.clear();
        assert!(set.is_empty());
    }

    #[test]
    fn test_calibration_quantile_tracks_contents() {
        let mut set = CalibrationSet::new(100, 0.5);
        for s in [0.9, 0.8, 0.7, 0.6] {
            set.record(s, true);
        }
        // residuals 0.1..0.4, rank ⌈5 × 0.5⌉ = 3
        assert!((set.quantile() - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_config_validation() {
        assert!(UncertaintyConfig::default().validate().is_ok());
        let bad = UncertaintyConfig {
            miscoverage: 0.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = UncertaintyConfig {
            min_calibration_samples: 10,
            calibration_capacity: 5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
