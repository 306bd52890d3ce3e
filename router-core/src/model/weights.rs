//! Serializable weights for the gated low-rank recurrent cell.
//!
//! All matrices are row-major `Vec<f32>`:
//!
//! ```text
//! w1: hidden_dim × rank_w     w2: rank_w × input_dim
//! u1: hidden_dim × rank_u     u2: rank_u × hidden_dim
//! bias_gate, bias_update, output: hidden_dim
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{RouterError, RouterResult};
use crate::features::SIGNAL_COUNT;

/// Upper bound on recurrent steps per inference.
pub const MAX_STEPS: usize = 16;

/// Trained (or hand-set) parameters of the inference model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelWeights {
    pub input_dim: usize,
    pub hidden_dim: usize,
    pub rank_w: usize,
    pub rank_u: usize,
    pub steps: usize,
    pub w1: Vec<f32>,
    pub w2: Vec<f32>,
    pub u1: Vec<f32>,
    pub u2: Vec<f32>,
    pub bias_gate: Vec<f32>,
    pub bias_update: Vec<f32>,
    pub zeta: f32,
    pub nu: f32,
    pub output: Vec<f32>,
    pub output_bias: f32,
}

impl ModelWeights {
    /// Deterministic weights that score the weighted feature sum.
    ///
    /// Every hidden unit sees `4 × Σ features` with no recurrence, so a
    /// candidate whose weighted signals add up to roughly 0.6 or more scores
    /// above 0.92 and one near zero scores close to 0. Used until trained
    /// weights are loaded.
    pub fn heuristic() -> Self {
        const HIDDEN: usize = 8;
        Self {
            input_dim: SIGNAL_COUNT,
            hidden_dim: HIDDEN,
            rank_w: 1,
            rank_u: 1,
            steps: 1,
            w1: vec![4.0; HIDDEN],
            w2: vec![1.0; SIGNAL_COUNT],
            u1: vec![0.0; HIDDEN],
            u2: vec![0.0; HIDDEN],
            bias_gate: vec![-8.0; HIDDEN],
            bias_update: vec![-2.0; HIDDEN],
            zeta: 1.0,
            nu: 0.0,
            output: vec![1.0; HIDDEN],
            output_bias: 0.0,
        }
    }

    /// Parse weights from JSON and validate them.
    pub fn from_json_str(json: &str) -> RouterResult<Self> {
        let weights: Self = serde_json::from_str(json)
            .map_err(|e| RouterError::InvalidWeights(format!("malformed weights JSON: {e}")))?;
        weights.validate()?;
        Ok(weights)
    }

    /// Total number of scalar parameters, biases included.
    pub fn parameter_count(&self) -> usize {
        self.w1.len()
            + self.w2.len()
            + self.u1.len()
            + self.u2.len()
            + self.bias_gate.len()
            + self.bias_update.len()
            + self.output.len()
            + 3
    }

    /// Check shapes, ranges and finiteness.
    pub fn validate(&self) -> RouterResult<()> {
        if self.input_dim != SIGNAL_COUNT {
            return Err(invalid(format!(
                "input_dim must be {SIGNAL_COUNT}, got {}",
                self.input_dim
            )));
        }
        if self.hidden_dim == 0 || self.rank_w == 0 || self.rank_u == 0 {
            return Err(invalid("hidden_dim, rank_w and rank_u must be positive"));
        }
        if !(1..=MAX_STEPS).contains(&self.steps) {
            return Err(invalid(format!(
                "steps must be in 1..={MAX_STEPS}, got {}",
                self.steps
            )));
        }

        let h = self.hidden_dim;
        let shapes: [(&str, &[f32], usize); 7] = [
            ("w1", self.w1.as_slice(), matrix_len("w1", h, self.rank_w)?),
            ("w2", self.w2.as_slice(), matrix_len("w2", self.rank_w, self.input_dim)?),
            ("u1", self.u1.as_slice(), matrix_len("u1", h, self.rank_u)?),
            ("u2", self.u2.as_slice(), matrix_len("u2", self.rank_u, h)?),
            ("bias_gate", self.bias_gate.as_slice(), h),
            ("bias_update", self.bias_update.as_slice(), h),
            ("output", self.output.as_slice(), h),
        ];
        for (name, values, expected) in shapes {
            if values.len() != expected {
                return Err(invalid(format!(
                    "{name} has {} values, expected {expected}",
                    values.len()
                )));
            }
            if let Some(pos) = values.iter().position(|v| !v.is_finite()) {
                return Err(invalid(format!("{name}[{pos}] is not finite")));
            }
        }

        for (name, v) in [("zeta", self.zeta), ("nu", self.nu)] {
            if !v.is_finite() || !(0.0..=1.0).contains(&v) {
                return Err(invalid(format!("{name} must be in [0, 1], got {v}")));
            }
        }
        if !self.output_bias.is_finite() {
            return Err(invalid("output_bias is not finite"));
        }
        Ok(())
    }
}

impl Default for ModelWeights {
    fn default() -> Self {
        Self::heuristic()
    }
}

fn invalid(msg: impl Into<String>) -> RouterError {
    RouterError::InvalidWeights(msg.into())
}

/// `rows × cols`, or `InvalidWeights` when the product overflows.
pub(crate) fn matrix_len(name: &str, rows: usize, cols: usize) -> RouterResult<usize> {
    rows.checked_mul(cols)
        .ok_or_else(|| invalid(format!("{name} shape {rows}×{cols} overflows")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heuristic_is_valid() {
        let w = ModelWeights::heuristic();
        w.validate().unwrap();
        assert_eq!(w.parameter_count(), 8 + 5 + 8 + 8 + 8 + 8 + 8 + 3);
    }

    #[test]
    fn test_wrong_input_dim_rejected() {
        let mut w = ModelWeights::heuristic();
        w.input_dim = 4;
        w.w2.truncate(4);
        let err = w.validate().unwrap_err();
        assert!(matches!(err, RouterError::InvalidWeights(ref m) if m.contains("input_dim")));
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let mut w = ModelWeights::heuristic();
        w.u2.push(0.0);
        let err = w.validate().unwrap_err();
        assert!(err.to_string().contains("u2"));
    }

    #[test]
    fn test_steps_bounds() {
        let mut w = ModelWeights::heuristic();
        w.steps = 0;
        assert!(w.validate().is_err());
        w.steps = MAX_STEPS + 1;
        assert!(w.validate().is_err());
        w.steps = MAX_STEPS;
        assert!(w.validate().is_ok());
    }

    #[test]
    fn test_non_finite_rejected() {
        let mut w = ModelWeights::heuristic();
        w.bias_gate[3] = f32::INFINITY;
        let err = w.validate().unwrap_err();
        assert!(err.to_string().contains("bias_gate[3]"));
    }

    #[test]
    fn test_zeta_nu_range() {
        let mut w = ModelWeights::heuristic();
        w.nu = 1.5;
        assert!(w.validate().is_err());
        w.nu = 0.1;
        w.zeta = -0.1;
        assert!(w.validate().is_err());
    }

    #[test]
    fn test_huge_dimensions_rejected_without_overflow() {
        let mut w = ModelWeights::heuristic();
        w.hidden_dim = usize::MAX / 2 + 1;
        w.rank_w = 4;
        let err = w.validate().unwrap_err();
        assert!(matches!(err, RouterError::InvalidWeights(ref m) if m.contains("overflows")));

        let json = serde_json::to_string(&w).unwrap();
        let err = ModelWeights::from_json_str(&json).unwrap_err();
        assert_eq!(err.code(), "INVALID_WEIGHTS");
    }

    #[test]
    fn test_json_round_trip_and_errors() {
        let json = serde_json::to_string(&ModelWeights::heuristic()).unwrap();
        let parsed = ModelWeights::from_json_str(&json).unwrap();
        assert_eq!(parsed, ModelWeights::heuristic());

        let err = ModelWeights::from_json_str("{not json").unwrap_err();
        assert_eq!(err.code(), "INVALID_WEIGHTS");
    }
}
