//! Gated low-rank recurrent cell.
//!
//! ```text
//! pre   = W1 (W2 x) + U1 (U2 h)
//! z     = σ(pre + b_gate)
//! c     = tanh(pre + b_update)
//! h'    = (ζ (1 − z) + ν) ⊙ c + z ⊙ h
//! score = σ(v · h_T + b_out)
//! ```
//!
//! The cell is generic over matrix storage so the full-precision and the
//! quantized model share one forward pass.

use crate::error::{RouterError, RouterResult};

use super::weights::{matrix_len, ModelWeights};

/// Matrix-vector product over some storage format.
pub trait MatVec: Send + Sync {
    /// Number of output rows.
    fn rows(&self) -> usize;

    /// Number of input columns.
    fn cols(&self) -> usize;

    /// `out = self · x`. `x.len() == cols()`, `out.len() == rows()`.
    fn matvec(&self, x: &[f32], out: &mut [f32]);

    /// Number of stored scalar weights.
    fn stored(&self) -> usize;
}

/// Row-major dense `f32` matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl DenseMatrix {
    /// Wrap row-major values. `data.len()` must equal `rows × cols`.
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> RouterResult<Self> {
        let len = matrix_len("matrix", rows, cols)?;
        if data.len() != len {
            return Err(RouterError::InvalidWeights(format!(
                "matrix {rows}×{cols} needs {len} values, got {}",
                data.len()
            )));
        }
        Ok(Self { rows, cols, data })
    }

    /// One row.
    pub fn row(&self, r: usize) -> &[f32] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }
}

impl MatVec for DenseMatrix {
    fn rows(&self) -> usize {
        self.rows
    }

    fn cols(&self) -> usize {
        self.cols
    }

    fn matvec(&self, x: &[f32], out: &mut [f32]) {
        for (r, slot) in out.iter_mut().enumerate().take(self.rows) {
            *slot = self.row(r).iter().zip(x).map(|(w, v)| w * v).sum();
        }
    }

    fn stored(&self) -> usize {
        self.data.len()
    }
}

/// Gated recurrent cell over matrix storage `M`.
#[derive(Debug, Clone)]
pub struct GatedCell<M> {
    pub(crate) w1: M,
    pub(crate) w2: M,
    pub(crate) u1: M,
    pub(crate) u2: M,
    pub(crate) output: M,
    pub(crate) bias_gate: Vec<f32>,
    pub(crate) bias_update: Vec<f32>,
    pub(crate) zeta: f32,
    pub(crate) nu: f32,
    pub(crate) output_bias: f32,
    pub(crate) steps: usize,
}

/// Full-precision model.
pub type FastGrnn = GatedCell<DenseMatrix>;

impl GatedCell<DenseMatrix> {
    /// Validate `weights` and build the full-precision cell.
    pub fn from_weights(weights: &ModelWeights) -> RouterResult<Self> {
        weights.validate()?;
        let h = weights.hidden_dim;
        Ok(Self {
            w1: DenseMatrix::new(h, weights.rank_w, weights.w1.clone())?,
            w2: DenseMatrix::new(weights.rank_w, weights.input_dim, weights.w2.clone())?,
            u1: DenseMatrix::new(h, weights.rank_u, weights.u1.clone())?,
            u2: DenseMatrix::new(weights.rank_u, h, weights.u2.clone())?,
            output: DenseMatrix::new(1, h, weights.output.clone())?,
            bias_gate: weights.bias_gate.clone(),
            bias_update: weights.bias_update.clone(),
            zeta: weights.zeta,
            nu: weights.nu,
            output_bias: weights.output_bias,
            steps: weights.steps,
        })
    }
}

impl<M: MatVec> GatedCell<M> {
    /// Input width expected by [`GatedCell::forward`].
    pub fn input_dim(&self) -> usize {
        self.w2.cols()
    }

    /// Hidden state width.
    pub fn hidden_dim(&self) -> usize {
        self.w1.rows()
    }

    /// Stored scalars: matrix entries plus biases and gate scalars.
    pub fn parameter_count(&self) -> usize {
        self.w1.stored()
            + self.w2.stored()
            + self.u1.stored()
            + self.u2.stored()
            + self.output.stored()
            + self.bias_gate.len()
            + self.bias_update.len()
            + 3
    }

    /// Run `steps` recurrent updates on `x` and return the score in (0, 1).
    ///
    /// # Errors
    ///
    /// `DimensionMismatch` when `x` has the wrong width; `Inference` when the
    /// score is not finite.
    pub fn forward(&self, x: &[f32]) -> RouterResult<f32> {
        if x.len() != self.input_dim() {
            return Err(RouterError::DimensionMismatch {
                expected: self.input_dim(),
                actual: x.len(),
            });
        }

        let hidden = self.hidden_dim();
        let mut low_w = vec![0.0; self.w2.rows()];
        let mut wx = vec![0.0; hidden];
        self.w2.matvec(x, &mut low_w);
        self.w1.matvec(&low_w, &mut wx);

        let mut h = vec![0.0; hidden];
        let mut low_u = vec![0.0; self.u2.rows()];
        let mut uh = vec![0.0; hidden];
        for _ in 0..self.steps {
            self.u2.matvec(&h, &mut low_u);
            self.u1.matvec(&low_u, &mut uh);
            for i in 0..hidden {
                let pre = wx[i] + uh[i];
                let z = sigmoid(pre + self.bias_gate[i]);
                let c = (pre + self.bias_update[i]).tanh();
                h[i] = (self.zeta * (1.0 - z) + self.nu) * c + z * h[i];
            }
        }

        let mut logit = [0.0_f32; 1];
        self.output.matvec(&h, &mut logit);
        let score = sigmoid(logit[0] + self.output_bias);
        if !score.is_finite() {
            return Err(RouterError::Inference(format!(
                "model produced non-finite score {score}"
            )));
        }
        Ok(score)
    }
}

/// Logistic function, kept inside `[ε, 1 − ε]` so large logits never
/// saturate to exactly 0 or 1. NaN passes through.
pub fn sigmoid(x: f32) -> f32 {
    (1.0 / (1.0 + (-x).exp())).clamp(f32::EPSILON, 1.0 - f32::EPSILON)
}
