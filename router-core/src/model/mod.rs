//! Inference model
//!
//! One [`InferenceModel`] enum covers both operating modes so the router calls
//! a single `infer` regardless of how the weights are stored. The active model
//! lives in a [`ModelSlot`] and is swapped atomically on reload.

pub mod fastgrnn;
pub mod quantized;
pub mod slot;
pub mod weights;

pub use fastgrnn::{sigmoid, DenseMatrix, FastGrnn, GatedCell, MatVec};
pub use quantized::{
    QuantizationConfig, QuantizationStats, QuantizedFastGrnn, QuantizedMatrix,
    QUANTIZATION_TOLERANCE,
};
pub use slot::{LoadedModel, ModelInfo, ModelSlot, ReloadGuard};
pub use weights::{ModelWeights, MAX_STEPS};

use serde::{Deserialize, Serialize};

use crate::error::RouterResult;
use crate::features::FeatureVector;

/// How weights are stored and evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelMode {
    /// Dense `f32` reference model
    #[default]
    FullPrecision,
    /// Pruned sparse int8 model
    Quantized,
}

impl ModelMode {
    /// Mode selected by the `quantization_enabled` flag.
    pub fn from_quantization(enabled: bool) -> Self {
        if enabled {
            Self::Quantized
        } else {
            Self::FullPrecision
        }
    }
}

impl std::fmt::Display for ModelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FullPrecision => write!(f, "full_precision"),
            Self::Quantized => write!(f, "quantized"),
        }
    }
}

/// A built, validated model in one of the two modes.
#[derive(Debug, Clone)]
pub enum InferenceModel {
    FullPrecision(FastGrnn),
    Quantized(QuantizedFastGrnn),
}

impl InferenceModel {
    /// Validate `weights` and build the model for `mode`.
    ///
    /// A quantized build must stay within [`QUANTIZATION_TOLERANCE`] of the
    /// full-precision model, otherwise it fails with `InvalidWeights`.
    pub fn build(
        weights: &ModelWeights,
        mode: ModelMode,
        quantization: &QuantizationConfig,
    ) -> RouterResult<Self> {
        let reference = FastGrnn::from_weights(weights)?;
        match mode {
            ModelMode::FullPrecision => Ok(Self::FullPrecision(reference)),
            ModelMode::Quantized => Ok(Self::Quantized(QuantizedFastGrnn::quantize_checked(
                weights,
                quantization,
                &reference,
            )?)),
        }
    }

    /// Score one feature vector. Output is in (0, 1).
    pub fn infer(&self, features: &FeatureVector) -> RouterResult<f32> {
        match self {
            Self::FullPrecision(m) => m.forward(features.as_slice()),
            Self::Quantized(m) => m.forward(features.as_slice()),
        }
    }

    pub fn mode(&self) -> ModelMode {
        match self {
            Self::FullPrecision(_) => ModelMode::FullPrecision,
            Self::Quantized(_) => ModelMode::Quantized,
        }
    }

    /// Stored scalar parameters after any pruning.
    pub fn parameter_count(&self) -> usize {
        match self {
            Self::FullPrecision(m) => m.parameter_count(),
            Self::Quantized(m) => m.parameter_count(),
        }
    }
}
