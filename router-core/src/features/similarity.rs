//! Vector similarity primitives.

use crate::error::{RouterError, RouterResult};

/// Cosine similarity between two equal-length vectors.
///
/// Returns a value in [-1, 1]. A zero-norm input yields 0.0 rather than NaN.
///
/// # Errors
///
/// [`RouterError::DimensionMismatch`] when the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> RouterResult<f32> {
    if a.len() != b.len() {
        return Err(RouterError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }

    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= f32::MIN_POSITIVE || !denom.is_finite() {
        return Ok(0.0);
    }
    Ok((dot / denom).clamp(-1.0, 1.0))
}
