//! Versioned model slot with single-writer hot reload.
//!
//! Readers take an `Arc` snapshot of the active model and finish their request
//! on that version even if a reload publishes a new one meanwhile. A reload
//! holds a [`ReloadGuard`] while it builds; a second reload attempted in that
//! window fails with `ReloadInProgress`.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::error::{RouterError, RouterResult};
use crate::features::FeatureVector;

use super::{InferenceModel, ModelMode, ModelWeights, QuantizationConfig};

/// A published model and its provenance.
#[derive(Debug)]
pub struct LoadedModel {
    pub version: u64,
    pub mode: ModelMode,
    pub loaded_at: DateTime<Utc>,
    pub parameter_count: usize,
    model: InferenceModel,
}

impl LoadedModel {
    pub fn infer(&self, features: &FeatureVector) -> RouterResult<f32> {
        self.model.infer(features)
    }

    pub fn model(&self) -> &InferenceModel {
        &self.model
    }

    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            version: self.version,
            mode: self.mode,
            loaded_at: self.loaded_at,
            parameter_count: self.parameter_count,
        }
    }
}

/// Serializable description of the active model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub version: u64,
    pub mode: ModelMode,
    pub loaded_at: DateTime<Utc>,
    pub parameter_count: usize,
}

/// Holder of the active model.
#[derive(Debug, Default)]
pub struct ModelSlot {
    active: RwLock<Option<Arc<LoadedModel>>>,
    reloading: AtomicBool,
    last_version: AtomicU64,
}

impl ModelSlot {
    /// A slot with no model.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Snapshot of the active model, if any.
    pub fn current(&self) -> Option<Arc<LoadedModel>> {
        self.active.read().clone()
    }

    /// Version of the active model, if any.
    pub fn version(&self) -> Option<u64> {
        self.active.read().as_ref().map(|m| m.version)
    }

    /// Claim the single reload slot.
    ///
    /// # Errors
    ///
    /// `ReloadInProgress` when another guard is alive.
    pub fn begin_reload(&self) -> RouterResult<ReloadGuard<'_>> {
        self.reloading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| RouterError::ReloadInProgress)?;
        Ok(ReloadGuard { slot: self })
    }

    /// Build a model from `weights` and publish it. Returns the new version.
    ///
    /// The previous model stays active if building fails.
    pub fn load(
        &self,
        weights: &ModelWeights,
        mode: ModelMode,
        quantization: &QuantizationConfig,
    ) -> RouterResult<u64> {
        let guard = self.begin_reload()?;
        let model = InferenceModel::build(weights, mode, quantization)?;
        Ok(guard.publish(model))
    }
}

/// Exclusive right to publish the next model. Releases the slot on drop.
#[derive(Debug)]
pub struct ReloadGuard<'a> {
    slot: &'a ModelSlot,
}

impl ReloadGuard<'_> {
    /// Swap `model` in as the active model and return its version.
    pub fn publish(self, model: InferenceModel) -> u64 {
        let version = self.slot.last_version.fetch_add(1, Ordering::AcqRel) + 1;
        let loaded = Arc::new(LoadedModel {
            version,
            mode: model.mode(),
            loaded_at: Utc::now(),
            parameter_count: model.parameter_count(),
            model,
        });
        let previous = self.slot.active.write().replace(loaded);
        info!(
            version,
            previous = ?previous.as_ref().map(|m| m.version),
            "model published"
        );
        version
    }
}

impl Drop for ReloadGuard<'_> {
    fn drop(&mut self) {
        self.slot.reloading.store(false, Ordering::Release);
    }
}
