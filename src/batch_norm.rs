/*
 * Batch normalization over [batch, features] matrices, with running
 * population statistics for inference.
 *
 * Variables per site (all length `features`):
 *   scale     trainable, starts at 0.1
 *   offset    trainable, starts at 0
 *   pop_mean  tracked,   starts at 0
 *   pop_var   tracked,   starts at 1
 */

use crate::error::{ModelError, Result};
use crate::initializers::{Constant, Ones, Zeros};
use crate::matrix::Matrix;
use crate::variables::{ParameterStore, Reuse, VarId, VariableScope};
use serde::{Deserialize, Serialize};
use tracing::trace;

#[derive(Clone, Debug, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchNormConfig {
    pub(crate) epsilon: f64,
    pub(crate) decay: f64,
}

impl BatchNormConfig {
    pub fn new() -> Self {
        BatchNormConfig {
            epsilon: 1e-3,
            decay: 0.999,
        }
    }

    pub fn epsilon(self, epsilon: f64) -> Self {
        Self { epsilon, ..self }
    }

    pub fn decay(self, decay: f64) -> Self {
        Self { decay, ..self }
    }
}

impl Default for BatchNormConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Which statistics a normalization call uses.
///
/// `BatchStatistics` normalizes with the moments of the batch at hand and
/// folds them into the running estimates. `PopulationStatistics` reads the
/// running estimates and leaves them alone.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormalizationMode {
    BatchStatistics,
    PopulationStatistics,
}

impl NormalizationMode {
    pub fn from_training(is_training: bool) -> Self {
        if is_training {
            NormalizationMode::BatchStatistics
        } else {
            NormalizationMode::PopulationStatistics
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BatchNorm {
    scale: VarId,
    offset: VarId,
    pop_mean: VarId,
    pop_var: VarId,
    size: usize,
    config: BatchNormConfig,
}

impl BatchNorm {
    /// Creates (or fetches, depending on the scope's reuse policy) the four
    /// site variables under `scope/name`.
    pub fn build(
        scope: &mut VariableScope<'_>,
        name: &str,
        size: usize,
        config: BatchNormConfig,
    ) -> Result<Self> {
        let mut site = scope.sub_scope(name, Reuse::Inherit);
        let scale = site.get_variable("scale", &[size], Constant(0.1), true)?;
        let offset = site.get_variable("offset", &[size], Zeros, true)?;
        let pop_mean = site.get_variable("pop_mean", &[size], Zeros, false)?;
        let pop_var = site.get_variable("pop_var", &[size], Ones, false)?;
        Ok(BatchNorm {
            scale,
            offset,
            pop_mean,
            pop_var,
            size,
            config,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn pop_mean(&self) -> VarId {
        self.pop_mean
    }

    pub fn pop_var(&self) -> VarId {
        self.pop_var
    }

    pub fn apply(
        &self,
        store: &mut ParameterStore,
        x: &Matrix,
        mode: NormalizationMode,
    ) -> Result<Matrix> {
        if x.cols() != self.size {
            return Err(ModelError::shape(
                "batch norm features",
                &[self.size],
                &[x.cols()],
            ));
        }
        match mode {
            NormalizationMode::BatchStatistics => {
                if x.rows() == 0 {
                    return Err(ModelError::shape(
                        "batch norm needs a non-empty batch",
                        &[1, self.size],
                        &x.shape(),
                    ));
                }
                let (mean, var) = x.column_moments();
                let decay = self.config.decay;
                for (p, m) in store.value_mut(self.pop_mean)?.iter_mut().zip(mean.iter()) {
                    *p = *p * decay + m * (1.0 - decay);
                }
                for (p, v) in store.value_mut(self.pop_var)?.iter_mut().zip(var.iter()) {
                    *p = *p * decay + v * (1.0 - decay);
                }
                trace!(features = self.size, "batch norm with batch statistics");
                self.normalize(store, x, &mean, &var)
            }
            NormalizationMode::PopulationStatistics => {
                let mean = store.value(self.pop_mean)?;
                let var = store.value(self.pop_var)?;
                self.normalize(store, x, mean, var)
            }
        }
    }

    fn normalize(
        &self,
        store: &ParameterStore,
        x: &Matrix,
        mean: &[f64],
        var: &[f64],
    ) -> Result<Matrix> {
        let scale = store.value(self.scale)?;
        let offset = store.value(self.offset)?;
        let mut out = x.clone();
        let cols = x.cols();
        for (idx, v) in out.data_mut().iter_mut().enumerate() {
            let c = idx % cols;
            let inv = scale[c] / (var[c] + self.config.epsilon).sqrt();
            *v = (*v - mean[c]) * inv + offset[c];
        }
        Ok(out)
    }
}
