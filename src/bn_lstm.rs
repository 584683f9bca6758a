/*
 * Batch-normalized LSTM (Cooijmans et al., "Recurrent Batch Normalization").
 *
 * Differences from the plain LSTM cell:
 *   - separate input-to-hidden (W_xh) and hidden-to-hidden (W_hh) weights,
 *     each product normalized on its own before the bias is added;
 *   - the new memory is normalized before it goes through the output
 *     activation, but the state carries the unnormalized memory;
 *   - W_xh starts orthogonal, W_hh starts as three orthogonal gate blocks
 *     plus a scaled identity on the candidate block.
 *
 * Variables, relative to the cell scope:
 *   W_xh [input, 4n]   W_hh [n, 4n]   bias [4n]
 *   batch norm sites xh and hh (width 4n), c (width n)
 */

use crate::activation::Activation;
use crate::batch_norm::{BatchNorm, BatchNormConfig, NormalizationMode};
use crate::error::{ModelError, Result};
use crate::initializers::{BnLstmIdentity, GlorotUniform, Orthogonal};
use crate::lstm::LSTMGates;
use crate::matrix::Matrix;
use crate::rnn::{check_step_shapes, LSTMStateTuple, RNNCell};
use crate::variables::{ParameterStore, Reuse, VarId, VariableScope};
use tracing::{debug, trace};

#[derive(Clone, Debug)]
pub struct BatchNormLSTMCell {
    num_units: usize,
    is_training: bool,
    forget_bias: f64,
    activation: Activation,
    reuse: Reuse,
    identity_scale: f64,
    batch_norm: BatchNormConfig,
    scope_name: String,
}

/// Handles to one built set of cell parameters.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BatchNormLSTMParams {
    w_xh: VarId,
    w_hh: VarId,
    bias: VarId,
    bn_xh: BatchNorm,
    bn_hh: BatchNorm,
    bn_c: BatchNorm,
    input_size: usize,
}

impl BatchNormLSTMParams {
    pub fn w_xh(&self) -> VarId {
        self.w_xh
    }

    pub fn w_hh(&self) -> VarId {
        self.w_hh
    }

    pub fn bias(&self) -> VarId {
        self.bias
    }

    pub fn bn_xh(&self) -> &BatchNorm {
        &self.bn_xh
    }

    pub fn bn_hh(&self) -> &BatchNorm {
        &self.bn_hh
    }

    pub fn bn_c(&self) -> &BatchNorm {
        &self.bn_c
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }
}

impl BatchNormLSTMCell {
    pub fn new(num_units: usize) -> Self {
        BatchNormLSTMCell {
            num_units,
            is_training: false,
            forget_bias: 1.0,
            activation: Activation::Tanh,
            reuse: Reuse::Inherit,
            identity_scale: 0.95,
            batch_norm: BatchNormConfig::default(),
            scope_name: "BatchNormLSTMCell".to_string(),
        }
    }

    pub fn is_training(self, is_training: bool) -> Self {
        Self {
            is_training,
            ..self
        }
    }

    /// Added to the forget gate pre-activation. Use `0.0` for weights
    /// trained without it.
    pub fn forget_bias(self, forget_bias: f64) -> Self {
        Self {
            forget_bias,
            ..self
        }
    }

    pub fn activation(self, activation: Activation) -> Self {
        Self { activation, ..self }
    }

    pub fn reuse(self, reuse: Reuse) -> Self {
        Self { reuse, ..self }
    }

    pub fn identity_scale(self, identity_scale: f64) -> Self {
        Self {
            identity_scale,
            ..self
        }
    }

    pub fn batch_norm_config(self, batch_norm: BatchNormConfig) -> Self {
        Self { batch_norm, ..self }
    }

    pub fn scope_name(self, scope_name: &str) -> Self {
        Self {
            scope_name: scope_name.to_string(),
            ..self
        }
    }

    pub fn num_units(&self) -> usize {
        self.num_units
    }

    pub fn training(&self) -> bool {
        self.is_training
    }

    pub fn mode(&self) -> NormalizationMode {
        NormalizationMode::from_training(self.is_training)
    }

    /// `BN_xh(x W_xh) + BN_hh(h W_hh) + bias`, shape `[batch, 4 * num_units]`.
    ///
    /// In `BatchStatistics` mode this updates the running statistics of the
    /// `xh` and `hh` sites.
    pub fn gate_pre_activations(
        &self,
        store: &mut ParameterStore,
        params: &BatchNormLSTMParams,
        inputs: &Matrix,
        state: &LSTMStateTuple,
        mode: NormalizationMode,
    ) -> Result<Matrix> {
        check_step_shapes(inputs, params.input_size, state, self.num_units)?;
        let xh = inputs.matmul(&store.matrix(params.w_xh)?)?;
        let hh = state.h.matmul(&store.matrix(params.w_hh)?)?;
        let bn_xh = params.bn_xh.apply(store, &xh, mode)?;
        let bn_hh = params.bn_hh.apply(store, &hh, mode)?;
        bn_xh.add(&bn_hh)?.add_row_vector(store.value(params.bias)?)
    }

    /// One step with an explicit normalization mode, ignoring the
    /// `is_training` flag the cell was configured with.
    pub fn call_with_mode(
        &self,
        store: &mut ParameterStore,
        params: &BatchNormLSTMParams,
        inputs: &Matrix,
        state: &LSTMStateTuple,
        mode: NormalizationMode,
    ) -> Result<(Matrix, LSTMStateTuple)> {
        let hidden = self.gate_pre_activations(store, params, inputs, state, mode)?;
        let gates = LSTMGates::split(&hidden, self.num_units)?;
        let new_c = gates.next_memory(&state.c, self.forget_bias, self.activation)?;
        let bn_new_c = params.bn_c.apply(store, &new_c, mode)?;
        let new_h = gates.emit(&bn_new_c, self.activation)?;
        trace!(batch = inputs.rows(), mode = ?mode, "batch norm LSTM step");
        Ok((
            new_h.clone(),
            LSTMStateTuple {
                c: new_c,
                h: new_h,
            },
        ))
    }
}

impl RNNCell for BatchNormLSTMCell {
    type Params = BatchNormLSTMParams;

    fn state_size(&self) -> (usize, usize) {
        (self.num_units, self.num_units)
    }

    fn output_size(&self) -> usize {
        self.num_units
    }

    fn build(
        &self,
        scope: &mut VariableScope<'_>,
        input_width: Option<usize>,
    ) -> Result<Self::Params> {
        if self.num_units == 0 {
            return Err(ModelError::InvalidConfig(
                "batch norm LSTM cell needs at least one unit".to_string(),
            ));
        }
        let mut cell = scope.sub_scope(&self.scope_name, self.reuse);
        let input_size = match input_width {
            Some(w) if w > 0 => w,
            _ => {
                return Err(ModelError::UnknownInputWidth {
                    scope: cell.name().to_string(),
                })
            }
        };
        let n = self.num_units;

        let w_xh = cell.get_variable("W_xh", &[input_size, 4 * n], Orthogonal, true)?;
        let w_hh = cell.get_variable(
            "W_hh",
            &[n, 4 * n],
            BnLstmIdentity {
                scale: self.identity_scale,
            },
            true,
        )?;
        let bias = cell.get_variable("bias", &[4 * n], GlorotUniform, true)?;

        let bn_xh = BatchNorm::build(&mut cell, "xh", 4 * n, self.batch_norm)?;
        let bn_hh = BatchNorm::build(&mut cell, "hh", 4 * n, self.batch_norm)?;
        let bn_c = BatchNorm::build(&mut cell, "c", n, self.batch_norm)?;

        debug!(scope = cell.name(), input_size, num_units = n, "built batch norm LSTM cell");
        Ok(BatchNormLSTMParams {
            w_xh,
            w_hh,
            bias,
            bn_xh,
            bn_hh,
            bn_c,
            input_size,
        })
    }

    fn call(
        &self,
        store: &mut ParameterStore,
        params: &Self::Params,
        inputs: &Matrix,
        state: &LSTMStateTuple,
    ) -> Result<(Matrix, LSTMStateTuple)> {
        self.call_with_mode(store, params, inputs, state, self.mode())
    }
}
