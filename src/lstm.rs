/*
 * Standard LSTM cell (no peepholes, no normalization).
 *
 * One kernel of shape [input + num_units, 4 * num_units] applied to
 * concat(inputs, h), plus a bias. The pre-activation columns are four equal
 * gate blocks in the order i (input gate), j (candidate), f (forget gate),
 * o (output gate).
 */

use crate::activation::{sigmoid, Activation};
use crate::error::{ModelError, Result};
use crate::initializers::{GlorotUniform, Zeros};
use crate::matrix::Matrix;
use crate::rnn::{check_step_shapes, LSTMStateTuple, RNNCell};
use crate::variables::{ParameterStore, Reuse, VarId, VariableScope};
use tracing::debug;

/// Gate pre-activations split out of a `[batch, 4 * num_units]` matrix.
#[derive(Clone, Debug)]
pub struct LSTMGates {
    pub input: Matrix,
    pub candidate: Matrix,
    pub forget: Matrix,
    pub output: Matrix,
}

impl LSTMGates {
    pub fn split(hidden: &Matrix, num_units: usize) -> Result<Self> {
        if hidden.cols() != 4 * num_units {
            return Err(ModelError::shape(
                "LSTM gate pre-activations",
                &[hidden.rows(), 4 * num_units],
                &hidden.shape(),
            ));
        }
        let rows = hidden.rows();
        Ok(LSTMGates {
            input: hidden.block(0, 0, rows, num_units),
            candidate: hidden.block(0, num_units, rows, num_units),
            forget: hidden.block(0, 2 * num_units, rows, num_units),
            output: hidden.block(0, 3 * num_units, rows, num_units),
        })
    }

    /// `c * sigmoid(f + forget_bias) + sigmoid(i) * activation(j)`
    pub fn next_memory(
        &self,
        c: &Matrix,
        forget_bias: f64,
        activation: Activation,
    ) -> Result<Matrix> {
        let retained = c.hadamard(&self.forget.map(|f| sigmoid(f + forget_bias)))?;
        let written = self
            .input
            .map(sigmoid)
            .hadamard(&self.candidate.map(|j| activation.apply(j)))?;
        retained.add(&written)
    }

    /// `activation(memory) * sigmoid(o)`
    pub fn emit(&self, memory: &Matrix, activation: Activation) -> Result<Matrix> {
        memory
            .map(|m| activation.apply(m))
            .hadamard(&self.output.map(sigmoid))
    }
}

#[derive(Clone, Debug)]
pub struct BasicLSTMCell {
    num_units: usize,
    forget_bias: f64,
    activation: Activation,
    reuse: Reuse,
    scope_name: String,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BasicLSTMParams {
    kernel: VarId,
    bias: VarId,
    input_size: usize,
}

impl BasicLSTMParams {
    pub fn kernel(&self) -> VarId {
        self.kernel
    }

    pub fn bias(&self) -> VarId {
        self.bias
    }
}

impl BasicLSTMCell {
    pub fn new(num_units: usize) -> Self {
        BasicLSTMCell {
            num_units,
            forget_bias: 1.0,
            activation: Activation::Tanh,
            reuse: Reuse::Inherit,
            scope_name: "basic_lstm_cell".to_string(),
        }
    }

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

    pub fn num_units(&self) -> usize {
        self.num_units
    }
}

impl RNNCell for BasicLSTMCell {
    type Params = BasicLSTMParams;

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
                "LSTM cell needs at least one unit".to_string(),
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
        let kernel = cell.get_variable("kernel", &[input_size + n, 4 * n], GlorotUniform, true)?;
        let bias = cell.get_variable("bias", &[4 * n], Zeros, true)?;
        debug!(scope = cell.name(), input_size, num_units = n, "built LSTM cell");
        Ok(BasicLSTMParams {
            kernel,
            bias,
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
        check_step_shapes(inputs, params.input_size, state, self.num_units)?;
        let hidden = Matrix::hconcat(&[inputs, &state.h])?
            .matmul(&store.matrix(params.kernel)?)?
            .add_row_vector(store.value(params.bias)?)?;
        let gates = LSTMGates::split(&hidden, self.num_units)?;
        let new_c = gates.next_memory(&state.c, self.forget_bias, self.activation)?;
        let new_h = gates.emit(&new_c, self.activation)?;
        Ok((
            new_h.clone(),
            LSTMStateTuple {
                c: new_c,
                h: new_h,
            },
        ))
    }
}
