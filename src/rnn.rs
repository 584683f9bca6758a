use crate::error::{ModelError, Result};
use crate::matrix::Matrix;
use crate::variables::{ParameterStore, VariableScope};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// `(c, h)` state of an LSTM-style cell, each `[batch, num_units]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LSTMStateTuple {
    pub c: Matrix,
    pub h: Matrix,
}

impl LSTMStateTuple {
    pub fn zeros(batch_size: usize, num_units: usize) -> Self {
        LSTMStateTuple {
            c: Matrix::zeros(batch_size, num_units),
            h: Matrix::zeros(batch_size, num_units),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.h.rows()
    }
}

/// One step of a recurrent computation.
///
/// A cell object only carries configuration. `build` resolves its variables
/// in a scope and returns handles (`Params`). `call` runs one time step with
/// those handles; calling it repeatedly with the same `Params` is what makes
/// the parameters shared across time.
pub trait RNNCell {
    type Params;

    /// Widths of `(c, h)`.
    fn state_size(&self) -> (usize, usize);

    fn output_size(&self) -> usize;

    fn zero_state(&self, batch_size: usize) -> LSTMStateTuple {
        let (c, h) = self.state_size();
        LSTMStateTuple {
            c: Matrix::zeros(batch_size, c),
            h: Matrix::zeros(batch_size, h),
        }
    }

    /// `input_width` is `None` when the feature width of the inputs is not
    /// known yet; cells refuse to size their weights in that case.
    fn build(
        &self,
        scope: &mut VariableScope<'_>,
        input_width: Option<usize>,
    ) -> Result<Self::Params>;

    fn call(
        &self,
        store: &mut ParameterStore,
        params: &Self::Params,
        inputs: &Matrix,
        state: &LSTMStateTuple,
    ) -> Result<(Matrix, LSTMStateTuple)>;
}

pub(crate) fn check_step_shapes(
    inputs: &Matrix,
    input_width: usize,
    state: &LSTMStateTuple,
    num_units: usize,
) -> Result<()> {
    let batch = inputs.rows();
    if inputs.cols() != input_width {
        return Err(ModelError::shape(
            "cell input width",
            &[batch, input_width],
            &inputs.shape(),
        ));
    }
    if state.c.shape() != [batch, num_units] {
        return Err(ModelError::shape(
            "cell state c",
            &[batch, num_units],
            &state.c.shape(),
        ));
    }
    if state.h.shape() != [batch, num_units] {
        return Err(ModelError::shape(
            "cell state h",
            &[batch, num_units],
            &state.h.shape(),
        ));
    }
    Ok(())
}

/// Inverted dropout on a cell's output. The state passes through untouched.
#[derive(Clone, Debug)]
pub struct DropoutWrapper<C> {
    cell: C,
    output_keep_prob: f64,
}

impl<C: RNNCell> DropoutWrapper<C> {
    pub fn new(cell: C, output_keep_prob: f64) -> Result<Self> {
        if !(output_keep_prob > 0.0 && output_keep_prob <= 1.0) {
            return Err(ModelError::InvalidConfig(format!(
                "dropout keep probability must be in (0, 1], got {}",
                output_keep_prob
            )));
        }
        Ok(DropoutWrapper {
            cell,
            output_keep_prob,
        })
    }

    pub fn inner(&self) -> &C {
        &self.cell
    }
}

pub fn dropout<R: Rng>(x: &Matrix, keep_prob: f64, rng: &mut R) -> Matrix {
    if keep_prob >= 1.0 {
        return x.clone();
    }
    let mut out = x.clone();
    for v in out.data_mut().iter_mut() {
        let keep = (keep_prob + rng.random::<f64>()).floor();
        *v = *v / keep_prob * keep;
    }
    out
}

impl<C: RNNCell> RNNCell for DropoutWrapper<C> {
    type Params = C::Params;

    fn state_size(&self) -> (usize, usize) {
        self.cell.state_size()
    }

    fn output_size(&self) -> usize {
        self.cell.output_size()
    }

    fn build(
        &self,
        scope: &mut VariableScope<'_>,
        input_width: Option<usize>,
    ) -> Result<Self::Params> {
        self.cell.build(scope, input_width)
    }

    fn call(
        &self,
        store: &mut ParameterStore,
        params: &Self::Params,
        inputs: &Matrix,
        state: &LSTMStateTuple,
    ) -> Result<(Matrix, LSTMStateTuple)> {
        let (output, new_state) = self.cell.call(store, params, inputs, state)?;
        let output = dropout(&output, self.output_keep_prob, store.rng_mut());
        Ok((output, new_state))
    }
}

/// Runs `cell` over time-major `inputs` (one `[batch, features]` matrix per
/// step), returning every step's output and the final state.
pub fn static_rnn<C: RNNCell>(
    cell: &C,
    store: &mut ParameterStore,
    params: &C::Params,
    inputs: &[Matrix],
    initial_state: LSTMStateTuple,
) -> Result<(Vec<Matrix>, LSTMStateTuple)> {
    let mut state = initial_state;
    let mut outputs = Vec::with_capacity(inputs.len());
    for (t, x) in inputs.iter().enumerate() {
        trace!(step = t, "rnn step");
        let (output, next) = cell.call(store, params, x, &state)?;
        outputs.push(output);
        state = next;
    }
    Ok((outputs, state))
}

#[derive(Clone, Debug)]
pub struct BidirectionalOutput {
    /// Forward outputs, in time order.
    pub forward: Vec<Matrix>,
    /// Backward outputs, re-aligned to time order.
    pub backward: Vec<Matrix>,
    pub forward_state: LSTMStateTuple,
    pub backward_state: LSTMStateTuple,
}

impl BidirectionalOutput {
    /// `[forward_t, backward_t]` concatenated per time step.
    pub fn concatenated(&self) -> Result<Vec<Matrix>> {
        self.forward
            .iter()
            .zip(self.backward.iter())
            .map(|(f, b)| Matrix::hconcat(&[f, b]))
            .collect()
    }
}

/// Runs `fw` over t = 0..T and `bw` over t = T-1..0, both from zero state.
pub fn bidirectional_rnn<F: RNNCell, B: RNNCell>(
    fw: &F,
    fw_params: &F::Params,
    bw: &B,
    bw_params: &B::Params,
    store: &mut ParameterStore,
    inputs: &[Matrix],
) -> Result<BidirectionalOutput> {
    let batch_size = match inputs.first() {
        Some(x) => x.rows(),
        None => {
            return Err(ModelError::InvalidConfig(
                "bidirectional rnn needs at least one time step".to_string(),
            ))
        }
    };

    let (forward, forward_state) =
        static_rnn(fw, store, fw_params, inputs, fw.zero_state(batch_size))?;

    let reversed: Vec<Matrix> = inputs.iter().rev().cloned().collect();
    let (mut backward, backward_state) =
        static_rnn(bw, store, bw_params, &reversed, bw.zero_state(batch_size))?;
    backward.reverse();

    Ok(BidirectionalOutput {
        forward,
        backward,
        forward_state,
        backward_state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lstm::BasicLSTMCell;
    use crate::variables::Reuse;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sequence(steps: usize, batch: usize, width: usize) -> Vec<Matrix> {
        (0..steps)
            .map(|t| {
                let data = (0..batch * width)
                    .map(|i| ((t * 7 + i) as f64 * 0.37).sin())
                    .collect();
                Matrix::from_vec(batch, width, data).unwrap()
            })
            .collect()
    }

    #[test]
    fn dropout_with_full_keep_is_identity() {
        let mut rng = StdRng::seed_from_u64(0);
        let x = Matrix::from_rows(&[vec![1.0, -2.0, 3.0]]).unwrap();
        assert_eq!(dropout(&x, 1.0, &mut rng), x);
    }

    #[test]
    fn dropout_zeroes_or_rescales() {
        let mut rng = StdRng::seed_from_u64(4);
        let x = Matrix::filled(20, 20, 1.0);
        let y = dropout(&x, 0.5, &mut rng);
        assert!(y.data().iter().all(|v| *v == 0.0 || *v == 2.0));
        assert!(y.data().iter().any(|v| *v == 0.0));
        assert!(y.data().iter().any(|v| *v == 2.0));
    }

    #[test]
    fn zero_state_has_requested_batch() {
        let s = LSTMStateTuple::zeros(3, 5);
        assert_eq!(s.batch_size(), 3);
        assert_eq!(s.c.shape(), [3, 5]);
    }

    #[test]
    fn backward_outputs_are_in_forward_time_order() {
        let mut store = ParameterStore::seeded(12);
        let fw = BasicLSTMCell::new(3);
        let bw = BasicLSTMCell::new(3);
        let (fw_params, bw_params) = {
            let mut scope = store.scope("bi", Reuse::Create);
            let f = fw
                .build(&mut scope.sub_scope("fw", Reuse::Inherit), Some(2))
                .unwrap();
            let b = bw
                .build(&mut scope.sub_scope("bw", Reuse::Inherit), Some(2))
                .unwrap();
            (f, b)
        };
        let xs = sequence(4, 2, 2);
        let out = bidirectional_rnn(&fw, &fw_params, &bw, &bw_params, &mut store, &xs).unwrap();
        assert_eq!(out.backward.len(), 4);

        // the backward pass starts at the last step
        let (first_bw, _) = bw
            .call(&mut store, &bw_params, &xs[3], &bw.zero_state(2))
            .unwrap();
        assert_eq!(out.backward[3], first_bw);
        assert_eq!(out.backward[0], out.backward_state.h);
        assert_eq!(out.forward[3], out.forward_state.h);

        let joined = out.concatenated().unwrap();
        assert_eq!(joined[3].shape(), [2, 6]);
        assert_eq!(joined[3].block(0, 3, 2, 3), first_bw);
    }

    #[test]
    fn dropout_wrapper_leaves_state_alone() {
        let mut store = ParameterStore::seeded(5);
        let cell = BasicLSTMCell::new(8);
        let params = cell
            .build(&mut store.scope("d", Reuse::Create), Some(4))
            .unwrap();
        let wrapped = DropoutWrapper::new(cell.clone(), 0.5).unwrap();
        let x = sequence(1, 3, 4).remove(0);
        let state = cell.zero_state(3);

        let (plain_out, plain_state) = cell.call(&mut store, &params, &x, &state).unwrap();
        let (dropped_out, dropped_state) = wrapped.call(&mut store, &params, &x, &state).unwrap();
        assert_eq!(dropped_state, plain_state);
        for (d, p) in dropped_out.data().iter().zip(plain_out.data().iter()) {
            assert!(*d == 0.0 || (*d - p / 0.5).abs() < 1e-12);
        }
    }

    #[test]
    fn dropout_wrapper_rejects_bad_keep_probability() {
        for &keep in [0.0, -0.1, 1.5, f64::NAN].iter() {
            assert!(DropoutWrapper::new(BasicLSTMCell::new(2), keep).is_err());
        }
    }
}
