/*
 * Variable initializers.
 *
 * An initializer is handed a shape and an RNG and returns row-major data for
 * that shape. Layers take them as type parameters, so the choice is fixed
 * when the layer is built.
 */

use crate::error::{ModelError, Result};
use crate::linalg::thin_svd;
use crate::matrix::Matrix;
use rand::Rng;
use rand_distr::StandardNormal;

pub trait Initializer {
    fn initialize<R: Rng>(&self, shape: &[usize], rng: &mut R) -> Result<Vec<f64>>;
}

fn num_elements(shape: &[usize]) -> usize {
    shape.iter().product()
}

#[derive(Copy, Clone, Debug, Default)]
pub struct Zeros;

impl Initializer for Zeros {
    fn initialize<R: Rng>(&self, shape: &[usize], _rng: &mut R) -> Result<Vec<f64>> {
        Ok(vec![0.0; num_elements(shape)])
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct Ones;

impl Initializer for Ones {
    fn initialize<R: Rng>(&self, shape: &[usize], _rng: &mut R) -> Result<Vec<f64>> {
        Ok(vec![1.0; num_elements(shape)])
    }
}

#[derive(Copy, Clone, Debug)]
pub struct Constant(pub f64);

impl Initializer for Constant {
    fn initialize<R: Rng>(&self, shape: &[usize], _rng: &mut R) -> Result<Vec<f64>> {
        Ok(vec![self.0; num_elements(shape)])
    }
}

/// Uniform in `[low, high)`.
#[derive(Copy, Clone, Debug)]
pub struct RandomUniform {
    pub low: f64,
    pub high: f64,
}

impl Initializer for RandomUniform {
    fn initialize<R: Rng>(&self, shape: &[usize], rng: &mut R) -> Result<Vec<f64>> {
        if !(self.low <= self.high) {
            return Err(ModelError::InvalidConfig(format!(
                "uniform range [{}, {}) is empty",
                self.low, self.high
            )));
        }
        if self.low == self.high {
            return Ok(vec![self.low; num_elements(shape)]);
        }
        Ok((0..num_elements(shape))
            .map(|_| rng.random_range(self.low..self.high))
            .collect())
    }
}

/// Xavier/Glorot uniform: `U(-l, l)` with `l = sqrt(6 / (fan_in + fan_out))`.
#[derive(Copy, Clone, Debug, Default)]
pub struct GlorotUniform;

pub(crate) fn fans(shape: &[usize]) -> (f64, f64) {
    match shape.len() {
        0 => (1.0, 1.0),
        1 => (shape[0] as f64, shape[0] as f64),
        2 => (shape[0] as f64, shape[1] as f64),
        n => {
            let receptive: usize = shape[..n - 2].iter().product();
            (
                (shape[n - 2] * receptive) as f64,
                (shape[n - 1] * receptive) as f64,
            )
        }
    }
}

impl Initializer for GlorotUniform {
    fn initialize<R: Rng>(&self, shape: &[usize], rng: &mut R) -> Result<Vec<f64>> {
        let (fan_in, fan_out) = fans(shape);
        let limit = (6.0 / (fan_in + fan_out).max(1.0)).sqrt();
        RandomUniform {
            low: -limit,
            high: limit,
        }
        .initialize(shape, rng)
    }
}

/// Orthonormal rows or columns, via the SVD of a standard normal draw.
///
/// The shape is flattened to `(shape[0], product(shape[1..]))`. Whichever
/// singular factor has exactly that shape is returned: `U` (orthonormal
/// columns) when the matrix is tall or square, `V^T` (orthonormal rows) when
/// it is wide.
#[derive(Copy, Clone, Debug, Default)]
pub struct Orthogonal;

pub fn orthogonal<R: Rng>(shape: &[usize], rng: &mut R) -> Result<Matrix> {
    if shape.is_empty() {
        return Err(ModelError::InvalidConfig(
            "orthogonal initializer needs at least one dimension".to_string(),
        ));
    }
    let rows = shape[0];
    let cols: usize = shape[1..].iter().product();
    let draw: Vec<f64> = (0..rows * cols)
        .map(|_| rng.sample::<f64, _>(StandardNormal))
        .collect();
    let svd = thin_svd(&Matrix::from_vec(rows, cols, draw)?);
    if svd.u.shape() == [rows, cols] {
        Ok(svd.u)
    } else {
        Ok(svd.vt)
    }
}

impl Initializer for Orthogonal {
    fn initialize<R: Rng>(&self, shape: &[usize], rng: &mut R) -> Result<Vec<f64>> {
        Ok(orthogonal(shape, rng)?.into_vec())
    }
}

/// Hidden-to-hidden weights of the batch-normalized LSTM.
///
/// Four `n x n` gate blocks side by side in the order i, j, f, o. The
/// candidate block `j` starts as `scale * I`, the other three are
/// independent orthogonal matrices.
#[derive(Copy, Clone, Debug)]
pub struct BnLstmIdentity {
    pub scale: f64,
}

impl Default for BnLstmIdentity {
    fn default() -> Self {
        BnLstmIdentity { scale: 0.95 }
    }
}

impl Initializer for BnLstmIdentity {
    fn initialize<R: Rng>(&self, shape: &[usize], rng: &mut R) -> Result<Vec<f64>> {
        if shape.len() != 2 || shape[1] != shape[0] * 4 {
            return Err(ModelError::InvalidConfig(format!(
                "identity LSTM initializer needs shape [n, 4n], got {:?}",
                shape
            )));
        }
        let n = shape[0];
        let mut t = Matrix::zeros(n, 4 * n);
        t.set_block(0, n, &Matrix::identity(n).scale(self.scale))?;
        t.set_block(0, 0, &orthogonal(&[n, n], rng)?)?;
        t.set_block(0, 2 * n, &orthogonal(&[n, n], rng)?)?;
        t.set_block(0, 3 * n, &orthogonal(&[n, n], rng)?)?;
        Ok(t.into_vec())
    }
}

/// Fixed data, e.g. a pretrained embedding table.
#[derive(Copy, Clone, Debug)]
pub struct FromValues<'a>(pub &'a [f64]);

impl<'a> Initializer for FromValues<'a> {
    fn initialize<R: Rng>(&self, shape: &[usize], _rng: &mut R) -> Result<Vec<f64>> {
        if self.0.len() != num_elements(shape) {
            return Err(ModelError::shape(
                "initializer values",
                &[num_elements(shape)],
                &[self.0.len()],
            ));
        }
        Ok(self.0.to_vec())
    }
}
