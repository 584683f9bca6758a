use serde::{Deserialize, Serialize};

#[inline]
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

#[inline]
pub fn tanh(x: f64) -> f64 {
    x.tanh()
}

#[inline]
pub fn relu(x: f64) -> f64 {
    x.max(0.0)
}

#[inline]
pub fn identity(x: f64) -> f64 {
    x
}

/// `log(1 + e^x)` without overflowing for large `x`.
#[inline]
pub fn softplus(x: f64) -> f64 {
    if x > 30.0 {
        x
    } else {
        x.exp().ln_1p()
    }
}

/// Elementwise nonlinearity applied to the candidate input and to the cell
/// state on the way out of an LSTM cell.
///
/// No `PartialEq`, since `Custom` holds a function pointer.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub enum Activation {
    Tanh,
    Sigmoid,
    Relu,
    Identity,
    Softplus,
    #[serde(skip)]
    Custom(fn(f64) -> f64),
}

impl Activation {
    #[inline]
    pub fn apply(&self, x: f64) -> f64 {
        match self {
            Activation::Tanh => tanh(x),
            Activation::Sigmoid => sigmoid(x),
            Activation::Relu => relu(x),
            Activation::Identity => identity(x),
            Activation::Softplus => softplus(x),
            Activation::Custom(f) => f(x),
        }
    }
}

impl Default for Activation {
    fn default() -> Self {
        Activation::Tanh
    }
}
