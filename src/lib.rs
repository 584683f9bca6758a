#![allow(clippy::needless_range_loop)]

#[cfg(test)]
#[macro_use]
extern crate quickcheck;

pub mod activation;
pub mod batch_norm;
pub mod bn_lstm;
pub mod error;
pub mod initializers;
pub mod linalg;
pub mod lstm;
pub mod matrix;
pub mod rnn;
pub mod text_rnn;
pub mod variables;

pub use crate::batch_norm::{BatchNorm, BatchNormConfig, NormalizationMode};
pub use crate::bn_lstm::*;
pub use crate::error::{ModelError, Result};
pub use crate::lstm::*;
pub use crate::matrix::Matrix;
pub use crate::rnn::*;
pub use crate::text_rnn::*;
pub use crate::variables::{ParameterStore, Reuse, VarId, Variable, VariableScope};
