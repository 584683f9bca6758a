use thiserror::Error;

/// Everything that can go wrong while assembling or running a model.
///
/// Construction problems (unknown widths, scope conflicts, bad embedding
/// tables) come out of `build`/`new`. The runtime variants only fire when a
/// caller feeds data that disagrees with the shapes the model was built for.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("input width must be known to build variables in scope '{scope}'")]
    UnknownInputWidth { scope: String },

    #[error("variable '{name}' already exists and reuse was not requested")]
    VariableExists { name: String },

    #[error("variable '{name}' does not exist but reuse was requested")]
    VariableNotFound { name: String },

    #[error("variable #{index} is not held by this store")]
    UnknownVariable { index: usize },

    #[error("variable '{name}' has shape {actual:?}, requested {expected:?}")]
    VariableShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("pretrained embedding has shape {actual:?}, expected {expected:?}")]
    EmbeddingShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("{context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("token index {index} is outside vocabulary of size {vocab_size}")]
    TokenOutOfRange { index: usize, vocab_size: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;

impl ModelError {
    pub(crate) fn shape(context: &str, expected: &[usize], actual: &[usize]) -> Self {
        ModelError::ShapeMismatch {
            context: context.to_string(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
