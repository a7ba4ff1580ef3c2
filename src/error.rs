//! Error type shared by the model, flattening and sampling layers.

use thiserror::Error;

/// Everything that can go wrong before or during a sampling run.
///
/// Numerical divergences during sampling are *not* errors: they are recorded
/// on the chain as diagnostics and sampling continues.
#[derive(Debug, Error)]
pub enum BnnError {
    /// A tensor handed to the flattener does not match the recorded layout.
    #[error("shape mismatch for `{name}`: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A flat vector does not have the length recorded by the flattener.
    #[error("length mismatch: expected a vector of length {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// Invalid model or sampler hyperparameters.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The initial log-probability or its gradient is NaN or infinite.
    #[error("non-finite initial state: log_prob = {log_prob}, {non_finite_grad} non-finite gradient entries")]
    NonFiniteInitialState {
        log_prob: f64,
        non_finite_grad: usize,
    },

    /// `step` was called after the configured number of iterations.
    #[error("sampler already finished after {0} iterations")]
    SamplerFinished(usize),

    #[error("unsupported chain record version {found} (this build reads version {supported})")]
    UnsupportedRecordVersion { found: u32, supported: u32 },

    /// A loaded record whose rows disagree with its own dimensions.
    #[error("malformed chain record: {0}")]
    MalformedRecord(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "csv")]
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl BnnError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        BnnError::Configuration(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, BnnError>;
