//! Error types for strata-sgd.

use strata_matrix::MatrixError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SgdError {
    /// Invalid runner or controller settings.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The decay controller produced a step size that is NaN or infinite.
    #[error("non-finite step size {eps} at epoch {epoch}")]
    NonFiniteStep { epoch: usize, eps: f64 },
    #[error(transparent)]
    Matrix(#[from] MatrixError),
    /// The thread pool could not be built.
    #[error("thread pool: {0}")]
    ThreadPool(String),
}

impl From<rayon::ThreadPoolBuildError> for SgdError {
    fn from(e: rayon::ThreadPoolBuildError) -> Self {
        Self::ThreadPool(e.to_string())
    }
}
