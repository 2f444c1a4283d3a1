//! Error types for strata-matrix.

use thiserror::Error;

/// Errors raised while building matrices and block grids.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MatrixError {
    /// A coordinate lies outside the matrix.
    #[error("entry ({row}, {col}) outside {nrows}x{ncols} matrix")]
    OutOfBounds {
        row: usize,
        col: usize,
        nrows: usize,
        ncols: usize,
    },
    /// Buffer length does not match the declared shape.
    #[error("{what}: expected {expected} values, got {got}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    /// Grid would have zero blocks.
    #[error("degenerate grid: {workers} workers x {tasks_per_worker} tasks per worker")]
    EmptyGrid {
        workers: usize,
        tasks_per_worker: usize,
    },
    /// Block offsets are not a valid partition, or disagree between V, W and H.
    #[error("misaligned block offsets: {0}")]
    Misaligned(String),
}
