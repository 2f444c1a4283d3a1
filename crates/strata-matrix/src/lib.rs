//! strata-matrix: data model for stratified matrix factorization.
//!
//! - [`SparseMatrix`]: the data matrix V as coordinate triples
//! - [`RowFactors`] / [`ColFactors`]: dense W (row-major) and H (column-major)
//! - [`BlockGrid`]: the d x d partition of V aligned with W's rows and H's columns
//! - [`ProjectedSample`]: a re-indexed sample of V for step-size trials

pub mod bits;
pub mod dense;
pub mod error;
pub mod grid;
pub mod sample;
pub mod sparse;

pub use dense::{dot, ColFactors, Factors, RowFactors};
pub use error::MatrixError;
pub use grid::{split, BlockGrid, BlockId, SparseBlock};
pub use sample::ProjectedSample;
pub use sparse::{Entry, NnzCounts, SparseMatrix};
