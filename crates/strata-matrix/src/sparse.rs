use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::MatrixError;

/// One stored nonzero of a sparse matrix.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub row: usize,
    pub col: usize,
    pub value: f64,
}

/// Coordinate (triplet) sparse matrix.
///
/// Entries keep their insertion order; nothing is sorted or merged, so a
/// sequential SGD pass visits them exactly as they were pushed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseMatrix {
    pub nrows: usize,
    pub ncols: usize,
    pub rows: Vec<usize>,
    pub cols: Vec<usize>,
    #[serde(with = "crate::bits::vec")]
    pub vals: Vec<f64>,
}

impl SparseMatrix {
    pub fn new(nrows: usize, ncols: usize) -> Self {
        Self {
            nrows,
            ncols,
            rows: Vec::new(),
            cols: Vec::new(),
            vals: Vec::new(),
        }
    }

    pub fn with_capacity(nrows: usize, ncols: usize, nnz: usize) -> Self {
        Self {
            nrows,
            ncols,
            rows: Vec::with_capacity(nnz),
            cols: Vec::with_capacity(nnz),
            vals: Vec::with_capacity(nnz),
        }
    }

    /// Build from `(row, col, value)` triplets, rejecting out-of-range coordinates.
    pub fn from_triplets(
        nrows: usize,
        ncols: usize,
        triplets: impl IntoIterator<Item = (usize, usize, f64)>,
    ) -> Result<Self, MatrixError> {
        let mut m = Self::new(nrows, ncols);
        for (row, col, value) in triplets {
            if row >= nrows || col >= ncols {
                return Err(MatrixError::OutOfBounds { row, col, nrows, ncols });
            }
            m.push(row, col, value);
        }
        Ok(m)
    }

    /// Add a triplet (row, col, value).
    pub fn push(&mut self, row: usize, col: usize, value: f64) {
        assert!(row < self.nrows && col < self.ncols);
        self.rows.push(row);
        self.cols.push(col);
        self.vals.push(value);
    }

    pub fn nnz(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The k-th stored entry.
    #[inline]
    pub fn entry(&self, k: usize) -> Entry {
        Entry {
            row: self.rows[k],
            col: self.cols[k],
            value: self.vals[k],
        }
    }

    /// Stored entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = Entry> + '_ {
        (0..self.nnz()).map(move |k| self.entry(k))
    }

    /// Nonzeros per row and per column.
    pub fn nnz_counts(&self) -> NnzCounts {
        let mut rows = vec![0u32; self.nrows];
        let mut cols = vec![0u32; self.ncols];
        for k in 0..self.nnz() {
            rows[self.rows[k]] += 1;
            cols[self.cols[k]] += 1;
        }
        NnzCounts { rows, cols }
    }

    /// Sub-block with indices relative to the block origin.
    pub fn block(&self, rows: Range<usize>, cols: Range<usize>) -> SparseMatrix {
        let mut out = SparseMatrix::new(rows.len(), cols.len());
        for k in 0..self.nnz() {
            let (i, j) = (self.rows[k], self.cols[k]);
            if rows.contains(&i) && cols.contains(&j) {
                out.push(i - rows.start, j - cols.start, self.vals[k]);
            }
        }
        out
    }

    /// Sum of squared values.
    pub fn sq_norm(&self) -> f64 {
        self.vals.iter().map(|v| v * v).sum()
    }
}

/// Per-row and per-column nonzero counts of a data matrix.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NnzCounts {
    pub rows: Vec<u32>,
    pub cols: Vec<u32>,
}

impl NnzCounts {
    /// Largest count over all rows and columns.
    pub fn max(&self) -> u32 {
        self.rows
            .iter()
            .chain(self.cols.iter())
            .copied()
            .max()
            .unwrap_or(0)
    }
}
