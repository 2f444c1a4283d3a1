//! Dense factor matrices.
//!
//! `RowFactors` holds W (m x r) row-major, `ColFactors` holds H (r x n)
//! column-major. Either way, the latent vector of a data row or data column
//! is one contiguous slice, which is what the SGD inner loop dots together.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::MatrixError;

/// Dot product of two latent vectors.
#[inline]
pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Row factor matrix W. Row `i` lives at `data[i * rank..(i + 1) * rank]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RowFactors {
    #[serde(with = "crate::bits::vec")]
    data: Vec<f64>,
    nrows: usize,
    rank: usize,
}

impl RowFactors {
    pub fn zeros(nrows: usize, rank: usize) -> Self {
        Self { data: vec![0.0; nrows * rank], nrows, rank }
    }

    /// Create from a function of (row, latent index).
    pub fn from_fn(nrows: usize, rank: usize, f: impl Fn(usize, usize) -> f64) -> Self {
        let mut data = Vec::with_capacity(nrows * rank);
        for i in 0..nrows {
            for k in 0..rank {
                data.push(f(i, k));
            }
        }
        Self { data, nrows, rank }
    }

    /// Wrap row-major data.
    pub fn from_vec(nrows: usize, rank: usize, data: Vec<f64>) -> Result<Self, MatrixError> {
        if data.len() != nrows * rank {
            return Err(MatrixError::DimensionMismatch {
                what: "row factors",
                expected: nrows * rank,
                got: data.len(),
            });
        }
        Ok(Self { data, nrows, rank })
    }

    #[inline]
    pub fn rows(&self) -> usize { self.nrows }

    #[inline]
    pub fn rank(&self) -> usize { self.rank }

    #[inline]
    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.rank..(i + 1) * self.rank]
    }

    #[inline]
    pub fn row_mut(&mut self, i: usize) -> &mut [f64] {
        &mut self.data[i * self.rank..(i + 1) * self.rank]
    }

    #[inline]
    pub fn get(&self, i: usize, k: usize) -> f64 {
        self.data[i * self.rank + k]
    }

    /// Disjoint mutable views of every row.
    pub fn rows_mut(&mut self) -> std::slice::ChunksExactMut<'_, f64> {
        self.data.chunks_exact_mut(self.rank.max(1))
    }

    #[inline]
    pub fn as_slice(&self) -> &[f64] { &self.data }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f64] { &mut self.data }

    /// Copy of the rows in `range`.
    pub fn block(&self, range: Range<usize>) -> RowFactors {
        let data = self.data[range.start * self.rank..range.end * self.rank].to_vec();
        RowFactors { data, nrows: range.len(), rank: self.rank }
    }

    /// Overwrite rows starting at `offset` with `block`.
    pub fn set_block(&mut self, offset: usize, block: &RowFactors) -> Result<(), MatrixError> {
        if block.rank != self.rank || offset + block.nrows > self.nrows {
            return Err(MatrixError::DimensionMismatch {
                what: "row block",
                expected: self.nrows.saturating_sub(offset) * self.rank,
                got: block.data.len(),
            });
        }
        self.data[offset * self.rank..(offset + block.nrows) * self.rank]
            .copy_from_slice(&block.data);
        Ok(())
    }

    pub fn scale(&mut self, factor: f64) {
        self.data.iter_mut().for_each(|v| *v *= factor);
    }

    /// Multiply latent column `k` by `factors[k]`.
    pub fn scale_latent(&mut self, factors: &[f64]) {
        assert_eq!(factors.len(), self.rank);
        for row in self.data.chunks_exact_mut(self.rank.max(1)) {
            for (v, f) in row.iter_mut().zip(factors) {
                *v *= f;
            }
        }
    }

    /// Per latent dimension, sum over rows of `weight(i) * w_ik^2`.
    pub fn latent_sq_sums(&self, weights: Option<&[u32]>) -> Vec<f64> {
        let mut sums = vec![0.0; self.rank];
        for i in 0..self.nrows {
            let wt = weights.map_or(1.0, |w| w[i] as f64);
            for (s, v) in sums.iter_mut().zip(self.row(i)) {
                *s += wt * v * v;
            }
        }
        sums
    }

    /// Weighted squared Frobenius norm.
    pub fn sq_norm(&self, weights: Option<&[u32]>) -> f64 {
        self.latent_sq_sums(weights).iter().sum()
    }
}

/// Column factor matrix H. Column `j` lives at `data[j * rank..(j + 1) * rank]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColFactors {
    #[serde(with = "crate::bits::vec")]
    data: Vec<f64>,
    rank: usize,
    ncols: usize,
}

impl ColFactors {
    pub fn zeros(rank: usize, ncols: usize) -> Self {
        Self { data: vec![0.0; rank * ncols], rank, ncols }
    }

    /// Create from a function of (latent index, column).
    pub fn from_fn(rank: usize, ncols: usize, f: impl Fn(usize, usize) -> f64) -> Self {
        let mut data = Vec::with_capacity(rank * ncols);
        for j in 0..ncols {
            for k in 0..rank {
                data.push(f(k, j));
            }
        }
        Self { data, rank, ncols }
    }

    /// Wrap column-major data.
    pub fn from_vec(rank: usize, ncols: usize, data: Vec<f64>) -> Result<Self, MatrixError> {
        if data.len() != rank * ncols {
            return Err(MatrixError::DimensionMismatch {
                what: "column factors",
                expected: rank * ncols,
                got: data.len(),
            });
        }
        Ok(Self { data, rank, ncols })
    }

    #[inline]
    pub fn cols(&self) -> usize { self.ncols }

    #[inline]
    pub fn rank(&self) -> usize { self.rank }

    #[inline]
    pub fn col(&self, j: usize) -> &[f64] {
        &self.data[j * self.rank..(j + 1) * self.rank]
    }

    #[inline]
    pub fn col_mut(&mut self, j: usize) -> &mut [f64] {
        &mut self.data[j * self.rank..(j + 1) * self.rank]
    }

    #[inline]
    pub fn get(&self, k: usize, j: usize) -> f64 {
        self.data[j * self.rank + k]
    }

    /// Disjoint mutable views of every column.
    pub fn cols_mut(&mut self) -> std::slice::ChunksExactMut<'_, f64> {
        self.data.chunks_exact_mut(self.rank.max(1))
    }

    #[inline]
    pub fn as_slice(&self) -> &[f64] { &self.data }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f64] { &mut self.data }

    /// Copy of the columns in `range`.
    pub fn block(&self, range: Range<usize>) -> ColFactors {
        let data = self.data[range.start * self.rank..range.end * self.rank].to_vec();
        ColFactors { data, rank: self.rank, ncols: range.len() }
    }

    /// Overwrite columns starting at `offset` with `block`.
    pub fn set_block(&mut self, offset: usize, block: &ColFactors) -> Result<(), MatrixError> {
        if block.rank != self.rank || offset + block.ncols > self.ncols {
            return Err(MatrixError::DimensionMismatch {
                what: "column block",
                expected: self.ncols.saturating_sub(offset) * self.rank,
                got: block.data.len(),
            });
        }
        self.data[offset * self.rank..(offset + block.ncols) * self.rank]
            .copy_from_slice(&block.data);
        Ok(())
    }

    pub fn scale(&mut self, factor: f64) {
        self.data.iter_mut().for_each(|v| *v *= factor);
    }

    /// Multiply latent row `k` by `factors[k]`.
    pub fn scale_latent(&mut self, factors: &[f64]) {
        assert_eq!(factors.len(), self.rank);
        for col in self.data.chunks_exact_mut(self.rank.max(1)) {
            for (v, f) in col.iter_mut().zip(factors) {
                *v *= f;
            }
        }
    }

    /// Per latent dimension, sum over columns of `weight(j) * h_kj^2`.
    pub fn latent_sq_sums(&self, weights: Option<&[u32]>) -> Vec<f64> {
        let mut sums = vec![0.0; self.rank];
        for j in 0..self.ncols {
            let wt = weights.map_or(1.0, |w| w[j] as f64);
            for (s, v) in sums.iter_mut().zip(self.col(j)) {
                *s += wt * v * v;
            }
        }
        sums
    }

    /// Weighted squared Frobenius norm.
    pub fn sq_norm(&self, weights: Option<&[u32]>) -> f64 {
        self.latent_sq_sums(weights).iter().sum()
    }
}

/// The factor pair (W, H) whose product approximates the data matrix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Factors {
    pub w: RowFactors,
    pub h: ColFactors,
}

impl Factors {
    /// Pair W and H, checking that their ranks agree.
    pub fn new(w: RowFactors, h: ColFactors) -> Result<Self, MatrixError> {
        if w.rank() != h.rank() {
            return Err(MatrixError::DimensionMismatch {
                what: "factor rank",
                expected: w.rank(),
                got: h.rank(),
            });
        }
        Ok(Self { w, h })
    }

    #[inline]
    pub fn rank(&self) -> usize { self.w.rank() }

    /// Model prediction for cell (i, j).
    #[inline]
    pub fn product(&self, i: usize, j: usize) -> f64 {
        dot(self.w.row(i), self.h.col(j))
    }

    /// Dense row-major reconstruction of W·H.
    pub fn reconstruct(&self) -> Vec<f64> {
        let (m, n) = (self.w.rows(), self.h.cols());
        let mut out = Vec::with_capacity(m * n);
        for i in 0..m {
            for j in 0..n {
                out.push(self.product(i, j));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_and_cols_are_contiguous() {
        let w = RowFactors::from_fn(3, 2, |i, k| (i * 10 + k) as f64);
        assert_eq!(w.row(1), &[10.0, 11.0]);
        let h = ColFactors::from_fn(2, 3, |k, j| (k * 10 + j) as f64);
        assert_eq!(h.col(2), &[2.0, 12.0]);
        assert_eq!(h.get(1, 2), 12.0);
    }

    #[test]
    fn from_vec_checks_length() {
        assert!(RowFactors::from_vec(2, 2, vec![0.0; 3]).is_err());
        assert!(ColFactors::from_vec(2, 2, vec![0.0; 4]).is_ok());
    }

    #[test]
    fn block_roundtrip_in_place() {
        let mut w = RowFactors::from_fn(4, 2, |i, k| (i + k) as f64);
        let mut b = w.block(1..3);
        b.scale(2.0);
        w.set_block(1, &b).unwrap();
        assert_eq!(w.row(0), &[0.0, 1.0]);
        assert_eq!(w.row(1), &[2.0, 4.0]);
        assert_eq!(w.row(3), &[3.0, 4.0]);
        assert!(w.set_block(3, &b).is_err());
    }

    #[test]
    fn weighted_latent_sums() {
        let w = RowFactors::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(w.latent_sq_sums(None), vec![10.0, 20.0]);
        assert_eq!(w.latent_sq_sums(Some(&[2, 0])), vec![2.0, 8.0]);
        let h = ColFactors::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(h.sq_norm(None), 30.0);
    }

    #[test]
    fn product_matches_reconstruction() {
        let w = RowFactors::from_fn(2, 3, |i, k| (i + k + 1) as f64);
        let h = ColFactors::from_fn(3, 2, |k, j| (k * j) as f64 - 0.5);
        let f = Factors::new(w, h).unwrap();
        let dense = f.reconstruct();
        assert_eq!(dense.len(), 4);
        assert!((dense[3] - f.product(1, 1)).abs() < 1e-12);
    }

    #[test]
    fn rank_mismatch_rejected() {
        let err = Factors::new(RowFactors::zeros(2, 2), ColFactors::zeros(3, 2)).unwrap_err();
        assert!(matches!(err, MatrixError::DimensionMismatch { .. }));
    }
}
