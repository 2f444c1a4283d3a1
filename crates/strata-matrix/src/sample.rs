//! Projected samples: a small random subset of V re-indexed onto the rows and
//! columns it touches, used to try out step sizes cheaply.

use std::collections::HashMap;

use rand::seq::index;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::dense::{ColFactors, Factors, RowFactors};
use crate::sparse::SparseMatrix;

/// Sampled entries of V plus the maps back to global indices.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectedSample {
    /// Sampled entries, indexed densely over `rows` x `cols`.
    pub data: SparseMatrix,
    /// Global row index of each local row.
    pub rows: Vec<usize>,
    /// Global column index of each local column.
    pub cols: Vec<usize>,
    /// Shape of the matrix the sample was drawn from.
    pub full_rows: usize,
    pub full_cols: usize,
}

impl ProjectedSample {
    /// Smaller of the row and column coverage ratios.
    pub fn scale_factor(&self) -> f64 {
        if self.full_rows == 0 || self.full_cols == 0 {
            return 1.0;
        }
        let r = self.rows.len() as f64 / self.full_rows as f64;
        let c = self.cols.len() as f64 / self.full_cols as f64;
        r.min(c)
    }

    /// Private copy of the W rows and H columns the sample touches.
    pub fn project(&self, factors: &Factors) -> Factors {
        let r = factors.rank();
        let w = RowFactors::from_fn(self.rows.len(), r, |i, k| factors.w.get(self.rows[i], k));
        let h = ColFactors::from_fn(r, self.cols.len(), |k, j| factors.h.get(k, self.cols[j]));
        Factors { w, h }
    }
}

impl SparseMatrix {
    /// Draw `n` entries without replacement (all of them if `n >= nnz`).
    pub fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> ProjectedSample {
        let n = n.min(self.nnz());
        let mut picked = index::sample(rng, self.nnz(), n).into_vec();
        picked.sort_unstable();

        let mut row_map: HashMap<usize, usize> = HashMap::new();
        let mut col_map: HashMap<usize, usize> = HashMap::new();
        let mut rows = Vec::new();
        let mut cols = Vec::new();
        let mut local = Vec::with_capacity(n);
        for k in picked {
            let e = self.entry(k);
            let li = *row_map.entry(e.row).or_insert_with(|| {
                rows.push(e.row);
                rows.len() - 1
            });
            let lj = *col_map.entry(e.col).or_insert_with(|| {
                cols.push(e.col);
                cols.len() - 1
            });
            local.push((li, lj, e.value));
        }

        let mut data = SparseMatrix::with_capacity(rows.len(), cols.len(), local.len());
        for (i, j, x) in local {
            data.push(i, j, x);
        }
        ProjectedSample {
            data,
            rows,
            cols,
            full_rows: self.nrows,
            full_cols: self.ncols,
        }
    }
}
