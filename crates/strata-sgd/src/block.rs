//! BlockWorker: the SGD inner loop over one block of V.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use strata_matrix::{ColFactors, Entry, RowFactors, SparseBlock, SparseMatrix};

use crate::functions::UpdateFn;

/// Order in which the entries of a block (or of V) are visited.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SgdOrder {
    /// Stored order.
    #[default]
    Sequential,
    /// `nnz` uniform draws.
    WithReplacement,
    /// One random permutation, consumed once.
    WithoutReplacement,
}

/// Borrowed V block with its origin in the full matrix.
#[derive(Clone, Copy, Debug)]
pub struct BlockRef<'a> {
    pub data: &'a SparseMatrix,
    pub row_offset: usize,
    pub col_offset: usize,
}

impl<'a> BlockRef<'a> {
    /// All of V as a single block.
    pub fn whole(data: &'a SparseMatrix) -> Self {
        Self { data, row_offset: 0, col_offset: 0 }
    }
}

impl<'a> From<&'a SparseBlock> for BlockRef<'a> {
    fn from(block: &'a SparseBlock) -> Self {
        Self {
            data: &block.data,
            row_offset: block.row_offset,
            col_offset: block.col_offset,
        }
    }
}

/// Applies an [`UpdateFn`] to every entry of one block.
///
/// `w` holds exactly the block's rows and `h` exactly its columns, so the
/// worker cannot reach latent vectors outside the block.
pub struct BlockWorker<'a, U: ?Sized> {
    update: &'a U,
    order: SgdOrder,
}

impl<'a, U: UpdateFn + ?Sized> BlockWorker<'a, U> {
    pub fn new(update: &'a U, order: SgdOrder) -> Self {
        Self { update, order }
    }

    /// Run one pass; returns the number of updates applied.
    pub fn run<R: Rng + ?Sized>(
        &self,
        block: BlockRef<'_>,
        w: &mut RowFactors,
        h: &mut ColFactors,
        eps: f64,
        rng: &mut R,
    ) -> usize {
        debug_assert_eq!(w.rows(), block.data.nrows);
        debug_assert_eq!(h.cols(), block.data.ncols);
        let nnz = block.data.nnz();
        if nnz == 0 {
            return 0;
        }
        match self.order {
            SgdOrder::Sequential => {
                for k in 0..nnz {
                    self.step(block, w, h, k, eps);
                }
            }
            SgdOrder::WithReplacement => {
                for _ in 0..nnz {
                    let k = rng.gen_range(0..nnz);
                    self.step(block, w, h, k, eps);
                }
            }
            SgdOrder::WithoutReplacement => {
                let mut perm: Vec<usize> = (0..nnz).collect();
                perm.shuffle(rng);
                for k in perm {
                    self.step(block, w, h, k, eps);
                }
            }
        }
        nnz
    }

    #[inline]
    fn step(&self, block: BlockRef<'_>, w: &mut RowFactors, h: &mut ColFactors, k: usize, eps: f64) {
        let local = block.data.entry(k);
        let entry = Entry {
            row: local.row + block.row_offset,
            col: local.col + block.col_offset,
            value: local.value,
        };
        self.update.update(w.row_mut(local.row), h.col_mut(local.col), entry, eps);
    }
}
