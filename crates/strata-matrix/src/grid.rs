//! Block grid: how V, W and H are cut into aligned blocks and who owns them.
//!
//! With `d = workers * tasks_per_worker`, V is cut into a d x d grid. Row
//! block `i` of V shares its row range with row block `i` of W, column block
//! `j` shares its column range with column block `j` of H. Row block `i`
//! (all of its V blocks plus the W row block) is pinned to worker
//! `i / tasks_per_worker`.

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::dense::{ColFactors, RowFactors};
use crate::error::MatrixError;
use crate::sparse::SparseMatrix;

/// Split `n` items into `parts` contiguous ranges, returned as `parts + 1` offsets.
///
/// The first `n % parts` ranges receive one extra item.
pub fn split(n: usize, parts: usize) -> Vec<usize> {
    assert!(parts > 0, "split: zero parts");
    let base = n / parts;
    let extra = n % parts;
    let mut offsets = Vec::with_capacity(parts + 1);
    let mut at = 0;
    offsets.push(0);
    for p in 0..parts {
        at += base + usize::from(p < extra);
        offsets.push(at);
    }
    offsets
}

/// Coordinates of a block in the d x d grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId {
    pub row: usize,
    pub col: usize,
}

impl BlockId {
    pub fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.row, self.col)
    }
}

/// Partition of the data and factor matrices into a d x d block grid.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockGrid {
    workers: usize,
    tasks_per_worker: usize,
    row_offsets: Vec<usize>,
    col_offsets: Vec<usize>,
}

impl BlockGrid {
    /// Even split of an `nrows x ncols` matrix.
    pub fn new(
        nrows: usize,
        ncols: usize,
        workers: usize,
        tasks_per_worker: usize,
    ) -> Result<Self, MatrixError> {
        let d = checked_dim(workers, tasks_per_worker)?;
        Ok(Self {
            workers,
            tasks_per_worker,
            row_offsets: split(nrows, d),
            col_offsets: split(ncols, d),
        })
    }

    /// Grid from explicit offsets, e.g. when W and H were distributed beforehand.
    pub fn from_offsets(
        row_offsets: Vec<usize>,
        col_offsets: Vec<usize>,
        workers: usize,
        tasks_per_worker: usize,
    ) -> Result<Self, MatrixError> {
        let d = checked_dim(workers, tasks_per_worker)?;
        validate_offsets("row", &row_offsets, d)?;
        validate_offsets("column", &col_offsets, d)?;
        Ok(Self { workers, tasks_per_worker, row_offsets, col_offsets })
    }

    /// Blocks per side.
    #[inline]
    pub fn d(&self) -> usize {
        self.row_offsets.len() - 1
    }

    #[inline]
    pub fn workers(&self) -> usize { self.workers }

    #[inline]
    pub fn tasks_per_worker(&self) -> usize { self.tasks_per_worker }

    pub fn nrows(&self) -> usize {
        self.row_offsets[self.d()]
    }

    pub fn ncols(&self) -> usize {
        self.col_offsets[self.d()]
    }

    pub fn row_offsets(&self) -> &[usize] { &self.row_offsets }

    pub fn col_offsets(&self) -> &[usize] { &self.col_offsets }

    pub fn row_range(&self, i: usize) -> Range<usize> {
        self.row_offsets[i]..self.row_offsets[i + 1]
    }

    pub fn col_range(&self, j: usize) -> Range<usize> {
        self.col_offsets[j]..self.col_offsets[j + 1]
    }

    /// Worker that owns row block `i` (and every V block in that row).
    #[inline]
    pub fn owner(&self, row_block: usize) -> usize {
        row_block / self.tasks_per_worker
    }

    /// Row blocks owned by `worker`.
    pub fn owned_rows(&self, worker: usize) -> Range<usize> {
        worker * self.tasks_per_worker..(worker + 1) * self.tasks_per_worker
    }

    /// Row block containing global row `i`.
    pub fn row_block_of(&self, i: usize) -> usize {
        self.row_offsets.partition_point(|&o| o <= i) - 1
    }

    /// Column block containing global column `j`.
    pub fn col_block_of(&self, j: usize) -> usize {
        self.col_offsets.partition_point(|&o| o <= j) - 1
    }

    /// Fail unless V, W and H agree with this grid's boundaries.
    pub fn check_aligned(
        &self,
        v: &SparseMatrix,
        w: &RowFactors,
        h: &ColFactors,
    ) -> Result<(), MatrixError> {
        if v.nrows != self.nrows() || w.rows() != self.nrows() {
            return Err(MatrixError::Misaligned(format!(
                "grid covers {} rows, V has {}, W has {}",
                self.nrows(),
                v.nrows,
                w.rows()
            )));
        }
        if v.ncols != self.ncols() || h.cols() != self.ncols() {
            return Err(MatrixError::Misaligned(format!(
                "grid covers {} columns, V has {}, H has {}",
                self.ncols(),
                v.ncols,
                h.cols()
            )));
        }
        if w.rank() != h.rank() {
            return Err(MatrixError::DimensionMismatch {
                what: "factor rank",
                expected: w.rank(),
                got: h.rank(),
            });
        }
        Ok(())
    }

    /// Cut V into d^2 blocks, row-major in block order, entries in stored order.
    pub fn partition(&self, v: &SparseMatrix) -> Result<Vec<SparseBlock>, MatrixError> {
        if v.nrows != self.nrows() || v.ncols != self.ncols() {
            return Err(MatrixError::Misaligned(format!(
                "V is {}x{}, grid is {}x{}",
                v.nrows,
                v.ncols,
                self.nrows(),
                self.ncols()
            )));
        }
        let d = self.d();
        let mut blocks = Vec::with_capacity(d * d);
        for bi in 0..d {
            for bj in 0..d {
                let (rows, cols) = (self.row_range(bi), self.col_range(bj));
                blocks.push(SparseBlock {
                    id: BlockId::new(bi, bj),
                    row_offset: rows.start,
                    col_offset: cols.start,
                    data: SparseMatrix::new(rows.len(), cols.len()),
                });
            }
        }
        for e in v.iter() {
            let (bi, bj) = (self.row_block_of(e.row), self.col_block_of(e.col));
            let block = &mut blocks[bi * d + bj];
            block.data.push(e.row - block.row_offset, e.col - block.col_offset, e.value);
        }
        Ok(blocks)
    }
}

fn checked_dim(workers: usize, tasks_per_worker: usize) -> Result<usize, MatrixError> {
    let d = workers * tasks_per_worker;
    if d == 0 {
        return Err(MatrixError::EmptyGrid { workers, tasks_per_worker });
    }
    Ok(d)
}

fn validate_offsets(axis: &str, offsets: &[usize], d: usize) -> Result<(), MatrixError> {
    if offsets.len() != d + 1 {
        return Err(MatrixError::Misaligned(format!(
            "{axis} offsets describe {} blocks, grid needs {d}",
            offsets.len().saturating_sub(1)
        )));
    }
    if offsets[0] != 0 {
        return Err(MatrixError::Misaligned(format!("{axis} offsets must start at 0")));
    }
    if offsets.windows(2).any(|w| w[0] > w[1]) {
        return Err(MatrixError::Misaligned(format!("{axis} offsets are not monotone")));
    }
    Ok(())
}

/// One block of V with local indices and its origin in the full matrix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SparseBlock {
    pub id: BlockId,
    pub row_offset: usize,
    pub col_offset: usize,
    pub data: SparseMatrix,
}

impl SparseBlock {
    pub fn nnz(&self) -> usize {
        self.data.nnz()
    }
}
