//! H storage on the coordinator.
//!
//! [`HStore`] keeps H cut into column blocks with a commit counter per block.
//! A block is lent to one task per stratum and must come back carrying the
//! version it left with; anything else means two tasks held the same block.
//! [`HSnapshot`] is an immutable, cheaply cloned view of the whole of H.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strata_matrix::{BlockGrid, ColFactors};

use crate::error::MeshError;
use crate::protocol::{self, HBlock};

pub struct HStore {
    blocks: Vec<HBlock>,
    rank: usize,
    ncols: usize,
}

impl HStore {
    /// Cut `h` along the grid's column blocks, all at version 0.
    pub fn new(h: &ColFactors, grid: &BlockGrid) -> Result<Self, MeshError> {
        if h.cols() != grid.ncols() {
            return Err(MeshError::Config(format!(
                "H has {} columns, grid covers {}",
                h.cols(),
                grid.ncols()
            )));
        }
        let blocks = (0..grid.d())
            .map(|j| {
                let cols = grid.col_range(j);
                HBlock { index: j, offset: cols.start, version: 0, values: h.block(cols) }
            })
            .collect();
        Ok(Self { blocks, rank: h.rank(), ncols: h.cols() })
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Copy of column block `j` to send to a task.
    pub fn checkout(&self, j: usize) -> HBlock {
        self.blocks[j].clone()
    }

    pub fn version(&self, j: usize) -> u64 {
        self.blocks[j].version
    }

    /// Accept a block returned by a task and bump its version.
    pub fn commit(&mut self, mut block: HBlock) -> Result<(), MeshError> {
        let index = block.index;
        let current = self.blocks.get(index).ok_or_else(|| MeshError::StaleBlock {
            index,
            reason: "no such column block".into(),
        })?;
        if block.version != current.version {
            return Err(MeshError::StaleBlock {
                index,
                reason: format!("returned at version {}, store is at {}", block.version, current.version),
            });
        }
        if block.offset != current.offset
            || block.values.cols() != current.values.cols()
            || block.values.rank() != current.values.rank()
        {
            return Err(MeshError::StaleBlock { index, reason: "shape changed".into() });
        }
        block.version += 1;
        self.blocks[index] = block;
        Ok(())
    }

    /// Assemble the full H.
    pub fn assemble(&self) -> Result<ColFactors, MeshError> {
        let mut h = ColFactors::zeros(self.rank, self.ncols);
        for b in &self.blocks {
            h.set_block(b.offset, &b.values)?;
        }
        Ok(h)
    }

    /// Overwrite every block from a full H, e.g. after regularization.
    pub fn replace(&mut self, h: &ColFactors) -> Result<(), MeshError> {
        if h.cols() != self.ncols || h.rank() != self.rank {
            return Err(MeshError::Config(format!(
                "replacement H is {}x{}, store holds {}x{}",
                h.rank(),
                h.cols(),
                self.rank,
                self.ncols
            )));
        }
        for b in &mut self.blocks {
            b.values = h.block(b.offset..b.offset + b.values.cols());
            b.version += 1;
        }
        Ok(())
    }

    /// Freeze the current H as of `epoch`.
    pub fn materialize(&self, epoch: usize) -> Result<HSnapshot, MeshError> {
        Ok(HSnapshot::new(epoch, self.assemble()?))
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct SnapshotInner {
    epoch: usize,
    h: ColFactors,
}

/// Read-only H at the end of an epoch.
#[derive(Clone, Debug, PartialEq)]
pub struct HSnapshot(Arc<SnapshotInner>);

impl HSnapshot {
    pub fn new(epoch: usize, h: ColFactors) -> Self {
        Self(Arc::new(SnapshotInner { epoch, h }))
    }

    pub fn epoch(&self) -> usize {
        self.0.epoch
    }

    pub fn h(&self) -> &ColFactors {
        &self.0.h
    }

    pub fn encode(&self) -> Result<Vec<u8>, MeshError> {
        protocol::encode(&*self.0)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MeshError> {
        Ok(Self(Arc::new(protocol::decode(bytes)?)))
    }
}
