//! DsgdJob: a validated job description bound to its data.

use std::sync::Arc;

use strata_matrix::{BlockGrid, NnzCounts, RowFactors, SparseBlock, SparseMatrix};
use strata_sgd::{BalanceController, Decay, LossFn, RegularizeFn, UpdateFn};

use crate::config::JobConfig;
use crate::error::MeshError;
use crate::protocol::{RowBlock, WorkerId, WorkerSetup, PROTOCOL_VERSION};

/// Configuration, block grid and training data of one distributed run.
pub struct DsgdJob {
    config: JobConfig,
    grid: BlockGrid,
    data: Arc<SparseMatrix>,
    /// Loss is evaluated here instead of on `data` when set.
    eval: Option<Arc<SparseMatrix>>,
    counts: Arc<NnzCounts>,
}

impl DsgdJob {
    pub fn new(config: JobConfig, data: SparseMatrix) -> Result<Self, MeshError> {
        config.validate()?;
        let grid = BlockGrid::new(data.nrows, data.ncols, config.workers, config.tasks_per_worker)?;
        let counts = Arc::new(data.nnz_counts());
        Ok(Self { config, grid, data: Arc::new(data), eval: None, counts })
    }

    /// Evaluate loss on held-out data of the same shape.
    pub fn with_eval(mut self, eval: SparseMatrix) -> Result<Self, MeshError> {
        if eval.nrows != self.data.nrows || eval.ncols != self.data.ncols {
            return Err(MeshError::Config(format!(
                "evaluation data is {}x{}, training data is {}x{}",
                eval.nrows, eval.ncols, self.data.nrows, self.data.ncols
            )));
        }
        self.eval = Some(Arc::new(eval));
        Ok(self)
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn grid(&self) -> &BlockGrid {
        &self.grid
    }

    pub fn data(&self) -> &SparseMatrix {
        &self.data
    }

    pub fn eval_data(&self) -> &SparseMatrix {
        self.eval.as_deref().unwrap_or(&self.data)
    }

    /// Nonzeros per row and column of the training data.
    pub fn counts(&self) -> &Arc<NnzCounts> {
        &self.counts
    }

    /// Balance controller for the configured policy and cadence.
    pub fn balance_controller(&self) -> Result<BalanceController, MeshError> {
        Ok(BalanceController::new(
            self.config.balance,
            self.config.balance_cadence,
            Some(self.counts.clone()),
        )?)
    }

    /// Decay for any data-free policy; auto decay needs
    /// [`build_decay_with`](Self::build_decay_with).
    pub fn build_decay(&self) -> Result<Box<dyn Decay>, MeshError> {
        Ok(self.config.decay.build()?)
    }

    /// Decay for any policy. Auto decay samples the training data and runs
    /// its trials with the strategies `make` returns for that sample.
    pub fn build_decay_with<U, R, L, F>(&self, make: F) -> Result<Box<dyn Decay>, MeshError>
    where
        U: UpdateFn + 'static,
        R: RegularizeFn + 'static,
        L: LossFn + 'static,
        F: FnOnce(&SparseMatrix) -> (U, R, L),
    {
        Ok(self.config.decay.build_with_data(&self.data, self.config.order, make)?)
    }

    /// W cut into row blocks, grouped by owning worker.
    pub fn row_blocks(&self, w: &RowFactors) -> Vec<(WorkerId, Vec<RowBlock>)> {
        let grid = &self.grid;
        (0..grid.workers())
            .map(|p| {
                let blocks = grid
                    .owned_rows(p)
                    .map(|i| {
                        let rows = grid.row_range(i);
                        RowBlock { index: i, offset: rows.start, values: w.block(rows) }
                    })
                    .collect();
                (WorkerId(p as u32), blocks)
            })
            .collect()
    }

    /// One setup per worker: the V blocks of its row blocks plus its W.
    pub fn worker_setups(&self, w: &RowFactors) -> Result<Vec<WorkerSetup>, MeshError> {
        if w.rows() != self.grid.nrows() {
            return Err(MeshError::Config(format!(
                "W has {} rows, data has {}",
                w.rows(),
                self.grid.nrows()
            )));
        }
        let mut v_blocks: Vec<Vec<SparseBlock>> = vec![Vec::new(); self.grid.workers()];
        for block in self.grid.partition(&self.data)? {
            v_blocks[self.grid.owner(block.id.row)].push(block);
        }
        let setups = self
            .row_blocks(w)
            .into_iter()
            .zip(v_blocks)
            .map(|((worker, w_blocks), v_blocks)| WorkerSetup {
                version: PROTOCOL_VERSION,
                worker,
                d: self.grid.d(),
                v_blocks,
                w_blocks,
            })
            .collect();
        Ok(setups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> SparseMatrix {
        SparseMatrix::from_triplets(6, 4, (0..6).map(|i| (i, i % 4, 1.0 + i as f64))).unwrap()
    }

    #[test]
    fn setups_cover_every_block_once() {
        let config = JobConfig::default().with_workers(2, 2);
        let job = DsgdJob::new(config, data()).unwrap();
        let w = RowFactors::from_fn(6, 2, |i, k| (i * 2 + k) as f64);
        let setups = job.worker_setups(&w).unwrap();
        assert_eq!(setups.len(), 2);
        let mut seen = Vec::new();
        for s in &setups {
            assert_eq!(s.v_blocks.len(), 2 * 4);
            assert_eq!(s.w_blocks.len(), 2);
            for b in &s.v_blocks {
                assert_eq!(job.grid().owner(b.id.row), s.worker.0 as usize);
                seen.push(b.id);
            }
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 16);
        let nnz: usize = setups.iter().flat_map(|s| &s.v_blocks).map(|b| b.nnz()).sum();
        assert_eq!(nnz, 6);
    }

    #[test]
    fn row_blocks_tile_w() {
        let job = DsgdJob::new(JobConfig::default().with_workers(3, 1), data()).unwrap();
        let w = RowFactors::from_fn(6, 1, |i, _| i as f64);
        let mut rebuilt = RowFactors::zeros(6, 1);
        for (_, blocks) in job.row_blocks(&w) {
            for b in blocks {
                rebuilt.set_block(b.offset, &b.values).unwrap();
            }
        }
        assert_eq!(rebuilt, w);
    }

    #[test]
    fn eval_shape_checked() {
        let job = DsgdJob::new(JobConfig::default(), data()).unwrap();
        assert!(job.with_eval(SparseMatrix::new(3, 3)).is_err());
    }

    #[test]
    fn auto_decay_needs_the_data() {
        use strata_sgd::{AutoConfig, DecayConfig, Nzsl, NzslLoss, RegularizeNone};

        let config = JobConfig::default().with_decay(DecayConfig::Auto(AutoConfig::new(0.05)));
        let job = DsgdJob::new(config, data()).unwrap();
        assert!(job.build_decay().is_err());
        let mut decay = job.build_decay_with(|_| (Nzsl, RegularizeNone, NzslLoss)).unwrap();
        let factors = strata_matrix::Factors {
            w: RowFactors::from_fn(6, 1, |_, _| 0.5),
            h: strata_matrix::ColFactors::from_fn(1, 4, |_, _| 0.5),
        };
        let eps = decay.next(0, None, 10.0, &factors);
        assert!(eps > 0.0 && eps <= 0.05, "{eps}");
    }

    #[test]
    fn wrong_w_rejected() {
        let job = DsgdJob::new(JobConfig::default(), data()).unwrap();
        assert!(job.worker_setups(&RowFactors::zeros(5, 1)).is_err());
    }
}
