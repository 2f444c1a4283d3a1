//! LocalLockRunner: shared-memory SGD guarded by per-row and per-column locks.
//!
//! No block partitioning: every thread may touch any entry, so each W row
//! and each H column gets its own mutex (m + n locks). A thread always
//! acquires the row lock before the column lock. Rows and columns are
//! separate lock classes and nobody holds two locks of one class, so this
//! order rules out a wait cycle.

use parking_lot::Mutex;
use rand::{Rng, RngCore, SeedableRng};
use rand::seq::SliceRandom;
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::{ThreadPool, ThreadPoolBuilder};
use strata_matrix::{split, Factors, MatrixError, SparseMatrix};
use tracing::debug;

use crate::block::SgdOrder;
use crate::error::SgdError;
use crate::functions::{RegularizeFn, UpdateFn};
use crate::runner::EpochStep;

pub struct LocalLockRunner<U, R> {
    update: U,
    regularize: R,
    order: SgdOrder,
    threads: usize,
    pool: ThreadPool,
    rng: Xoshiro256PlusPlus,
}

impl<U: UpdateFn, R: RegularizeFn> LocalLockRunner<U, R> {
    pub fn new(
        update: U,
        regularize: R,
        order: SgdOrder,
        threads: usize,
        seed: u64,
    ) -> Result<Self, SgdError> {
        if threads == 0 {
            return Err(SgdError::InvalidConfig("lock runner needs at least one thread".into()));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("strata-lock-{i}"))
            .build()?;
        Ok(Self {
            update,
            regularize,
            order,
            threads,
            pool,
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Apply `nnz(v)` updates spread over the pool; no regularization.
    pub fn run_updates(
        &mut self,
        factors: &mut Factors,
        v: &SparseMatrix,
        eps: f64,
    ) -> Result<usize, SgdError> {
        if v.nrows != factors.w.rows() || v.ncols != factors.h.cols() {
            return Err(MatrixError::Misaligned(format!(
                "V is {}x{}, factors cover {}x{}",
                v.nrows,
                v.ncols,
                factors.w.rows(),
                factors.h.cols()
            ))
            .into());
        }
        if factors.rank() == 0 {
            return Err(SgdError::InvalidConfig("factor rank is 0".into()));
        }
        let nnz = v.nnz();
        if nnz == 0 {
            return Ok(0);
        }

        let seeds: Vec<u64> = (0..self.threads).map(|_| self.rng.next_u64()).collect();
        let perm = (self.order == SgdOrder::WithoutReplacement).then(|| {
            let mut p: Vec<usize> = (0..nnz).collect();
            p.shuffle(&mut self.rng);
            p
        });
        let ranges = split(nnz, self.threads);

        let Factors { w, h } = factors;
        let rows: Vec<Mutex<&mut [f64]>> = w.rows_mut().map(Mutex::new).collect();
        let cols: Vec<Mutex<&mut [f64]>> = h.cols_mut().map(Mutex::new).collect();
        let (update, order) = (&self.update, self.order);

        self.pool.scope(|s| {
            for (t, seed) in seeds.into_iter().enumerate() {
                let (rows, cols, perm) = (&rows, &cols, &perm);
                let range = ranges[t]..ranges[t + 1];
                s.spawn(move |_| {
                    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
                    for k in range {
                        let idx = match (order, perm) {
                            (SgdOrder::WithReplacement, _) => rng.gen_range(0..nnz),
                            (SgdOrder::WithoutReplacement, Some(p)) => p[k],
                            _ => k,
                        };
                        let entry = v.entry(idx);
                        // row before column
                        let mut w_row = rows[entry.row].lock();
                        let mut h_col = cols[entry.col].lock();
                        update.update(&mut **w_row, &mut **h_col, entry, eps);
                    }
                });
            }
        });
        debug!(updates = nnz, threads = self.threads, "lock runner pass done");
        Ok(nnz)
    }
}

impl<U: UpdateFn, R: RegularizeFn> EpochStep for LocalLockRunner<U, R> {
    fn epoch(&mut self, factors: &mut Factors, v: &SparseMatrix, eps: f64) -> Result<bool, SgdError> {
        self.run_updates(factors, v, eps)?;
        Ok(self.regularize.regularize(factors, eps))
    }
}
