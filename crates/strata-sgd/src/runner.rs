//! Sequential reference runner and the epoch loop shared by local runners.

use std::time::{Duration, Instant};

use rand::{Rng, RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use strata_matrix::{Factors, SparseMatrix};
use tracing::info;

use crate::balance::BalanceController;
use crate::block::{BlockRef, BlockWorker, SgdOrder};
use crate::decay::Decay;
use crate::error::SgdError;
use crate::functions::{RegularizeFn, UpdateFn};
use crate::loss::LossFn;

/// One SGD pass over all of `v`, then one regularization pass.
/// Returns the regularizer's rescale hint.
pub fn sgd_epoch<U, R, Rn>(
    update: &U,
    regularize: &R,
    order: SgdOrder,
    v: &SparseMatrix,
    factors: &mut Factors,
    eps: f64,
    rng: &mut Rn,
) -> bool
where
    U: UpdateFn + ?Sized,
    R: RegularizeFn + ?Sized,
    Rn: Rng + ?Sized,
{
    let Factors { w, h } = &mut *factors;
    BlockWorker::new(update, order).run(BlockRef::whole(v), w, h, eps, rng);
    regularize.regularize(factors, eps)
}

/// Per-epoch record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub epoch: usize,
    pub eps: f64,
    /// Loss after the epoch (and any balancing).
    pub loss: f64,
    pub balanced: bool,
    pub elapsed: Duration,
}

/// Loss trajectory of a run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub initial_loss: f64,
    pub entries: Vec<TraceEntry>,
}

impl Trace {
    pub fn new(initial_loss: f64) -> Self {
        Self { initial_loss, entries: Vec::new() }
    }

    pub fn push(&mut self, entry: TraceEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Loss after the last epoch, or the initial loss.
    pub fn final_loss(&self) -> f64 {
        self.entries.last().map_or(self.initial_loss, |e| e.loss)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TraceEntry> {
        self.entries.iter()
    }
}

/// One epoch of some runner: update every entry of `v` once, regularize.
pub trait EpochStep {
    /// Returns the regularizer's rescale hint.
    fn epoch(&mut self, factors: &mut Factors, v: &SparseMatrix, eps: f64) -> Result<bool, SgdError>;
}

/// The controllers wrapped around every epoch.
pub struct TrainLoop<'a> {
    pub decay: &'a mut dyn Decay,
    pub loss: &'a dyn LossFn,
    pub balance: &'a BalanceController,
    /// Loss data; the training matrix when `None`.
    pub eval: Option<&'a SparseMatrix>,
}

/// Drive `step` for `epochs` epochs:
/// decay -> epoch -> balance -> loss -> trace.
pub fn run_epochs<S: EpochStep + ?Sized>(
    step: &mut S,
    factors: &mut Factors,
    v: &SparseMatrix,
    ctl: TrainLoop<'_>,
    epochs: usize,
) -> Result<Trace, SgdError> {
    let eval = ctl.eval.unwrap_or(v);
    let mut current = ctl.loss.evaluate(factors, Some(eval));
    let mut previous = None;
    let mut trace = Trace::new(current);
    info!(loss = current, "initial loss");

    for epoch in 0..epochs {
        let eps = ctl.decay.next(epoch, previous, current, factors);
        if !eps.is_finite() {
            return Err(SgdError::NonFiniteStep { epoch, eps });
        }
        let start = Instant::now();
        let hint = step.epoch(factors, v, eps)?;
        let balanced = ctl.balance.maybe_apply(epoch, hint, factors);
        let elapsed = start.elapsed();

        previous = Some(current);
        current = ctl.loss.evaluate(factors, Some(eval));
        info!(epoch, eps, loss = current, ?elapsed, "finished epoch");
        trace.push(TraceEntry { epoch, eps, loss: current, balanced, elapsed });
    }
    Ok(trace)
}

/// Plain sequential SGD over the whole matrix.
pub struct SgdRunner<U, R> {
    update: U,
    regularize: R,
    order: SgdOrder,
    rng: Xoshiro256PlusPlus,
}

impl<U: UpdateFn, R: RegularizeFn> SgdRunner<U, R> {
    pub fn new(update: U, regularize: R, order: SgdOrder, seed: u64) -> Self {
        Self {
            update,
            regularize,
            order,
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
        }
    }
}

impl<U: UpdateFn, R: RegularizeFn> EpochStep for SgdRunner<U, R> {
    fn epoch(&mut self, factors: &mut Factors, v: &SparseMatrix, eps: f64) -> Result<bool, SgdError> {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(self.rng.next_u64());
        Ok(sgd_epoch(&self.update, &self.regularize, self.order, v, factors, eps, &mut rng))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decay::{BoldDriver, ConstantDecay};
    use crate::functions::{Nzsl, RegularizeNone};
    use crate::loss::NzslLoss;
    use strata_matrix::{ColFactors, RowFactors};

    fn rank_one_problem() -> (SparseMatrix, Factors) {
        let u = [1.0, 2.0, 0.5, 1.5];
        let v = [0.5, 1.0, 2.0];
        let mut m = SparseMatrix::new(4, 3);
        for i in 0..4 {
            for j in 0..3 {
                if (i + j) % 2 == 0 || i == 3 {
                    m.push(i, j, u[i] * v[j]);
                }
            }
        }
        let f = Factors {
            w: RowFactors::from_fn(4, 1, |_, _| 0.7),
            h: ColFactors::from_fn(1, 3, |_, _| 0.7),
        };
        (m, f)
    }

    #[test]
    fn loss_decreases_with_small_steps() {
        let (v, mut f) = rank_one_problem();
        let mut runner = SgdRunner::new(Nzsl, RegularizeNone, SgdOrder::WithoutReplacement, 1);
        let mut decay = ConstantDecay { eps: 0.05 };
        let balance = BalanceController::disabled();
        let trace = run_epochs(
            &mut runner,
            &mut f,
            &v,
            TrainLoop { decay: &mut decay, loss: &NzslLoss, balance: &balance, eval: None },
            50,
        )
        .unwrap();
        assert_eq!(trace.len(), 50);
        assert!(trace.final_loss() < trace.initial_loss * 0.2);
    }

    #[test]
    fn same_seed_same_trajectory() {
        let (v, f0) = rank_one_problem();
        let run = |seed| {
            let mut f = f0.clone();
            let mut runner = SgdRunner::new(Nzsl, RegularizeNone, SgdOrder::WithReplacement, seed);
            let mut decay = BoldDriver::new(0.05);
            let balance = BalanceController::disabled();
            run_epochs(
                &mut runner,
                &mut f,
                &v,
                TrainLoop { decay: &mut decay, loss: &NzslLoss, balance: &balance, eval: None },
                5,
            )
            .unwrap();
            f
        };
        assert_eq!(run(9), run(9));
    }

    #[test]
    fn non_finite_step_is_an_error() {
        let (v, mut f) = rank_one_problem();
        let mut runner = SgdRunner::new(Nzsl, RegularizeNone, SgdOrder::Sequential, 0);
        let mut decay = ConstantDecay { eps: f64::NAN };
        let balance = BalanceController::disabled();
        let err = run_epochs(
            &mut runner,
            &mut f,
            &v,
            TrainLoop { decay: &mut decay, loss: &NzslLoss, balance: &balance, eval: None },
            1,
        )
        .unwrap_err();
        assert!(matches!(err, SgdError::NonFiniteStep { epoch: 0, .. }));
    }
}
