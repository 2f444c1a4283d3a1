//! strata: stratified SGD for sparse matrix factorization
//!
//! Factorizes a sparse m x n matrix V into W (m x r) and H (r x n) by
//! stochastic gradient descent, either in one process or spread over a set
//! of workers that process conflict-free blocks in parallel.
//!
//! # Crates
//! - [`matrix`]: sparse data, dense factors, block grid
//! - [`sgd`]: update/regularize/loss strategies, step-size decay, balancing,
//!   sequential and lock-based local runners
//! - [`mesh`]: stratum scheduling, workers, coordinator, distributed epochs

pub use strata_matrix as matrix;
pub use strata_mesh as mesh;
pub use strata_sgd as sgd;

/// The types most programs need.
pub mod prelude {
    pub use strata_matrix::{BlockGrid, ColFactors, Factors, RowFactors, SparseMatrix};
    pub use strata_mesh::{
        Coordinator, DsgdJob, EpochRunner, JobConfig, MeshError, StratumOrder, Worker, WorkerId,
    };
    pub use strata_sgd::{
        run_epochs, BalanceCadence, BalanceController, BalancePolicy, Decay, DecayConfig,
        LocalLockRunner, LossFn, Nzsl, NzslLoss, RegularizeFn, RegularizeL2, RegularizeNone,
        SgdError, SgdOrder, SgdRunner, Trace, TrainLoop, UpdateFn,
    };
}

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use std::sync::Arc;

    fn tiny() -> (SparseMatrix, Factors) {
        let v = SparseMatrix::from_triplets(4, 4, (0..4).map(|i| (i, (i + 1) % 4, 2.0))).unwrap();
        let f = Factors::new(RowFactors::from_fn(4, 1, |_, _| 1.0), ColFactors::from_fn(1, 4, |_, _| 1.0))
            .unwrap();
        (v, f)
    }

    #[test]
    fn local_runner_through_prelude() {
        let (v, mut f) = tiny();
        let mut runner = SgdRunner::new(Nzsl, RegularizeNone, SgdOrder::Sequential, 0);
        let mut decay = DecayConfig::Constant { eps: 0.05 }.build().unwrap();
        let trace = run_epochs(
            &mut runner,
            &mut f,
            &v,
            TrainLoop {
                decay: decay.as_mut(),
                loss: &NzslLoss,
                balance: &BalanceController::disabled(),
                eval: None,
            },
            5,
        )
        .unwrap();
        assert!(trace.final_loss() < trace.initial_loss);
    }

    #[tokio::test]
    async fn distributed_runner_through_prelude() {
        let (v, f) = tiny();
        let job = DsgdJob::new(JobConfig::default().with_workers(2, 1), v).unwrap();
        let decay = job.build_decay().unwrap();
        let (coordinator, _workers) = Coordinator::in_process(2, Arc::new(Nzsl)).await;
        let mut runner =
            EpochRunner::start(job, coordinator, f, decay, RegularizeNone, NzslLoss).await.unwrap();
        let trace = runner.run(3).await.unwrap();
        assert_eq!(trace.len(), 3);
        assert!(trace.final_loss() <= trace.initial_loss);
    }
}
