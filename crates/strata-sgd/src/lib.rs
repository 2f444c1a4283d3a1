//! strata-sgd: the per-entry side of stratified matrix factorization.
//!
//! - [`UpdateFn`] / [`RegularizeFn`] / [`LossFn`]: pluggable model strategies
//! - [`BlockWorker`]: SGD over one block in a chosen [`SgdOrder`]
//! - [`Decay`]: step-size policies, including the sample-based [`AutoDecay`]
//! - [`BalanceController`]: product-preserving rescaling of W and H
//! - [`SgdRunner`] / [`LocalLockRunner`]: single-process runners sharing
//!   [`run_epochs`]
//!
//! # Example
//!
//! ```ignore
//! use strata_sgd::*;
//!
//! let mut runner = LocalLockRunner::new(Nzsl, RegularizeL2 { lambda: 0.05 },
//!     SgdOrder::WithoutReplacement, 8, 42)?;
//! let mut decay = BoldDriver::new(0.01);
//! let balance = BalanceController::new(BalancePolicy::L2Simple, BalanceCadence::EveryEpoch, None)?;
//! let trace = run_epochs(&mut runner, &mut factors, &v, TrainLoop {
//!     decay: &mut decay, loss: &NzslLoss, balance: &balance, eval: None,
//! }, 20)?;
//! ```

pub mod auto;
pub mod balance;
pub mod block;
pub mod decay;
pub mod error;
pub mod functions;
pub mod lock;
pub mod loss;
pub mod runner;

pub use auto::{AutoConfig, AutoDecay};
pub use balance::{balance_optimal, balance_simple, BalanceCadence, BalanceController, BalancePolicy};
pub use block::{BlockRef, BlockWorker, SgdOrder};
pub use decay::{BoldDriver, ConstantDecay, Decay, DecayConfig, SequentialDecay};
pub use error::SgdError;
pub use functions::{
    Nzsl, NzslL2, NzslNzl2, RegularizeFn, RegularizeL2, RegularizeNone, RegularizeNzl2,
    RegularizeTruncate, UpdateFn, UpdateTruncate,
};
pub use lock::LocalLockRunner;
pub use loss::{rmse, L2Loss, LossFn, Nzl2Loss, NzslLoss, SumLoss};
pub use runner::{run_epochs, sgd_epoch, EpochStep, SgdRunner, Trace, TraceEntry, TrainLoop};
