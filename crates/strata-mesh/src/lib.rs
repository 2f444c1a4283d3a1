//! strata-mesh: distributed stratified SGD over tarpc.
//!
//! The data matrix is cut into a d x d grid with `d = workers *
//! tasks_per_worker`. Each worker keeps the V blocks and W rows of its row
//! blocks for the whole job; H column blocks travel with the tasks. An epoch
//! runs d strata, each a set of blocks sharing no rows or columns, so every
//! task of a stratum updates disjoint parts of W and H.
//!
//! # Architecture
//!
//! - [`StratumScheduler`]: cyclic strata, optionally reshuffled or regrouped each epoch
//! - [`Worker`]: serves [`BlockService`] over a channel or TCP
//! - [`Coordinator`]: worker registry, stratum fan-out and barrier
//! - [`HStore`] / [`HSnapshot`]: versioned H blocks on the coordinator
//! - [`EpochRunner`]: decay, strata, regularize, balance, loss
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use strata_mesh::*;
//! use strata_sgd::{Nzsl, NzslLoss, RegularizeNone};
//!
//! let job = DsgdJob::new(JobConfig::default().with_workers(4, 1), v)?;
//! let (coordinator, _workers) = Coordinator::in_process(4, Arc::new(Nzsl)).await;
//! let decay = job.build_decay()?;
//! let mut runner = EpochRunner::start(job, coordinator, factors, decay, RegularizeNone, NzslLoss).await?;
//! let trace = runner.run(20).await?;
//! ```

pub mod config;
pub mod coordinator;
pub mod epoch;
pub mod error;
pub mod job;
pub mod protocol;
pub mod schedule;
pub mod snapshot;
pub mod transport;
pub mod worker;

pub use config::JobConfig;
pub use coordinator::Coordinator;
pub use epoch::EpochRunner;
pub use error::MeshError;
pub use job::DsgdJob;
pub use protocol::{
    HBlock, RemoteError, RowBlock, TaskAck, TaskBatch, WorkItem, WorkerId, WorkerSetup, PROTOCOL_VERSION,
};
pub use schedule::{assign_tasks, cyclic_plan, Stratum, StratumOrder, StratumScheduler, TaskAssignment};
pub use snapshot::{HSnapshot, HStore};
pub use transport::{BlockService, BlockServiceClient};
pub use worker::Worker;
