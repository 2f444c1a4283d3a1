//! EpochRunner: the distributed training loop.
//!
//! Per epoch: pick a step size, run the d strata one after another (each a
//! barrier over all of its tasks), pull W back from the workers, regularize
//! and balance on the coordinator, push the result out again and record the
//! loss.

use std::time::Instant;

use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use tracing::{debug, info};

use strata_matrix::Factors;
use strata_sgd::{BalanceController, Decay, LossFn, RegularizeFn, SgdError, Trace, TraceEntry};

use crate::coordinator::Coordinator;
use crate::error::MeshError;
use crate::job::DsgdJob;
use crate::protocol::{TaskBatch, WorkItem, WorkerId, PROTOCOL_VERSION};
use crate::schedule::{assign_tasks, Stratum, StratumScheduler};
use crate::snapshot::{HSnapshot, HStore};

pub struct EpochRunner<R, L> {
    job: DsgdJob,
    coordinator: Coordinator,
    scheduler: StratumScheduler,
    decay: Box<dyn Decay>,
    regularize: R,
    loss: L,
    balance: BalanceController,
    h_store: HStore,
    /// Coordinator copy of W and H, current as of the last finished epoch.
    model: Factors,
    /// Seeds for work items.
    rng: Xoshiro256PlusPlus,
    epoch: usize,
    previous_loss: Option<f64>,
    current_loss: f64,
    trace: Trace,
}

impl<R: RegularizeFn, L: LossFn> EpochRunner<R, L> {
    /// Load every worker and evaluate the initial loss.
    ///
    /// The coordinator must already know `worker-0 .. worker-{workers-1}`.
    /// Its RPC grace is taken from the job config.
    pub async fn start(
        job: DsgdJob,
        coordinator: Coordinator,
        factors: Factors,
        decay: Box<dyn Decay>,
        regularize: R,
        loss: L,
    ) -> Result<Self, MeshError> {
        let grid = job.grid();
        grid.check_aligned(job.data(), &factors.w, &factors.h)?;
        if factors.rank() == 0 {
            return Err(MeshError::Config("factor rank is 0".into()));
        }
        let registered = coordinator.worker_ids().await;
        if registered.is_empty() {
            return Err(MeshError::NoWorkers);
        }
        for p in 0..grid.workers() {
            let id = WorkerId(p as u32);
            if registered.binary_search(&id).is_err() {
                return Err(MeshError::WorkerNotFound(id));
            }
        }

        let config = job.config();
        let coordinator = coordinator.with_task_grace(config.task_grace());
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(config.seed);
        let scheduler = StratumScheduler::with_layout(
            grid.workers(),
            grid.tasks_per_worker(),
            config.stratum_order,
            rng.next_u64(),
        )?;
        let balance = job.balance_controller()?;
        let h_store = HStore::new(&factors.h, grid)?;

        coordinator.load_all(job.worker_setups(&factors.w)?).await?;

        let current_loss = loss.evaluate(&factors, Some(job.eval_data()));
        info!(
            workers = grid.workers(),
            d = grid.d(),
            nnz = job.data().nnz(),
            loss = current_loss,
            "distributed job started"
        );
        Ok(Self {
            scheduler,
            balance,
            h_store,
            model: factors,
            rng,
            epoch: 0,
            previous_loss: None,
            current_loss,
            trace: Trace::new(current_loss),
            job,
            coordinator,
            decay,
            regularize,
            loss,
        })
    }

    /// Run `epochs` more epochs; returns the trace of the whole run so far.
    pub async fn run(&mut self, epochs: usize) -> Result<Trace, MeshError> {
        for _ in 0..epochs {
            self.run_epoch().await?;
        }
        Ok(self.trace.clone())
    }

    /// Run the number of epochs the job config asks for.
    pub async fn run_configured(&mut self) -> Result<Trace, MeshError> {
        self.run(self.job.config().epochs).await
    }

    pub async fn run_epoch(&mut self) -> Result<TraceEntry, MeshError> {
        let epoch = self.epoch;
        let eps = self.decay.next(epoch, self.previous_loss, self.current_loss, &self.model);
        if !eps.is_finite() {
            return Err(SgdError::NonFiniteStep { epoch, eps }.into());
        }
        let start = Instant::now();

        let mut updates = 0u64;
        for (s, stratum) in self.scheduler.epoch_plan().iter().enumerate() {
            let batches = self.batches(epoch, s, stratum, eps);
            let acks = self.coordinator.dispatch_stratum(batches).await?;
            for ack in acks {
                updates += ack.updates;
                for h in ack.h_blocks {
                    self.h_store.commit(h)?;
                }
            }
            debug!(epoch, stratum = s, "stratum complete");
        }

        for b in self.coordinator.gather_w().await? {
            self.model.w.set_block(b.offset, &b.values)?;
        }
        self.model.h = self.h_store.assemble()?;
        let hint = self.regularize.regularize(&mut self.model, eps);
        let balanced = self.balance.maybe_apply(epoch, hint, &mut self.model);
        self.coordinator.scatter_w(self.job.row_blocks(&self.model.w)).await?;
        self.h_store.replace(&self.model.h)?;
        let elapsed = start.elapsed();

        self.previous_loss = Some(self.current_loss);
        self.current_loss = self.loss.evaluate(&self.model, Some(self.job.eval_data()));
        info!(epoch, eps, loss = self.current_loss, updates, ?elapsed, "finished epoch");

        let entry = TraceEntry { epoch, eps, loss: self.current_loss, balanced, elapsed };
        self.trace.push(entry.clone());
        self.epoch += 1;
        Ok(entry)
    }

    /// One batch per task; item seeds are drawn in assignment order.
    fn batches(
        &mut self,
        epoch: usize,
        stratum: usize,
        blocks: &Stratum,
        eps: f64,
    ) -> Vec<(WorkerId, TaskBatch)> {
        let order = self.job.config().order;
        assign_tasks(blocks, self.job.grid())
            .into_iter()
            .map(|task| {
                let items = task
                    .blocks
                    .iter()
                    .map(|&block| WorkItem {
                        block,
                        seed: self.rng.next_u64(),
                        h: self.h_store.checkout(block.col),
                    })
                    .collect();
                let batch = TaskBatch {
                    version: PROTOCOL_VERSION,
                    epoch,
                    stratum,
                    task: task.task,
                    eps,
                    order,
                    items,
                };
                (WorkerId(task.worker as u32), batch)
            })
            .collect()
    }

    /// Epochs completed.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn current_loss(&self) -> f64 {
        self.current_loss
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn job(&self) -> &DsgdJob {
        &self.job
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// W and H as of the last finished epoch.
    pub fn factors(&self) -> &Factors {
        &self.model
    }

    /// H as held by the store, tagged with the number of finished epochs.
    pub fn snapshot(&self) -> Result<HSnapshot, MeshError> {
        self.h_store.materialize(self.epoch)
    }

    /// Stop the workers and hand back the trained factors.
    pub async fn finish(self) -> (Factors, Trace) {
        self.coordinator.shutdown_all().await;
        (self.model, self.trace)
    }
}
