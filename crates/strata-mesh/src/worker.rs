//! Worker: holds a slice of V and W and runs block tasks on request.
//!
//! A worker owns the V blocks of its row blocks and the matching W row
//! blocks for the whole job. Each `run_task` checks the needed W blocks out
//! of the shared state, runs the SGD passes on a blocking thread, then checks
//! them back in. Tasks of one stratum never share a row block, so concurrent
//! tasks on the same worker never wait on each other.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use tarpc::context;
use tarpc::server::{BaseChannel, Channel};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use strata_matrix::{BlockId, SparseBlock};
use strata_sgd::{BlockRef, BlockWorker, SgdOrder, UpdateFn};

use crate::error::MeshError;
use crate::protocol::{
    HBlock, RemoteError, RowBlock, TaskAck, TaskBatch, WorkItem, WorkerId, WorkerSetup,
    PROTOCOL_VERSION,
};
use crate::transport::{json_transport, BlockService, BlockServiceClient};

/// A V block paired with the W block it was checked out with.
struct Checkout {
    v: Arc<SparseBlock>,
    w: RowBlock,
    item: WorkItem,
}

/// Shared worker state.
#[derive(Default)]
pub struct WorkerState {
    id: Option<WorkerId>,
    /// Grid size of the loaded job; H block indices must stay below it.
    d: usize,
    v_blocks: HashMap<BlockId, Arc<SparseBlock>>,
    /// W row blocks not currently checked out, keyed by row block index.
    w_blocks: HashMap<usize, RowBlock>,
    in_flight: usize,
    tasks_run: u64,
    shutting_down: bool,
}

impl WorkerState {
    fn check_out(&mut self, items: Vec<WorkItem>) -> Result<Vec<Checkout>, String> {
        let mut out: Vec<Checkout> = Vec::with_capacity(items.len());
        for item in items {
            match self.take(&item) {
                Ok((v, w)) => out.push(Checkout { v, w, item }),
                Err(e) => {
                    for c in out {
                        self.w_blocks.insert(c.w.index, c.w);
                    }
                    return Err(e);
                }
            }
        }
        self.in_flight += 1;
        Ok(out)
    }

    fn take(&mut self, item: &WorkItem) -> Result<(Arc<SparseBlock>, RowBlock), String> {
        let block = item.block;
        if item.h.index >= self.d {
            let d = self.d;
            return Err(format!("H block {} is outside the {d} x {d} grid", item.h.index));
        }
        let v = self
            .v_blocks
            .get(&block)
            .cloned()
            .ok_or_else(|| format!("block {block} is not held by this worker"))?;
        let h = &item.h;
        if h.index != block.col || h.offset != v.col_offset || h.values.cols() != v.data.ncols {
            return Err(format!(
                "H block {} (offset {}, {} columns) does not fit V block {block}",
                h.index,
                h.offset,
                h.values.cols()
            ));
        }
        let rank = self
            .w_blocks
            .get(&block.row)
            .map(|w| w.values.rank())
            .ok_or_else(|| format!("row block {} is checked out or not owned", block.row))?;
        if rank != h.values.rank() {
            return Err(format!("rank mismatch: W has {rank}, H has {}", h.values.rank()));
        }
        let w = self
            .w_blocks
            .remove(&block.row)
            .ok_or_else(|| format!("row block {} vanished", block.row))?;
        Ok((v, w))
    }
}

/// Run every checked-out block in order. Pure CPU work.
fn run_items<U: UpdateFn + ?Sized>(
    update: &U,
    order: SgdOrder,
    eps: f64,
    jobs: Vec<Checkout>,
) -> (Vec<RowBlock>, Vec<HBlock>, u64) {
    let worker = BlockWorker::new(update, order);
    let mut w_out = Vec::with_capacity(jobs.len());
    let mut h_out = Vec::with_capacity(jobs.len());
    let mut updates = 0u64;
    for Checkout { v, mut w, item } in jobs {
        let WorkItem { seed, mut h, .. } = item;
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        updates += worker.run(BlockRef::from(&*v), &mut w.values, &mut h.values, eps, &mut rng) as u64;
        w_out.push(w);
        h_out.push(h);
    }
    (w_out, h_out, updates)
}

/// A worker process serving [`BlockService`].
pub struct Worker<U> {
    state: Arc<RwLock<WorkerState>>,
    update: Arc<U>,
}

impl<U> Clone for Worker<U> {
    fn clone(&self) -> Self {
        Self { state: self.state.clone(), update: self.update.clone() }
    }
}

impl<U: UpdateFn + 'static> Worker<U> {
    /// Create a new, empty worker that applies `update` to every entry.
    pub fn new(update: U) -> Self {
        Self::shared(Arc::new(update))
    }

    /// Create a worker sharing an update strategy with others.
    pub fn shared(update: Arc<U>) -> Self {
        Self { state: Arc::new(RwLock::new(WorkerState::default())), update }
    }

    fn handler(&self) -> WorkerHandler<U> {
        WorkerHandler { state: self.state.clone(), update: self.update.clone() }
    }

    /// Spawn a worker serving a tarpc channel transport.
    ///
    /// Returns a client that can call this worker's RPC methods.
    pub fn spawn_channel(&self) -> BlockServiceClient {
        let (client_transport, server_transport) = tarpc::transport::channel::unbounded();

        let server = BaseChannel::with_defaults(server_transport);
        let handler = self.handler();

        tokio::spawn(async move {
            server
                .execute(handler.serve())
                .for_each(|response| async move {
                    tokio::spawn(response);
                })
                .await;
        });

        BlockServiceClient::new(tarpc::client::Config::default(), client_transport).spawn()
    }

    /// Accept loop: serve tarpc over incoming TCP connections.
    ///
    /// Returns once a shutdown has been requested and the next connection
    /// attempt arrives, or when accepting fails.
    pub async fn serve_tcp(&self, listener: TcpListener) -> Result<(), MeshError> {
        info!(addr = ?listener.local_addr().ok(), "worker listening");
        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| MeshError::Transport(e.to_string()))?;
            if self.is_shutting_down().await {
                info!("worker shutting down, refusing {peer}");
                return Ok(());
            }
            stream.set_nodelay(true)?;
            debug!("connection from {peer}");
            let server = BaseChannel::with_defaults(json_transport(stream));
            let handler = self.handler();
            tokio::spawn(async move {
                server
                    .execute(handler.serve())
                    .for_each(|response| async move {
                        tokio::spawn(response);
                    })
                    .await;
            });
        }
    }

    /// Whether shutdown has been requested.
    pub async fn is_shutting_down(&self) -> bool {
        self.state.read().await.shutting_down
    }

    pub async fn worker_id(&self) -> Option<WorkerId> {
        self.state.read().await.id
    }

    /// Number of V blocks held.
    pub async fn num_blocks(&self) -> usize {
        self.state.read().await.v_blocks.len()
    }

    /// Tasks completed since the last load.
    pub async fn tasks_run(&self) -> u64 {
        self.state.read().await.tasks_run
    }
}

/// tarpc service implementation for workers.
struct WorkerHandler<U> {
    state: Arc<RwLock<WorkerState>>,
    update: Arc<U>,
}

impl<U> Clone for WorkerHandler<U> {
    fn clone(&self) -> Self {
        Self { state: self.state.clone(), update: self.update.clone() }
    }
}

fn check_version(got: u32) -> Result<(), RemoteError> {
    if got != PROTOCOL_VERSION {
        return Err(RemoteError::VersionMismatch { expected: PROTOCOL_VERSION, got });
    }
    Ok(())
}

impl<U: UpdateFn + 'static> BlockService for WorkerHandler<U> {
    async fn load(self, _ctx: context::Context, setup: WorkerSetup) -> Result<usize, RemoteError> {
        check_version(setup.version)?;
        let worker = setup.worker;
        if setup.d == 0 {
            return Err("empty block grid".into());
        }
        let owned: HashMap<usize, RowBlock> =
            setup.w_blocks.into_iter().map(|b| (b.index, b)).collect();
        for v in &setup.v_blocks {
            if v.id.row >= setup.d || v.id.col >= setup.d {
                let d = setup.d;
                return Err(format!("V block {} is outside the {d} x {d} grid", v.id).into());
            }
            let w = owned
                .get(&v.id.row)
                .ok_or_else(|| format!("V block {} has no W row block on {worker}", v.id))?;
            if w.offset != v.row_offset || w.values.rows() != v.data.nrows {
                return Err(format!("W row block {} does not cover V block {}", w.index, v.id).into());
            }
        }

        let mut st = self.state.write().await;
        if st.in_flight > 0 {
            return Err("cannot reload while tasks are running".into());
        }
        let blocks = setup.v_blocks.len();
        st.id = Some(worker);
        st.d = setup.d;
        st.v_blocks = setup.v_blocks.into_iter().map(|b| (b.id, Arc::new(b))).collect();
        st.w_blocks = owned;
        st.tasks_run = 0;
        info!(%worker, d = st.d, blocks, "worker loaded");
        Ok(blocks)
    }

    async fn run_task(self, _ctx: context::Context, batch: TaskBatch) -> Result<TaskAck, RemoteError> {
        check_version(batch.version)?;
        let TaskBatch { epoch, stratum, task, eps, order, items, .. } = batch;
        let jobs = {
            let mut st = self.state.write().await;
            if st.shutting_down {
                return Err("worker is shutting down".into());
            }
            st.check_out(items)?
        };

        let update = self.update.clone();
        let finished =
            tokio::task::spawn_blocking(move || run_items(&*update, order, eps, jobs)).await;

        let mut st = self.state.write().await;
        st.in_flight -= 1;
        let (w_blocks, h_blocks, updates) = finished.map_err(|e| {
            warn!(epoch, stratum, task, "block task failed: {e}");
            format!("block task failed: {e}")
        })?;
        for w in w_blocks {
            st.w_blocks.insert(w.index, w);
        }
        st.tasks_run += 1;
        debug!(epoch, stratum, task, updates, "task done");
        Ok(TaskAck { task, h_blocks, updates })
    }

    async fn fetch_w(self, _ctx: context::Context) -> Result<Vec<RowBlock>, RemoteError> {
        let st = self.state.read().await;
        if st.in_flight > 0 {
            return Err("W is checked out by running tasks".into());
        }
        let mut blocks: Vec<RowBlock> = st.w_blocks.values().cloned().collect();
        blocks.sort_by_key(|b| b.index);
        Ok(blocks)
    }

    async fn store_w(self, _ctx: context::Context, blocks: Vec<RowBlock>) -> Result<(), RemoteError> {
        let mut st = self.state.write().await;
        if st.in_flight > 0 {
            return Err("W is checked out by running tasks".into());
        }
        for b in &blocks {
            let current = st
                .w_blocks
                .get(&b.index)
                .ok_or_else(|| format!("row block {} is not owned here", b.index))?;
            if current.offset != b.offset
                || current.values.rows() != b.values.rows()
                || current.values.rank() != b.values.rank()
            {
                return Err(format!("row block {} changed shape", b.index).into());
            }
        }
        for b in blocks {
            st.w_blocks.insert(b.index, b);
        }
        Ok(())
    }

    async fn ping(self, _ctx: context::Context, seq: u64) -> u64 {
        seq
    }

    async fn shutdown(self, _ctx: context::Context) -> Result<(), RemoteError> {
        info!("shutdown requested");
        self.state.write().await.shutting_down = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_matrix::{BlockGrid, ColFactors, Entry, RowFactors, SparseMatrix};
    use strata_sgd::Nzsl;

    #[derive(Clone, Copy)]
    struct Bump;

    impl UpdateFn for Bump {
        fn update(&self, w: &mut [f64], h: &mut [f64], _: Entry, _: f64) {
            w[0] += 1.0;
            h[0] += 1.0;
        }
    }

    fn setup(grid: &BlockGrid, v: &SparseMatrix) -> WorkerSetup {
        let v_blocks = grid.partition(v).unwrap();
        let w_blocks = (0..grid.d())
            .map(|i| RowBlock {
                index: i,
                offset: grid.row_range(i).start,
                values: RowFactors::zeros(grid.row_range(i).len(), 1),
            })
            .collect();
        WorkerSetup { version: PROTOCOL_VERSION, worker: WorkerId(0), d: grid.d(), v_blocks, w_blocks }
    }

    fn h_block(grid: &BlockGrid, j: usize) -> HBlock {
        let cols = grid.col_range(j);
        HBlock { index: j, offset: cols.start, version: 0, values: ColFactors::zeros(1, cols.len()) }
    }

    fn batch(items: Vec<WorkItem>) -> TaskBatch {
        TaskBatch {
            version: PROTOCOL_VERSION,
            epoch: 0,
            stratum: 0,
            task: 0,
            eps: 0.1,
            order: SgdOrder::Sequential,
            items,
        }
    }

    fn diag(n: usize) -> SparseMatrix {
        SparseMatrix::from_triplets(n, n, (0..n).map(|i| (i, i, 1.0))).unwrap()
    }

    #[tokio::test]
    async fn ping_echoes() {
        let client = Worker::new(Nzsl).spawn_channel();
        assert_eq!(client.ping(context::current(), 41).await.unwrap(), 41);
    }

    #[tokio::test]
    async fn task_returns_updated_h_and_keeps_w() {
        let grid = BlockGrid::new(4, 4, 1, 2).unwrap();
        let v = diag(4);
        let worker = Worker::new(Bump);
        let client = worker.spawn_channel();
        let held = client.load(context::current(), setup(&grid, &v)).await.unwrap().unwrap();
        assert_eq!(held, 4);

        let item = WorkItem { block: BlockId::new(1, 1), seed: 0, h: h_block(&grid, 1) };
        let ack = client.run_task(context::current(), batch(vec![item])).await.unwrap().unwrap();
        assert_eq!(ack.updates, 2);
        assert_eq!(ack.h_blocks[0].values.as_slice(), &[1.0, 1.0]);

        let w = client.fetch_w(context::current()).await.unwrap().unwrap();
        assert_eq!(w[0].values.as_slice(), &[0.0, 0.0]);
        assert_eq!(w[1].values.as_slice(), &[1.0, 1.0]);
        assert_eq!(worker.tasks_run().await, 1);
    }

    #[tokio::test]
    async fn bad_items_leave_w_in_place() {
        let grid = BlockGrid::new(4, 4, 1, 2).unwrap();
        let client = Worker::new(Bump).spawn_channel();
        client.load(context::current(), setup(&grid, &diag(4))).await.unwrap().unwrap();

        // second item pairs block (0,1) with the wrong H block
        let items = vec![
            WorkItem { block: BlockId::new(1, 0), seed: 0, h: h_block(&grid, 0) },
            WorkItem { block: BlockId::new(0, 1), seed: 0, h: h_block(&grid, 0) },
        ];
        assert!(client.run_task(context::current(), batch(items)).await.unwrap().is_err());
        let w = client.fetch_w(context::current()).await.unwrap().unwrap();
        assert_eq!(w.len(), 2);
    }

    #[tokio::test]
    async fn version_mismatch_rejected() {
        let grid = BlockGrid::new(2, 2, 1, 1).unwrap();
        let client = Worker::new(Bump).spawn_channel();
        let mut s = setup(&grid, &diag(2));
        s.version = PROTOCOL_VERSION + 1;
        let err = client.load(context::current(), s).await.unwrap().unwrap_err();
        assert_eq!(
            err,
            RemoteError::VersionMismatch { expected: PROTOCOL_VERSION, got: PROTOCOL_VERSION + 1 }
        );
    }

    #[tokio::test]
    async fn blocks_outside_the_grid_rejected() {
        let grid = BlockGrid::new(4, 4, 1, 2).unwrap();
        let client = Worker::new(Bump).spawn_channel();
        let mut s = setup(&grid, &diag(4));
        s.d = 1;
        assert!(client.load(context::current(), s).await.unwrap().is_err());

        client.load(context::current(), setup(&grid, &diag(4))).await.unwrap().unwrap();
        let mut h = h_block(&grid, 1);
        h.index = 2;
        let item = WorkItem { block: BlockId::new(1, 1), seed: 0, h };
        let err = client.run_task(context::current(), batch(vec![item])).await.unwrap().unwrap_err();
        assert!(err.to_string().contains("outside"), "{err}");
    }

    #[tokio::test]
    async fn store_w_rejects_unknown_blocks() {
        let grid = BlockGrid::new(2, 2, 1, 1).unwrap();
        let client = Worker::new(Bump).spawn_channel();
        client.load(context::current(), setup(&grid, &diag(2))).await.unwrap().unwrap();
        let stray = RowBlock { index: 5, offset: 0, values: RowFactors::zeros(2, 1) };
        assert!(client.store_w(context::current(), vec![stray]).await.unwrap().is_err());
    }

    #[tokio::test]
    async fn shutdown_stops_tasks() {
        let grid = BlockGrid::new(2, 2, 1, 1).unwrap();
        let worker = Worker::new(Bump);
        let client = worker.spawn_channel();
        client.load(context::current(), setup(&grid, &diag(2))).await.unwrap().unwrap();
        client.shutdown(context::current()).await.unwrap().unwrap();
        assert!(worker.is_shutting_down().await);
        let item = WorkItem { block: BlockId::new(0, 0), seed: 0, h: h_block(&grid, 0) };
        assert!(client.run_task(context::current(), batch(vec![item])).await.unwrap().is_err());
    }
}
