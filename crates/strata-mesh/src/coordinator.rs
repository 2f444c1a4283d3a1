//! Coordinator: drives every worker of a job over RPC.
//!
//! The coordinator never touches V. It sends each worker its setup once,
//! fans out one stratum at a time and waits for every task to finish before
//! the next stratum goes out.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, try_join_all};
use tarpc::context;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use strata_sgd::UpdateFn;

use crate::error::MeshError;
use crate::protocol::{RowBlock, TaskAck, TaskBatch, WorkerId, WorkerSetup};
use crate::transport::{self, context_with_grace, BlockServiceClient};
use crate::worker::Worker;

/// Coordinator that manages the workers of one job.
pub struct Coordinator {
    /// Connected worker clients.
    workers: Arc<RwLock<HashMap<WorkerId, BlockServiceClient>>>,
    /// Added to the deadline of every call that moves blocks.
    task_grace: Duration,
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            workers: Arc::new(RwLock::new(HashMap::new())),
            task_grace: Duration::from_secs(60),
        }
    }

    pub fn with_task_grace(mut self, grace: Duration) -> Self {
        self.task_grace = grace;
        self
    }

    pub fn task_grace(&self) -> Duration {
        self.task_grace
    }

    /// Spawn `n` in-process workers sharing `update`, registered as
    /// `worker-0 .. worker-{n-1}`.
    pub async fn in_process<U: UpdateFn + 'static>(n: usize, update: Arc<U>) -> (Self, Vec<Worker<U>>) {
        let coordinator = Self::new();
        let mut workers = Vec::with_capacity(n);
        for i in 0..n {
            let worker = Worker::shared(update.clone());
            coordinator.add_worker(WorkerId(i as u32), worker.spawn_channel()).await;
            workers.push(worker);
        }
        (coordinator, workers)
    }

    /// Register a worker client directly (for in-process / channel transport).
    pub async fn add_worker(&self, id: WorkerId, client: BlockServiceClient) {
        self.workers.write().await.insert(id, client);
    }

    /// Connect to a remote worker over TCP.
    pub async fn connect_tcp(&self, id: WorkerId, addr: SocketAddr) -> Result<(), MeshError> {
        let client = transport::connect(addr).await?;
        self.add_worker(id, client).await;
        info!("connected to {id} at {addr}");
        Ok(())
    }

    pub async fn num_workers(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Registered worker ids, ascending.
    pub async fn worker_ids(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self.workers.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    async fn client(&self, id: WorkerId) -> Result<BlockServiceClient, MeshError> {
        self.workers.read().await.get(&id).cloned().ok_or(MeshError::WorkerNotFound(id))
    }

    /// Send every worker its setup, concurrently.
    pub async fn load_all(&self, setups: Vec<WorkerSetup>) -> Result<(), MeshError> {
        if setups.is_empty() {
            return Err(MeshError::NoWorkers);
        }
        let mut calls = Vec::with_capacity(setups.len());
        for setup in setups {
            let id = setup.worker;
            let client = self.client(id).await?;
            calls.push(async move {
                match client.load(context_with_grace(self.task_grace), setup).await {
                    Ok(Ok(blocks)) => {
                        debug!("{id} holds {blocks} blocks");
                        Ok(())
                    }
                    Ok(Err(e)) => Err(MeshError::remote(id, e)),
                    Err(e) => Err(MeshError::Rpc(e.to_string())),
                }
            });
        }
        try_join_all(calls).await?;
        Ok(())
    }

    /// Run one stratum: every batch is sent before any reply is awaited,
    /// and this returns only once all of them have been acknowledged.
    pub async fn dispatch_stratum(
        &self,
        batches: Vec<(WorkerId, TaskBatch)>,
    ) -> Result<Vec<TaskAck>, MeshError> {
        let mut calls = Vec::with_capacity(batches.len());
        for (id, batch) in batches {
            let client = self.client(id).await?;
            let ctx = context_with_grace(self.task_grace);
            calls.push(async move {
                match client.run_task(ctx, batch).await {
                    Ok(Ok(ack)) => Ok(ack),
                    Ok(Err(e)) => {
                        warn!("task failed on {id}: {e}");
                        Err(MeshError::remote(id, e))
                    }
                    Err(e) => {
                        warn!("rpc failed to {id}: {e}");
                        Err(MeshError::Rpc(e.to_string()))
                    }
                }
            });
        }
        try_join_all(calls).await
    }

    /// Collect every W row block from every worker.
    pub async fn gather_w(&self) -> Result<Vec<RowBlock>, MeshError> {
        let workers: Vec<(WorkerId, BlockServiceClient)> =
            self.workers.read().await.iter().map(|(id, c)| (*id, c.clone())).collect();
        let calls = workers.into_iter().map(|(id, client)| async move {
            match client.fetch_w(context_with_grace(self.task_grace)).await {
                Ok(Ok(blocks)) => Ok(blocks),
                Ok(Err(e)) => Err(MeshError::remote(id, e)),
                Err(e) => Err(MeshError::Rpc(e.to_string())),
            }
        });
        let mut blocks: Vec<RowBlock> = try_join_all(calls).await?.into_iter().flatten().collect();
        blocks.sort_by_key(|b| b.index);
        Ok(blocks)
    }

    /// Push W row blocks back to the workers that own them.
    pub async fn scatter_w(&self, blocks: Vec<(WorkerId, Vec<RowBlock>)>) -> Result<(), MeshError> {
        let mut calls = Vec::with_capacity(blocks.len());
        for (id, owned) in blocks {
            let client = self.client(id).await?;
            calls.push(async move {
                match client.store_w(context_with_grace(self.task_grace), owned).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(MeshError::remote(id, e)),
                    Err(e) => Err(MeshError::Rpc(e.to_string())),
                }
            });
        }
        try_join_all(calls).await?;
        Ok(())
    }

    /// Ping all workers; returns those that answered.
    pub async fn ping_all(&self) -> Vec<WorkerId> {
        let workers: Vec<(WorkerId, BlockServiceClient)> =
            self.workers.read().await.iter().map(|(id, c)| (*id, c.clone())).collect();
        let pings = workers.into_iter().map(|(id, client)| async move {
            match client.ping(context::current(), u64::from(id.0)).await {
                Ok(seq) if seq == u64::from(id.0) => Some(id),
                Ok(_) => None,
                Err(e) => {
                    warn!("ping failed to {id}: {e}");
                    None
                }
            }
        });
        let mut alive: Vec<WorkerId> = join_all(pings).await.into_iter().flatten().collect();
        alive.sort();
        alive
    }

    /// Ask every worker to shut down.
    pub async fn shutdown_all(&self) {
        let workers = self.workers.read().await;
        for (id, client) in workers.iter() {
            match client.shutdown(context::current()).await {
                Ok(Ok(())) => info!("shut down {id}"),
                Ok(Err(e)) => warn!("shutdown failed on {id}: {e}"),
                Err(e) => warn!("shutdown rpc failed to {id}: {e}"),
            }
        }
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}
