//! Transport layer: tarpc RPC over length-delimited JSON frames.
//!
//! `BlockService` is the interface the coordinator drives on each worker.
//! In-process workers use tarpc's channel transport (see
//! [`Worker::spawn_channel`](crate::worker::Worker::spawn_channel)); remote
//! workers speak the same service over TCP through [`json_transport`].

use std::net::SocketAddr;
use std::time::Duration;

use tarpc::context;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::MeshError;
use crate::protocol::{RemoteError, RowBlock, TaskAck, TaskBatch, WorkerSetup};

// ---------------------------------------------------------------------------
// BlockService: tarpc RPC interface
// ---------------------------------------------------------------------------

/// RPC service trait for worker processes.
///
/// A worker owns its W row blocks for the whole job. H blocks only pass
/// through: each `run_task` call carries them in and its ack carries them
/// back out.
#[tarpc::service]
pub trait BlockService {
    /// Install this worker's V blocks and W row blocks. Returns the number
    /// of V blocks held.
    async fn load(setup: WorkerSetup) -> Result<usize, RemoteError>;

    /// Run one task of a stratum and return the updated H blocks.
    async fn run_task(batch: TaskBatch) -> Result<TaskAck, RemoteError>;

    /// Copy out every W row block this worker owns.
    async fn fetch_w() -> Result<Vec<RowBlock>, RemoteError>;

    /// Overwrite W row blocks, e.g. after regularization on the coordinator.
    async fn store_w(blocks: Vec<RowBlock>) -> Result<(), RemoteError>;

    /// Health check ping. Returns the same sequence number.
    async fn ping(seq: u64) -> u64;

    /// Graceful shutdown.
    async fn shutdown() -> Result<(), RemoteError>;
}

/// Create a tarpc serde transport over any byte stream.
///
/// Uses length-delimited framing + JSON codec for tarpc message exchange.
pub fn json_transport<S, Item, SinkItem>(
    stream: S,
) -> tarpc::serde_transport::Transport<S, Item, SinkItem, tokio_serde::formats::Json<Item, SinkItem>>
where
    S: AsyncRead + AsyncWrite,
    Item: for<'de> serde::Deserialize<'de>,
    SinkItem: serde::Serialize,
{
    tarpc::serde_transport::new(
        tokio_util::codec::length_delimited::Builder::new().new_framed(stream),
        tokio_serde::formats::Json::default(),
    )
}

/// Open a TCP connection to a worker and spawn a client on it.
pub async fn connect(addr: SocketAddr) -> Result<BlockServiceClient, MeshError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| MeshError::Transport(format!("connect {addr}: {e}")))?;
    stream.set_nodelay(true)?;
    let client = BlockServiceClient::new(tarpc::client::Config::default(), json_transport(stream))
        .spawn();
    Ok(client)
}

/// Request context whose deadline is pushed `extra` past tarpc's default.
pub fn context_with_grace(extra: Duration) -> context::Context {
    let mut ctx = context::current();
    ctx.deadline += extra;
    ctx
}
