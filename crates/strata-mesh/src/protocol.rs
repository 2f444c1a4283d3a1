//! Wire protocol types exchanged between the coordinator and workers.
//!
//! Everything here crosses the RPC boundary, so it is all plain serde data.
//! Floats travel as bit patterns (see [`strata_matrix::bits`]) so a JSON hop
//! neither rounds them nor chokes on NaN and inf.
//! Factor blocks travel by value: a task receives the H column block it is
//! paired with, and sends the updated block back in its acknowledgement.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use strata_matrix::{BlockId, ColFactors, RowFactors, SparseBlock};
use strata_sgd::SgdOrder;
use thiserror::Error;

use crate::error::MeshError;

/// Protocol version. Incremented on breaking wire format changes.
pub const PROTOCOL_VERSION: u32 = 2;

/// Identifies a worker process within a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// A row block of W, owned by one worker for the whole job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RowBlock {
    /// Row block index in the grid.
    pub index: usize,
    /// First global row.
    pub offset: usize,
    pub values: RowFactors,
}

/// A column block of H, lent to exactly one task per stratum.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HBlock {
    /// Column block index in the grid.
    pub index: usize,
    /// First global column.
    pub offset: usize,
    /// Commit counter, checked when the block comes back.
    pub version: u64,
    pub values: ColFactors,
}

/// Everything a worker holds for the job: its V blocks and W row blocks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerSetup {
    pub version: u32,
    pub worker: WorkerId,
    pub d: usize,
    pub v_blocks: Vec<SparseBlock>,
    pub w_blocks: Vec<RowBlock>,
}

/// One V block to process, with the H block it pairs with in this stratum.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub block: BlockId,
    /// Seed for this block's entry order.
    pub seed: u64,
    pub h: HBlock,
}

/// The work of one task within one stratum.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskBatch {
    pub version: u32,
    pub epoch: usize,
    pub stratum: usize,
    /// Task index on the receiving worker.
    pub task: usize,
    #[serde(with = "strata_matrix::bits")]
    pub eps: f64,
    pub order: SgdOrder,
    pub items: Vec<WorkItem>,
}

/// Completion of a [`TaskBatch`]: the updated H blocks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskAck {
    pub task: usize,
    pub h_blocks: Vec<HBlock>,
    pub updates: u64,
}

/// Why a worker refused or failed a request.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RemoteError {
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u32, got: u32 },
    #[error("{0}")]
    Rejected(String),
}

impl From<String> for RemoteError {
    fn from(message: String) -> Self {
        Self::Rejected(message)
    }
}

impl From<&str> for RemoteError {
    fn from(message: &str) -> Self {
        Self::Rejected(message.to_owned())
    }
}

/// Compact binary encoding, used for checkpoints.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, MeshError> {
    Ok(postcard::to_allocvec(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MeshError> {
    Ok(postcard::from_bytes(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_id_display() {
        assert_eq!(WorkerId(3).to_string(), "worker-3");
    }

    #[test]
    fn batch_survives_binary_encoding() {
        let batch = TaskBatch {
            version: PROTOCOL_VERSION,
            epoch: 2,
            stratum: 1,
            task: 0,
            eps: 0.125,
            order: SgdOrder::WithoutReplacement,
            items: vec![WorkItem {
                block: BlockId::new(0, 1),
                seed: 99,
                h: HBlock {
                    index: 1,
                    offset: 4,
                    version: 7,
                    values: ColFactors::from_fn(2, 3, |k, j| (k + j) as f64 * 0.5),
                },
            }],
        };
        let bytes = encode(&batch).unwrap();
        let back: TaskBatch = decode(&bytes).unwrap();
        assert_eq!(back, batch);
    }

    #[test]
    fn non_finite_batch_survives_json() {
        let mut h = ColFactors::from_fn(2, 2, |k, j| (k * 2 + j) as f64 / 3.0);
        h.col_mut(0)[1] = f64::INFINITY;
        let batch = TaskBatch {
            version: PROTOCOL_VERSION,
            epoch: 0,
            stratum: 0,
            task: 1,
            eps: f64::NAN,
            order: SgdOrder::Sequential,
            items: vec![WorkItem {
                block: BlockId::new(1, 0),
                seed: u64::MAX,
                h: HBlock { index: 0, offset: 0, version: 3, values: h.clone() },
            }],
        };
        let back: TaskBatch = serde_json::from_str(&serde_json::to_string(&batch).unwrap()).unwrap();
        assert!(back.eps.is_nan());
        assert_eq!(back.items[0].seed, u64::MAX);
        assert_eq!(back.items[0].h.values.col(0)[1], f64::INFINITY);
        assert_eq!(back.items[0].h.values.col(1), h.col(1));
    }

    #[test]
    fn remote_errors_keep_their_kind() {
        let err = RemoteError::VersionMismatch { expected: 2, got: 1 };
        let back: RemoteError = serde_json::from_str(&serde_json::to_string(&err).unwrap()).unwrap();
        assert_eq!(back, err);
        assert_eq!(RemoteError::from("busy").to_string(), "busy");
    }

    #[test]
    fn garbage_is_a_serde_error() {
        let err = decode::<TaskAck>(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, MeshError::Serde(_)));
    }
}
