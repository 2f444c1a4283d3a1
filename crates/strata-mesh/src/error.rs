//! Error types for strata-mesh.

use strata_matrix::MatrixError;
use strata_sgd::SgdError;
use thiserror::Error;

use crate::protocol::{RemoteError, WorkerId};

/// Errors that can occur while setting up or running a distributed job.
///
/// Everything except `Config`, `Matrix` and `Sgd` is raised after the job has
/// started and is fatal to it.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Invalid job configuration, detected before any epoch runs.
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Matrix(#[from] MatrixError),
    #[error(transparent)]
    Sgd(#[from] SgdError),
    /// Transport-level error (connect, accept).
    #[error("transport error: {0}")]
    Transport(String),
    /// RPC call failed.
    #[error("rpc error: {0}")]
    Rpc(String),
    /// A worker rejected or failed a task.
    #[error("dispatch failed on {worker}: {message}")]
    Dispatch { worker: WorkerId, message: String },
    /// Protocol version mismatch.
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u32, got: u32 },
    /// A returned H block does not match what was lent out.
    #[error("stale or foreign H block {index}: {reason}")]
    StaleBlock { index: usize, reason: String },
    #[error("{0} is not registered")]
    WorkerNotFound(WorkerId),
    #[error("no workers available")]
    NoWorkers,
    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serde(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<postcard::Error> for MeshError {
    fn from(e: postcard::Error) -> Self {
        Self::Serde(e.to_string())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serde(e.to_string())
    }
}

impl MeshError {
    /// Lift a worker's refusal into a job error.
    pub fn remote(worker: WorkerId, err: RemoteError) -> Self {
        match err {
            RemoteError::VersionMismatch { expected, got } => Self::VersionMismatch { expected, got },
            RemoteError::Rejected(message) => Self::Dispatch { worker, message },
        }
    }
}
