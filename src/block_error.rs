//! BlockError: Unified error type for parablock public APIs
//!
//! This error type is used throughout the library to provide non-panicking
//! error handling. Conditions that the runtime tolerates (metadata mismatches,
//! failed page-outs) are logged instead and never surface here.

use crate::types::{Gid, StorageHandle};
use thiserror::Error;

/// Unified error type for parablock operations.
#[derive(Debug, Error)]
pub enum BlockError {
    /// The requested block count cannot be factored into the fixed divisions.
    #[error("cannot factor {nblocks} blocks into the provided divisions {divisions:?}")]
    Factorization {
        nblocks: usize,
        divisions: Vec<usize>,
    },
    /// Decomposer parameters are inconsistent (dimension mismatch, zero blocks, ...).
    #[error("invalid decomposition: {0}")]
    InvalidDecomposition(String),
    /// A local block index does not exist in the collection.
    #[error("local block index {0} out of range")]
    InvalidLocalId(usize),
    /// The gid is not owned by this worker.
    #[error("block {0} is not local to this worker")]
    UnknownGid(Gid),
    /// The storage handle was never issued or has already been consumed.
    #[error("unknown or consumed storage handle {0}")]
    UnknownHandle(StorageHandle),
    /// Paging was requested but no external storage is attached.
    #[error("no external storage configured")]
    NoStorage,
    /// A block asked for a queue that was never delivered to it.
    #[error("no incoming queue from block {from} to block {to}")]
    NoQueue { from: Gid, to: Gid },
    /// Runtime settings are unusable (e.g. a memory limit without storage).
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Encoding or decoding a value failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// A read ran past the end of a memory buffer.
    #[error("buffer underflow: requested {requested} bytes, {remaining} remaining")]
    BufferUnderflow { requested: usize, remaining: usize },
    /// A block archive could not be interpreted.
    #[error("archive format error: {0}")]
    Archive(String),
    /// MPI could not be initialized (or was initialized twice).
    #[error("MPI initialization failed")]
    MpiInit,
    /// Underlying file-system failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for BlockError {
    fn from(e: bincode::Error) -> Self {
        BlockError::Serialization(e.to_string())
    }
}
