#![cfg_attr(docsrs, feature(doc_cfg))]
//! # parablock
//!
//! parablock is a block-parallel runtime for distributed scientific codes. A
//! problem is cut into blocks identified by a global id (gid); each worker
//! owns some of them, runs callbacks over its blocks and exchanges messages
//! with the neighbors listed in each block's link.
//!
//! ## Features
//! - Block placement with contiguous, round-robin and dynamic assigners
//! - Regular decomposition of discrete and continuous boxes, with ghosts and periodic axes
//! - Round-based (`exchange`) and asynchronous (`iexchange`) message exchange
//! - Per-block collectives reduced once per round
//! - Out-of-core paging of blocks and message queues to temporary files
//! - Pluggable transports: serial, in-process multi-rank, and MPI (`mpi-support`)
//!
//! ## Determinism
//!
//! Gid order drives every local fold, and the storage directory picker uses a
//! seeded `SmallRng`, so runs with the same layout are reproducible.
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! parablock = "0.3"
//! # features = ["mpi-support"]
//! ```
//!
//! A typical program builds an [`Assigner`](assigner::Assigner), lets a
//! [`RegularDecomposer`](decomposer::RegularDecomposer) create the local
//! blocks inside a [`Master`](master::Master), then alternates `foreach` and
//! `exchange` until done.

pub mod algs;
pub mod assigner;
pub mod block_error;
pub mod collection;
pub mod decomposer;
pub mod io;
pub mod link;
pub mod master;
pub mod serialization;
pub mod storage;
pub mod types;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::algs::communicator::{
        CommTag, Communicator, LocalComm, LocalWorld, NoComm, ReduceOp, Wait,
    };
    pub use crate::assigner::{
        Assigner, ContiguousAssigner, DynamicAssigner, RoundRobinAssigner,
    };
    pub use crate::block_error::BlockError;
    pub use crate::collection::Collection;
    pub use crate::decomposer::{RegularDecomposer, RegularDecomposerBuilder};
    pub use crate::link::{Bounds, Link, PlainLink, RegularLink};
    pub use crate::master::{CollectiveId, Master, MasterConfig, Proxy};
    pub use crate::serialization::{Block, MemoryBuffer};
    pub use crate::storage::{ExternalStorage, FileStorage};
    pub use crate::types::{BlockID, Direction, Gid, StorageHandle};
}
