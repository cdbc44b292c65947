//! Small shared identifiers: block ids, storage handles, directions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Neg;

/// Global block identifier, unique across the whole run.
pub type Gid = u64;

/// Opaque handle returned by [`ExternalStorage::put`](crate::storage::ExternalStorage::put).
pub type StorageHandle = u64;

/// A neighbor record: the block's gid together with the rank that owns it.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct BlockID {
    pub gid: Gid,
    pub proc: usize,
}

impl BlockID {
    pub fn new(gid: Gid, proc: usize) -> Self {
        Self { gid, proc }
    }
}

impl fmt::Display for BlockID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.gid, self.proc)
    }
}

/// Per-axis offset in {-1, 0, 1} pointing from a block to one of its neighbors.
///
/// The same type records wrap vectors: a non-zero entry means the neighbor was
/// reached by wrapping around the domain along that axis.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Direction(pub Vec<i32>);

impl Direction {
    pub fn zeros(dim: usize) -> Self {
        Direction(vec![0; dim])
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&d| d == 0)
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.0
    }
}

impl Neg for &Direction {
    type Output = Direction;
    fn neg(self) -> Direction {
        Direction(self.0.iter().map(|d| -d).collect())
    }
}

impl Neg for Direction {
    type Output = Direction;
    fn neg(self) -> Direction {
        -&self
    }
}

impl From<Vec<i32>> for Direction {
    fn from(v: Vec<i32>) -> Self {
        Direction(v)
    }
}
