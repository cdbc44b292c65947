//! Block ownership: which worker rank owns a given gid.
//!
//! Static policies ([`ContiguousAssigner`], [`RoundRobinAssigner`]) are pure
//! functions of `(size, nblocks)` and need no communication. The
//! [`DynamicAssigner`] keeps a table with one record per gid; ownership writes
//! are staged locally and become visible to every worker after a collective
//! [`DynamicAssigner::flush`].

use crate::algs::communicator::Communicator;
use crate::block_error::BlockError;
use crate::serialization::MemoryBuffer;
use crate::types::Gid;

/// Maps a gid to its owning rank.
///
/// `rank(gid)` for `gid >= nblocks()` is a caller error.
pub trait Assigner: Send + Sync {
    /// Number of workers.
    fn size(&self) -> usize;
    /// Total number of blocks in the run.
    fn nblocks(&self) -> usize;
    /// Owner of `gid`.
    fn rank(&self, gid: Gid) -> usize;
    /// Every gid owned by `rank`, in increasing order.
    fn local_gids(&self, rank: usize) -> Vec<Gid> {
        (0..self.nblocks() as Gid)
            .filter(|&gid| self.rank(gid) == rank)
            .collect()
    }
    /// Owners of several gids at once.
    fn ranks(&self, gids: &[Gid]) -> Vec<usize> {
        gids.iter().map(|&gid| self.rank(gid)).collect()
    }
}

/// Contiguous ranges: `nblocks / size` per rank, the remainder to the first ranks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ContiguousAssigner {
    size: usize,
    nblocks: usize,
}

impl ContiguousAssigner {
    pub fn new(size: usize, nblocks: usize) -> Self {
        Self {
            size: size.max(1),
            nblocks,
        }
    }

    fn range(&self, rank: usize) -> (usize, usize) {
        let div = self.nblocks / self.size;
        let rem = self.nblocks % self.size;
        let from = rank * div + rank.min(rem);
        let to = from + div + usize::from(rank < rem);
        (from.min(self.nblocks), to.min(self.nblocks))
    }
}

impl Assigner for ContiguousAssigner {
    fn size(&self) -> usize {
        self.size
    }

    fn nblocks(&self) -> usize {
        self.nblocks
    }

    fn rank(&self, gid: Gid) -> usize {
        let gid = gid as usize;
        let div = self.nblocks / self.size;
        let rem = self.nblocks % self.size;
        // the first `rem` ranks hold `div + 1` blocks each
        let r = gid / (div + 1);
        if r < rem {
            r
        } else {
            rem + (gid - (div + 1) * rem) / div
        }
    }

    fn local_gids(&self, rank: usize) -> Vec<Gid> {
        let (from, to) = self.range(rank);
        (from as Gid..to as Gid).collect()
    }
}

/// `rank(gid) = gid mod size`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RoundRobinAssigner {
    size: usize,
    nblocks: usize,
}

impl RoundRobinAssigner {
    pub fn new(size: usize, nblocks: usize) -> Self {
        Self {
            size: size.max(1),
            nblocks,
        }
    }
}

impl Assigner for RoundRobinAssigner {
    fn size(&self) -> usize {
        self.size
    }

    fn nblocks(&self) -> usize {
        self.nblocks
    }

    fn rank(&self, gid: Gid) -> usize {
        (gid % self.size as Gid) as usize
    }

    fn local_gids(&self, rank: usize) -> Vec<Gid> {
        (rank as Gid..self.nblocks as Gid)
            .step_by(self.size)
            .collect()
    }
}

/// Mutable ownership backed by a table of one rank record per gid.
///
/// Every worker holds a view of the whole table. `set_rank` only stages the
/// write; [`flush`](Self::flush) is collective and publishes all staged writes
/// to all workers. Reads between flushes see the last flushed state plus this
/// worker's own staged writes.
#[derive(Clone, Debug)]
pub struct DynamicAssigner {
    size: usize,
    table: Vec<u32>,
    staged: Vec<(Gid, u32)>,
}

impl DynamicAssigner {
    /// Start from contiguous placement.
    pub fn new(size: usize, nblocks: usize) -> Self {
        Self::from_assigner(&ContiguousAssigner::new(size, nblocks))
    }

    /// Start from the placement of any other assigner.
    pub fn from_assigner(initial: &dyn Assigner) -> Self {
        let table = (0..initial.nblocks() as Gid)
            .map(|gid| initial.rank(gid) as u32)
            .collect();
        Self {
            size: initial.size(),
            table,
            staged: Vec::new(),
        }
    }

    pub fn get_rank(&self, gid: Gid) -> usize {
        self.table[gid as usize] as usize
    }

    /// Stage a new owner for `gid`; applied locally at once, remotely at the next flush.
    pub fn set_rank(&mut self, rank: usize, gid: Gid) {
        self.table[gid as usize] = rank as u32;
        self.staged.push((gid, rank as u32));
    }

    pub fn set_ranks(&mut self, updates: &[(Gid, usize)]) {
        for &(gid, rank) in updates {
            self.set_rank(rank, gid);
        }
    }

    /// Number of writes waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.staged.len()
    }

    /// Publish staged writes from every worker. Collective: all ranks must call it.
    ///
    /// Writes are applied in rank order, so when two workers claim the same gid
    /// in one epoch the higher rank wins on every worker.
    pub fn flush<C: Communicator>(&mut self, comm: &C) -> Result<(), BlockError> {
        let mut bb = MemoryBuffer::new();
        bb.save(&self.staged)?;
        self.staged.clear();
        let all = comm.all_gather_bytes(bb.as_slice());
        for (src, bytes) in all.into_iter().enumerate() {
            let mut bb = MemoryBuffer::from_vec(bytes);
            let updates: Vec<(Gid, u32)> = bb.load()?;
            for (gid, rank) in updates {
                match self.table.get_mut(gid as usize) {
                    Some(slot) => *slot = rank,
                    None => log::warn!("rank {src} staged an owner for out-of-range gid {gid}"),
                }
            }
        }
        Ok(())
    }
}

impl Assigner for DynamicAssigner {
    fn size(&self) -> usize {
        self.size
    }

    fn nblocks(&self) -> usize {
        self.table.len()
    }

    fn rank(&self, gid: Gid) -> usize {
        self.get_rank(gid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{LocalWorld, NoComm};

    #[test]
    fn contiguous_remainder_goes_to_first_ranks() {
        let a = ContiguousAssigner::new(3, 8);
        assert_eq!(a.local_gids(0), vec![0, 1, 2]);
        assert_eq!(a.local_gids(1), vec![3, 4, 5]);
        assert_eq!(a.local_gids(2), vec![6, 7]);
        assert_eq!(a.rank(5), 1);
        assert_eq!(a.rank(6), 2);
    }

    #[test]
    fn contiguous_fewer_blocks_than_ranks() {
        let a = ContiguousAssigner::new(4, 2);
        assert_eq!(a.rank(0), 0);
        assert_eq!(a.rank(1), 1);
        assert!(a.local_gids(3).is_empty());
    }

    #[test]
    fn round_robin_local_gids() {
        let a = RoundRobinAssigner::new(3, 10);
        assert_eq!(a.local_gids(1), vec![1, 4, 7]);
        assert_eq!(a.rank(8), 2);
    }

    #[test]
    fn dynamic_single_worker_flush() {
        let mut a = DynamicAssigner::new(1, 4);
        a.set_rank(0, 3);
        assert_eq!(a.pending(), 1);
        a.flush(&NoComm).unwrap();
        assert_eq!(a.pending(), 0);
        assert_eq!(a.get_rank(3), 0);
    }

    #[test]
    fn dynamic_writes_visible_after_flush() {
        let views = LocalWorld::run(2, |comm| {
            let mut a = DynamicAssigner::new(2, 4);
            if comm.rank() == 0 {
                // hand gid 0 to rank 1
                a.set_rank(1, 0);
            }
            let before = a.get_rank(0);
            a.flush(&comm).unwrap();
            (before, a.get_rank(0), a.local_gids(1))
        });
        assert_eq!(views[0].0, 1);
        assert_eq!(views[1].0, 0, "remote write invisible before flush");
        for (_, after, gids) in views {
            assert_eq!(after, 1);
            assert_eq!(gids, vec![0, 2, 3]);
        }
    }
}
