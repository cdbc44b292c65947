//! Per-block reductions merged across the whole run.
//!
//! Blocks register contributions through the proxy under a [`CollectiveId`].
//! During the exchange, contributions are merged on the worker, workers agree
//! on the union of ids with one all-gather, and each id is reduced with one
//! network all-reduce. A worker without a contribution for an id supplies the
//! identity element. Results stay readable until the next exchange.

use crate::algs::communicator::{Communicator, ReduceOp};
use crate::block_error::BlockError;
use crate::serialization::MemoryBuffer;
use crate::types::Gid;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Explicit step identifier of a collective.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectiveId(pub u32);

impl From<u32> for CollectiveId {
    fn from(id: u32) -> Self {
        CollectiveId(id)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CollectiveValues {
    F64(Vec<f64>),
    I64(Vec<i64>),
}

impl CollectiveValues {
    pub fn len(&self) -> usize {
        match self {
            CollectiveValues::F64(v) => v.len(),
            CollectiveValues::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn kind(&self) -> ValueKind {
        match self {
            CollectiveValues::F64(_) => ValueKind::F64,
            CollectiveValues::I64(_) => ValueKind::I64,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum ValueKind {
    F64,
    I64,
}

/// One accumulator: the operation and the values folded so far.
#[derive(Clone, Debug, PartialEq)]
pub struct CollectiveRecord {
    pub op: ReduceOp,
    pub values: CollectiveValues,
}

impl CollectiveRecord {
    pub fn init(op: ReduceOp, values: CollectiveValues) -> Self {
        Self { op, values }
    }

    fn identity(op: ReduceOp, kind: ValueKind, len: usize) -> Self {
        let values = match kind {
            ValueKind::F64 => CollectiveValues::F64(vec![op.identity_f64(); len]),
            ValueKind::I64 => CollectiveValues::I64(vec![op.identity_i64(); len]),
        };
        Self { op, values }
    }

    /// Fold `other` into this accumulator element-wise.
    pub fn update(&mut self, other: &CollectiveValues) {
        let op = self.op;
        match (&mut self.values, other) {
            (CollectiveValues::F64(acc), CollectiveValues::F64(v)) => {
                if acc.len() != v.len() {
                    log::warn!("collective lengths differ: {} vs {}", acc.len(), v.len());
                }
                for (a, b) in acc.iter_mut().zip(v) {
                    *a = op.apply_f64(*a, *b);
                }
            }
            (CollectiveValues::I64(acc), CollectiveValues::I64(v)) => {
                if acc.len() != v.len() {
                    log::warn!("collective lengths differ: {} vs {}", acc.len(), v.len());
                }
                for (a, b) in acc.iter_mut().zip(v) {
                    *a = op.apply_i64(*a, *b);
                }
            }
            _ => log::warn!("ignoring collective contribution of a different value type"),
        }
    }

    /// Overwrite with another record's values (the global result).
    pub fn copy_from(&mut self, other: &CollectiveRecord) {
        self.values = other.values.clone();
    }

    pub fn result_f64(&self) -> Option<&[f64]> {
        match &self.values {
            CollectiveValues::F64(v) => Some(v),
            CollectiveValues::I64(_) => None,
        }
    }

    pub fn result_i64(&self) -> Option<&[i64]> {
        match &self.values {
            CollectiveValues::I64(v) => Some(v),
            CollectiveValues::F64(_) => None,
        }
    }

    /// Reshape to `kind`/`len`, padding with the identity element.
    fn conform(&self, op: ReduceOp, kind: ValueKind, len: usize) -> CollectiveValues {
        let mut out = Self::identity(op, kind, len);
        out.update(&self.values);
        out.values
    }
}

/// Collective state of one block.
#[derive(Debug, Default)]
pub struct CollectiveSlot {
    pub(crate) pending: BTreeMap<CollectiveId, CollectiveRecord>,
    pub(crate) results: BTreeMap<CollectiveId, CollectiveRecord>,
}

impl CollectiveSlot {
    pub fn contribute(&mut self, id: CollectiveId, op: ReduceOp, values: CollectiveValues) {
        match self.pending.get_mut(&id) {
            Some(rec) => {
                if rec.op != op {
                    log::warn!("collective {id:?} registered with {:?} and {op:?}", rec.op);
                }
                rec.update(&values);
            }
            None => {
                self.pending.insert(id, CollectiveRecord::init(op, values));
            }
        }
    }

    pub fn result(&self, id: CollectiveId) -> Option<&CollectiveRecord> {
        self.results.get(&id)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Announcement {
    id: CollectiveId,
    op: ReduceOp,
    kind: ValueKind,
    len: usize,
}

/// Reduce all pending contributions across blocks and workers. Collective.
pub(crate) fn process<C: Communicator>(
    comm: &C,
    slots: &mut HashMap<Gid, CollectiveSlot>,
) -> Result<(), BlockError> {
    // merge on this worker, in gid order so the fold is deterministic
    let mut gids: Vec<Gid> = slots.keys().copied().collect();
    gids.sort_unstable();
    let mut local: BTreeMap<CollectiveId, CollectiveRecord> = BTreeMap::new();
    for gid in &gids {
        for (id, rec) in &slots[gid].pending {
            match local.get_mut(id) {
                Some(acc) => acc.update(&rec.values),
                None => {
                    local.insert(*id, rec.clone());
                }
            }
        }
    }

    let announcements: Vec<Announcement> = local
        .iter()
        .map(|(id, rec)| Announcement {
            id: *id,
            op: rec.op,
            kind: rec.values.kind(),
            len: rec.values.len(),
        })
        .collect();
    let mut bb = MemoryBuffer::new();
    bb.save(&announcements)?;
    let mut union: BTreeMap<CollectiveId, Announcement> = BTreeMap::new();
    for (rank, bytes) in comm.all_gather_bytes(bb.as_slice()).into_iter().enumerate() {
        let theirs: Vec<Announcement> = MemoryBuffer::from_vec(bytes).load()?;
        for a in theirs {
            match union.get(&a.id) {
                Some(first) if first.op != a.op || first.kind != a.kind || first.len != a.len => {
                    log::warn!(
                        "rank {rank} disagrees on collective {:?}: {:?}/{:?}/{} vs {:?}/{:?}/{}",
                        a.id,
                        a.op,
                        a.kind,
                        a.len,
                        first.op,
                        first.kind,
                        first.len
                    );
                }
                Some(_) => {}
                None => {
                    union.insert(a.id, a);
                }
            }
        }
    }

    let mut global: BTreeMap<CollectiveId, CollectiveRecord> = BTreeMap::new();
    for (id, a) in &union {
        let contribution = match local.get(id) {
            Some(rec) => rec.conform(a.op, a.kind, a.len),
            None => CollectiveRecord::identity(a.op, a.kind, a.len).values,
        };
        let values = match contribution {
            CollectiveValues::F64(v) => CollectiveValues::F64(comm.all_reduce_f64(&v, a.op)),
            CollectiveValues::I64(v) => CollectiveValues::I64(comm.all_reduce_i64(&v, a.op)),
        };
        global.insert(*id, CollectiveRecord::init(a.op, values));
    }
    if !global.is_empty() {
        log::debug!("reduced {} collectives", global.len());
    }

    for slot in slots.values_mut() {
        let pending = std::mem::take(&mut slot.pending);
        slot.results.clear();
        for (id, mut rec) in pending {
            if let Some(g) = global.get(&id) {
                rec.copy_from(g);
                slot.results.insert(id, rec);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{LocalWorld, NoComm};

    #[test]
    fn merges_blocks_on_one_worker() {
        let mut slots: HashMap<Gid, CollectiveSlot> = HashMap::new();
        for gid in 0..4u64 {
            slots.entry(gid).or_default().contribute(
                CollectiveId(0),
                ReduceOp::Sum,
                CollectiveValues::F64(vec![gid as f64 + 1.0]),
            );
        }
        process(&NoComm, &mut slots).unwrap();
        for slot in slots.values() {
            assert_eq!(slot.result(CollectiveId(0)).unwrap().result_f64(), Some(&[10.0][..]));
        }
    }

    #[test]
    fn missing_step_contributes_identity() {
        // rank 1 never registers step 7; rank 0 does
        let results = LocalWorld::run(2, |comm| {
            let mut slots: HashMap<Gid, CollectiveSlot> = HashMap::new();
            let slot = slots.entry(comm.rank() as Gid).or_default();
            slot.contribute(
                CollectiveId(1),
                ReduceOp::Max,
                CollectiveValues::I64(vec![comm.rank() as i64]),
            );
            if comm.rank() == 0 {
                slot.contribute(CollectiveId(7), ReduceOp::Product, CollectiveValues::I64(vec![5]));
            }
            process(&comm, &mut slots).unwrap();
            let slot = &slots[&(comm.rank() as Gid)];
            (
                slot.result(CollectiveId(1)).and_then(|r| r.result_i64()).map(<[i64]>::to_vec),
                slot.result(CollectiveId(7)).and_then(|r| r.result_i64()).map(<[i64]>::to_vec),
            )
        });
        assert_eq!(results[0], (Some(vec![1]), Some(vec![5])));
        assert_eq!(results[1], (Some(vec![1]), None));
    }

    #[test]
    fn repeated_contribution_folds() {
        let mut slot = CollectiveSlot::default();
        slot.contribute(CollectiveId(2), ReduceOp::Min, CollectiveValues::F64(vec![3.0, 1.0]));
        slot.contribute(CollectiveId(2), ReduceOp::Min, CollectiveValues::F64(vec![2.0, 4.0]));
        assert_eq!(
            slot.pending[&CollectiveId(2)].values,
            CollectiveValues::F64(vec![2.0, 1.0])
        );
    }
}
