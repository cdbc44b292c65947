#![allow(dead_code)]
use parablock::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Test block: a value plus whatever a test wants to remember.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub gid: Gid,
    pub value: i64,
    pub received: Vec<Gid>,
    pub reduced: Vec<f64>,
    pub started: bool,
}

impl Field {
    pub fn new(gid: Gid) -> Self {
        Self {
            gid,
            value: gid as i64,
            ..Default::default()
        }
    }
}

impl Block for Field {
    fn save(&self, buf: &mut MemoryBuffer) -> Result<(), BlockError> {
        buf.save(self)
    }
    fn load(buf: &mut MemoryBuffer) -> Result<Self, BlockError> {
        buf.load()
    }
}

/// `nblocks` blocks along a 1-D line, placed contiguously over the world.
pub fn line<C: Communicator>(comm: C, nblocks: usize, config: MasterConfig) -> Master<Field, C> {
    let assigner = ContiguousAssigner::new(comm.size(), nblocks);
    let mut master = Master::new(comm, config, None).unwrap();
    let domain = Bounds::from_corners(vec![0i64], vec![99]);
    let dec = RegularDecomposer::builder(domain, nblocks).build().unwrap();
    dec.decompose_into(&mut master, &assigner, |gid, _, _, _| Field::new(gid))
        .unwrap();
    master
}

/// A `side x side` grid of blocks, round-robin over the world.
pub fn grid<C: Communicator>(comm: C, side: usize) -> Master<Field, C> {
    let nblocks = side * side;
    let assigner = RoundRobinAssigner::new(comm.size(), nblocks);
    let mut master = Master::new(comm, MasterConfig::default(), None).unwrap();
    let domain = Bounds::from_corners(vec![0i64, 0], vec![63, 63]);
    let dec = RegularDecomposer::builder(domain, nblocks).build().unwrap();
    dec.decompose_into(&mut master, &assigner, |gid, _, _, _| Field::new(gid))
        .unwrap();
    master
}

pub fn file_storage(dir: &std::path::Path) -> Arc<dyn ExternalStorage> {
    Arc::new(FileStorage::in_dir(dir))
}

/// `(gid, block)` for every local block, in local order.
pub fn snapshot<C: Communicator>(master: &mut Master<Field, C>) -> Vec<(Gid, Field)> {
    (0..master.size())
        .map(|lid| {
            let gid = master.gid(lid).unwrap();
            (gid, master.block(lid).unwrap().clone())
        })
        .collect()
}

/// Merge per-rank snapshots and sort by gid.
pub fn merged(per_rank: Vec<Vec<(Gid, Field)>>) -> Vec<(Gid, Field)> {
    let mut all: Vec<_> = per_rank.into_iter().flatten().collect();
    all.sort_by_key(|(gid, _)| *gid);
    all
}
