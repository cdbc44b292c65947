use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use std::time::Duration;

use parablock::prelude::*;

struct Payload(Vec<u8>);

impl Block for Payload {
    fn save(&self, buf: &mut MemoryBuffer) -> Result<(), BlockError> {
        buf.save(&self.0)
    }
    fn load(buf: &mut MemoryBuffer) -> Result<Self, BlockError> {
        Ok(Payload(buf.load()?))
    }
}

fn payload(gid: Gid, bytes: usize) -> Payload {
    let mut rng = SmallRng::seed_from_u64(gid);
    let mut data = vec![0u8; bytes];
    rng.fill_bytes(&mut data);
    Payload(data)
}

/// 2-D grid of `side * side` blocks over `ranks` in-process workers.
fn grid_master(comm: LocalComm, side: usize, bytes: usize) -> Master<Payload, LocalComm> {
    let nblocks = side * side;
    let assigner = ContiguousAssigner::new(comm.size(), nblocks);
    let mut master = Master::new(comm, MasterConfig::default(), None).unwrap();
    let domain = Bounds::from_corners(vec![0i64, 0], vec![1023, 1023]);
    let dec = RegularDecomposer::builder(domain, nblocks).build().unwrap();
    dec.decompose_into(&mut master, &assigner, |gid, _, _, _| payload(gid, bytes))
        .unwrap();
    master
}

fn ship_to_neighbors(b: &mut Payload, p: &mut Proxy<'_>) -> Result<(), BlockError> {
    for target in p.link().unique_targets() {
        p.enqueue_bytes(target, &b.0)?;
    }
    Ok(())
}

fn bench_exchange(c: &mut Criterion) {
    let mut group = c.benchmark_group("exchange");
    group.measurement_time(Duration::from_secs(5));

    for &bytes in &[64usize, 4096, 65536] {
        group.bench_with_input(BenchmarkId::new("collective", bytes), &bytes, |bch, &bytes| {
            bch.iter(|| {
                LocalWorld::run(4, |comm| {
                    let mut m = grid_master(comm, 4, bytes);
                    m.foreach(ship_to_neighbors).unwrap();
                    m.exchange(false).unwrap();
                })
            })
        });
        group.bench_with_input(BenchmarkId::new("remote", bytes), &bytes, |bch, &bytes| {
            bch.iter(|| {
                LocalWorld::run(4, |comm| {
                    let mut m = grid_master(comm, 4, bytes);
                    m.foreach(ship_to_neighbors).unwrap();
                    m.exchange(true).unwrap();
                })
            })
        });
    }
    group.finish();
}

fn bench_all_reduce(c: &mut Criterion) {
    c.bench_function("all_reduce_16_blocks", |bch| {
        bch.iter(|| {
            LocalWorld::run(4, |comm| {
                let mut m = grid_master(comm, 4, 8);
                m.foreach(|b: &mut Payload, p: &mut Proxy<'_>| {
                    p.all_reduce_i64(CollectiveId(0), &[b.0.len() as i64], ReduceOp::Sum);
                    Ok(())
                })
                .unwrap();
                m.exchange(false).unwrap();
            })
        })
    });
}

criterion_group!(benches, bench_exchange, bench_all_reduce);
criterion_main!(benches);
