mod util;

use parablock::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use util::*;

/// Spread the minimum gid over the grid; a block forwards only improvements.
fn flood_min(b: &mut Field, p: &mut Proxy<'_>) -> Result<bool, BlockError> {
    let first = !b.started;
    b.started = true;
    let mut best = b.value;
    for src in p.incoming_gids() {
        while p.has_incoming_from(src) {
            let v: i64 = p.dequeue(src)?;
            b.received.push(src);
            best = best.min(v);
        }
    }
    if first || best < b.value {
        b.value = best;
        for target in p.link().unique_targets() {
            p.enqueue(target, &best)?;
        }
    }
    Ok(true)
}

/// Like [`flood_min`], but a block stays active until it has heard from someone.
fn flood_min_until_heard(b: &mut Field, p: &mut Proxy<'_>) -> Result<bool, BlockError> {
    flood_min(b, p)?;
    Ok(!b.received.is_empty())
}

type Callback = fn(&mut Field, &mut Proxy<'_>) -> Result<bool, BlockError>;

fn flood(ranks: usize, f: Callback, min_queue_size: usize, hold: Duration) -> Vec<(Gid, Field)> {
    merged(LocalWorld::run(ranks, |comm| {
        let mut m = grid(comm, 3);
        m.iexchange(f, min_queue_size, hold).unwrap();
        snapshot(&mut m)
    }))
}

#[test]
fn minimum_floods_the_grid() {
    let blocks = flood(3, flood_min, 0, Duration::ZERO);
    assert_eq!(blocks.len(), 9);
    for (gid, b) in &blocks {
        assert_eq!(b.value, 0, "block {gid}");
        assert!(!b.received.is_empty(), "block {gid} heard nothing");
    }
}

#[test]
fn holding_small_messages_still_terminates() {
    // every first message is small and its sender still busy, so it waits out the hold time
    let blocks = flood(2, flood_min_until_heard, 1 << 16, Duration::from_millis(2));
    assert!(blocks.iter().all(|(_, b)| b.value == 0));
}

#[test]
fn serial_run_matches_distributed_result() {
    let serial = merged(vec![{
        let mut m = grid(NoComm, 3);
        m.iexchange(flood_min, 0, Duration::ZERO).unwrap();
        snapshot(&mut m)
    }]);
    let values = |blocks: &[(Gid, Field)]| blocks.iter().map(|(_, b)| b.value).collect::<Vec<_>>();
    assert_eq!(values(&serial), values(&flood(4, flood_min, 0, Duration::ZERO)));
}

#[test]
fn iexchange_runs_deferred_commands_first() {
    let mut m = line(NoComm, 3, MasterConfig::default().with_immediate(false));
    m.foreach(|b: &mut Field, _: &mut Proxy<'_>| {
        b.value += 100;
        Ok(())
    })
    .unwrap();
    m.iexchange(flood_min, 0, Duration::ZERO).unwrap();
    let values: Vec<i64> = snapshot(&mut m).into_iter().map(|(_, b)| b.value).collect();
    assert_eq!(values, vec![100, 100, 100]);
}

#[test]
fn held_queues_are_paged_to_storage() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStorage::in_dir(dir.path()));
    let shared: Arc<dyn ExternalStorage> = store.clone();
    let cfg = MasterConfig::default().with_queue_unload_size(16);
    let mut m: Master<Field, _> = Master::new(NoComm, cfg, Some(shared)).unwrap();
    for gid in 0..2u64 {
        let link = PlainLink::with_neighbors(vec![BlockID::new(1 - gid, 0)]);
        m.add(gid, Field::new(gid), Link::from(link)).unwrap();
    }

    let mut records_while_held = 0;
    m.iexchange(
        |b: &mut Field, p: &mut Proxy<'_>| {
            if p.gid() == 0 {
                if !b.started {
                    b.started = true;
                    p.enqueue(BlockID::new(1, 0), &vec![7i64; 16])?;
                    return Ok(false);
                }
                records_while_held = records_while_held.max(store.len());
                return Ok(true);
            }
            for src in p.incoming_gids() {
                while p.has_incoming_from(src) {
                    let v: Vec<i64> = p.dequeue(src)?;
                    b.value += v.iter().sum::<i64>();
                    b.received.push(src);
                }
            }
            Ok(true)
        },
        1 << 20,
        Duration::from_secs(3600),
    )
    .unwrap();

    assert!(records_while_held >= 1, "held queue stayed in memory");
    let b1 = m.block(1).unwrap();
    assert_eq!(b1.received, vec![0]);
    assert_eq!(b1.value, 1 + 7 * 16);
    assert!(store.is_empty());
}
