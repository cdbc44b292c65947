mod util;

use parablock::io::split::{read_block_count, read_blocks_split, write_blocks_split};
use parablock::io::{read_blocks, read_index, write_blocks};
use parablock::prelude::*;
use util::*;

fn stamp(b: &mut Field, _: &mut Proxy<'_>) -> Result<(), BlockError> {
    b.value = b.gid as i64 * 10;
    b.reduced = vec![b.gid as f64; b.gid as usize + 1];
    Ok(())
}

#[test]
fn archive_round_trip_with_new_placement() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blocks.bin");

    let written = merged(LocalWorld::run(2, |comm| {
        let mut m = line(comm, 5, MasterConfig::default());
        m.foreach(stamp).unwrap();
        write_blocks(&path, &mut m, b"step 7").unwrap();
        snapshot(&mut m)
    }));

    let index = read_index(&path).unwrap();
    let gids: Vec<Gid> = index.entries.iter().map(|e| e.gid).collect();
    assert_eq!(gids, vec![0, 1, 2, 3, 4]);
    assert_eq!(index.extra, b"step 7");

    let read = LocalWorld::run(3, |comm| {
        let assigner = RoundRobinAssigner::new(comm.size(), 5);
        let mut m: Master<Field, _> = Master::new(comm, MasterConfig::default(), None).unwrap();
        let extra = read_blocks(&path, &mut m, &assigner).unwrap();
        m.fix_links(&assigner);
        let links_fixed = (0..m.size()).all(|lid| {
            m.link(lid)
                .unwrap()
                .neighbors()
                .iter()
                .all(|n| n.proc == assigner.rank(n.gid))
        });
        (extra, links_fixed, m.gids().to_vec(), snapshot(&mut m))
    });
    let mut back = Vec::new();
    for (rank, (extra, links_fixed, gids, snap)) in read.into_iter().enumerate() {
        assert_eq!(extra, b"step 7");
        assert!(links_fixed);
        assert!(gids.iter().all(|g| *g as usize % 3 == rank));
        back.push(snap);
    }
    assert_eq!(merged(back), written);
}

#[test]
fn links_survive_the_archive() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("one.bin");
    let mut m = line(NoComm, 3, MasterConfig::default());
    let before: Vec<Link> = (0..3).map(|lid| m.link(lid).unwrap().clone()).collect();
    write_blocks(&path, &mut m, &[]).unwrap();

    let mut m2: Master<Field, _> = Master::new(NoComm, MasterConfig::default(), None).unwrap();
    let extra = read_blocks(&path, &mut m2, &ContiguousAssigner::new(1, 3)).unwrap();
    assert!(extra.is_empty());
    let after: Vec<Link> = (0..3).map(|lid| m2.link(lid).unwrap().clone()).collect();
    assert_eq!(before, after);
    assert_eq!(m2.expected(), m.expected());
    assert!(after[1].as_discrete().is_some());
}

#[test]
fn missing_block_is_an_archive_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("short.bin");
    let mut m = line(NoComm, 2, MasterConfig::default());
    write_blocks(&path, &mut m, &[]).unwrap();
    let mut m2: Master<Field, _> = Master::new(NoComm, MasterConfig::default(), None).unwrap();
    let err = read_blocks(&path, &mut m2, &ContiguousAssigner::new(1, 3)).unwrap_err();
    assert!(matches!(err, BlockError::Archive(_)));
}

#[test]
fn split_archive_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("blocks");

    let written = merged(LocalWorld::run(2, |comm| {
        let mut m = line(comm, 4, MasterConfig::default());
        m.foreach(stamp).unwrap();
        write_blocks_split(&root, &mut m, b"meta").unwrap();
        snapshot(&mut m)
    }));
    assert!(root.join("3").is_file());
    let raw = std::fs::read(root.join("extra")).unwrap();
    assert_eq!(raw[..8], 4u64.to_le_bytes());
    assert_eq!(&raw[8..], b"meta");
    assert_eq!(read_block_count(&root).unwrap(), 4);

    let (extra, read) = {
        let mut m: Master<Field, _> = Master::new(NoComm, MasterConfig::default(), None).unwrap();
        let extra = read_blocks_split(&root, &mut m, &ContiguousAssigner::new(1, 4)).unwrap();
        (extra, snapshot(&mut m))
    };
    assert_eq!(extra, b"meta");
    assert_eq!(read, written);
}

#[test]
fn split_count_comes_from_extra() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("blocks");
    let mut m = line(NoComm, 3, MasterConfig::default());
    write_blocks_split(&root, &mut m, b"run 2").unwrap();
    std::fs::write(root.join("17"), b"stray").unwrap();

    assert_eq!(read_block_count(&root).unwrap(), 3);
    let mut m2: Master<Field, _> = Master::new(NoComm, MasterConfig::default(), None).unwrap();
    let extra = read_blocks_split(&root, &mut m2, &ContiguousAssigner::new(1, 3)).unwrap();
    assert_eq!(extra, b"run 2");
    assert_eq!(snapshot(&mut m2), snapshot(&mut m));
}

#[test]
fn mismatched_record_gid_is_read_best_effort() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("swapped");
    let mut m = line(NoComm, 2, MasterConfig::default());
    m.foreach(stamp).unwrap();
    write_blocks_split(&root, &mut m, &[]).unwrap();
    std::fs::rename(root.join("0"), root.join("tmp")).unwrap();
    std::fs::rename(root.join("1"), root.join("0")).unwrap();
    std::fs::rename(root.join("tmp"), root.join("1")).unwrap();

    let mut m2: Master<Field, _> = Master::new(NoComm, MasterConfig::default(), None).unwrap();
    read_blocks_split(&root, &mut m2, &ContiguousAssigner::new(1, 2)).unwrap();
    assert_eq!(m2.gids(), &[0 as Gid, 1]);
    // the file named 0 carries block 1, and it is loaded under the gid the assigner asked for
    assert_eq!(m2.block(0).unwrap().gid, 1);
    assert_eq!(m2.block(0).unwrap().value, 10);
    assert_eq!(m2.block(1).unwrap().gid, 0);
}

#[test]
fn paged_blocks_are_archived() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("paged.bin");
    let cfg = MasterConfig::default().with_limit(1);
    let mut m: Master<Field, _> = Master::new(NoComm, cfg, Some(file_storage(dir.path()))).unwrap();
    for gid in 0..4 {
        m.add(gid, Field::new(gid), Link::default()).unwrap();
    }
    m.foreach(stamp).unwrap();
    write_blocks(&path, &mut m, &[]).unwrap();
    assert!(m.in_memory() <= 1);

    let mut m2: Master<Field, _> = Master::new(NoComm, MasterConfig::default(), None).unwrap();
    read_blocks(&path, &mut m2, &ContiguousAssigner::new(1, 4)).unwrap();
    assert_eq!(snapshot(&mut m2), snapshot(&mut m));
}
