use parablock::prelude::*;
use proptest::prelude::*;

proptest! {
    #[test]
    fn contiguous_partitions_every_gid_once(size in 1usize..9, nblocks in 0usize..200) {
        let a = ContiguousAssigner::new(size, nblocks);
        let mut seen = vec![0usize; nblocks];
        for rank in 0..size {
            let local = a.local_gids(rank);
            prop_assert!(local.windows(2).all(|w| w[0] + 1 == w[1]), "not contiguous: {local:?}");
            for gid in local {
                prop_assert_eq!(a.rank(gid), rank);
                seen[gid as usize] += 1;
            }
        }
        prop_assert!(seen.iter().all(|&n| n == 1));
    }

    #[test]
    fn contiguous_is_balanced(size in 1usize..9, nblocks in 0usize..200) {
        let a = ContiguousAssigner::new(size, nblocks);
        let counts: Vec<usize> = (0..size).map(|r| a.local_gids(r).len()).collect();
        let (lo, hi) = (counts.iter().min().copied(), counts.iter().max().copied());
        prop_assert!(hi.unwrap_or(0) - lo.unwrap_or(0) <= 1, "{counts:?}");
        // remainder goes to the first ranks
        prop_assert!(counts.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn round_robin_is_modular(size in 1usize..9, nblocks in 0usize..200) {
        let a = RoundRobinAssigner::new(size, nblocks);
        for gid in 0..nblocks as Gid {
            prop_assert_eq!(a.rank(gid), gid as usize % size);
        }
        for rank in 0..size {
            prop_assert!(a.local_gids(rank).iter().all(|&g| g as usize % size == rank));
        }
    }
}

#[test]
fn dynamic_writes_are_visible_after_flush() {
    let views = LocalWorld::run(3, |comm| {
        let mut a = DynamicAssigner::new(comm.size(), 6);
        let before = a.ranks(&[0, 5]);
        // every rank claims one block of its right neighbor
        let claimed = a.local_gids((comm.rank() + 1) % 3)[0];
        a.set_rank(comm.rank(), claimed);
        assert_eq!(a.pending(), 1);
        a.flush(&comm).unwrap();
        assert_eq!(a.pending(), 0);
        (before, (0..6).map(|g| a.get_rank(g)).collect::<Vec<_>>())
    });
    for (before, after) in &views {
        assert_eq!(before, &vec![0, 2]);
        assert_eq!(after, &vec![2, 0, 0, 1, 1, 2]);
    }
}
