//! Asynchronous exchange.
//!
//! [`Master::iexchange`] keeps calling a callback on every block that still
//! has work and ships outgoing queues as soon as they are worth sending. A
//! block is done once its callback reports so and it has no unread incoming
//! data; new data makes it active again.
//!
//! Global termination follows the NBX pattern with a vote: a worker that is
//! locally idle posts a non-blocking barrier and keeps serving messages. Once
//! the barrier completes, all workers sum `[dirty, sent - received]`; the
//! exchange ends when both sums are zero, otherwise everyone resumes work.

use super::Master;
use super::proxy::Proxy;
use super::queues::{self, IncomingRound};
use super::state::{TerminationPhase, Vote};
use crate::algs::communicator::{CommTag, Communicator, ReduceOp, Wait};
use crate::algs::wire::{KIND_IQUEUE, MessageInfo, split_message};
use crate::block_error::BlockError;
use crate::serialization::Block;
use crate::types::{BlockID, Gid};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// When a small outgoing queue may wait for more data.
#[derive(Copy, Clone, Debug)]
pub(crate) struct HoldPolicy {
    pub min_queue_size: usize,
    pub max_hold_time: Duration,
}

impl HoldPolicy {
    /// A queue of a block that is still working is held while it is small and young.
    pub(crate) fn holds(&self, size: usize, age: Duration, block_done: bool) -> bool {
        !block_done && size < self.min_queue_size && age < self.max_hold_time
    }
}

#[derive(Debug, Default)]
struct Counters {
    sent: i64,
    received: i64,
    /// Something happened since the last barrier was posted.
    dirty: bool,
}

struct Session {
    round: u64,
    hold: HoldPolicy,
    inbox: IncomingRound,
    done: Vec<bool>,
    held_since: HashMap<(Gid, BlockID), Instant>,
    counters: Counters,
}

impl<B: Block, C: Communicator> Master<B, C> {
    /// Run `f` until every block on every worker is done and no message is in flight.
    ///
    /// `f` returns whether its block is done. Messages it enqueues are sent
    /// once they reach `min_queue_size` bytes, once they have waited
    /// `max_hold_time`, or once the block is done, whichever comes first.
    /// Deferred commands are executed first. Collective.
    pub fn iexchange<F>(
        &mut self,
        mut f: F,
        min_queue_size: usize,
        max_hold_time: Duration,
    ) -> Result<(), BlockError>
    where
        F: FnMut(&mut B, &mut Proxy<'_>) -> Result<bool, BlockError>,
    {
        self.execute()?;
        let mut session = Session {
            round: self.exchange_round,
            hold: HoldPolicy {
                min_queue_size,
                max_hold_time,
            },
            inbox: IncomingRound::default(),
            done: vec![false; self.gids.len()],
            held_since: HashMap::new(),
            counters: Counters::default(),
        };
        log::debug!(
            "rank {} entering iexchange with {} blocks",
            self.comm.rank(),
            self.gids.len()
        );
        let result = self.iexchange_loop(&mut session, &mut f);
        let Session {
            inbox, counters, ..
        } = session;
        inbox.discard(self.storage.as_ref());
        log::debug!(
            "rank {} left iexchange: sent {}, received {}",
            self.comm.rank(),
            counters.sent,
            counters.received
        );
        result
    }

    fn iexchange_loop<F>(&mut self, s: &mut Session, f: &mut F) -> Result<(), BlockError>
    where
        F: FnMut(&mut B, &mut Proxy<'_>) -> Result<bool, BlockError>,
    {
        let cap = self.config.max_in_flight_sends;
        let mut phase = TerminationPhase::Working;
        let mut barrier: Option<C::BarrierHandle> = None;
        loop {
            self.transport.progress(&self.comm, CommTag::IEXCHANGE, cap);
            self.iexchange_receive(s)?;
            let ran = self.iexchange_run(s, f)?;
            let holding = self.iexchange_flush(s, Instant::now())?;
            self.transport.progress(&self.comm, CommTag::IEXCHANGE, cap);

            let idle = !holding && s.done.iter().all(|d| *d) && self.transport.is_idle();
            let barrier_done = barrier.as_mut().is_some_and(|b| b.test());
            let vote = if barrier_done {
                let dirty = i64::from(s.counters.dirty || !idle);
                let in_transit = s.counters.sent - s.counters.received;
                let sums = self
                    .comm
                    .all_reduce_i64(&[dirty, in_transit], ReduceOp::Sum);
                Some(Vote::from_sums(&sums))
            } else {
                None
            };

            let next = phase.next(idle, barrier_done, vote);
            match (phase, next) {
                (TerminationPhase::Working, TerminationPhase::BarrierPending) => {
                    barrier = Some(self.comm.ibarrier());
                    s.counters.dirty = false;
                }
                (TerminationPhase::BarrierPending, TerminationPhase::Working) => {
                    log::trace!("rank {}: termination vote {vote:?}, resuming", self.comm.rank());
                    barrier = None;
                }
                _ => {}
            }
            phase = next;
            if phase == TerminationPhase::Done {
                return Ok(());
            }
            if !ran {
                std::thread::yield_now();
            }
        }
    }

    fn iexchange_receive(&mut self, s: &mut Session) -> Result<(), BlockError> {
        let storage = self.storage.clone();
        let mut landed = false;
        for (info, bytes) in self
            .transport
            .receive(&self.comm, CommTag::IEXCHANGE, KIND_IQUEUE)
        {
            s.counters.received += 1;
            s.counters.dirty = true;
            let (from, to) = (info.from(), info.to());
            let Some(&lid) = self.lids.get(&to) else {
                log::warn!("iexchange: dropping message {from} -> {to}, target is not local");
                continue;
            };
            s.done[lid] = false;
            s.inbox.deliver(from, to, bytes, storage.as_ref())?;
            landed = true;
        }
        if landed {
            queues::page_incoming(&mut s.inbox, self.queue_policy.as_ref(), storage.as_ref());
        }
        Ok(())
    }

    /// Call `f` on every block that is not done. Returns whether any block ran.
    fn iexchange_run<F>(&mut self, s: &mut Session, f: &mut F) -> Result<bool, BlockError>
    where
        F: FnMut(&mut B, &mut Proxy<'_>) -> Result<bool, BlockError>,
    {
        let mut ran = false;
        for lid in 0..self.gids.len() {
            if s.done[lid] {
                continue;
            }
            let gid = self.gids[lid];
            self.admit(lid)?;
            let block = self.blocks.get(lid)?;
            let storage = self.storage.as_ref();
            let outgoing = self.outgoing.entry(gid).or_default();
            let incoming = s.inbox.queues.get_mut(&gid);
            let slot = self.collectives.entry(gid).or_default();
            let mut proxy = Proxy::new(
                gid,
                &self.links[lid],
                s.round,
                &mut *outgoing,
                incoming,
                slot,
                storage,
            );
            let finished = f(block, &mut proxy)?;
            let drained = proxy.empty_incoming_queues();
            drop(proxy);
            queues::page_outgoing(gid, outgoing, self.queue_policy.as_ref(), storage);

            s.done[lid] = finished && drained;
            if let Some(queues) = s.inbox.queues.get_mut(&gid) {
                queues.retain(|_, q| q.remaining() > 0);
            }
            if let Some(limit) = self.config.limit {
                if self.blocks.in_memory() > limit {
                    self.blocks.unload(lid)?;
                }
            }
            ran = true;
        }
        if ran {
            s.counters.dirty = true;
        }
        Ok(ran)
    }

    /// Send every queue that is not held. Returns whether some queue is still held.
    fn iexchange_flush(&mut self, s: &mut Session, now: Instant) -> Result<bool, BlockError> {
        let rank = self.comm.rank();
        let storage = self.storage.clone();
        let max = self.config.max_message_size;
        let mut holding = false;
        let mut landed = false;
        for lid in 0..self.gids.len() {
            let from = self.gids[lid];
            let Some(queues) = self.outgoing.get_mut(&from) else {
                continue;
            };
            let mut ready = Vec::new();
            for (target, q) in queues.iter() {
                if q.size() == 0 {
                    continue;
                }
                let since = *s.held_since.entry((from, *target)).or_insert(now);
                if s.hold.holds(q.size(), now.duration_since(since), s.done[lid]) {
                    holding = true;
                } else {
                    ready.push(*target);
                }
            }

            for target in ready {
                let Some(mut q) = queues.remove(&target) else {
                    continue;
                };
                s.held_since.remove(&(from, target));
                let bytes = q.take_bytes(storage.as_ref())?;
                s.counters.sent += 1;
                s.counters.dirty = true;
                if target.proc != rank {
                    log::trace!("iexchange: {from} -> {target}, {} bytes", bytes.len());
                    let info = MessageInfo::new(KIND_IQUEUE, from, target.gid, s.round);
                    self.transport
                        .push(target.proc, split_message(info, &bytes, max));
                    continue;
                }
                s.counters.received += 1;
                match self.lids.get(&target.gid) {
                    Some(&to_lid) => {
                        s.done[to_lid] = false;
                        s.inbox.deliver(from, target.gid, bytes, storage.as_ref())?;
                        landed = true;
                    }
                    None => log::warn!(
                        "iexchange: dropping message {from} -> {}, target is not local",
                        target.gid
                    ),
                }
            }
        }
        if landed {
            queues::page_incoming(&mut s.inbox, self.queue_policy.as_ref(), storage.as_ref());
        }
        Ok(holding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{LocalWorld, NoComm};
    use crate::assigner::{Assigner, ContiguousAssigner};
    use crate::link::{Link, PlainLink};
    use crate::master::MasterConfig;
    use crate::serialization::MemoryBuffer;

    #[derive(Debug, Default)]
    struct Hop {
        started: bool,
        seen: u64,
    }

    impl Block for Hop {
        fn save(&self, buf: &mut MemoryBuffer) -> Result<(), BlockError> {
            buf.save(&(self.started, self.seen))
        }
        fn load(buf: &mut MemoryBuffer) -> Result<Self, BlockError> {
            let (started, seen) = buf.load()?;
            Ok(Hop { started, seen })
        }
    }

    /// Block 0 injects a token with `hops` remaining; each receiver forwards it around the ring.
    fn relay(
        next: impl Fn(Gid) -> BlockID,
        hops: u32,
    ) -> impl FnMut(&mut Hop, &mut Proxy<'_>) -> Result<bool, BlockError> {
        move |b: &mut Hop, p: &mut Proxy<'_>| {
            let to = next(p.gid());
            if !b.started {
                b.started = true;
                if p.gid() == 0 {
                    p.enqueue(to, &hops)?;
                }
            }
            for src in p.incoming_gids() {
                while p.has_incoming_from(src) {
                    let left: u32 = p.dequeue(src)?;
                    b.seen += 1;
                    if left > 0 {
                        p.enqueue(to, &(left - 1))?;
                    }
                }
            }
            Ok(true)
        }
    }

    fn ring_master<C: Communicator>(comm: C, assigner: &dyn Assigner) -> Master<Hop, C> {
        let n = assigner.nblocks() as Gid;
        let mut m = Master::new(comm, MasterConfig::default(), None).unwrap();
        for gid in assigner.local_gids(m.communicator().rank()) {
            let next = (gid + 1) % n;
            let link = PlainLink::with_neighbors(vec![BlockID::new(next, assigner.rank(next))]);
            m.add(gid, Hop::default(), Link::from(link)).unwrap();
        }
        m
    }

    fn total_seen<C: Communicator>(m: &mut Master<Hop, C>) -> u64 {
        (0..m.size()).map(|lid| m.block(lid).unwrap().seen).sum()
    }

    #[test]
    fn hold_policy() {
        let hold = HoldPolicy {
            min_queue_size: 64,
            max_hold_time: Duration::from_millis(10),
        };
        assert!(hold.holds(8, Duration::ZERO, false));
        assert!(!hold.holds(8, Duration::ZERO, true));
        assert!(!hold.holds(64, Duration::ZERO, false));
        assert!(!hold.holds(8, Duration::from_millis(10), false));
    }

    #[test]
    fn token_circulates_on_one_worker() {
        let assigner = ContiguousAssigner::new(1, 3);
        let mut m = ring_master(NoComm, &assigner);
        let next = |gid: Gid| BlockID::new((gid + 1) % 3, 0);
        m.iexchange(relay(next, 7), 0, Duration::ZERO).unwrap();
        assert_eq!(total_seen(&mut m), 8);
    }

    #[test]
    fn token_circulates_across_workers() {
        let seen = LocalWorld::run(2, |comm| {
            let assigner = ContiguousAssigner::new(2, 4);
            let mut m = ring_master(comm, &assigner);
            let next = |gid: Gid| {
                let g = (gid + 1) % 4;
                BlockID::new(g, assigner.rank(g))
            };
            m.iexchange(relay(next, 10), 0, Duration::ZERO).unwrap();
            total_seen(&mut m)
        });
        assert_eq!(seen.iter().sum::<u64>(), 11);
    }

    #[test]
    fn held_messages_go_out_when_blocks_finish() {
        let seen = LocalWorld::run(2, |comm| {
            let assigner = ContiguousAssigner::new(2, 4);
            let mut m = ring_master(comm, &assigner);
            let next = |gid: Gid| {
                let g = (gid + 1) % 4;
                BlockID::new(g, assigner.rank(g))
            };
            m.iexchange(relay(next, 5), 1 << 20, Duration::from_secs(3600))
                .unwrap();
            total_seen(&mut m)
        });
        assert_eq!(seen.iter().sum::<u64>(), 6);
    }
}
