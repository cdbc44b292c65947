//! Round-based exchange.
//!
//! Each call to [`Master::exchange`] opens a new round, ships every outgoing
//! queue as one message per `(sender, receiver)` pair, and spins until the
//! round has landed:
//!
//! * collective mode touches every unique neighbor (empty queues become empty
//!   confirmations) and is done once all local sends were matched and
//!   `received == expected`;
//! * remote mode (NBX) sends only non-empty queues, to arbitrary targets, and
//!   is done once all local sends were matched and a non-blocking barrier
//!   posted after that completed.
//!
//! Messages tagged with a later round are kept for that round and never
//! exposed early.

use super::Master;
use super::collectives;
use super::queues;
use super::state::{ExchangeMode, ExchangePhase, ExchangeProgress};
use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{InFlightRecv, KIND_QUEUE, MessageInfo, RecvKey, parse_message, split_message};
use crate::block_error::BlockError;
use crate::serialization::Block;
use crate::storage::ExternalStorage;
use crate::types::Gid;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Send backlog, posted sends and partially received messages of one worker.
pub(crate) struct Transport<H> {
    unposted: VecDeque<(usize, Vec<u8>)>,
    in_flight: Vec<H>,
    recvs: HashMap<RecvKey, InFlightRecv>,
}

impl<H: Wait> Transport<H> {
    pub(crate) fn new() -> Self {
        Self {
            unposted: VecDeque::new(),
            in_flight: Vec::new(),
            recvs: HashMap::new(),
        }
    }

    /// Queue the pieces of one message for `peer`, in order.
    pub(crate) fn push(&mut self, peer: usize, pieces: Vec<Vec<u8>>) {
        self.unposted.extend(pieces.into_iter().map(|p| (peer, p)));
    }

    /// Retire matched sends and post queued pieces up to `cap` in flight.
    pub(crate) fn progress<C>(&mut self, comm: &C, tag: CommTag, cap: usize)
    where
        C: Communicator<SendHandle = H>,
    {
        self.in_flight.retain_mut(|h| !h.test());
        while self.in_flight.len() < cap {
            let Some((peer, bytes)) = self.unposted.pop_front() else {
                break;
            };
            self.in_flight.push(comm.isend(peer, tag, bytes));
        }
    }

    pub(crate) fn unposted(&self) -> usize {
        self.unposted.len()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.unposted.is_empty() && self.in_flight.is_empty()
    }

    /// Drain every pending transport message with `tag` and return the completed ones.
    ///
    /// Malformed pieces are logged and dropped.
    pub(crate) fn receive<C>(
        &mut self,
        comm: &C,
        tag: CommTag,
        kind: u16,
    ) -> Vec<(MessageInfo, Vec<u8>)>
    where
        C: Communicator<SendHandle = H>,
    {
        let mut complete = Vec::new();
        while let Some((source, msg)) = comm.try_recv(tag) {
            let (info, window) = match parse_message(&msg) {
                Ok(parsed) => parsed,
                Err(e) => {
                    log::warn!("dropping message from rank {source}: {e}");
                    continue;
                }
            };
            if info.kind() != kind {
                log::warn!(
                    "dropping message of kind {} from rank {source} (expected {kind})",
                    info.kind()
                );
                continue;
            }
            if info.nparts() <= 1 {
                complete.push((info, window.to_vec()));
                continue;
            }

            let key = RecvKey {
                source,
                from: info.from(),
                to: info.to(),
                round: info.round(),
            };
            if info.part() == 0 {
                match InFlightRecv::new(info, window.len()) {
                    Ok(recv) => {
                        if self.recvs.insert(key, recv).is_some() {
                            log::warn!("restarting reassembly of {key:?}, previous pieces dropped");
                        }
                    }
                    Err(e) => {
                        log::warn!("dropping {key:?}: {e}");
                        self.recvs.remove(&key);
                        continue;
                    }
                }
            }
            let Some(recv) = self.recvs.get_mut(&key) else {
                log::warn!("dropping piece {} of {key:?} without a head", info.part());
                continue;
            };
            match recv.absorb(&info, window) {
                Ok(false) => {}
                Ok(true) => {
                    if let Some(recv) = self.recvs.remove(&key) {
                        log::trace!("reassembled {} pieces of {key:?}", recv.info.nparts());
                        let head = recv.info;
                        complete.push((head, recv.into_buffer()));
                    }
                }
                Err(e) => {
                    log::warn!("dropping {key:?}: {e}");
                    self.recvs.remove(&key);
                }
            }
        }
        complete
    }
}

impl<B: Block, C: Communicator> Master<B, C> {
    /// Run deferred commands, then move all enqueued messages to their targets.
    ///
    /// Collective: every worker must call it. Afterwards the proxy exposes the
    /// messages of the new round and the results of the collectives.
    pub fn exchange(&mut self, remote: bool) -> Result<(), BlockError> {
        self.execute()?;

        // rounds up to the current one have been consumed
        let later = self.incoming.split_off(&(self.exchange_round + 1));
        let storage = self.storage.clone();
        for (_, round) in std::mem::replace(&mut self.incoming, later) {
            round.discard(storage.as_ref());
        }
        self.exchange_round += 1;
        let round = self.exchange_round;
        let mode = if remote {
            ExchangeMode::Remote
        } else {
            ExchangeMode::Collective
        };
        log::debug!(
            "rank {} entering round {round} ({mode:?}, expecting {})",
            self.comm.rank(),
            self.expected
        );

        if !remote {
            self.touch_neighbor_queues();
        }
        self.incoming.entry(round).or_default();
        self.post_outgoing(round, remote)?;

        let cap = self.config.max_in_flight_sends;
        let mut barrier: Option<C::BarrierHandle> = None;
        let mut barrier_done = false;
        loop {
            self.transport.progress(&self.comm, CommTag::EXCHANGE, cap);
            for (info, bytes) in self.transport.receive(&self.comm, CommTag::EXCHANGE, KIND_QUEUE) {
                self.deliver(info, bytes)?;
            }
            if let Some(b) = barrier.as_mut() {
                barrier_done = barrier_done || b.test();
            }
            let progress = ExchangeProgress {
                unposted: self.transport.unposted(),
                in_flight: self.transport.in_flight(),
                received: self.incoming.get(&round).map_or(0, |r| r.received),
                expected: self.expected,
                barrier_done,
            };
            match ExchangePhase::next(mode, &progress) {
                ExchangePhase::Done => break,
                ExchangePhase::BarrierPending if barrier.is_none() => {
                    barrier = Some(self.comm.ibarrier());
                }
                _ => std::thread::yield_now(),
            }
        }

        if let Some(landed) = self.incoming.get_mut(&round) {
            if mode == ExchangeMode::Collective && landed.received != self.expected {
                log::warn!(
                    "round {round} landed with {} messages, expected {}",
                    landed.received,
                    self.expected
                );
            }
            queues::page_incoming(landed, self.queue_policy.as_ref(), self.storage.as_ref());
        }
        self.process_collectives()?;
        log::debug!("rank {} finished round {round}", self.comm.rank());
        Ok(())
    }

    /// Reduce the collectives registered since the last exchange. Collective.
    pub fn process_collectives(&mut self) -> Result<(), BlockError> {
        collectives::process(&self.comm, &mut self.collectives)
    }

    /// Make sure every unique neighbor gets a (possibly empty) queue.
    fn touch_neighbor_queues(&mut self) {
        for (gid, link) in self.gids.iter().zip(&self.links) {
            let queues = self.outgoing.entry(*gid).or_default();
            for target in link.unique_targets() {
                queues.entry(target).or_default();
            }
        }
    }

    /// Hand every outgoing queue to the transport, or straight to incoming for local targets.
    fn post_outgoing(&mut self, round: u64, remote: bool) -> Result<(), BlockError> {
        let rank = self.comm.rank();
        let storage = self.storage.clone();
        let max = self.config.max_message_size;
        for from in self.gids.clone() {
            let Some(queues) = self.outgoing.get_mut(&from) else {
                continue;
            };
            for (target, mut queue) in std::mem::take(queues) {
                if remote && queue.size() == 0 {
                    continue;
                }
                let bytes = queue.take_bytes(storage.as_ref())?;
                if target.proc == rank {
                    self.deliver_local(from, target.gid, round, bytes, storage.as_ref())?;
                } else {
                    log::trace!("round {round}: {from} -> {target}, {} bytes", bytes.len());
                    let info = MessageInfo::new(KIND_QUEUE, from, target.gid, round);
                    self.transport
                        .push(target.proc, split_message(info, &bytes, max));
                }
            }
        }
        Ok(())
    }

    fn deliver_local(
        &mut self,
        from: Gid,
        to: Gid,
        round: u64,
        bytes: Vec<u8>,
        storage: Option<&Arc<dyn ExternalStorage>>,
    ) -> Result<(), BlockError> {
        if !self.lids.contains_key(&to) {
            log::warn!("round {round}: dropping message {from} -> {to}, target is not local");
            return Ok(());
        }
        self.incoming
            .entry(round)
            .or_default()
            .deliver(from, to, bytes, storage)
    }

    fn deliver(&mut self, info: MessageInfo, bytes: Vec<u8>) -> Result<(), BlockError> {
        let (from, to, round) = (info.from(), info.to(), info.round());
        if bytes.len() as u64 != info.total() {
            log::warn!(
                "message {from} -> {to} carries {} bytes, header says {}",
                bytes.len(),
                info.total()
            );
        }
        if round < self.exchange_round {
            log::warn!("dropping message {from} -> {to} of finished round {round}");
            return Ok(());
        }
        let storage = self.storage.clone();
        self.deliver_local(from, to, round, bytes, storage.as_ref())
    }
}
