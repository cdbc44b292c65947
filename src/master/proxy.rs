//! The view a callback gets of its block's communication state.

use super::collectives::{CollectiveId, CollectiveSlot, CollectiveValues};
use super::queues::{IncomingQueues, OutgoingQueues, QueueBuffer};
use crate::algs::communicator::ReduceOp;
use crate::block_error::BlockError;
use crate::link::Link;
use crate::serialization::MemoryBuffer;
use crate::storage::ExternalStorage;
use crate::types::{BlockID, Gid};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Queues, link and collectives of the block a callback is running on.
///
/// Values enqueued to a target are concatenated into one message per
/// `(sender, receiver)` pair and delivered by the next exchange. Incoming
/// queues hold what the previous exchange delivered, keyed by sender gid.
pub struct Proxy<'a> {
    gid: Gid,
    link: &'a Link,
    round: u64,
    outgoing: &'a mut OutgoingQueues,
    incoming: Option<&'a mut IncomingQueues>,
    collectives: &'a mut CollectiveSlot,
    storage: Option<&'a Arc<dyn ExternalStorage>>,
}

impl<'a> Proxy<'a> {
    pub(crate) fn new(
        gid: Gid,
        link: &'a Link,
        round: u64,
        outgoing: &'a mut OutgoingQueues,
        incoming: Option<&'a mut IncomingQueues>,
        collectives: &'a mut CollectiveSlot,
        storage: Option<&'a Arc<dyn ExternalStorage>>,
    ) -> Self {
        Self {
            gid,
            link,
            round,
            outgoing,
            incoming,
            collectives,
            storage,
        }
    }

    pub fn gid(&self) -> Gid {
        self.gid
    }

    pub fn link(&self) -> &Link {
        self.link
    }

    /// Exchange round whose messages are currently incoming.
    pub fn round(&self) -> u64 {
        self.round
    }

    /// Raw outgoing buffer for `target`, created on first use.
    pub fn outgoing(&mut self, target: BlockID) -> Result<&mut MemoryBuffer, BlockError> {
        self.outgoing.entry(target).or_default().load(self.storage)
    }

    /// Append `value` to the message for `target`.
    pub fn enqueue<T: Serialize + ?Sized>(
        &mut self,
        target: BlockID,
        value: &T,
    ) -> Result<(), BlockError> {
        self.outgoing(target)?.save(value)
    }

    pub fn enqueue_bytes(&mut self, target: BlockID, bytes: &[u8]) -> Result<(), BlockError> {
        self.outgoing(target)?.save_bytes(bytes);
        Ok(())
    }

    /// Raw incoming buffer from `source`.
    pub fn incoming(&mut self, source: Gid) -> Result<&mut MemoryBuffer, BlockError> {
        let to = self.gid;
        self.incoming
            .as_deref_mut()
            .and_then(|queues| queues.get_mut(&source))
            .ok_or(BlockError::NoQueue { from: source, to })?
            .load(self.storage)
    }

    /// Read the next value sent by `source`.
    pub fn dequeue<T: DeserializeOwned>(&mut self, source: Gid) -> Result<T, BlockError> {
        self.incoming(source)?.load()
    }

    /// Senders that delivered a queue this round, including empty ones.
    pub fn incoming_gids(&self) -> Vec<Gid> {
        self.incoming
            .as_deref()
            .map(|queues| queues.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Some incoming queue still has unread bytes.
    pub fn has_incoming(&self) -> bool {
        self.incoming
            .as_deref()
            .is_some_and(|queues| queues.values().any(|q| q.remaining() > 0))
    }

    pub fn has_incoming_from(&self, source: Gid) -> bool {
        self.incoming
            .as_deref()
            .and_then(|queues| queues.get(&source))
            .is_some_and(|q| q.remaining() > 0)
    }

    pub fn empty_incoming_queues(&self) -> bool {
        !self.has_incoming()
    }

    pub fn empty_outgoing_queues(&self) -> bool {
        self.outgoing.values().all(|q| q.size() == 0)
    }

    pub fn empty_queues(&self) -> bool {
        self.empty_incoming_queues() && self.empty_outgoing_queues()
    }

    /// Contribute to the all-reduce `id`; the result is readable after the next exchange.
    pub fn all_reduce_f64(&mut self, id: impl Into<CollectiveId>, values: &[f64], op: ReduceOp) {
        self.collectives
            .contribute(id.into(), op, CollectiveValues::F64(values.to_vec()));
    }

    pub fn all_reduce_i64(&mut self, id: impl Into<CollectiveId>, values: &[i64], op: ReduceOp) {
        self.collectives
            .contribute(id.into(), op, CollectiveValues::I64(values.to_vec()));
    }

    /// Result of collective `id` from the last exchange.
    pub fn result_f64(&self, id: impl Into<CollectiveId>) -> Option<&[f64]> {
        self.collectives.result(id.into())?.result_f64()
    }

    pub fn result_i64(&self, id: impl Into<CollectiveId>) -> Option<&[i64]> {
        self.collectives.result(id.into())?.result_i64()
    }

    /// Bytes enqueued so far, over all targets.
    #[cfg(test)]
    pub(crate) fn outgoing_size(&self) -> usize {
        self.outgoing.values().map(QueueBuffer::size).sum()
    }
}
