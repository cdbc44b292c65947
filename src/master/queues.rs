//! Message queues and their paging.
//!
//! Every `(sender gid, receiver gid)` pair has at most one queue per round.
//! A queue is either a resident [`MemoryBuffer`] or a record of the bytes it
//! left in [`ExternalStorage`].

use crate::block_error::BlockError;
use crate::serialization::MemoryBuffer;
use crate::storage::ExternalStorage;
use crate::types::{BlockID, Gid, StorageHandle};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Descriptor of one queue: its true byte length and, when paged out, its handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QueueRecord {
    pub size: usize,
    pub external: Option<StorageHandle>,
}

#[derive(Debug)]
pub enum QueueBuffer {
    Resident(MemoryBuffer),
    Paged { size: usize, handle: StorageHandle },
}

impl Default for QueueBuffer {
    fn default() -> Self {
        QueueBuffer::Resident(MemoryBuffer::new())
    }
}

impl From<Vec<u8>> for QueueBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        QueueBuffer::Resident(MemoryBuffer::from_vec(bytes))
    }
}

impl QueueBuffer {
    pub fn record(&self) -> QueueRecord {
        match self {
            QueueBuffer::Resident(bb) => QueueRecord {
                size: bb.size(),
                external: None,
            },
            QueueBuffer::Paged { size, handle } => QueueRecord {
                size: *size,
                external: Some(*handle),
            },
        }
    }

    /// Total serialized length.
    pub fn size(&self) -> usize {
        self.record().size
    }

    /// Bytes not yet dequeued. A paged queue has not been read at all.
    pub fn remaining(&self) -> usize {
        match self {
            QueueBuffer::Resident(bb) => bb.remaining(),
            QueueBuffer::Paged { size, .. } => *size,
        }
    }

    pub fn is_resident(&self) -> bool {
        matches!(self, QueueBuffer::Resident(_))
    }

    /// Page the queue back in if needed and return its buffer.
    pub fn load(
        &mut self,
        storage: Option<&Arc<dyn ExternalStorage>>,
    ) -> Result<&mut MemoryBuffer, BlockError> {
        if let QueueBuffer::Paged { handle, .. } = *self {
            let storage = storage.ok_or(BlockError::NoStorage)?;
            let mut bb = MemoryBuffer::new();
            storage.get(handle, &mut bb, 0)?;
            *self = QueueBuffer::Resident(bb);
        }
        match self {
            QueueBuffer::Resident(bb) => Ok(bb),
            QueueBuffer::Paged { handle, .. } => Err(BlockError::UnknownHandle(*handle)),
        }
    }

    /// Move the unread part of the queue to storage.
    ///
    /// Empty queues stay resident. A failed write is logged and the queue stays resident.
    pub fn unload(&mut self, storage: &Arc<dyn ExternalStorage>) {
        let QueueBuffer::Resident(bb) = self else {
            return;
        };
        bb.compact();
        if bb.is_empty() {
            return;
        }
        let size = bb.size();
        match storage.put(bb) {
            Ok(handle) => *self = QueueBuffer::Paged { size, handle },
            Err(e) => log::warn!("keeping {size}-byte queue in memory: {e}"),
        }
    }

    /// Take the full contents, paging in first.
    pub fn take_bytes(
        &mut self,
        storage: Option<&Arc<dyn ExternalStorage>>,
    ) -> Result<Vec<u8>, BlockError> {
        Ok(self.load(storage)?.take().into_vec())
    }

    /// Append a complete message to this queue.
    pub fn append_bytes(
        &mut self,
        bytes: &[u8],
        storage: Option<&Arc<dyn ExternalStorage>>,
    ) -> Result<(), BlockError> {
        self.load(storage)?.save_bytes(bytes);
        Ok(())
    }

    /// Drop any paged copy without reading it.
    pub fn discard(self, storage: Option<&Arc<dyn ExternalStorage>>) {
        if let (QueueBuffer::Paged { handle, .. }, Some(storage)) = (self, storage) {
            storage.destroy(handle);
        }
    }
}

/// Outgoing queues of one block, keyed by destination.
pub type OutgoingQueues = BTreeMap<BlockID, QueueBuffer>;

/// Incoming queues of one block, keyed by sender gid.
pub type IncomingQueues = BTreeMap<Gid, QueueBuffer>;

/// Everything received for one exchange round.
#[derive(Debug, Default)]
pub struct IncomingRound {
    pub queues: HashMap<Gid, IncomingQueues>,
    /// Complete messages received so far this round.
    pub received: usize,
}

impl IncomingRound {
    /// Store a complete message from `from` for `to`.
    pub fn deliver(
        &mut self,
        from: Gid,
        to: Gid,
        bytes: Vec<u8>,
        storage: Option<&Arc<dyn ExternalStorage>>,
    ) -> Result<(), BlockError> {
        let queues = self.queues.entry(to).or_default();
        match queues.get_mut(&from) {
            Some(q) => q.append_bytes(&bytes, storage)?,
            None => {
                queues.insert(from, QueueBuffer::from(bytes));
            }
        }
        self.received += 1;
        Ok(())
    }

    pub fn discard(self, storage: Option<&Arc<dyn ExternalStorage>>) {
        for (_, queues) in self.queues {
            for (_, q) in queues {
                q.discard(storage);
            }
        }
    }
}

/// Decides which queues go to external storage.
pub trait QueuePolicy: Send + Sync {
    /// Page out the queue `from -> to` of `size` bytes after it landed?
    fn unload_incoming(&self, to: Gid, from: Gid, size: usize) -> bool;
    /// Page out all outgoing queues of `from`, totalling `size` bytes, after its callback?
    fn unload_outgoing(&self, from: Gid, size: usize) -> bool;
}

/// Page out anything larger than a fixed byte count.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QueueSizePolicy {
    pub size: usize,
}

impl QueueSizePolicy {
    pub fn new(size: usize) -> Self {
        Self { size }
    }
}

impl Default for QueueSizePolicy {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl QueuePolicy for QueueSizePolicy {
    fn unload_incoming(&self, _to: Gid, _from: Gid, size: usize) -> bool {
        size > self.size
    }

    fn unload_outgoing(&self, _from: Gid, size: usize) -> bool {
        size > self.size
    }
}

/// Page out outgoing queues of one block when the policy asks for it.
pub(crate) fn page_outgoing(
    from: Gid,
    queues: &mut OutgoingQueues,
    policy: &dyn QueuePolicy,
    storage: Option<&Arc<dyn ExternalStorage>>,
) {
    let Some(storage) = storage else {
        return;
    };
    let total: usize = queues.values().map(QueueBuffer::size).sum();
    if policy.unload_outgoing(from, total) {
        for q in queues.values_mut() {
            q.unload(storage);
        }
    }
}

/// Page out landed incoming queues of one round when the policy asks for it.
pub(crate) fn page_incoming(
    round: &mut IncomingRound,
    policy: &dyn QueuePolicy,
    storage: Option<&Arc<dyn ExternalStorage>>,
) {
    let Some(storage) = storage else {
        return;
    };
    for (&to, queues) in round.queues.iter_mut() {
        for (&from, q) in queues.iter_mut() {
            if policy.unload_incoming(to, from, q.size()) {
                q.unload(storage);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileStorage;

    #[test]
    fn paged_queue_reloads_unread_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn ExternalStorage> = Arc::new(FileStorage::in_dir(dir.path()));
        let mut q = QueueBuffer::from(vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
        q.load(None).unwrap().load_bytes(1).unwrap();
        q.unload(&storage);
        assert_eq!(
            q.record(),
            QueueRecord {
                size: 8,
                external: Some(0)
            }
        );
        assert_eq!(q.take_bytes(Some(&storage)).unwrap(), vec![2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn paged_queue_without_storage_fails() {
        let mut q = QueueBuffer::Paged { size: 3, handle: 9 };
        assert!(matches!(q.load(None), Err(BlockError::NoStorage)));
    }

    #[test]
    fn deliver_appends_and_counts() {
        let mut round = IncomingRound::default();
        round.deliver(1, 2, vec![1], None).unwrap();
        round.deliver(1, 2, vec![2], None).unwrap();
        round.deliver(3, 2, vec![], None).unwrap();
        assert_eq!(round.received, 3);
        let q = &round.queues[&2];
        assert_eq!(q[&1].size(), 2);
        assert_eq!(q[&3].size(), 0);
    }

    #[test]
    fn size_policy_threshold() {
        let p = QueueSizePolicy::new(10);
        assert!(!p.unload_outgoing(0, 10));
        assert!(p.unload_incoming(0, 1, 11));
    }
}
