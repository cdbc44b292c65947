//! Per-worker block container with optional out-of-core paging.
//!
//! Each slot is either a resident block or the handle of its serialized bytes
//! in [`ExternalStorage`]. Eviction is caller driven: nothing is unloaded
//! unless [`Collection::unload`] or [`Collection::unload_all`] is called.

use crate::block_error::BlockError;
use crate::serialization::{Block, MemoryBuffer};
use crate::storage::ExternalStorage;
use crate::types::StorageHandle;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Where a block currently lives.
#[derive(Debug)]
pub enum Residency<B> {
    Resident(Box<B>),
    Paged(StorageHandle),
}

impl<B> Residency<B> {
    pub fn is_resident(&self) -> bool {
        matches!(self, Residency::Resident(_))
    }
}

pub struct Collection<B: Block> {
    slots: Vec<Residency<B>>,
    in_memory: AtomicUsize,
    storage: Option<Arc<dyn ExternalStorage>>,
}

impl<B: Block> Collection<B> {
    pub fn new(storage: Option<Arc<dyn ExternalStorage>>) -> Self {
        Self {
            slots: Vec::new(),
            in_memory: AtomicUsize::new(0),
            storage,
        }
    }

    /// Admit a resident block; returns its local index.
    pub fn add(&mut self, block: B) -> usize {
        self.slots.push(Residency::Resident(Box::new(block)));
        self.in_memory.fetch_add(1, Ordering::Relaxed);
        self.slots.len() - 1
    }

    /// Number of slots, resident or not.
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of resident blocks.
    pub fn in_memory(&self) -> usize {
        self.in_memory.load(Ordering::Relaxed)
    }

    pub fn storage(&self) -> Option<&Arc<dyn ExternalStorage>> {
        self.storage.as_ref()
    }

    pub fn is_resident(&self, i: usize) -> bool {
        self.slots.get(i).is_some_and(Residency::is_resident)
    }

    /// The block at `i` if it is resident; never touches storage.
    pub fn find(&self, i: usize) -> Option<&B> {
        match self.slots.get(i)? {
            Residency::Resident(b) => Some(&**b),
            Residency::Paged(_) => None,
        }
    }

    /// The block at `i`, paging it in first when necessary.
    pub fn get(&mut self, i: usize) -> Result<&mut B, BlockError> {
        self.load(i)?;
        match &mut self.slots[i] {
            Residency::Resident(b) => Ok(&mut **b),
            Residency::Paged(h) => Err(BlockError::UnknownHandle(*h)),
        }
    }

    /// Page in the block at `i`; no-op when already resident.
    pub fn load(&mut self, i: usize) -> Result<(), BlockError> {
        let handle = match self.slots.get(i) {
            None => return Err(BlockError::InvalidLocalId(i)),
            Some(Residency::Resident(_)) => return Ok(()),
            Some(Residency::Paged(h)) => *h,
        };
        let storage = self.storage.as_ref().ok_or(BlockError::NoStorage)?;
        let mut bb = MemoryBuffer::new();
        storage.get(handle, &mut bb, 0)?;
        let block = B::load(&mut bb)?;
        self.slots[i] = Residency::Resident(Box::new(block));
        self.in_memory.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Save the block at `i` to storage and drop it from memory.
    ///
    /// A failed storage write is logged and the block stays resident.
    pub fn unload(&mut self, i: usize) -> Result<(), BlockError> {
        let storage = self.storage.as_ref().ok_or(BlockError::NoStorage)?;
        let block = match self.slots.get(i) {
            None => return Err(BlockError::InvalidLocalId(i)),
            Some(Residency::Paged(_)) => return Ok(()),
            Some(Residency::Resident(b)) => b,
        };
        let mut bb = MemoryBuffer::new();
        block.save(&mut bb)?;
        match storage.put(&mut bb) {
            Ok(handle) => {
                self.slots[i] = Residency::Paged(handle);
                self.in_memory.fetch_sub(1, Ordering::Relaxed);
            }
            Err(e) => log::warn!("keeping block {i} resident, storage write failed: {e}"),
        }
        Ok(())
    }

    /// Unload every resident block.
    pub fn unload_all(&mut self) -> Result<(), BlockError> {
        for i in 0..self.slots.len() {
            if self.is_resident(i) {
                self.unload(i)?;
            }
        }
        Ok(())
    }

    /// Unload every resident block except `keep`.
    pub fn unload_others(&mut self, keep: usize) -> Result<(), BlockError> {
        for i in 0..self.slots.len() {
            if i != keep && self.is_resident(i) {
                self.unload(i)?;
            }
        }
        Ok(())
    }

    /// Page in every block and hand out disjoint mutable references.
    pub fn blocks_mut(&mut self) -> Result<Vec<&mut B>, BlockError> {
        for i in 0..self.slots.len() {
            self.load(i)?;
        }
        let mut out = Vec::with_capacity(self.slots.len());
        for slot in &mut self.slots {
            match slot {
                Residency::Resident(b) => out.push(&mut **b),
                Residency::Paged(h) => return Err(BlockError::UnknownHandle(*h)),
            }
        }
        Ok(out)
    }

    /// Remove slot `i` and hand its block to the caller; later indices shift down.
    pub fn release(&mut self, i: usize) -> Result<B, BlockError> {
        self.load(i)?;
        match self.slots.remove(i) {
            Residency::Resident(b) => {
                self.in_memory.fetch_sub(1, Ordering::Relaxed);
                Ok(*b)
            }
            Residency::Paged(h) => Err(BlockError::UnknownHandle(h)),
        }
    }

    /// Drop every block, discarding paged copies.
    pub fn clear(&mut self) {
        for slot in self.slots.drain(..) {
            if let (Residency::Paged(h), Some(storage)) = (slot, self.storage.as_ref()) {
                storage.destroy(h);
            }
        }
        self.in_memory.store(0, Ordering::Relaxed);
    }
}

impl<B: Block> Drop for Collection<B> {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileStorage;

    struct Payload(Vec<u32>);

    impl Block for Payload {
        fn save(&self, buf: &mut MemoryBuffer) -> Result<(), BlockError> {
            buf.save(&self.0)
        }
        fn load(buf: &mut MemoryBuffer) -> Result<Self, BlockError> {
            Ok(Payload(buf.load()?))
        }
    }

    fn with_storage() -> (tempfile::TempDir, Collection<Payload>) {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn ExternalStorage> = Arc::new(FileStorage::in_dir(dir.path()));
        (dir, Collection::new(Some(storage)))
    }

    #[test]
    fn unload_then_get_restores_payload() {
        let (_dir, mut c) = with_storage();
        let i = c.add(Payload(vec![4, 5, 6]));
        c.unload(i).unwrap();
        assert_eq!(c.in_memory(), 0);
        assert!(c.find(i).is_none());
        assert_eq!(c.get(i).unwrap().0, vec![4, 5, 6]);
        assert_eq!(c.in_memory(), 1);
    }

    #[test]
    fn unload_without_storage_is_an_error() {
        let mut c: Collection<Payload> = Collection::new(None);
        c.add(Payload(vec![1]));
        assert!(matches!(c.unload(0), Err(BlockError::NoStorage)));
        assert!(c.is_resident(0));
    }

    #[test]
    fn release_shifts_indices_and_loads_paged_blocks() {
        let (_dir, mut c) = with_storage();
        c.add(Payload(vec![0]));
        c.add(Payload(vec![1]));
        c.unload_all().unwrap();
        let b = c.release(0).unwrap();
        assert_eq!(b.0, vec![0]);
        assert_eq!(c.size(), 1);
        assert_eq!(c.get(0).unwrap().0, vec![1]);
    }

    #[test]
    fn out_of_range_index() {
        let mut c: Collection<Payload> = Collection::new(None);
        assert!(matches!(c.get(3), Err(BlockError::InvalidLocalId(3))));
    }
}
