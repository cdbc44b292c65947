//! Byte buffers used for block state and message queues.
//!
//! A [`MemoryBuffer`] is an append-only byte vector with a read cursor. Values
//! go in either as raw bytes, as little-endian counters or as `serde` values
//! encoded with `bincode`. Reads consume from the cursor in the order the
//! writes happened.

use crate::block_error::BlockError;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Growable byte buffer with a read position.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryBuffer {
    buffer: Vec<u8>,
    position: usize,
}

impl MemoryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap existing bytes; the cursor starts at the beginning.
    pub fn from_vec(buffer: Vec<u8>) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Total number of bytes held, independent of the read position.
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Bytes not yet consumed by reads.
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.position
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.position = 0;
    }

    /// Drop the bytes that were already read.
    pub fn compact(&mut self) {
        if self.position > 0 {
            self.buffer.drain(..self.position);
            self.position = 0;
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }

    /// Take the contents, leaving an empty buffer behind.
    pub fn take(&mut self) -> MemoryBuffer {
        std::mem::take(self)
    }

    pub fn save_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn load_bytes(&mut self, n: usize) -> Result<&[u8], BlockError> {
        if n > self.remaining() {
            return Err(BlockError::BufferUnderflow {
                requested: n,
                remaining: self.remaining(),
            });
        }
        let start = self.position;
        self.position += n;
        Ok(&self.buffer[start..start + n])
    }


    pub fn save_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn load_u64(&mut self) -> Result<u64, BlockError> {
        let bytes = self.load_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    /// Encode a serde value with bincode at the end of the buffer.
    pub fn save<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), BlockError> {
        bincode::serialize_into(&mut self.buffer, value)?;
        Ok(())
    }

    /// Decode the next serde value at the read cursor.
    pub fn load<T: DeserializeOwned>(&mut self) -> Result<T, BlockError> {
        let mut rest = &self.buffer[self.position..];
        let before = rest.len();
        let value = bincode::deserialize_from(&mut rest)?;
        self.position += before - rest.len();
        Ok(value)
    }
}

impl From<Vec<u8>> for MemoryBuffer {
    fn from(v: Vec<u8>) -> Self {
        MemoryBuffer::from_vec(v)
    }
}

/// User block contract: how the runtime saves and recreates a block.
///
/// Creation is `load`, destruction is `Drop`. Blocks must be `Send` so that
/// `foreach` can hand them to the worker thread pool.
pub trait Block: Send + 'static {
    /// Serialize the block into `buf`.
    fn save(&self, buf: &mut MemoryBuffer) -> Result<(), BlockError>;
    /// Recreate a block from bytes written by [`Block::save`].
    fn load(buf: &mut MemoryBuffer) -> Result<Self, BlockError>
    where
        Self: Sized;
}
