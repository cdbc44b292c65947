//! Fixed, versioned, little-endian wire header for queue traffic.
//!
//! Every transport message is a [`MessageInfo`] header followed by one window
//! of the queue payload. Buffers larger than one transport message are cut
//! into `nparts` windows; piece 0 is the head record and carries the total
//! size so the receiver can reserve the whole buffer up front.

use crate::block_error::BlockError;
use crate::types::Gid;
use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;
use std::mem::size_of;

/// Bump when the layout or semantics change in incompatible ways.
pub const WIRE_VERSION: u16 = 1;

/// Header bytes preceding every payload window.
pub const HEADER_SIZE: usize = size_of::<MessageInfo>();

/// Message kinds carried in the header.
pub const KIND_QUEUE: u16 = 1;
pub const KIND_IQUEUE: u16 = 2;

/// All multi-byte integers are stored pre-LE with `.to_le()` and decoded with `.from_le()`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct MessageInfo {
    pub version_le: u16,
    pub kind_le: u16,
    pub reserved_le: u32, // keep zero
    pub from_le: u64,
    pub to_le: u64,
    pub round_le: u64,
    pub nparts_le: u32,
    pub part_le: u32,
    pub total_le: u64,
}

const_assert_eq!(size_of::<MessageInfo>(), 48);

impl MessageInfo {
    pub fn new(kind: u16, from: Gid, to: Gid, round: u64) -> Self {
        Self {
            version_le: WIRE_VERSION.to_le(),
            kind_le: kind.to_le(),
            reserved_le: 0,
            from_le: from.to_le(),
            to_le: to.to_le(),
            round_le: round.to_le(),
            nparts_le: 1u32.to_le(),
            part_le: 0,
            total_le: 0,
        }
    }

    pub fn version(&self) -> u16 {
        u16::from_le(self.version_le)
    }
    pub fn kind(&self) -> u16 {
        u16::from_le(self.kind_le)
    }
    pub fn from(&self) -> Gid {
        u64::from_le(self.from_le)
    }
    pub fn to(&self) -> Gid {
        u64::from_le(self.to_le)
    }
    pub fn round(&self) -> u64 {
        u64::from_le(self.round_le)
    }
    pub fn nparts(&self) -> u32 {
        u32::from_le(self.nparts_le)
    }
    pub fn part(&self) -> u32 {
        u32::from_le(self.part_le)
    }
    pub fn total(&self) -> u64 {
        u64::from_le(self.total_le)
    }

    fn with_piece(mut self, nparts: u32, part: u32, total: u64) -> Self {
        self.nparts_le = nparts.to_le();
        self.part_le = part.to_le();
        self.total_le = total.to_le();
        self
    }
}

/// Split `payload` into transport messages no larger than `max_message_size`.
///
/// `max_message_size` is clamped so that every piece carries at least one
/// payload byte. An empty payload still produces one (header-only) message.
pub fn split_message(info: MessageInfo, payload: &[u8], max_message_size: usize) -> Vec<Vec<u8>> {
    let window = max_message_size.saturating_sub(HEADER_SIZE).max(1);
    let nparts = payload.len().div_ceil(window).max(1);
    let total = payload.len() as u64;
    let mut pieces = Vec::with_capacity(nparts);
    for part in 0..nparts {
        let start = (part * window).min(payload.len());
        let end = (start + window).min(payload.len());
        let hdr = info.with_piece(nparts as u32, part as u32, total);
        let mut msg = Vec::with_capacity(HEADER_SIZE + end - start);
        msg.extend_from_slice(bytemuck::bytes_of(&hdr));
        msg.extend_from_slice(&payload[start..end]);
        pieces.push(msg);
    }
    pieces
}

/// Split a raw transport message into its header and payload window.
pub fn parse_message(msg: &[u8]) -> Result<(MessageInfo, &[u8]), BlockError> {
    if msg.len() < HEADER_SIZE {
        return Err(BlockError::Serialization(format!(
            "message of {} bytes is shorter than the {HEADER_SIZE}-byte header",
            msg.len()
        )));
    }
    let info: MessageInfo = bytemuck::pod_read_unaligned(&msg[..HEADER_SIZE]);
    if info.version() != WIRE_VERSION {
        return Err(BlockError::Serialization(format!(
            "wire version {} (expected {WIRE_VERSION})",
            info.version()
        )));
    }
    Ok((info, &msg[HEADER_SIZE..]))
}

/// Identity of a message being reassembled.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RecvKey {
    pub source: usize,
    pub from: Gid,
    pub to: Gid,
    pub round: u64,
}

/// A partially received multi-piece message.
#[derive(Debug)]
pub struct InFlightRecv {
    pub info: MessageInfo,
    pub buffer: Vec<u8>,
    received_parts: u32,
}

impl InFlightRecv {
    /// Start reassembly from a head piece whose payload window is `window` bytes.
    ///
    /// No piece is larger than the head, so a `total` beyond `nparts * window`
    /// is a corrupt header and nothing is reserved for it.
    pub fn new(info: MessageInfo, window: usize) -> Result<Self, BlockError> {
        let bound = u64::from(info.nparts()).saturating_mul(window as u64);
        if info.total() > bound {
            return Err(BlockError::Serialization(format!(
                "{} pieces of at most {window} bytes cannot carry {} bytes",
                info.nparts(),
                info.total()
            )));
        }
        Ok(Self {
            info,
            buffer: Vec::with_capacity(info.total() as usize),
            received_parts: 0,
        })
    }

    /// Append the next window. Returns `Ok(true)` once all pieces arrived.
    pub fn absorb(&mut self, info: &MessageInfo, window: &[u8]) -> Result<bool, BlockError> {
        if info.part() != self.received_parts || info.nparts() != self.info.nparts() {
            return Err(BlockError::Serialization(format!(
                "piece {}/{} arrived while expecting {}/{}",
                info.part(),
                info.nparts(),
                self.received_parts,
                self.info.nparts()
            )));
        }
        if (self.buffer.len() + window.len()) as u64 > self.info.total() {
            return Err(BlockError::Serialization(format!(
                "piece {} overruns the announced {} bytes",
                info.part(),
                self.info.total()
            )));
        }
        self.buffer.extend_from_slice(window);
        self.received_parts += 1;
        Ok(self.is_complete())
    }

    pub fn is_complete(&self) -> bool {
        self.received_parts == self.info.nparts()
    }

    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }
}
