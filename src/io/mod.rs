//! Block archives: saving all blocks of a run to disk and reading them back.
//!
//! [`write_blocks`] produces one shared file. Each worker writes its records
//! at offsets derived from an all-gather of record sizes, and rank 0 appends
//! the footer:
//!
//! ```text
//! [record]*  count:u64  (gid:u64 offset:u64 size:u64)*  extra_len:u64 extra  footer_len:u64
//! ```
//!
//! Index entries are sorted by gid and all integers are little-endian. A
//! record is the gid, the bincode-encoded [`Link`] and then whatever
//! [`Block::save`] wrote. The [`split`] module stores one file per block
//! instead.

pub mod split;

use crate::algs::communicator::Communicator;
use crate::assigner::Assigner;
use crate::block_error::BlockError;
use crate::link::Link;
use crate::master::Master;
use crate::serialization::{Block, MemoryBuffer};
use crate::types::Gid;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// One index entry of the footer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub gid: Gid,
    pub offset: u64,
    pub size: u64,
}

/// Footer of an archive written by [`write_blocks`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArchiveIndex {
    pub entries: Vec<ArchiveEntry>,
    pub extra: Vec<u8>,
}

impl ArchiveIndex {
    pub fn find(&self, gid: Gid) -> Option<&ArchiveEntry> {
        self.entries
            .binary_search_by_key(&gid, |e| e.gid)
            .ok()
            .map(|i| &self.entries[i])
    }

    fn encode(&self) -> Vec<u8> {
        let mut bb = MemoryBuffer::new();
        bb.save_u64(self.entries.len() as u64);
        for e in &self.entries {
            bb.save_u64(e.gid);
            bb.save_u64(e.offset);
            bb.save_u64(e.size);
        }
        bb.save_u64(self.extra.len() as u64);
        bb.save_bytes(&self.extra);
        let footer_len = bb.size() as u64;
        bb.save_u64(footer_len);
        bb.into_vec()
    }

    fn decode(footer: Vec<u8>) -> Result<Self, BlockError> {
        let mut bb = MemoryBuffer::from_vec(footer);
        let count = bb.load_u64()?;
        let mut entries = Vec::new();
        for _ in 0..count {
            entries.push(ArchiveEntry {
                gid: bb.load_u64()?,
                offset: bb.load_u64()?,
                size: bb.load_u64()?,
            });
        }
        let len = bb.load_u64()? as usize;
        let extra = bb.load_bytes(len)?.to_vec();
        Ok(Self { entries, extra })
    }
}

/// Serialize one block: gid, link, then the block itself.
pub(crate) fn encode_record<B: Block>(
    gid: Gid,
    link: &Link,
    block: &B,
) -> Result<Vec<u8>, BlockError> {
    let mut bb = MemoryBuffer::new();
    bb.save_u64(gid);
    link.save(&mut bb)?;
    block.save(&mut bb)?;
    Ok(bb.into_vec())
}

/// Inverse of [`encode_record`]. A stored gid other than `gid` is only logged.
pub(crate) fn decode_record<B: Block>(gid: Gid, bytes: Vec<u8>) -> Result<(B, Link), BlockError> {
    let mut bb = MemoryBuffer::from_vec(bytes);
    let stored = bb.load_u64()?;
    if stored != gid {
        log::warn!("archive record for block {gid} carries gid {stored}");
    }
    let link = Link::load(&mut bb)?;
    let block = B::load(&mut bb)?;
    if bb.remaining() > 0 {
        log::warn!("block {gid}: {} trailing bytes in archive record", bb.remaining());
    }
    Ok((block, link))
}

/// Encode every local block, paging them in as needed.
pub(crate) fn encode_local<B: Block, C: Communicator>(
    master: &mut Master<B, C>,
) -> Result<Vec<(Gid, Vec<u8>)>, BlockError> {
    let mut records = Vec::with_capacity(master.size());
    for lid in 0..master.size() {
        let gid = master.gid(lid).ok_or(BlockError::InvalidLocalId(lid))?;
        let link = master
            .link(lid)
            .cloned()
            .ok_or(BlockError::InvalidLocalId(lid))?;
        let record = encode_record(gid, &link, master.block(lid)?)?;
        records.push((gid, record));
    }
    Ok(records)
}

fn gather_u64<C: Communicator>(comm: &C, value: u64) -> Result<Vec<u64>, BlockError> {
    comm.all_gather_bytes(&value.to_le_bytes())
        .into_iter()
        .map(|bytes| MemoryBuffer::from_vec(bytes).load_u64())
        .collect()
}

/// Write every block of every worker into the archive at `path`. Collective.
///
/// `extra` is stored once, from rank 0's argument.
pub fn write_blocks<B: Block, C: Communicator>(
    path: impl AsRef<Path>,
    master: &mut Master<B, C>,
    extra: &[u8],
) -> Result<(), BlockError> {
    let path = path.as_ref();
    let records = encode_local(master)?;
    let comm = master.communicator();
    let rank = comm.rank();

    let local_size: u64 = records.iter().map(|(_, r)| r.len() as u64).sum();
    let sizes = gather_u64(comm, local_size)?;
    let start: u64 = sizes[..rank].iter().sum();
    let data_end: u64 = sizes.iter().sum();

    if rank == 0 {
        File::create(path)?;
    }
    comm.barrier();

    let mut entries = Vec::with_capacity(records.len());
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(start))?;
    let mut offset = start;
    for (gid, record) in &records {
        file.write_all(record)?;
        entries.push(ArchiveEntry {
            gid: *gid,
            offset,
            size: record.len() as u64,
        });
        offset += record.len() as u64;
    }
    file.flush()?;
    log::debug!(
        "rank {rank} wrote {} blocks at [{start}, {offset}) of {}",
        records.len(),
        path.display()
    );

    let mut bb = MemoryBuffer::new();
    let triples: Vec<(u64, u64, u64)> = entries.iter().map(|e| (e.gid, e.offset, e.size)).collect();
    bb.save(&triples)?;
    let gathered = comm.all_gather_bytes(bb.as_slice());
    if rank == 0 {
        let mut all = Vec::new();
        for bytes in gathered {
            let theirs: Vec<(u64, u64, u64)> = MemoryBuffer::from_vec(bytes).load()?;
            all.extend(theirs.into_iter().map(|(gid, offset, size)| ArchiveEntry {
                gid,
                offset,
                size,
            }));
        }
        all.sort_by_key(|e| e.gid);
        let index = ArchiveIndex {
            entries: all,
            extra: extra.to_vec(),
        };
        file.seek(SeekFrom::Start(data_end))?;
        file.write_all(&index.encode())?;
        file.flush()?;
    }
    drop(file);
    comm.barrier();
    Ok(())
}

/// Read the footer of the archive at `path`.
pub fn read_index(path: impl AsRef<Path>) -> Result<ArchiveIndex, BlockError> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len < 8 {
        return Err(BlockError::Archive(format!("{len}-byte file has no footer")));
    }
    let mut raw = [0u8; 8];
    file.seek(SeekFrom::Start(len - 8))?;
    file.read_exact(&mut raw)?;
    let footer_len = u64::from_le_bytes(raw);
    if footer_len > len - 8 {
        return Err(BlockError::Archive(format!(
            "footer of {footer_len} bytes does not fit in a {len}-byte file"
        )));
    }
    let mut footer = vec![0u8; footer_len as usize];
    file.seek(SeekFrom::Start(len - 8 - footer_len))?;
    file.read_exact(&mut footer)?;
    ArchiveIndex::decode(footer)
}

/// Add to `master` every block that `assigner` places on this worker. Collective.
///
/// Returns the extra bytes stored with the archive.
pub fn read_blocks<B: Block, C: Communicator>(
    path: impl AsRef<Path>,
    master: &mut Master<B, C>,
    assigner: &dyn Assigner,
) -> Result<Vec<u8>, BlockError> {
    let path = path.as_ref();
    let index = read_index(path)?;
    if index.entries.len() != assigner.nblocks() {
        log::warn!(
            "{} holds {} blocks, the assigner expects {}",
            path.display(),
            index.entries.len(),
            assigner.nblocks()
        );
    }
    let rank = master.communicator().rank();
    let mut file = File::open(path)?;
    for gid in assigner.local_gids(rank) {
        let entry = index
            .find(gid)
            .ok_or_else(|| BlockError::Archive(format!("block {gid} missing from archive")))?;
        let mut bytes = vec![0u8; entry.size as usize];
        file.seek(SeekFrom::Start(entry.offset))?;
        file.read_exact(&mut bytes)?;
        let (block, link) = decode_record::<B>(gid, bytes)?;
        master.add(gid, block, link)?;
    }
    log::debug!("rank {rank} read {} blocks from {}", master.size(), path.display());
    master.communicator().barrier();
    Ok(index.extra)
}
