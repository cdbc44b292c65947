//! Directory archives: one file per block, named by its gid, plus an `extra`
//! file holding the total block count (u64 LE) followed by the user metadata.

use super::{decode_record, encode_local, gather_u64};
use crate::algs::communicator::Communicator;
use crate::assigner::Assigner;
use crate::block_error::BlockError;
use crate::master::Master;
use crate::serialization::{Block, MemoryBuffer};
use crate::types::Gid;
use std::fs;
use std::path::{Path, PathBuf};

const EXTRA_FILE: &str = "extra";

fn block_path(dir: &Path, gid: Gid) -> PathBuf {
    dir.join(gid.to_string())
}

/// Write each local block to `dir/<gid>`; rank 0 writes `extra`. Collective.
pub fn write_blocks_split<B: Block, C: Communicator>(
    dir: impl AsRef<Path>,
    master: &mut Master<B, C>,
    extra: &[u8],
) -> Result<(), BlockError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    let records = encode_local(master)?;
    for (gid, record) in &records {
        fs::write(block_path(dir, *gid), record)?;
    }
    let comm = master.communicator();
    let total: u64 = gather_u64(comm, records.len() as u64)?.iter().sum();
    if comm.rank() == 0 {
        let mut bb = MemoryBuffer::new();
        bb.save_u64(total);
        bb.save_bytes(extra);
        fs::write(dir.join(EXTRA_FILE), bb.as_slice())?;
    }
    log::debug!(
        "rank {} wrote {} block files to {}",
        comm.rank(),
        records.len(),
        dir.display()
    );
    comm.barrier();
    Ok(())
}

/// Number of block files in `dir`.
fn count_blocks(dir: &Path) -> Result<usize, BlockError> {
    let mut n = 0;
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        if name.to_str().is_some_and(|s| s.parse::<Gid>().is_ok()) {
            n += 1;
        }
    }
    Ok(n)
}

/// Split the `extra` file into the stored block count and the user metadata.
fn decode_extra(bytes: Vec<u8>) -> Result<(u64, Vec<u8>), BlockError> {
    if bytes.len() < 8 {
        return Err(BlockError::Archive(format!(
            "{}-byte extra file has no block count",
            bytes.len()
        )));
    }
    let mut bb = MemoryBuffer::from_vec(bytes);
    let count = bb.load_u64()?;
    let rest = bb.remaining();
    Ok((count, bb.load_bytes(rest)?.to_vec()))
}

/// Load the blocks `assigner` places on this worker from `dir`. Collective.
///
/// Returns the metadata stored in `extra`, empty if the file is missing.
pub fn read_blocks_split<B: Block, C: Communicator>(
    dir: impl AsRef<Path>,
    master: &mut Master<B, C>,
    assigner: &dyn Assigner,
) -> Result<Vec<u8>, BlockError> {
    let dir = dir.as_ref();
    let (count, extra) = match fs::read(dir.join(EXTRA_FILE)) {
        Ok(bytes) => {
            let (count, extra) = decode_extra(bytes)?;
            (Some(count), extra)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::warn!("{} has no extra file", dir.display());
            (None, Vec::new())
        }
        Err(e) => return Err(e.into()),
    };
    let found = count_blocks(dir)?;
    let count = match count {
        Some(count) => {
            if count as usize != found {
                log::warn!(
                    "{} records {count} blocks but holds {found} block files",
                    dir.display()
                );
            }
            count as usize
        }
        None => found,
    };
    if count != assigner.nblocks() {
        log::warn!(
            "{} holds {count} blocks, the assigner expects {}",
            dir.display(),
            assigner.nblocks()
        );
    }
    let rank = master.communicator().rank();
    for gid in assigner.local_gids(rank) {
        let bytes = fs::read(block_path(dir, gid))?;
        let (block, link) = decode_record::<B>(gid, bytes)?;
        master.add(gid, block, link)?;
    }
    master.communicator().barrier();
    Ok(extra)
}

/// Block count recorded in the `extra` file of `dir`.
pub fn read_block_count(dir: impl AsRef<Path>) -> Result<u64, BlockError> {
    let bytes = fs::read(dir.as_ref().join(EXTRA_FILE))?;
    Ok(decode_extra(bytes)?.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extra_needs_a_block_count() {
        assert!(matches!(decode_extra(vec![1, 2, 3]), Err(BlockError::Archive(_))));
        let mut raw = 5u64.to_le_bytes().to_vec();
        raw.extend_from_slice(b"meta");
        assert_eq!(decode_extra(raw).unwrap(), (5, b"meta".to_vec()));
    }
}
