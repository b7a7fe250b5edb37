//! Byte-granular file I/O over the block mapping.
//!
//! A transfer at an unaligned offset is cut into a partial head block, a run of
//! whole blocks and a partial tail block; every piece goes through the buffer
//! cache.

use crate::block_dev::BlockDevice;
use crate::cache::BufferCache;
use crate::config::{BLOCK_SIZE, MAX_FILE_SIZE};
use crate::error::{FsError, Result};
use crate::inode::{Inode, bmap, block_of};
use crate::superblock::SuperBlock;

/// Splits `[offset, offset + len)` into per-block pieces:
/// `(logical block, offset within block, piece length)`.
fn pieces(offset: usize, len: usize) -> impl Iterator<Item = (usize, usize, usize)> {
    let end = offset + len;
    let mut pos = offset;
    core::iter::from_fn(move || {
        if pos >= end {
            return None;
        }
        let within = pos % BLOCK_SIZE;
        let n = (BLOCK_SIZE - within).min(end - pos);
        let piece = (pos / BLOCK_SIZE, within, n);
        pos += n;
        Some(piece)
    })
}

/// Reads from `offset` into `buffer`, clamped to the file size.
/// Returns the number of bytes read. Holes read as zeroes.
pub fn read_at<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    inode: &Inode,
    offset: usize,
    buffer: &mut [u8],
) -> Result<usize> {
    let size = inode.size as usize;
    if offset >= size {
        return Ok(0);
    }
    let len = buffer.len().min(size - offset);

    let mut done = 0;
    for (index, within, n) in pieces(offset, len) {
        let dest = &mut buffer[done..done + n];
        match block_of(cache, inode, index)? {
            Some(block_id) => {
                cache.read(block_id, |buf| dest.copy_from_slice(&buf[within..within + n]))?
            }
            None => dest.fill(0),
        }
        done += n;
    }
    Ok(done)
}

/// Writes `buffer` at `offset`, allocating blocks on demand, and raises the
/// file size to the end of the write.
///
/// If the device runs out of blocks part way, the bytes already written are
/// kept (and counted in the size) before the error is returned.
pub fn write_at<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    superblock: &mut SuperBlock,
    inode: &mut Inode,
    offset: usize,
    buffer: &[u8],
) -> Result<usize> {
    let (written, result) = write_at_partial(cache, superblock, inode, offset, buffer);
    result.map(|()| written)
}

/// Same as `write_at`, but the byte count is reported on failure too.
pub fn write_at_partial<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    superblock: &mut SuperBlock,
    inode: &mut Inode,
    offset: usize,
    buffer: &[u8],
) -> (usize, Result<()>) {
    if buffer.is_empty() {
        return (0, Ok(()));
    }
    if offset
        .checked_add(buffer.len())
        .is_none_or(|end| end > MAX_FILE_SIZE)
    {
        return (0, Err(FsError::OutOfRange));
    }

    let mut done = 0;
    let mut result = Ok(());
    for (index, within, n) in pieces(offset, buffer.len()) {
        let src = &buffer[done..done + n];
        result = bmap(cache, superblock, inode, index).and_then(|block_id| {
            cache.modify(block_id, |buf| buf[within..within + n].copy_from_slice(src))
        });
        if result.is_err() {
            break;
        }
        done += n;
    }

    if done > 0 {
        let end = (offset + done) as u32;
        inode.size = inode.size.max(end);
    }
    (done, result)
}
