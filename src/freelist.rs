//! Free data block management.
//!
//! The superblock keeps a bounded stack of free block ids. When a release finds
//! the stack full, the released block becomes an overflow node: the whole stack
//! is saved into it and the stack shrinks to that single entry. Popping the last
//! entry while free blocks remain therefore yields an overflow node, whose saved
//! stack is loaded back before the block is handed out.

use tracing::debug;

use crate::block_dev::BlockDevice;
use crate::cache::BufferCache;
use crate::config::*;
use crate::error::{FsError, Result};
use crate::ptrs::{BlockPtrs, BlockPtrsMut};
use crate::superblock::SuperBlock;

fn check_block_id(superblock: &SuperBlock, block_id: u32) -> Result<()> {
    if block_id == NULL_BLOCK || block_id >= superblock.block_count {
        return Err(FsError::Corruption {
            block: block_id,
            detail: "free list holds an id outside the data region".to_string(),
        });
    }
    Ok(())
}

/// Allocates a data block. Its cached payload is zero-filled.
pub fn alloc_data_block<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    superblock: &mut SuperBlock,
) -> Result<u32> {
    if superblock.total_free_blocks == 0 {
        return Err(FsError::Exhausted);
    }
    if superblock.free_stack_len == 0 {
        return Err(FsError::Corruption {
            block: SUPERBLOCK_ID,
            detail: "free blocks counted but free stack is empty".to_string(),
        });
    }

    let top = superblock.free_stack_len as usize - 1;
    let block_id = superblock.free_stack[top];
    check_block_id(superblock, block_id)?;

    // Overflow node: its payload is the next full stack.
    let refill = if top == 0 && superblock.total_free_blocks > 1 {
        Some(cache.read(block_id, |buf| BlockPtrs::new(buf).iter().collect::<Vec<u32>>())?)
    } else {
        None
    };
    // The superblock only changes once the block is zeroed.
    cache.fetch_zeroed(block_id)?;

    match refill {
        Some(saved) => {
            for (entry, id) in superblock.free_stack.iter_mut().zip(saved) {
                *entry = id;
            }
            superblock.free_stack_len = FREE_STACK_CAPACITY as u32;
            debug!(target: "flatfs::alloc", block_id, "refilled free stack from overflow node");
        }
        None => superblock.free_stack_len = top as u32,
    }
    superblock.total_free_blocks -= 1;

    debug!(
        target: "flatfs::alloc",
        block_id,
        free = superblock.total_free_blocks,
        "alloc block"
    );
    Ok(block_id)
}

/// Returns a data block to the free pool.
pub fn free_data_block<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    superblock: &mut SuperBlock,
    block_id: u32,
) -> Result<()> {
    check_block_id(superblock, block_id)?;

    let len = superblock.free_stack_len as usize;
    if len == FREE_STACK_CAPACITY {
        let slot = cache.fetch_zeroed(block_id)?;
        BlockPtrsMut::new(cache.data_mut(slot)).copy_from(&superblock.free_stack);
        superblock.free_stack[0] = block_id;
        superblock.free_stack_len = 1;
        debug!(target: "flatfs::alloc", block_id, "spilled free stack into overflow node");
    } else {
        superblock.free_stack[len] = block_id;
        superblock.free_stack_len += 1;
    }
    superblock.total_free_blocks += 1;
    Ok(())
}

/// Puts every data block except the reserved block 0 on the free list.
pub fn seed_free_blocks<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    superblock: &mut SuperBlock,
) -> Result<()> {
    for block_id in 1..superblock.block_count {
        free_data_block(cache, superblock, block_id)?;
    }
    Ok(())
}
