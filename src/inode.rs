//! Inode records, the in-memory inode table and block mapping.
//!
//! The table is loaded wholesale at mount and written back wholesale at unmount.
//! Unused inodes form a singly linked free list through `next_free`, headed by
//! the superblock.
//!
//! An inode starts with up to `NUM_BLOCK_PTRS` direct data block pointers. The
//! first write past them promotes the inode: the direct pointers move into a new
//! indirection block that becomes `block_ptrs[0]`, and from then on
//! `block_ptrs[n / PTRS_PER_BLOCK]` names the indirection block that maps
//! logical block `n`.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::block_dev::BlockDevice;
use crate::cache::{BufferCache, SlotId};
use crate::config::*;
use crate::error::{FsError, Result};
use crate::freelist::{alloc_data_block, free_data_block};
use crate::ptrs::{BlockPtrs, BlockPtrsMut};
use crate::superblock::SuperBlock;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct InodeMode: u32 {
        const DIRECTORY = 1 << 0;
        /// `block_ptrs` name indirection blocks rather than data blocks.
        const INDIRECT = 1 << 1;
    }
}

impl Default for InodeMode {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub mode: InodeMode,
    pub block_ptrs: [u32; NUM_BLOCK_PTRS],
    pub size: u32,
    /// Directory entries stored; meaningless for regular files.
    pub entry_count: u32,
    /// Free-list link while the inode is unused.
    pub next_free: u32,
    pub link_count: u32,
    /// Bumped each time the inode is handed out again.
    pub generation: u32,
}

impl Inode {
    pub fn is_dir(&self) -> bool {
        self.mode.contains(InodeMode::DIRECTORY)
    }

    pub fn is_indirect(&self) -> bool {
        self.mode.contains(InodeMode::INDIRECT)
    }
}

#[derive(Debug, Clone)]
pub struct InodeTable {
    inodes: Vec<Inode>,
}

impl InodeTable {
    /// A fresh table: inode 0 is the (still empty) root directory, every other
    /// inode is threaded onto the free list in ascending order.
    pub fn format(superblock: &mut SuperBlock) -> Self {
        let count = superblock.inode_count as usize;
        let mut inodes = vec![Inode::default(); count];
        for id in 1..count {
            inodes[id].next_free = if id + 1 < count { id as u32 + 1 } else { 0 };
        }
        inodes[ROOT_INODE_ID as usize] = Inode {
            mode: InodeMode::DIRECTORY,
            link_count: 1,
            ..Inode::default()
        };
        superblock.free_inode_head = if count > 1 { 1 } else { 0 };
        Self { inodes }
    }

    pub fn load<D: BlockDevice>(device: &mut D, superblock: &SuperBlock) -> Result<Self> {
        let count = superblock.inode_count as usize;
        let mut inodes = Vec::with_capacity(count);
        let mut buf = Box::new([0u8; BLOCK_SIZE]);
        for i in 0..superblock.inode_table_blocks() {
            device.read_block(INODE_TABLE_START + i, &mut buf)?;
            for record in buf.chunks_exact(INODE_SIZE) {
                if inodes.len() == count {
                    break;
                }
                inodes.push(bincode::deserialize::<Inode>(record)?);
            }
        }
        debug!(target: "flatfs::inode", count, "inode table loaded");
        Ok(Self { inodes })
    }

    pub fn store<D: BlockDevice>(&self, device: &mut D) -> Result<()> {
        let mut buf = Box::new([0u8; BLOCK_SIZE]);
        for (i, chunk) in self.inodes.chunks(INODES_PER_BLOCK).enumerate() {
            buf.fill(0);
            for (record, inode) in buf.chunks_exact_mut(INODE_SIZE).zip(chunk) {
                let bytes = bincode::serialize(inode)?;
                record[..bytes.len()].copy_from_slice(&bytes);
            }
            device.write_block(INODE_TABLE_START + i as u32, &buf)?;
        }
        Ok(())
    }

    pub fn get(&self, inode_id: u32) -> Result<&Inode> {
        self.inodes
            .get(inode_id as usize)
            .ok_or_else(|| bad_inode(inode_id))
    }

    pub fn get_mut(&mut self, inode_id: u32) -> Result<&mut Inode> {
        self.inodes
            .get_mut(inode_id as usize)
            .ok_or_else(|| bad_inode(inode_id))
    }

    /// Pops an inode off the free list and resets it to an empty regular file
    /// with one link.
    pub fn alloc(&mut self, superblock: &mut SuperBlock) -> Result<u32> {
        let inode_id = superblock.free_inode_head;
        if inode_id == 0 {
            return Err(FsError::NoFreeInode);
        }
        let inode = self.get_mut(inode_id)?;
        if inode.link_count != 0 {
            return Err(FsError::Corruption {
                block: INODE_TABLE_START + inode_id / INODES_PER_BLOCK as u32,
                detail: format!("inode {inode_id} on the free list is still linked"),
            });
        }
        superblock.free_inode_head = inode.next_free;
        *inode = Inode {
            link_count: 1,
            generation: inode.generation.wrapping_add(1),
            ..Inode::default()
        };
        debug!(target: "flatfs::inode", inode_id, "alloc inode");
        Ok(inode_id)
    }

    /// Pushes an inode onto the free list. Its blocks must already be released.
    pub fn release(&mut self, superblock: &mut SuperBlock, inode_id: u32) -> Result<()> {
        if inode_id == ROOT_INODE_ID {
            return Err(FsError::Busy);
        }
        let head = superblock.free_inode_head;
        let inode = self.get_mut(inode_id)?;
        *inode = Inode {
            next_free: head,
            generation: inode.generation,
            ..Inode::default()
        };
        superblock.free_inode_head = inode_id;
        debug!(target: "flatfs::inode", inode_id, "release inode");
        Ok(())
    }
}

fn bad_inode(inode_id: u32) -> FsError {
    FsError::Corruption {
        block: INODE_TABLE_START,
        detail: format!("inode id {inode_id} outside the inode table"),
    }
}

/// Moves the direct pointers into a new indirection block.
fn promote<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    superblock: &mut SuperBlock,
    inode: &mut Inode,
) -> Result<()> {
    let indirect = alloc_data_block(cache, superblock)?;
    let direct = inode.block_ptrs;
    cache.modify(indirect, |buf| BlockPtrsMut::new(buf).copy_from(&direct))?;
    inode.block_ptrs = [NULL_BLOCK; NUM_BLOCK_PTRS];
    inode.block_ptrs[0] = indirect;
    inode.mode.insert(InodeMode::INDIRECT);
    debug!(target: "flatfs::inode", indirect, "promoted to indirect addressing");
    Ok(())
}

fn check_index(index: usize) -> Result<()> {
    if index >= NUM_BLOCK_PTRS * PTRS_PER_BLOCK {
        return Err(FsError::OutOfRange);
    }
    Ok(())
}

/// Looks up the data block backing logical block `index`; a hole is `None`.
pub fn block_of<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    inode: &Inode,
    index: usize,
) -> Result<Option<u32>> {
    check_index(index)?;
    let block_id = if !inode.is_indirect() {
        match inode.block_ptrs.get(index) {
            Some(&ptr) => ptr,
            None => return Ok(None),
        }
    } else {
        let indirect = inode.block_ptrs[index / PTRS_PER_BLOCK];
        if indirect == NULL_BLOCK {
            return Ok(None);
        }
        cache
            .read(indirect, |buf| BlockPtrs::new(buf).get(index % PTRS_PER_BLOCK))?
            .unwrap_or(NULL_BLOCK)
    };
    Ok((block_id != NULL_BLOCK).then_some(block_id))
}

/// Maps logical block `index` of `inode` to a data block id, allocating the
/// block, its indirection block and the promotion as needed.
pub fn bmap<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    superblock: &mut SuperBlock,
    inode: &mut Inode,
    index: usize,
) -> Result<u32> {
    if let Some(block_id) = block_of(cache, inode, index)? {
        return Ok(block_id);
    }

    if !inode.is_indirect() {
        if index < NUM_BLOCK_PTRS {
            let block_id = alloc_data_block(cache, superblock)?;
            inode.block_ptrs[index] = block_id;
            return Ok(block_id);
        }
        promote(cache, superblock, inode)?;
        // Promotion can only have moved blocks below `index`.
    }

    let slot = index / PTRS_PER_BLOCK;
    let mut indirect = inode.block_ptrs[slot];
    if indirect == NULL_BLOCK {
        indirect = alloc_data_block(cache, superblock)?;
        inode.block_ptrs[slot] = indirect;
    }
    // Allocating may recycle the cache slot, so the pointer is stored after it.
    let block_id = alloc_data_block(cache, superblock)?;
    cache.modify(indirect, |buf| {
        BlockPtrsMut::new(buf).set(index % PTRS_PER_BLOCK, block_id)
    })?;
    Ok(block_id)
}

/// Frees every data and indirection block the inode owns and clears its layout.
///
/// Each pointer is cleared as soon as its block is freed, so a call that fails
/// part way can be retried without freeing anything twice.
pub fn release_blocks<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    superblock: &mut SuperBlock,
    inode: &mut Inode,
) -> Result<()> {
    for k in 0..NUM_BLOCK_PTRS {
        let ptr = inode.block_ptrs[k];
        if ptr == NULL_BLOCK {
            continue;
        }
        if inode.is_indirect() {
            let slot = cache.fetch(ptr)?;
            cache.pin(slot);
            let result = release_indirect(cache, superblock, slot);
            cache.unpin(slot);
            result?;
        }
        free_data_block(cache, superblock, ptr)?;
        inode.block_ptrs[k] = NULL_BLOCK;
    }
    inode.mode.remove(InodeMode::INDIRECT);
    inode.size = 0;
    Ok(())
}

/// Frees the data blocks listed in the pinned indirection block at `slot`.
fn release_indirect<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    superblock: &mut SuperBlock,
    slot: SlotId,
) -> Result<()> {
    for i in 0..PTRS_PER_BLOCK {
        let data = BlockPtrs::new(cache.data(slot)).get(i).unwrap_or(NULL_BLOCK);
        if data != NULL_BLOCK {
            free_data_block(cache, superblock, data)?;
            BlockPtrsMut::new(cache.data_mut(slot)).set(i, NULL_BLOCK);
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block_dev::MemDisk;
    use crate::freelist::seed_free_blocks;

    fn setup(block_count: u32) -> (BufferCache<MemDisk>, SuperBlock, InodeTable) {
        let mut sb = SuperBlock::new(block_count, 128);
        let mut cache = BufferCache::new(MemDisk::new(sb.image_blocks()), sb.data_start());
        seed_free_blocks(&mut cache, &mut sb).unwrap();
        let table = InodeTable::format(&mut sb);
        (cache, sb, table)
    }

    #[test]
    fn test_record_fits_slot() {
        let bytes = bincode::serialize(&Inode::default()).unwrap();
        assert!(bytes.len() <= INODE_SIZE);
    }

    #[test]
    fn test_free_list_order_and_reuse() {
        let (_, mut sb, mut table) = setup(64);
        assert_eq!(table.alloc(&mut sb).unwrap(), 1);
        assert_eq!(table.alloc(&mut sb).unwrap(), 2);
        table.release(&mut sb, 1).unwrap();
        assert_eq!(table.get(1).unwrap().generation, 1);
        assert_eq!(table.alloc(&mut sb).unwrap(), 1);
        assert_eq!(table.get(1).unwrap().generation, 2);
        assert_eq!(table.alloc(&mut sb).unwrap(), 3);
    }

    #[test]
    fn test_free_list_exhaustion() {
        let (_, mut sb, mut table) = setup(64);
        for _ in 1..table.inodes.len() {
            table.alloc(&mut sb).unwrap();
        }
        assert!(matches!(table.alloc(&mut sb), Err(FsError::NoFreeInode)));
    }

    #[test]
    fn test_table_store_load() {
        let (mut cache, mut sb, mut table) = setup(64);
        let id = table.alloc(&mut sb).unwrap();
        table.get_mut(id).unwrap().size = 1234;
        table.store(cache.device_mut()).unwrap();
        let loaded = InodeTable::load(cache.device_mut(), &sb).unwrap();
        assert_eq!(loaded.get(id).unwrap().size, 1234);
        assert!(loaded.get(ROOT_INODE_ID).unwrap().is_dir());
        assert_eq!(loaded.inodes.len(), table.inodes.len());
    }

    #[test]
    fn test_promotion_keeps_direct_blocks() {
        let (mut cache, mut sb, _) = setup(200);
        let mut inode = Inode::default();
        let direct: Vec<u32> = (0..NUM_BLOCK_PTRS)
            .map(|i| bmap(&mut cache, &mut sb, &mut inode, i).unwrap())
            .collect();
        assert!(!inode.is_indirect());
        assert_eq!(block_of(&mut cache, &inode, NUM_BLOCK_PTRS).unwrap(), None);

        bmap(&mut cache, &mut sb, &mut inode, NUM_BLOCK_PTRS).unwrap();
        assert!(inode.is_indirect());
        for (i, &id) in direct.iter().enumerate() {
            assert_eq!(block_of(&mut cache, &inode, i).unwrap(), Some(id));
        }
        // Mapping again must not allocate.
        let free = sb.total_free_blocks;
        bmap(&mut cache, &mut sb, &mut inode, 3).unwrap();
        assert_eq!(sb.total_free_blocks, free);
    }

    #[test]
    fn test_second_indirection_slot() {
        let (mut cache, mut sb, _) = setup(200);
        let mut inode = Inode::default();
        let id = bmap(&mut cache, &mut sb, &mut inode, PTRS_PER_BLOCK + 3).unwrap();
        assert!(inode.is_indirect());
        assert_ne!(inode.block_ptrs[1], NULL_BLOCK);
        assert_eq!(
            block_of(&mut cache, &inode, PTRS_PER_BLOCK + 3).unwrap(),
            Some(id)
        );
        assert_eq!(block_of(&mut cache, &inode, PTRS_PER_BLOCK + 4).unwrap(), None);
        assert!(matches!(
            bmap(&mut cache, &mut sb, &mut inode, NUM_BLOCK_PTRS * PTRS_PER_BLOCK),
            Err(FsError::OutOfRange)
        ));
    }

    #[test]
    fn test_release_blocks_returns_everything() {
        let (mut cache, mut sb, _) = setup(300);
        let before = sb.total_free_blocks;
        let mut inode = Inode::default();
        for i in 0..20 {
            bmap(&mut cache, &mut sb, &mut inode, i).unwrap();
        }
        bmap(&mut cache, &mut sb, &mut inode, 2 * PTRS_PER_BLOCK).unwrap();
        // 21 data blocks plus indirection blocks in slots 0 and 2.
        assert_eq!(before - sb.total_free_blocks, 23);
        release_blocks(&mut cache, &mut sb, &mut inode).unwrap();
        assert_eq!(sb.total_free_blocks, before);
        assert_eq!(inode.block_ptrs, [NULL_BLOCK; NUM_BLOCK_PTRS]);
        assert!(!inode.is_indirect());
    }

    #[test]
    fn test_release_blocks_retry_frees_each_block_once() {
        let (mut cache, mut sb, _) = setup(128);
        let mut inode = Inode::default();
        for i in 0..20 {
            bmap(&mut cache, &mut sb, &mut inode, i).unwrap();
        }
        let indirect = inode.block_ptrs[0];
        let lost = cache
            .read(indirect, |buf| BlockPtrs::new(buf).get(10))
            .unwrap()
            .unwrap();
        // A bogus entry stops the release after the first ten data blocks.
        cache
            .modify(indirect, |buf| BlockPtrsMut::new(buf).set(10, 9999))
            .unwrap();
        let before = sb.total_free_blocks;
        assert!(matches!(
            release_blocks(&mut cache, &mut sb, &mut inode),
            Err(FsError::Corruption { block: 9999, .. })
        ));
        assert_eq!(sb.total_free_blocks, before + 10);
        assert_eq!(inode.block_ptrs[0], indirect);

        cache
            .modify(indirect, |buf| BlockPtrsMut::new(buf).set(10, NULL_BLOCK))
            .unwrap();
        release_blocks(&mut cache, &mut sb, &mut inode).unwrap();
        // Everything but the block whose entry was overwritten.
        assert_eq!(sb.total_free_blocks, before + 20);
        assert_eq!(inode.block_ptrs, [NULL_BLOCK; NUM_BLOCK_PTRS]);

        let mut seen = std::collections::HashSet::new();
        while sb.total_free_blocks > 0 {
            let id = alloc_data_block(&mut cache, &mut sb).unwrap();
            assert!(seen.insert(id), "block {id} freed twice");
        }
        assert!(!seen.contains(&lost));
    }
}
