use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::block_dev::BlockDevice;
use crate::config::*;
use crate::error::{FsError, Result};

/// Geometry requested when formatting an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatOptions {
    /// Number of blocks in the data region.
    pub block_count: u32,
    /// Number of inodes; defaults to a tenth of the block count.
    pub inode_count: Option<u32>,
}

impl FormatOptions {
    pub fn new(block_count: u32) -> Self {
        Self {
            block_count,
            inode_count: None,
        }
    }

    pub fn with_inodes(mut self, inode_count: u32) -> Self {
        self.inode_count = Some(inode_count);
        self
    }

    /// Returns `(block_count, inode_count)` with the inode count rounded up to
    /// whole inode-table blocks.
    pub fn geometry(&self) -> Result<(u32, u32)> {
        if self.block_count < MIN_BLOCK_COUNT {
            return Err(FsError::InvalidGeometry(format!(
                "need at least {MIN_BLOCK_COUNT} blocks, got {}",
                self.block_count
            )));
        }
        let inodes = self.inode_count.unwrap_or(self.block_count / 10);
        if inodes == 0 {
            return Err(FsError::InvalidGeometry("inode count must be positive".to_string()));
        }
        let per_block = INODES_PER_BLOCK as u32;
        let table_blocks = inodes.div_ceil(per_block);
        let rounded = table_blocks
            .checked_mul(per_block)
            .ok_or_else(|| FsError::InvalidGeometry(format!("{inodes} inodes is too many")))?;
        // The data region's byte offset and the whole image must be addressable.
        let data_start = INODE_TABLE_START + table_blocks;
        data_start
            .checked_mul(BLOCK_SIZE as u32)
            .and(data_start.checked_add(self.block_count))
            .ok_or_else(|| {
                FsError::InvalidGeometry(format!(
                    "{} blocks with {rounded} inodes exceeds the addressable image size",
                    self.block_count
                ))
            })?;
        Ok((self.block_count, rounded))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperBlock {
    pub magic: [u8; 4],
    /// Byte offset of the data region (past the inode table).
    pub block_offset: u32,
    pub inode_count: u32,
    /// Blocks in the data region, including reserved block 0.
    pub block_count: u32,
    pub free_stack_len: u32,
    pub total_free_blocks: u32,
    /// Always `FREE_STACK_CAPACITY` long; only `free_stack_len` entries are live.
    pub free_stack: Vec<u32>,
    /// First free inode, 0 when none is left.
    pub free_inode_head: u32,
}

impl SuperBlock {
    /// A superblock with an empty free pool. The caller fills it by releasing blocks.
    /// Geometry comes from `FormatOptions::geometry`, which rejects layouts that
    /// do not fit in 32-bit offsets.
    pub fn new(block_count: u32, inode_count: u32) -> Self {
        let table_blocks = inode_count.div_ceil(INODES_PER_BLOCK as u32);
        Self {
            magic: MAGIC,
            block_offset: (INODE_TABLE_START + table_blocks).saturating_mul(BLOCK_SIZE as u32),
            inode_count,
            block_count,
            free_stack_len: 0,
            total_free_blocks: 0,
            free_stack: vec![0; FREE_STACK_CAPACITY],
            free_inode_head: 0,
        }
    }

    pub fn inode_table_blocks(&self) -> u32 {
        self.inode_count.div_ceil(INODES_PER_BLOCK as u32)
    }

    /// First device block of the data region.
    pub fn data_start(&self) -> u32 {
        self.block_offset / BLOCK_SIZE as u32
    }

    /// Device blocks the whole image spans.
    pub fn image_blocks(&self) -> u32 {
        self.data_start().saturating_add(self.block_count)
    }

    fn validate(&self, device_blocks: u32) -> Result<()> {
        let corrupt = |detail: &str| FsError::Corruption {
            block: SUPERBLOCK_ID,
            detail: detail.to_string(),
        };
        if self.free_stack.len() != FREE_STACK_CAPACITY
            || self.free_stack_len as usize > FREE_STACK_CAPACITY
        {
            return Err(corrupt("free block stack overflows its capacity"));
        }
        if self.total_free_blocks < self.free_stack_len {
            return Err(corrupt("free block total below stack size"));
        }
        if self.block_offset % BLOCK_SIZE as u32 != 0
            || self.data_start() != INODE_TABLE_START + self.inode_table_blocks()
        {
            return Err(corrupt("data region offset disagrees with inode table size"));
        }
        if self.free_inode_head >= self.inode_count {
            return Err(corrupt("free inode head out of range"));
        }
        if self.image_blocks() > device_blocks {
            return Err(FsError::InvalidGeometry(format!(
                "image needs {} blocks, device has {device_blocks}",
                self.image_blocks()
            )));
        }
        Ok(())
    }
}

pub fn read_superblock<D: BlockDevice>(device: &mut D) -> Result<SuperBlock> {
    if device.num_blocks() == 0 {
        return Err(FsError::NotAFilesystem);
    }
    let mut buf = Box::new([0u8; BLOCK_SIZE]);
    device.read_block(SUPERBLOCK_ID, &mut buf)?;
    if buf[..MAGIC.len()] != MAGIC {
        warn!(target: "flatfs::fs", magic = ?&buf[..MAGIC.len()], "bad magic, refusing to mount");
        return Err(FsError::NotAFilesystem);
    }
    let superblock: SuperBlock = bincode::deserialize(&buf[..])?;
    superblock.validate(device.num_blocks())?;
    Ok(superblock)
}

pub fn write_superblock<D: BlockDevice>(device: &mut D, superblock: &SuperBlock) -> Result<()> {
    let bytes = bincode::serialize(superblock)?;
    let mut buf = Box::new([0u8; BLOCK_SIZE]);
    buf.get_mut(..bytes.len())
        .ok_or_else(|| FsError::Corruption {
            block: SUPERBLOCK_ID,
            detail: "superblock record larger than a block".to_string(),
        })?
        .copy_from_slice(&bytes);
    device.write_block(SUPERBLOCK_ID, &buf)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block_dev::MemDisk;

    #[test]
    fn test_geometry_rounds_inodes() {
        assert_eq!(FormatOptions::new(100).geometry().unwrap(), (100, 64));
        assert_eq!(
            FormatOptions::new(100).with_inodes(65).geometry().unwrap(),
            (100, 128)
        );
        assert!(FormatOptions::new(10).geometry().is_err());
        assert!(FormatOptions::new(100).with_inodes(0).geometry().is_err());
        assert_eq!(FormatOptions::new(11).geometry().unwrap(), (11, 64));
    }

    #[test]
    fn test_geometry_rejects_unaddressable_images() {
        // A tenth of this many inodes pushes the data region past 4 GiB.
        assert!(matches!(
            FormatOptions::new(700_000_000).geometry(),
            Err(FsError::InvalidGeometry(_))
        ));
        // Small inode table, but the image itself has more than u32::MAX blocks.
        assert!(matches!(
            FormatOptions::new(u32::MAX).with_inodes(64).geometry(),
            Err(FsError::InvalidGeometry(_))
        ));
        let (blocks, inodes) = FormatOptions::new(1_000_000).geometry().unwrap();
        let sb = SuperBlock::new(blocks, inodes);
        assert_eq!(sb.image_blocks(), sb.data_start() + blocks);
    }

    #[test]
    fn test_superblock_round_trip() {
        let mut sb = SuperBlock::new(100, 64);
        sb.free_stack[0] = 42;
        sb.free_stack_len = 1;
        sb.total_free_blocks = 1;
        sb.free_inode_head = 1;
        let mut disk = MemDisk::new(sb.image_blocks());
        write_superblock(&mut disk, &sb).unwrap();
        assert_eq!(read_superblock(&mut disk).unwrap(), sb);
        assert_eq!(sb.data_start(), 2);
    }

    #[test]
    fn test_bad_magic() {
        let mut disk = MemDisk::new(4);
        assert!(matches!(read_superblock(&mut disk), Err(FsError::NotAFilesystem)));
    }
}
