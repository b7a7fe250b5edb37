//! Backing store abstraction.
//!
//! A device is addressed in whole `BLOCK_SIZE` blocks counted from the start of
//! the image: block 0 is the superblock, the inode table follows, then the data
//! region. Data block `id` therefore lives at byte `block_offset + id * BLOCK_SIZE`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::config::BLOCK_SIZE;
use crate::error::{FsError, Result};

pub trait BlockDevice {
    /// Returns the number of blocks in the block device.
    fn num_blocks(&self) -> u32;

    /// Reads one whole block.
    fn read_block(&mut self, block_id: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<()>;

    /// Writes one whole block.
    fn write_block(&mut self, block_id: u32, buf: &[u8; BLOCK_SIZE]) -> Result<()>;

    /// Flushes any host-side buffering down to the medium.
    fn flush(&mut self) -> Result<()>;
}

fn check_range(block_id: u32, num_blocks: u32) -> Result<()> {
    if block_id >= num_blocks {
        return Err(FsError::Corruption {
            block: block_id,
            detail: format!("block beyond end of device ({num_blocks} blocks)"),
        });
    }
    Ok(())
}

/// A host file holding a formatted image. Opened once per session.
#[derive(Debug)]
pub struct FileDisk {
    file: File,
    num_blocks: u32,
}

impl FileDisk {
    /// Creates (or truncates) `path` and sizes it to `num_blocks` zeroed blocks.
    pub fn create(path: impl AsRef<Path>, num_blocks: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(u64::from(num_blocks) * BLOCK_SIZE as u64)?;
        Ok(Self { file, num_blocks })
    }

    /// Opens an existing image. A trailing partial block is ignored.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        let num_blocks = u32::try_from(len / BLOCK_SIZE as u64)
            .map_err(|_| FsError::InvalidGeometry(format!("image of {len} bytes is too large")))?;
        Ok(Self { file, num_blocks })
    }
}

impl BlockDevice for FileDisk {
    fn num_blocks(&self) -> u32 {
        self.num_blocks
    }

    fn read_block(&mut self, block_id: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        check_range(block_id, self.num_blocks)?;
        self.file
            .seek(SeekFrom::Start(u64::from(block_id) * BLOCK_SIZE as u64))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_block(&mut self, block_id: u32, buf: &[u8; BLOCK_SIZE]) -> Result<()> {
        check_range(block_id, self.num_blocks)?;
        self.file
            .seek(SeekFrom::Start(u64::from(block_id) * BLOCK_SIZE as u64))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// In-memory device, handy for tests and throwaway images.
#[derive(Debug, Clone)]
pub struct MemDisk {
    data: Vec<u8>,
    num_blocks: u32,
}

impl MemDisk {
    pub fn new(num_blocks: u32) -> Self {
        Self {
            data: vec![0u8; num_blocks as usize * BLOCK_SIZE],
            num_blocks,
        }
    }

    /// Raw image bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl BlockDevice for MemDisk {
    fn num_blocks(&self) -> u32 {
        self.num_blocks
    }

    fn read_block(&mut self, block_id: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        check_range(block_id, self.num_blocks)?;
        let start = block_id as usize * BLOCK_SIZE;
        buf.copy_from_slice(&self.data[start..start + BLOCK_SIZE]);
        Ok(())
    }

    fn write_block(&mut self, block_id: u32, buf: &[u8; BLOCK_SIZE]) -> Result<()> {
        check_range(block_id, self.num_blocks)?;
        let start = block_id as usize * BLOCK_SIZE;
        self.data[start..start + BLOCK_SIZE].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        // Nothing buffered between us and the bytes.
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_mem_disk_rejects_out_of_range() {
        let mut disk = MemDisk::new(4);
        let mut buf = [0u8; BLOCK_SIZE];
        assert!(disk.read_block(3, &mut buf).is_ok());
        assert!(matches!(
            disk.read_block(4, &mut buf),
            Err(FsError::Corruption { block: 4, .. })
        ));
    }

    #[test]
    fn test_file_disk_persists_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut disk = FileDisk::create(&path, 8).unwrap();
        let mut block = [0u8; BLOCK_SIZE];
        block[..5].copy_from_slice(b"hello");
        disk.write_block(5, &block).unwrap();
        disk.flush().unwrap();
        drop(disk);

        let mut disk = FileDisk::open(&path).unwrap();
        assert_eq!(disk.num_blocks(), 8);
        let mut read = [0u8; BLOCK_SIZE];
        disk.read_block(5, &mut read).unwrap();
        assert_eq!(&read[..5], b"hello");
    }
}
