//! Directory contents.
//!
//! A directory is an ordinary file whose bytes are a dense array of fixed-size
//! entries, `entry_count` of them. Every directory holds `.` and `..`.
//! Removal moves the last entry into the hole, so order is not stable.

use tracing::debug;

use crate::block_dev::BlockDevice;
use crate::cache::BufferCache;
use crate::config::*;
use crate::error::{FsError, Result};
use crate::file::{read_at, write_at};
use crate::inode::Inode;
use crate::superblock::SuperBlock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub inode_id: u32,
}

impl DirEntry {
    pub fn new(name: &str, inode_id: u32) -> Result<Self> {
        if name.is_empty()
            || name.len() > MAX_FILE_NAME_LEN
            || name.contains('/')
            || name.contains('\0')
        {
            return Err(FsError::InvalidFileName);
        }
        Ok(Self {
            name: name.to_string(),
            inode_id,
        })
    }

    /// On-disk form: NUL-padded name followed by the little-endian inode id.
    pub fn encode(&self) -> [u8; DIR_ENTRY_SIZE] {
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        let name = self.name.as_bytes();
        let len = name.len().min(MAX_FILE_NAME_LEN);
        raw[..len].copy_from_slice(&name[..len]);
        raw[DIR_NAME_FIELD..].copy_from_slice(&self.inode_id.to_le_bytes());
        raw
    }

    pub fn decode(raw: &[u8; DIR_ENTRY_SIZE]) -> Self {
        let field = &raw[..DIR_NAME_FIELD];
        let len = field.iter().position(|&c| c == 0).unwrap_or(DIR_NAME_FIELD);
        let mut id = [0u8; 4];
        id.copy_from_slice(&raw[DIR_NAME_FIELD..]);
        Self {
            name: String::from_utf8_lossy(&field[..len]).into_owned(),
            inode_id: u32::from_le_bytes(id),
        }
    }
}

/// Checks a name a caller wants to create.
pub fn check_new_name(name: &str) -> Result<()> {
    if name == DOT_NAME || name == DOTDOT_NAME {
        return Err(FsError::InvalidFileName);
    }
    DirEntry::new(name, 0).map(|_| ())
}

fn require_dir(dir: &Inode) -> Result<()> {
    if !dir.is_dir() {
        return Err(FsError::NotADirectory);
    }
    Ok(())
}

/// Reads entry number `index`.
pub fn dir_entry_at<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    dir: &Inode,
    index: usize,
) -> Result<DirEntry> {
    let mut raw = [0u8; DIR_ENTRY_SIZE];
    let read = read_at(cache, dir, index * DIR_ENTRY_SIZE, &mut raw)?;
    if read != DIR_ENTRY_SIZE {
        return Err(FsError::Corruption {
            block: dir.block_ptrs[0],
            detail: format!("directory entry {index} lies past the directory size"),
        });
    }
    Ok(DirEntry::decode(&raw))
}

/// Linear scan for `name`. Returns the entry index and its inode id.
pub fn dir_lookup<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    dir: &Inode,
    name: &str,
) -> Result<Option<(usize, u32)>> {
    require_dir(dir)?;
    for index in 0..dir.entry_count as usize {
        let entry = dir_entry_at(cache, dir, index)?;
        if entry.name == name {
            return Ok(Some((index, entry.inode_id)));
        }
    }
    Ok(None)
}

/// Appends an entry. The caller owns the child's link count.
pub fn dir_add_entry<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    superblock: &mut SuperBlock,
    dir: &mut Inode,
    entry: &DirEntry,
) -> Result<()> {
    if dir_lookup(cache, dir, &entry.name)?.is_some() {
        return Err(FsError::AlreadyExists);
    }
    let offset = dir.entry_count as usize * DIR_ENTRY_SIZE;
    write_at(cache, superblock, dir, offset, &entry.encode())?;
    dir.entry_count += 1;
    debug!(target: "flatfs::dir", name = %entry.name, inode_id = entry.inode_id, "add entry");
    Ok(())
}

/// Removes the entry called `name` by moving the last entry over it.
/// Returns the inode id the entry pointed at; reclaiming it is the caller's job.
pub fn dir_remove_entry<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    superblock: &mut SuperBlock,
    dir: &mut Inode,
    name: &str,
) -> Result<u32> {
    if name == DOT_NAME || name == DOTDOT_NAME {
        return Err(FsError::InvalidFileName);
    }
    let (index, inode_id) = dir_lookup(cache, dir, name)?.ok_or(FsError::NotFound)?;
    let last = dir.entry_count as usize - 1;
    if index != last {
        let moved = dir_entry_at(cache, dir, last)?;
        write_at(cache, superblock, dir, index * DIR_ENTRY_SIZE, &moved.encode())?;
    }
    dir.entry_count -= 1;
    dir.size = dir.entry_count * DIR_ENTRY_SIZE as u32;
    debug!(target: "flatfs::dir", name, inode_id, "remove entry");
    Ok(inode_id)
}

pub fn dir_entries<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    dir: &Inode,
) -> Result<Vec<DirEntry>> {
    require_dir(dir)?;
    (0..dir.entry_count as usize)
        .map(|index| dir_entry_at(cache, dir, index))
        .collect()
}

/// True when only `.` and `..` are left.
pub fn dir_is_empty(dir: &Inode) -> bool {
    dir.entry_count <= 2
}
