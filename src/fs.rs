use std::path::Path;

use bitflags::bitflags;
use tracing::{debug, info};

use crate::block_dev::{BlockDevice, FileDisk};
use crate::cache::BufferCache;
use crate::config::*;
use crate::directory::{
    DirEntry, check_new_name, dir_add_entry, dir_entries, dir_entry_at, dir_is_empty,
    dir_remove_entry,
};
use crate::error::{FsError, Result};
use crate::file::{read_at, write_at_partial};
use crate::freelist::seed_free_blocks;
use crate::inode::{Inode, InodeMode, InodeTable, release_blocks};
use crate::path::{self, Intent, normalize};
use crate::superblock::{FormatOptions, SuperBlock, read_superblock, write_superblock};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ = 1;
        /// Truncates an existing file unless `APPEND` is also set.
        const WRITE = 2;
        /// Keep existing content and start at the end.
        const APPEND = 4;
        /// Fail instead of creating a missing file. Implied without `WRITE`.
        const MUST_EXIST = 8;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// From the start of the file.
    Set,
    /// From the file size.
    End,
    /// From the current offset.
    Current,
}

/// An open file descriptor, valid until `close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fd(usize);

#[derive(Debug, Clone, Copy)]
struct FileDesc {
    inode_id: u32,
    access: OpenFlags,
    in_use: bool,
    offset: usize,
}

impl FileDesc {
    const UNUSED: Self = Self {
        inode_id: 0,
        access: OpenFlags::empty(),
        in_use: false,
        offset: 0,
    };
}

/// Cursor over a directory's entry names. Goes stale once the directory is
/// removed.
#[derive(Debug)]
pub struct DirStream {
    inode_id: u32,
    generation: u32,
    cursor: usize,
}

/// One open image. Owns the cache, the inode table and the descriptor table;
/// nothing reaches the backing store until `sync` or `close_image`, apart from
/// cache evictions.
#[derive(Debug)]
pub struct FileSystem<D: BlockDevice = FileDisk> {
    cache: BufferCache<D>,
    superblock: SuperBlock,
    inodes: InodeTable,
    fds: Vec<FileDesc>,
    cwd: String,
}

impl FileSystem<FileDisk> {
    /// Creates a host file at `path` and formats it.
    pub fn create_image(path: impl AsRef<Path>, opts: FormatOptions) -> Result<Self> {
        let (block_count, inode_count) = opts.geometry()?;
        let image_blocks = SuperBlock::new(block_count, inode_count).image_blocks();
        let disk = FileDisk::create(path, image_blocks)?;
        Self::format(disk, opts)
    }

    pub fn open_image(path: impl AsRef<Path>) -> Result<Self> {
        Self::mount(FileDisk::open(path)?)
    }
}

impl<D: BlockDevice> FileSystem<D> {
    pub fn format(mut device: D, opts: FormatOptions) -> Result<Self> {
        let (block_count, inode_count) = opts.geometry()?;
        let mut superblock = SuperBlock::new(block_count, inode_count);
        if device.num_blocks() < superblock.image_blocks() {
            return Err(FsError::InvalidGeometry(format!(
                "image needs {} blocks, device has {}",
                superblock.image_blocks(),
                device.num_blocks()
            )));
        }
        // Stale bytes in block 0 must not look like a valid image if we fail below.
        device.write_block(SUPERBLOCK_ID, &[0u8; BLOCK_SIZE])?;

        let mut cache = BufferCache::new(device, superblock.data_start());
        seed_free_blocks(&mut cache, &mut superblock)?;
        let inodes = InodeTable::format(&mut superblock);

        let mut fs = Self::with_parts(cache, superblock, inodes);
        fs.add_dot_entries(ROOT_INODE_ID, ROOT_INODE_ID)?;
        fs.sync()?;
        info!(
            target: "flatfs::fs",
            block_count,
            inode_count,
            free_blocks = fs.superblock.total_free_blocks,
            "formatted image"
        );
        Ok(fs)
    }

    pub fn mount(mut device: D) -> Result<Self> {
        let superblock = read_superblock(&mut device)?;
        let inodes = InodeTable::load(&mut device, &superblock)?;
        let cache = BufferCache::new(device, superblock.data_start());
        info!(
            target: "flatfs::fs",
            block_count = superblock.block_count,
            inode_count = superblock.inode_count,
            free_blocks = superblock.total_free_blocks,
            "mounted image"
        );
        Ok(Self::with_parts(cache, superblock, inodes))
    }

    fn with_parts(cache: BufferCache<D>, superblock: SuperBlock, inodes: InodeTable) -> Self {
        Self {
            cache,
            superblock,
            inodes,
            fds: vec![FileDesc::UNUSED; MAX_FD],
            cwd: "/".to_string(),
        }
    }

    /// Writes dirty blocks, the superblock and the inode table to the device.
    pub fn sync(&mut self) -> Result<()> {
        self.cache.flush_all()?;
        let device = self.cache.device_mut();
        write_superblock(device, &self.superblock)?;
        self.inodes.store(device)?;
        device.flush()
    }

    /// Closes every descriptor, syncs and hands the device back.
    pub fn close_image(mut self) -> Result<D> {
        for raw in 0..self.fds.len() {
            if self.fds[raw].in_use {
                self.close(Fd(raw))?;
            }
        }
        self.sync()?;
        info!(target: "flatfs::fs", "closed image");
        Ok(self.cache.into_device())
    }

    pub fn superblock(&self) -> &SuperBlock {
        &self.superblock
    }

    pub fn root_inode_id(&self) -> u32 {
        ROOT_INODE_ID
    }

    pub fn pwd(&self) -> &str {
        &self.cwd
    }

    pub fn chdir(&mut self, path: &str) -> Result<()> {
        let full = self.full_path(path)?;
        let inode_id = self.resolve(&full, Intent::Lookup)?;
        if !self.inodes.get(inode_id)?.is_dir() {
            return Err(FsError::NotADirectory);
        }
        self.cwd = full;
        Ok(())
    }

    /// Absolute, normalized form of `path`.
    fn full_path(&self, path: &str) -> Result<String> {
        if path.is_empty() {
            return Err(FsError::InvalidPath);
        }
        Ok(normalize(&self.cwd, path))
    }

    /// Resolves `path` against the current directory.
    pub fn resolve(&mut self, path: &str, intent: Intent) -> Result<u32> {
        path::resolve(
            &mut self.cache,
            &mut self.superblock,
            &mut self.inodes,
            &self.cwd,
            path,
            intent,
        )
    }

    /// Snapshot of the inode `path` names.
    pub fn metadata(&mut self, path: &str) -> Result<Inode> {
        let inode_id = self.resolve(path, Intent::Lookup)?;
        Ok(*self.inodes.get(inode_id)?)
    }

    fn lookup_opt(&mut self, path: &str) -> Result<Option<u32>> {
        match self.resolve(path, Intent::Lookup) {
            Ok(inode_id) => Ok(Some(inode_id)),
            Err(FsError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn add_dot_entries(&mut self, dir_id: u32, parent_id: u32) -> Result<()> {
        let dir = self.inodes.get_mut(dir_id)?;
        dir.mode.insert(InodeMode::DIRECTORY);
        dir_add_entry(&mut self.cache, &mut self.superblock, dir, &DirEntry::new(DOT_NAME, dir_id)?)?;
        dir_add_entry(
            &mut self.cache,
            &mut self.superblock,
            dir,
            &DirEntry::new(DOTDOT_NAME, parent_id)?,
        )
    }

    fn is_open(&self, inode_id: u32) -> bool {
        self.fds
            .iter()
            .any(|desc| desc.in_use && desc.inode_id == inode_id)
    }

    /// Frees an unlinked inode and all of its blocks.
    fn reclaim(&mut self, inode_id: u32) -> Result<()> {
        let inode = self.inodes.get_mut(inode_id)?;
        release_blocks(&mut self.cache, &mut self.superblock, inode)?;
        self.inodes.release(&mut self.superblock, inode_id)
    }

    /// Drops the directory entry for the normalized path `full` and one link of
    /// `inode_id`; the inode is reclaimed once unlinked and no longer open.
    fn unlink(&mut self, full: &str, inode_id: u32) -> Result<()> {
        let name = path::file_name(full).ok_or(FsError::Busy)?;
        let parent_id = self.resolve(full, Intent::ParentOf)?;
        let parent = self.inodes.get_mut(parent_id)?;
        dir_remove_entry(&mut self.cache, &mut self.superblock, parent, name)?;

        let inode = self.inodes.get_mut(inode_id)?;
        inode.link_count = inode.link_count.saturating_sub(1);
        if inode.link_count > 0 {
            return Ok(());
        }
        if self.is_open(inode_id) {
            debug!(target: "flatfs::fs", inode_id, "unlinked while open, reclaim deferred");
            return Ok(());
        }
        self.reclaim(inode_id)
    }

    // File descriptor operations.

    pub fn open(&mut self, path: &str, mut flags: OpenFlags) -> Result<Fd> {
        if !flags.contains(OpenFlags::WRITE) {
            flags.insert(OpenFlags::MUST_EXIST);
        }
        let raw = self
            .fds
            .iter()
            .position(|desc| !desc.in_use)
            .ok_or(FsError::NoFreeDescriptor)?;

        let full = self.full_path(path)?;
        let mut existing = self.lookup_opt(&full)?;
        if let Some(inode_id) = existing {
            if self.inodes.get(inode_id)?.is_dir() {
                return Err(FsError::IsADirectory);
            }
            if flags.contains(OpenFlags::WRITE) && !flags.contains(OpenFlags::APPEND) {
                self.unlink(&full, inode_id)?;
                existing = None;
            }
        } else if flags.contains(OpenFlags::MUST_EXIST) {
            return Err(FsError::NotFound);
        }

        let inode_id = match existing {
            Some(inode_id) => inode_id,
            None => self.resolve(&full, Intent::CreateLeaf)?,
        };
        let offset = if flags.contains(OpenFlags::APPEND) {
            self.inodes.get(inode_id)?.size as usize
        } else {
            0
        };
        self.fds[raw] = FileDesc {
            inode_id,
            access: flags & (OpenFlags::READ | OpenFlags::WRITE),
            in_use: true,
            offset,
        };
        debug!(target: "flatfs::fs", fd = raw, inode_id, path = %full, ?flags, "open");
        Ok(Fd(raw))
    }

    fn desc(&self, fd: Fd) -> Result<FileDesc> {
        self.fds
            .get(fd.0)
            .filter(|desc| desc.in_use)
            .copied()
            .ok_or(FsError::InvalidDescriptor)
    }

    fn set_offset(&mut self, fd: Fd, offset: usize) {
        self.fds[fd.0].offset = offset;
    }

    pub fn close(&mut self, fd: Fd) -> Result<()> {
        let desc = self.desc(fd)?;
        self.fds[fd.0] = FileDesc::UNUSED;
        debug!(target: "flatfs::fs", fd = fd.0, inode_id = desc.inode_id, "close");
        let unlinked = self.inodes.get(desc.inode_id)?.link_count == 0;
        if unlinked && !self.is_open(desc.inode_id) {
            self.reclaim(desc.inode_id)?;
        }
        Ok(())
    }

    /// Reads up to `buf.len()` bytes at the descriptor's offset and advances it.
    pub fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        let desc = self.desc(fd)?;
        if !desc.access.contains(OpenFlags::READ) {
            return Err(FsError::AccessDenied);
        }
        let inode = self.inodes.get(desc.inode_id)?;
        let read = read_at(&mut self.cache, inode, desc.offset, buf)?;
        self.set_offset(fd, desc.offset + read);
        Ok(read)
    }

    /// Writes `data` at the descriptor's offset and advances it past every byte
    /// that landed, including when the device fills up part way.
    pub fn write(&mut self, fd: Fd, data: &[u8]) -> Result<usize> {
        let desc = self.desc(fd)?;
        if !desc.access.contains(OpenFlags::WRITE) {
            return Err(FsError::AccessDenied);
        }
        let inode = self.inodes.get_mut(desc.inode_id)?;
        let (written, result) =
            write_at_partial(&mut self.cache, &mut self.superblock, inode, desc.offset, data);
        self.set_offset(fd, desc.offset + written);
        result.map(|()| written)
    }

    /// Moves the offset; the result must land inside the file.
    pub fn seek(&mut self, fd: Fd, offset: i64, whence: Whence) -> Result<usize> {
        let desc = self.desc(fd)?;
        let size = i64::from(self.inodes.get(desc.inode_id)?.size);
        let base = match whence {
            Whence::Set => 0,
            Whence::End => size,
            Whence::Current => desc.offset as i64,
        };
        let target = base.checked_add(offset).ok_or(FsError::OutOfRange)?;
        if target < 0 || target >= size {
            return Err(FsError::OutOfRange);
        }
        self.set_offset(fd, target as usize);
        Ok(target as usize)
    }

    pub fn tell(&self, fd: Fd) -> Result<usize> {
        Ok(self.desc(fd)?.offset)
    }

    pub fn eof(&self, fd: Fd) -> Result<bool> {
        let desc = self.desc(fd)?;
        Ok(desc.offset >= self.inodes.get(desc.inode_id)?.size as usize)
    }

    pub fn stat(&self, fd: Fd) -> Result<Inode> {
        let desc = self.desc(fd)?;
        Ok(*self.inodes.get(desc.inode_id)?)
    }

    // Namespace operations.

    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        let full = self.full_path(path)?;
        if self.lookup_opt(&full)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        let parent_id = self.resolve(&full, Intent::ParentOf)?;
        let dir_id = self.resolve(&full, Intent::CreateLeaf)?;
        if let Err(err) = self.add_dot_entries(dir_id, parent_id) {
            self.unlink(&full, dir_id)?;
            return Err(err);
        }
        debug!(target: "flatfs::fs", path = %full, inode_id = dir_id, "mkdir");
        Ok(())
    }

    /// Unlinks a regular file.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        let full = self.full_path(path)?;
        let inode_id = self.resolve(&full, Intent::Lookup)?;
        if self.inodes.get(inode_id)?.is_dir() {
            return Err(FsError::IsADirectory);
        }
        self.unlink(&full, inode_id)?;
        debug!(target: "flatfs::fs", path = %full, inode_id, "remove");
        Ok(())
    }

    /// Removes an empty directory.
    pub fn remove_dir(&mut self, path: &str) -> Result<()> {
        let full = self.full_path(path)?;
        if full == "/" {
            return Err(FsError::Busy);
        }
        let inode_id = self.resolve(&full, Intent::Lookup)?;
        let dir = self.inodes.get(inode_id)?;
        if !dir.is_dir() {
            return Err(FsError::NotADirectory);
        }
        if !dir_is_empty(dir) {
            return Err(FsError::NotEmpty);
        }
        if self.cwd == full || self.cwd.starts_with(&format!("{full}/")) {
            return Err(FsError::Busy);
        }
        self.unlink(&full, inode_id)?;
        debug!(target: "flatfs::fs", path = %full, inode_id, "rmdir");
        Ok(())
    }

    /// Adds `dst` as another name for the regular file `src`.
    pub fn link(&mut self, src: &str, dst: &str) -> Result<()> {
        let inode_id = self.resolve(src, Intent::Lookup)?;
        if self.inodes.get(inode_id)?.is_dir() {
            return Err(FsError::IsADirectory);
        }
        let full = self.full_path(dst)?;
        if self.lookup_opt(&full)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        let name = path::file_name(&full).ok_or(FsError::AlreadyExists)?;
        check_new_name(name)?;
        let parent_id = self.resolve(&full, Intent::ParentOf)?;
        let entry = DirEntry::new(name, inode_id)?;
        let parent = self.inodes.get_mut(parent_id)?;
        dir_add_entry(&mut self.cache, &mut self.superblock, parent, &entry)?;
        self.inodes.get_mut(inode_id)?.link_count += 1;
        debug!(target: "flatfs::fs", src, dst = %full, inode_id, "link");
        Ok(())
    }

    // Directory iteration.

    pub fn open_dir(&mut self, path: &str) -> Result<DirStream> {
        let inode_id = self.resolve(path, Intent::Lookup)?;
        let inode = self.inodes.get(inode_id)?;
        if !inode.is_dir() {
            return Err(FsError::NotADirectory);
        }
        Ok(DirStream {
            inode_id,
            generation: inode.generation,
            cursor: 0,
        })
    }

    /// Next entry name, `None` at the end. A stream whose directory has been
    /// removed yields `InvalidDescriptor`.
    pub fn next_entry(&mut self, dir: &mut DirStream) -> Result<Option<String>> {
        let inode = self.inodes.get(dir.inode_id)?;
        if inode.link_count == 0 || inode.generation != dir.generation || !inode.is_dir() {
            return Err(FsError::InvalidDescriptor);
        }
        if dir.cursor >= inode.entry_count as usize {
            return Ok(None);
        }
        let entry = dir_entry_at(&mut self.cache, inode, dir.cursor)?;
        dir.cursor += 1;
        Ok(Some(entry.name))
    }

    pub fn close_dir(&mut self, dir: DirStream) {
        drop(dir);
    }

    /// Every entry name in the directory, `.` and `..` included.
    pub fn read_dir(&mut self, path: &str) -> Result<Vec<String>> {
        let inode_id = self.resolve(path, Intent::Lookup)?;
        let dir = self.inodes.get(inode_id)?;
        Ok(dir_entries(&mut self.cache, dir)?
            .into_iter()
            .map(|entry| entry.name)
            .collect())
    }
}
