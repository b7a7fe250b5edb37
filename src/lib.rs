//! Flatfs is a small inode file system stored in a single host file.
//! No permissions, timestamps or journaling; one session owns the image at a time.
//!
//! Flatfs's linear layout:
//! - Superblock (block 0): magic, free block stack, free inode list head
//! - Inode Table
//! - Data Blocks (block 0 of the region is reserved)
//!
//! Flatfs's layers (from bottom to top):
//! 1. Block Device: whole-block access to the backing store.         | `FileDisk`, `MemDisk`, or user implemented
//! 2. Buffer Cache: 16 write-back slots over the data region.          | Fs implemented
//! 3. Free List: superblock stack of free blocks with overflow nodes.  | Fs implemented
//! 4. Inode: inode table, free inode list, direct/indirect mapping.    | Fs implemented
//! 5. File: byte-granular reads and writes through the mapping.        | Fs implemented
//! 6. Directory/Path: packed entry arrays and path resolution.         | Fs implemented
//! 7. FileSystem: the session, with descriptors and a working dir.     | Fs implemented

mod config;
mod error;
mod block_dev;
mod cache;
mod ptrs;
mod superblock;
mod freelist;
mod inode;
mod file;
mod directory;
mod path;
mod fs;

pub use block_dev::{BlockDevice, FileDisk, MemDisk};
pub use cache::{BufferCache, SlotId};
pub use config::*;
pub use directory::DirEntry;
pub use freelist::{alloc_data_block, free_data_block};
pub use fs::*;
pub use inode::{Inode, InodeMode};
pub use path::{Intent, normalize};
pub use superblock::{FormatOptions, SuperBlock};
pub use error::FsError as Error;
pub use error::Result;
