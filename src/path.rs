//! Path resolution and manipulation utilities.

use crate::block_dev::BlockDevice;
use crate::cache::BufferCache;
use crate::config::ROOT_INODE_ID;
use crate::directory::{DirEntry, check_new_name, dir_add_entry, dir_lookup};
use crate::error::{FsError, Result};
use crate::inode::InodeTable;
use crate::superblock::SuperBlock;

/// What `resolve` should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// The inode the path names.
    Lookup,
    /// Like `Lookup`, but a missing last component is created as an empty file.
    CreateLeaf,
    /// The directory that holds (or would hold) the last component.
    ParentOf,
}

/// Makes `path` absolute against `cwd` and canonical: no `.`, no `..`, no
/// repeated or trailing slashes. `..` at the root stays at the root.
pub fn normalize(cwd: &str, path: &str) -> String {
    let mut out = String::with_capacity(cwd.len() + path.len() + 1);
    // Length of `out` before each emitted segment, so `..` can drop back to it.
    let mut bounds: Vec<usize> = Vec::new();

    let relative = !path.starts_with('/');
    let prefix = if relative { cwd } else { "" };
    for segment in prefix.split('/').chain(path.split('/')) {
        match segment {
            "" | "." => {}
            ".." => {
                if let Some(bound) = bounds.pop() {
                    out.truncate(bound);
                }
            }
            name => {
                bounds.push(out.len());
                out.push('/');
                out.push_str(name);
            }
        }
    }

    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Components of a normalized path; the root has none.
pub fn split(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Last component of a normalized path, `None` for the root.
pub fn file_name(path: &str) -> Option<&str> {
    split(path).pop()
}

/// Walks `path` (relative paths start at `cwd`) from the root directory.
/// An empty path names nothing.
pub fn resolve<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    superblock: &mut SuperBlock,
    inodes: &mut InodeTable,
    cwd: &str,
    path: &str,
    intent: Intent,
) -> Result<u32> {
    if path.is_empty() {
        return Err(FsError::InvalidPath);
    }
    let full = normalize(cwd, path);
    let components = split(&full);

    let mut current = ROOT_INODE_ID;
    let mut parent = ROOT_INODE_ID;
    let mut matched = 0;
    for name in &components {
        let dir = inodes.get(current)?;
        if !dir.is_dir() {
            return Err(FsError::NotADirectory);
        }
        match dir_lookup(cache, dir, name)? {
            Some((_, child)) => {
                parent = current;
                current = child;
                matched += 1;
            }
            None => break,
        }
    }

    if matched == components.len() {
        return Ok(match intent {
            Intent::ParentOf => parent,
            Intent::Lookup | Intent::CreateLeaf => current,
        });
    }
    if matched + 1 < components.len() {
        return Err(FsError::NotFound);
    }

    // Only the last component is missing; `current` is its directory.
    match intent {
        Intent::Lookup => Err(FsError::NotFound),
        Intent::ParentOf => Ok(current),
        Intent::CreateLeaf => {
            let name = components[matched];
            check_new_name(name)?;
            let entry_inode = inodes.alloc(superblock)?;
            let entry = DirEntry::new(name, entry_inode)?;
            let added = dir_add_entry(cache, superblock, inodes.get_mut(current)?, &entry);
            if let Err(err) = added {
                inodes.release(superblock, entry_inode)?;
                return Err(err);
            }
            Ok(entry_inode)
        }
    }
}
