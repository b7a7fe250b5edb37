//! Error type shared by every layer of the file system.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    /// Host I/O failure on the backing store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A fixed-width record failed to encode or decode.
    #[error("record codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("no such file or directory")]
    NotFound,
    #[error("file exists")]
    AlreadyExists,
    #[error("no free inode left")]
    NoFreeInode,
    /// The free block pool is empty.
    #[error("no free block left")]
    Exhausted,
    /// File size or offset outside the addressable range.
    #[error("offset out of range")]
    OutOfRange,
    /// Bad magic on mount.
    #[error("not a flatfs image")]
    NotAFilesystem,
    #[error("bad file descriptor")]
    InvalidDescriptor,
    #[error("descriptor table full")]
    NoFreeDescriptor,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    NotEmpty,
    /// The directory is in use as (or above) the current directory, or is the root.
    #[error("resource busy")]
    Busy,
    #[error("invalid file name")]
    InvalidFileName,
    #[error("invalid path")]
    InvalidPath,
    /// Descriptor was not opened with the access mode the operation needs.
    #[error("descriptor not opened for this access")]
    AccessDenied,
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u32, detail: String },
    /// Every buffer slot is pinned; nothing can be evicted.
    #[error("all buffer cache slots are pinned")]
    CacheExhausted,
}

pub type Result<T> = core::result::Result<T, FsError>;
