pub const MAGIC: [u8; 4] = *b"\x121\n\0";

pub const BLOCK_SIZE: usize = 4096;
pub const SUPERBLOCK_ID: u32 = 0; // Device block holding the superblock
pub const INODE_TABLE_START: u32 = 1; // First device block of the inode table
pub const ROOT_INODE_ID: u32 = 0; // Inode ID for the root directory
pub const NULL_BLOCK: u32 = 0; // Data block 0 is reserved, so 0 means "no block"

pub const INODE_SIZE: usize = 64;
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;

pub const NUM_BLOCK_PTRS: usize = 8; // Direct pointers, or indirection blocks once promoted
pub const PTRS_PER_BLOCK: usize = BLOCK_SIZE / 4; // 32-bit block ids per block
pub const MAX_FILE_SIZE: usize = NUM_BLOCK_PTRS * PTRS_PER_BLOCK * BLOCK_SIZE; // 32 MiB

pub const FREE_STACK_CAPACITY: usize = 500; // Free block ids cached in the superblock

pub const DIR_ENTRY_SIZE: usize = 128;
pub const DIR_NAME_FIELD: usize = DIR_ENTRY_SIZE - 4; // DirEntry size minus inode ID (4 bytes)
pub const MAX_FILE_NAME_LEN: usize = DIR_NAME_FIELD - 1; // Names stay NUL-terminated on disk
pub const DOT_NAME: &str = ".";
pub const DOTDOT_NAME: &str = "..";

pub const CACHE_SLOTS: usize = 16;
pub const MAX_FD: usize = 256;
pub const MIN_BLOCK_COUNT: u32 = 11;
