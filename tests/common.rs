//! Common utilities for tests
#![allow(dead_code)]

use flatfs::{FileSystem, FormatOptions, MemDisk, SuperBlock};

pub const ORANGE: &str = "\x1b[38;5;214m";
pub const RESET: &str = "\x1b[0m";

/// Provides a macro for logging messages during tests.
/// e.g. log!("placeholder") -> println!("[test] placeholder");
#[macro_export]
macro_rules! log {
    ($msg:expr, $($arg:tt)*) => {
        println!("{}[test] {}{}", crate::common::ORANGE, format!($msg, $($arg)*), crate::common::RESET)
    };
}

/// Device blocks needed to hold an image formatted with `opts`.
pub fn image_blocks(opts: FormatOptions) -> u32 {
    let (blocks, inodes) = opts.geometry().unwrap();
    SuperBlock::new(blocks, inodes).image_blocks()
}

/// A freshly formatted in-memory file system.
pub fn mem_fs(opts: FormatOptions) -> FileSystem<MemDisk> {
    FileSystem::format(MemDisk::new(image_blocks(opts)), opts).unwrap()
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 253) as u8).collect()
}
