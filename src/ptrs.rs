//! Block payloads viewed as arrays of little-endian `u32` block ids.
//! Used by indirection blocks and by free-list overflow nodes.

use crate::config::{BLOCK_SIZE, PTRS_PER_BLOCK};

pub struct BlockPtrs<'a>(&'a [u8; BLOCK_SIZE]);

impl<'a> BlockPtrs<'a> {
    pub fn new(block: &'a [u8; BLOCK_SIZE]) -> Self {
        Self(block)
    }

    /// Returns the `index`-th id, or `None` past the end of the block.
    pub fn get(&self, index: usize) -> Option<u32> {
        if index >= PTRS_PER_BLOCK {
            return None;
        }
        let at = index * 4;
        let raw = self.0[at..at + 4].try_into().ok()?;
        Some(u32::from_le_bytes(raw))
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..PTRS_PER_BLOCK).filter_map(|i| self.get(i))
    }
}

pub struct BlockPtrsMut<'a>(&'a mut [u8; BLOCK_SIZE]);

impl<'a> BlockPtrsMut<'a> {
    pub fn new(block: &'a mut [u8; BLOCK_SIZE]) -> Self {
        Self(block)
    }

    /// Stores `value` at `index`. Returns false if `index` is out of range.
    pub fn set(&mut self, index: usize, value: u32) -> bool {
        if index >= PTRS_PER_BLOCK {
            return false;
        }
        let at = index * 4;
        self.0[at..at + 4].copy_from_slice(&value.to_le_bytes());
        true
    }

    /// Writes `values` starting at index 0.
    pub fn copy_from(&mut self, values: &[u32]) -> bool {
        if values.len() > PTRS_PER_BLOCK {
            return false;
        }
        for (i, &value) in values.iter().enumerate() {
            self.set(i, value);
        }
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bounds() {
        let mut block = [0u8; BLOCK_SIZE];
        let mut ptrs = BlockPtrsMut::new(&mut block);
        assert!(ptrs.set(PTRS_PER_BLOCK - 1, 77));
        assert!(!ptrs.set(PTRS_PER_BLOCK, 1));
        let view = BlockPtrs::new(&block);
        assert_eq!(view.get(PTRS_PER_BLOCK - 1), Some(77));
        assert_eq!(view.get(PTRS_PER_BLOCK), None);
        assert_eq!(view.iter().filter(|&p| p != 0).count(), 1);
    }
}
