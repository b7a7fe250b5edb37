//! Write-back buffer cache over the data region.
//!
//! A small fixed pool of block buffers, fully associative. A miss takes the
//! first available slot (an empty one if there is any), writing it back first
//! when dirty. There is no recency policy: higher layers pin a slot while they
//! interpret its payload across calls that may themselves go through the cache.
//!
//! Block ids handed to the cache are data-region ids; the cache adds the
//! region's starting device block.

use tracing::trace;

use crate::block_dev::BlockDevice;
use crate::config::{BLOCK_SIZE, CACHE_SLOTS};
use crate::error::{FsError, Result};

/// Handle to a cache slot. Valid until the next `fetch` unless the slot is pinned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotId(usize);

#[derive(Debug)]
struct BufferSlot {
    block_id: Option<u32>,
    dirty: bool,
    available: bool,
    data: Box<[u8; BLOCK_SIZE]>,
}

impl BufferSlot {
    fn empty() -> Self {
        Self {
            block_id: None,
            dirty: false,
            available: true,
            data: Box::new([0u8; BLOCK_SIZE]),
        }
    }
}

#[derive(Debug)]
pub struct BufferCache<D: BlockDevice> {
    device: D,
    data_start: u32,
    slots: Vec<BufferSlot>,
}

impl<D: BlockDevice> BufferCache<D> {
    pub fn new(device: D, data_start: u32) -> Self {
        Self {
            device,
            data_start,
            slots: (0..CACHE_SLOTS).map(|_| BufferSlot::empty()).collect(),
        }
    }

    /// Direct device access for metadata outside the data region.
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Gives the device back. Dirty slots are dropped; call `flush_all` first.
    pub fn into_device(self) -> D {
        self.device
    }

    fn device_block(&self, block_id: u32) -> Result<u32> {
        self.data_start
            .checked_add(block_id)
            .filter(|&b| b < self.device.num_blocks())
            .ok_or_else(|| FsError::Corruption {
                block: block_id,
                detail: "data block id outside the data region".to_string(),
            })
    }

    fn lookup(&self, block_id: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.block_id == Some(block_id))
    }

    fn victim(&self) -> Result<usize> {
        self.slots
            .iter()
            .position(|slot| slot.available && slot.block_id.is_none())
            .or_else(|| self.slots.iter().position(|slot| slot.available))
            .ok_or(FsError::CacheExhausted)
    }

    fn write_back(&mut self, idx: usize) -> Result<()> {
        let slot = &self.slots[idx];
        if let (true, Some(block_id)) = (slot.dirty, slot.block_id) {
            let device_block = self.device_block(block_id)?;
            self.device.write_block(device_block, &self.slots[idx].data)?;
            self.slots[idx].dirty = false;
        }
        Ok(())
    }

    /// Claims a slot for `block_id`, writing back whatever it held.
    /// On a failed write-back the slot keeps its block and its dirty flag.
    fn claim(&mut self, block_id: u32) -> Result<usize> {
        let idx = self.victim()?;
        if let Some(old) = self.slots[idx].block_id {
            trace!(target: "flatfs::cache", slot = idx, evicted = old, incoming = block_id, "evict");
        }
        self.write_back(idx)?;
        self.slots[idx].block_id = None;
        Ok(idx)
    }

    /// Returns the slot holding `block_id`, reading it from the device on a miss.
    pub fn fetch(&mut self, block_id: u32) -> Result<SlotId> {
        if let Some(idx) = self.lookup(block_id) {
            trace!(target: "flatfs::cache", slot = idx, block_id, "hit");
            return Ok(SlotId(idx));
        }
        let device_block = self.device_block(block_id)?;
        let idx = self.claim(block_id)?;
        self.device
            .read_block(device_block, &mut self.slots[idx].data)?;
        let slot = &mut self.slots[idx];
        slot.block_id = Some(block_id);
        slot.dirty = false;
        trace!(target: "flatfs::cache", slot = idx, block_id, "miss");
        Ok(SlotId(idx))
    }

    /// Like `fetch`, but the payload is zero-filled and marked dirty instead of
    /// being read. Used for freshly allocated blocks.
    pub fn fetch_zeroed(&mut self, block_id: u32) -> Result<SlotId> {
        self.device_block(block_id)?;
        let idx = match self.lookup(block_id) {
            Some(idx) => idx,
            None => self.claim(block_id)?,
        };
        let slot = &mut self.slots[idx];
        slot.data.fill(0);
        slot.block_id = Some(block_id);
        slot.dirty = true;
        Ok(SlotId(idx))
    }

    pub fn data(&self, slot: SlotId) -> &[u8; BLOCK_SIZE] {
        &self.slots[slot.0].data
    }

    /// Mutable payload access. The slot is flagged dirty.
    pub fn data_mut(&mut self, slot: SlotId) -> &mut [u8; BLOCK_SIZE] {
        let slot = &mut self.slots[slot.0];
        slot.dirty = true;
        &mut slot.data
    }

    /// Keeps the slot from being chosen as an eviction victim.
    pub fn pin(&mut self, slot: SlotId) {
        self.slots[slot.0].available = false;
    }

    pub fn unpin(&mut self, slot: SlotId) {
        self.slots[slot.0].available = true;
    }

    /// Fetches `block_id` and hands its payload to `f`.
    pub fn read<R>(&mut self, block_id: u32, f: impl FnOnce(&[u8; BLOCK_SIZE]) -> R) -> Result<R> {
        let slot = self.fetch(block_id)?;
        Ok(f(self.data(slot)))
    }

    /// Fetches `block_id`, lets `f` edit the payload and marks it dirty.
    pub fn modify<R>(
        &mut self,
        block_id: u32,
        f: impl FnOnce(&mut [u8; BLOCK_SIZE]) -> R,
    ) -> Result<R> {
        let slot = self.fetch(block_id)?;
        Ok(f(self.data_mut(slot)))
    }

    pub fn is_cached(&self, block_id: u32) -> bool {
        self.lookup(block_id).is_some()
    }

    pub fn dirty_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.dirty).count()
    }

    /// Writes every dirty slot back and flushes the device.
    pub fn flush_all(&mut self) -> Result<()> {
        for idx in 0..self.slots.len() {
            self.write_back(idx)?;
        }
        self.device.flush()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block_dev::MemDisk;

    const DATA_START: u32 = 2;

    fn cache(blocks: u32) -> BufferCache<MemDisk> {
        BufferCache::new(MemDisk::new(blocks), DATA_START)
    }

    #[test]
    fn test_hit_returns_same_slot() {
        let mut cache = cache(32);
        let a = cache.fetch(3).unwrap();
        let b = cache.fetch(3).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_write_back_on_flush_lands_at_region_offset() {
        let mut cache = cache(32);
        cache.modify(1, |buf| buf[0] = 0xAB).unwrap();
        assert_eq!(cache.dirty_count(), 1);
        cache.flush_all().unwrap();
        assert_eq!(cache.dirty_count(), 0);
        let disk = cache.into_device();
        assert_eq!(disk.as_bytes()[(DATA_START as usize + 1) * BLOCK_SIZE], 0xAB);
    }

    #[test]
    fn test_eviction_writes_dirty_victim() {
        let mut cache = cache(64);
        for id in 0..CACHE_SLOTS as u32 {
            cache.modify(id, |buf| buf[7] = id as u8 + 1).unwrap();
        }
        // Pool is full, the next miss must evict and persist slot 0's block.
        cache.fetch(40).unwrap();
        assert!(!cache.is_cached(0));
        assert!(cache.is_cached(40));
        let value = cache.read(0, |buf| buf[7]).unwrap();
        assert_eq!(value, 1);
    }

    /// Device whose writes fail while `broken` is set.
    struct FlakyDisk {
        inner: MemDisk,
        broken: bool,
    }

    impl BlockDevice for FlakyDisk {
        fn num_blocks(&self) -> u32 {
            self.inner.num_blocks()
        }

        fn read_block(&mut self, block_id: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
            self.inner.read_block(block_id, buf)
        }

        fn write_block(&mut self, block_id: u32, buf: &[u8; BLOCK_SIZE]) -> Result<()> {
            if self.broken {
                return Err(std::io::Error::other("injected write failure").into());
            }
            self.inner.write_block(block_id, buf)
        }

        fn flush(&mut self) -> Result<()> {
            self.inner.flush()
        }
    }

    #[test]
    fn test_failed_write_back_keeps_victim_dirty() {
        let disk = FlakyDisk {
            inner: MemDisk::new(64),
            broken: false,
        };
        let mut cache = BufferCache::new(disk, DATA_START);
        for id in 0..CACHE_SLOTS as u32 {
            cache.modify(id, |buf| buf[0] = id as u8 + 1).unwrap();
        }

        cache.device_mut().broken = true;
        assert!(matches!(cache.fetch(40), Err(FsError::Io(_))));
        assert_eq!(cache.dirty_count(), CACHE_SLOTS);
        assert!(cache.is_cached(0));
        assert!(!cache.is_cached(40));
        assert!(cache.flush_all().is_err());

        cache.device_mut().broken = false;
        cache.flush_all().unwrap();
        assert_eq!(cache.dirty_count(), 0);
        let disk = cache.into_device();
        for id in 0..CACHE_SLOTS {
            let at = (DATA_START as usize + id) * BLOCK_SIZE;
            assert_eq!(disk.inner.as_bytes()[at], id as u8 + 1);
        }
    }

    #[test]
    fn test_pinned_slot_survives_misses() {
        let mut cache = cache(64);
        let pinned = cache.fetch(5).unwrap();
        cache.pin(pinned);
        for id in 10..10 + 2 * CACHE_SLOTS as u32 {
            cache.fetch(id).unwrap();
        }
        assert!(cache.is_cached(5));
        cache.unpin(pinned);
    }

    #[test]
    fn test_all_pinned_is_an_error() {
        let mut cache = cache(64);
        for id in 0..CACHE_SLOTS as u32 {
            let slot = cache.fetch(id).unwrap();
            cache.pin(slot);
        }
        assert!(matches!(cache.fetch(50), Err(FsError::CacheExhausted)));
    }

    #[test]
    fn test_fetch_zeroed_clears_cached_payload() {
        let mut cache = cache(32);
        cache.modify(4, |buf| buf.fill(9)).unwrap();
        let slot = cache.fetch_zeroed(4).unwrap();
        assert!(cache.data(slot).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_block_outside_region_is_rejected() {
        let mut cache = cache(8);
        assert!(matches!(cache.fetch(6), Err(FsError::Corruption { .. })));
    }
}
