//! Header storage, split between in-band host reads and a device-mode
//! side-table.
//!
//! Mirrors `original_source/majel/malloc/detail/metadata_cache.{h,cc}`.
//! Host mode treats `block_address` as directly dereferenceable: the header
//! lives in the allocation itself. Device mode never dereferences a block
//! address from the host — it keeps an authoritative side-table and pulls a
//! fresh copy over `DeviceDriver::memcpy` only on a cache miss.

use std::collections::HashMap;

use crate::block::MemoryBlockHeader;
use crate::driver::{DeviceDriver, Direction};
use crate::error;

/// Where block headers for one buddy instance are stored.
pub enum MetadataCache {
    /// Headers live in-band at the block's address.
    Host,
    /// Headers live on the device; this side-table is the host's cached view.
    Device(HashMap<usize, MemoryBlockHeader>),
}

impl MetadataCache {
    /// Builds a cache appropriate for a buddy whose base allocator sources
    /// device memory (`uses_gpu = true`) or host memory (`false`).
    pub fn new(uses_gpu: bool) -> Self {
        if uses_gpu {
            MetadataCache::Device(HashMap::new())
        } else {
            MetadataCache::Host
        }
    }

    /// Reads the header at `block_address`, validating its guards.
    ///
    /// In device mode, a cache miss triggers a synchronous device→host copy
    /// of `overhead()` bytes on a freshly created stream before the guard
    /// check and caching.
    pub fn load(&mut self, block_address: usize, driver: &dyn DeviceDriver) -> MemoryBlockHeader {
        let header = match self {
            MetadataCache::Host => unsafe {
                *(block_address as *const MemoryBlockHeader)
            },
            MetadataCache::Device(cache) => {
                if let Some(header) = cache.get(&block_address) {
                    *header
                } else {
                    let mut staging = std::mem::MaybeUninit::<MemoryBlockHeader>::uninit();
                    let stream = driver.create_stream();
                    driver.memcpy(
                        staging.as_mut_ptr() as usize,
                        block_address,
                        MemoryBlockHeader::overhead(),
                        Direction::DeviceToHost,
                        stream,
                    );
                    driver.wait_for_stream(stream);
                    driver.destroy_stream(stream);
                    let header = unsafe { staging.assume_init() };
                    cache.insert(block_address, header);
                    header
                }
            }
        };
        if !header.check_guards() {
            error::fatal(error::Error::invariant(format!(
                "guard mismatch loading block at {block_address:#x}"
            )));
        }
        header
    }

    /// Writes `header` back after refreshing its guards.
    ///
    /// In device mode this updates only the host-side cache — the
    /// device-resident header is not copied back here. The device's guard
    /// bytes therefore diverge from the cached view immediately after the
    /// first mutation in device mode; see DESIGN.md for this open question.
    pub fn store(&mut self, block_address: usize, mut header: MemoryBlockHeader) {
        header.update_guards();
        match self {
            MetadataCache::Host => unsafe {
                *(block_address as *mut MemoryBlockHeader) = header;
            },
            MetadataCache::Device(cache) => {
                cache.insert(block_address, header);
            }
        }
    }

    /// Drops any cached entry for `block_address`. A no-op in host mode; in
    /// device mode the entry must exist (a miss here is an invariant
    /// violation — it means a block was freed to the base without ever
    /// being loaded through this cache).
    pub fn invalidate(&mut self, block_address: usize) {
        if let MetadataCache::Device(cache) = self {
            if cache.remove(&block_address).is_none() {
                error::fatal(error::Error::invariant(format!(
                    "invalidate of untracked block at {block_address:#x}"
                )));
            }
        }
    }

    /// Reserved for future explicit write-back support. Not called by any
    /// current caller; preserved as an unreachable sentinel rather than
    /// silently implemented.
    pub fn acquire(&mut self, _block_address: usize) -> MemoryBlockHeader {
        panic!("not implemented")
    }

    /// See [`acquire`](Self::acquire).
    pub fn release(&mut self, _block_address: usize, _header: MemoryBlockHeader) {
        panic!("not implemented")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockType;
    use crate::driver::mock::MockDriver;

    #[test]
    fn host_mode_round_trips_through_memory() {
        let mut buf = vec![0u8; 4096];
        let address = buf.as_mut_ptr() as usize;
        let header = MemoryBlockHeader::initialize(BlockType::Free, 0, 4096, None, None);
        unsafe { *(address as *mut MemoryBlockHeader) = header };

        let mut cache = MetadataCache::new(false);
        let driver = MockDriver::single(0);
        let loaded = cache.load(address, &driver);
        assert_eq!(loaded.total_size, 4096);

        cache.store(address, loaded);
        let reloaded = cache.load(address, &driver);
        assert!(reloaded.check_guards());
    }

    #[test]
    fn device_mode_caches_after_first_load() {
        let driver = MockDriver::single(1 << 20);
        let device_addr = driver.malloc(4096).unwrap();
        let header = MemoryBlockHeader::initialize(BlockType::Free, 0, 4096, None, None);
        unsafe { *(device_addr as *mut MemoryBlockHeader) = header };

        let mut cache = MetadataCache::new(true);
        let loaded = cache.load(device_addr, &driver);
        assert_eq!(loaded.total_size, 4096);
        // second load must hit the side-table, not the driver, so corrupting
        // the backing memory afterward must not affect it.
        unsafe { std::ptr::write_bytes(device_addr as *mut u8, 0, 4096) };
        let cached = cache.load(device_addr, &driver);
        assert!(cached.check_guards());

        cache.invalidate(device_addr);
    }

    #[test]
    #[should_panic(expected = "not implemented")]
    fn acquire_is_unimplemented() {
        let mut cache = MetadataCache::new(false);
        cache.acquire(0x1000);
    }
}
