//! The per-place base allocator for host (CPU) memory.
//!
//! Source 0, only present when `use_pinned_host_allocator` resolves true, is
//! page-locked host memory obtained through the driver façade (useful so a
//! GPU place's host-fallback copies don't need an extra pinning step).
//! Source ≥1 is always present and wraps the ordinary system allocator.

use std::alloc::{alloc, dealloc, Layout};
use std::sync::Arc;

use crate::block::MemoryBlockHeader;
use crate::driver::DeviceDriver;

use super::BaseAllocator;

fn layout_for(size: usize) -> Layout {
    let align = std::mem::align_of::<MemoryBlockHeader>();
    Layout::from_size_align(size.max(1), align).expect("size/align combination must be valid")
}

trait Source: Send + Sync {
    fn malloc(&self, size: usize) -> Option<usize>;
    fn free(&self, address: usize, size: usize);
}

struct PinnedSource {
    driver: Arc<dyn DeviceDriver>,
}

impl Source for PinnedSource {
    fn malloc(&self, size: usize) -> Option<usize> {
        self.driver.malloc_pinned(size)
    }

    fn free(&self, address: usize, size: usize) {
        self.driver.free_pinned(address, size);
    }
}

struct DefaultSource;

impl Source for DefaultSource {
    fn malloc(&self, size: usize) -> Option<usize> {
        let ptr = unsafe { alloc(layout_for(size)) };
        if ptr.is_null() {
            None
        } else {
            Some(ptr as usize)
        }
    }

    fn free(&self, address: usize, size: usize) {
        unsafe { dealloc(address as *mut u8, layout_for(size)) };
    }
}

/// Ordered source list backing `Place::HostCpu`.
pub struct CpuAllocator {
    sources: Vec<Box<dyn Source>>,
}

impl CpuAllocator {
    pub fn new(driver: Arc<dyn DeviceDriver>, use_pinned_host_allocator: bool) -> Self {
        let mut sources: Vec<Box<dyn Source>> = Vec::new();
        if use_pinned_host_allocator {
            sources.push(Box::new(PinnedSource { driver }));
        }
        sources.push(Box::new(DefaultSource));
        CpuAllocator { sources }
    }
}

impl BaseAllocator for CpuAllocator {
    fn malloc(&self, size: usize) -> Option<(usize, usize)> {
        for (index, source) in self.sources.iter().enumerate() {
            if let Some(address) = source.malloc(size) {
                return Some((address, index));
            }
        }
        None
    }

    fn free(&self, address: usize, size: usize, origin_index: usize) {
        match self.sources.get(origin_index) {
            Some(source) => source.free(address, size),
            None => super::free_out_of_range(origin_index, self.sources.len()),
        }
    }

    fn uses_gpu() -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockDriver;

    #[test]
    fn default_source_round_trips() {
        let driver: Arc<dyn DeviceDriver> = Arc::new(MockDriver::single(0));
        let allocator = CpuAllocator::new(driver, false);
        let (address, origin) = allocator.malloc(4096).unwrap();
        assert_eq!(origin, 0);
        allocator.free(address, 4096, origin);
    }

    #[test]
    fn pinned_source_is_tried_first_when_enabled() {
        let driver: Arc<dyn DeviceDriver> = Arc::new(MockDriver::single(1 << 20));
        let allocator = CpuAllocator::new(driver, true);
        let (address, origin) = allocator.malloc(4096).unwrap();
        assert_eq!(origin, 0);
        allocator.free(address, 4096, origin);
    }

    #[test]
    #[should_panic]
    fn free_with_invalid_origin_index_is_fatal() {
        let driver: Arc<dyn DeviceDriver> = Arc::new(MockDriver::single(0));
        let allocator = CpuAllocator::new(driver, false);
        allocator.free(0x1000, 4096, 99);
    }
}
