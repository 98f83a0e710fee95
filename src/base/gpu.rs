//! The per-place base allocator for one accelerator device.
//!
//! Source 0 is the device's native allocator, capped by a running total so
//! the buddy never pushes the device past `gpu_fraction` of its capacity.
//! Source 1 is a pinned-and-mapped host fallback, capped independently so
//! the combined host+device footprint never exceeds
//! `system_maximum_allocation_size`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::is_gpu_memory_use_allowed;
use crate::driver::DeviceDriver;

use super::BaseAllocator;

struct NativeSource {
    driver: Arc<dyn DeviceDriver>,
    device: u32,
    gpu_maximum_allocation_size: usize,
    total_allocated: AtomicUsize,
}

impl NativeSource {
    fn malloc(&self, size: usize) -> Option<usize> {
        if !is_gpu_memory_use_allowed() {
            return None;
        }
        self.driver.set_device(self.device);
        let (available, capacity) = self.driver.get_memory_usage();
        let used_by_others = capacity.saturating_sub(available);
        let mut total = self.total_allocated.load(Ordering::Relaxed);
        loop {
            let headroom = self
                .gpu_maximum_allocation_size
                .saturating_sub(used_by_others);
            let next = total.checked_add(size)?;
            if next > headroom {
                return None;
            }
            match self.total_allocated.compare_exchange_weak(
                total,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => total = actual,
            }
        }
        match self.driver.malloc(size) {
            Some(address) => Some(address),
            None => {
                self.total_allocated.fetch_sub(size, Ordering::Relaxed);
                None
            }
        }
    }

    fn free(&self, address: usize, size: usize) {
        self.driver.set_device(self.device);
        self.driver.free(address);
        self.total_allocated.fetch_sub(size, Ordering::Relaxed);
    }
}

struct HostFallbackSource {
    driver: Arc<dyn DeviceDriver>,
    cap: usize,
    total_allocated: AtomicUsize,
}

impl HostFallbackSource {
    fn malloc(&self, size: usize) -> Option<usize> {
        let mut total = self.total_allocated.load(Ordering::Relaxed);
        loop {
            let next = total.checked_add(size)?;
            if next > self.cap {
                return None;
            }
            match self.total_allocated.compare_exchange_weak(
                total,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => total = actual,
            }
        }
        match self.driver.malloc_pinned_mapped(size) {
            Some(address) => Some(address),
            None => {
                self.total_allocated.fetch_sub(size, Ordering::Relaxed);
                None
            }
        }
    }

    fn free(&self, address: usize, size: usize) {
        self.driver.free_pinned_mapped(address);
        self.total_allocated.fetch_sub(size, Ordering::Relaxed);
    }
}

/// Ordered source list backing `Place::Device(device)`.
pub struct GpuAllocator {
    native: NativeSource,
    host_fallback: HostFallbackSource,
}

impl GpuAllocator {
    pub fn new(
        driver: Arc<dyn DeviceDriver>,
        device: u32,
        gpu_maximum_allocation_size: usize,
        system_maximum_allocation_size: usize,
    ) -> Self {
        let host_fallback_cap =
            system_maximum_allocation_size.saturating_sub(gpu_maximum_allocation_size);
        GpuAllocator {
            native: NativeSource {
                driver: driver.clone(),
                device,
                gpu_maximum_allocation_size,
                total_allocated: AtomicUsize::new(0),
            },
            host_fallback: HostFallbackSource {
                driver,
                cap: host_fallback_cap,
                total_allocated: AtomicUsize::new(0),
            },
        }
    }
}

impl BaseAllocator for GpuAllocator {
    fn malloc(&self, size: usize) -> Option<(usize, usize)> {
        if let Some(address) = self.native.malloc(size) {
            return Some((address, 0));
        }
        if let Some(address) = self.host_fallback.malloc(size) {
            return Some((address, 1));
        }
        None
    }

    fn free(&self, address: usize, size: usize, origin_index: usize) {
        match origin_index {
            0 => self.native.free(address, size),
            1 => self.host_fallback.free(address, size),
            other => super::free_out_of_range(other, 2),
        }
    }

    fn uses_gpu() -> bool {
        true
    }
}
