//! A dependency-free [`DeviceDriver`] backed by ordinary heap allocations.
//!
//! Used whenever the `cuda` feature is off, which includes every unit and
//! integration test in this crate — the buddy allocator's device-mode code
//! path (metadata cache misses, stream-based copies, `memset_sync`) needs to
//! be exercised without a GPU attached. "Devices" here are just capacity-
//! bounded heaps; copies execute synchronously and streams are bookkeeping
//! only.

use std::alloc::{alloc, alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{Direction, DeviceDriver, StreamId};

const ALIGN: usize = 256;

struct Allocation {
    layout: Layout,
    device: Option<u32>,
}

struct DeviceState {
    capacity: usize,
    used: AtomicUsize,
}

/// A simulated accelerator fleet for tests and the `cuda`-less default build.
pub struct MockDriver {
    devices: Vec<DeviceState>,
    current_device: AtomicU32,
    allocations: Mutex<HashMap<usize, Allocation>>,
    streams: Mutex<HashMap<u64, ()>>,
    next_stream: AtomicU64,
}

impl MockDriver {
    /// Creates a driver simulating `device_capacities.len()` devices, each
    /// with the given capacity in bytes.
    pub fn new(device_capacities: Vec<usize>) -> Self {
        Self {
            devices: device_capacities
                .into_iter()
                .map(|capacity| DeviceState {
                    capacity,
                    used: AtomicUsize::new(0),
                })
                .collect(),
            current_device: AtomicU32::new(0),
            allocations: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            next_stream: AtomicU64::new(1),
        }
    }

    /// A single simulated device with `capacity` bytes, the common case in
    /// tests.
    pub fn single(capacity: usize) -> Self {
        Self::new(vec![capacity])
    }

    fn current(&self) -> usize {
        self.current_device.load(Ordering::Relaxed) as usize
    }

    fn alloc_tracked(&self, size: usize, device: Option<u32>) -> Option<usize> {
        let layout = Layout::from_size_align(size.max(1), ALIGN).ok()?;
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            return None;
        }
        let address = ptr as usize;
        self.allocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address, Allocation { layout, device });
        Some(address)
    }

    fn free_tracked(&self, address: usize) -> Option<Allocation> {
        self.allocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&address)
    }
}

impl DeviceDriver for MockDriver {
    fn device_count(&self) -> u32 {
        self.devices.len() as u32
    }

    fn set_device(&self, device: u32) {
        self.current_device.store(device, Ordering::Relaxed);
    }

    fn get_memory_usage(&self) -> (usize, usize) {
        let device = &self.devices[self.current()];
        let used = device.used.load(Ordering::Relaxed);
        (device.capacity.saturating_sub(used), device.capacity)
    }

    fn malloc(&self, size: usize) -> Option<usize> {
        let device_id = self.current();
        let device = &self.devices[device_id];
        let mut used = device.used.load(Ordering::Relaxed);
        loop {
            let next = used.checked_add(size)?;
            if next > device.capacity {
                return None;
            }
            match device.used.compare_exchange_weak(
                used,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => used = actual,
            }
        }
        match self.alloc_tracked(size, Some(device_id as u32)) {
            Some(address) => Some(address),
            None => {
                device.used.fetch_sub(size, Ordering::Relaxed);
                None
            }
        }
    }

    fn free(&self, address: usize) {
        if let Some(allocation) = self.free_tracked(address) {
            if let Some(device_id) = allocation.device {
                self.devices[device_id as usize]
                    .used
                    .fetch_sub(allocation.layout.size(), Ordering::Relaxed);
            }
            unsafe { dealloc(address as *mut u8, allocation.layout) };
        }
    }

    fn malloc_pinned(&self, size: usize) -> Option<usize> {
        self.alloc_tracked(size, None)
    }

    fn free_pinned(&self, address: usize, _size: usize) {
        if let Some(allocation) = self.free_tracked(address) {
            unsafe { dealloc(address as *mut u8, allocation.layout) };
        }
    }

    fn malloc_pinned_mapped(&self, size: usize) -> Option<usize> {
        let layout = Layout::from_size_align(size.max(1), ALIGN).ok()?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        let address = ptr as usize;
        self.allocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address, Allocation { layout, device: None });
        Some(address)
    }

    fn free_pinned_mapped(&self, address: usize) {
        if let Some(allocation) = self.free_tracked(address) {
            unsafe { dealloc(address as *mut u8, allocation.layout) };
        }
    }

    fn memset_sync(&self, address: usize, byte: u8, size: usize) {
        unsafe { std::ptr::write_bytes(address as *mut u8, byte, size) };
    }

    fn create_stream(&self) -> StreamId {
        let id = self.next_stream.fetch_add(1, Ordering::Relaxed);
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, ());
        StreamId(id)
    }

    fn memcpy(&self, dst: usize, src: usize, len: usize, _direction: Direction, _stream: StreamId) {
        if len == 0 {
            return;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len);
        }
    }

    fn wait_for_stream(&self, _stream: StreamId) {}

    fn destroy_stream(&self, stream: StreamId) {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&stream.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respects_device_capacity() {
        let driver = MockDriver::single(1024);
        let a = driver.malloc(600).unwrap();
        assert!(driver.malloc(600).is_none());
        driver.free(a);
        assert!(driver.malloc(600).is_some());
    }

    #[test]
    fn memcpy_round_trips() {
        let driver = MockDriver::single(4096);
        let src = driver.malloc_pinned(16).unwrap();
        let dst = driver.malloc(16).unwrap();
        unsafe { std::ptr::write_bytes(src as *mut u8, 0xAB, 16) };
        let stream = driver.create_stream();
        driver.memcpy(dst, src, 16, Direction::HostToDevice, stream);
        driver.wait_for_stream(stream);
        driver.destroy_stream(stream);
        let read = unsafe { std::slice::from_raw_parts(dst as *const u8, 16) };
        assert!(read.iter().all(|&b| b == 0xAB));
        driver.free_pinned(src, 16);
        driver.free(dst);
    }
}
