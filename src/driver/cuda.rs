//! CUDA-backed [`DeviceDriver`], built on `era_cudart` — the same crate
//! `gpu_prover::prover::context::ProverContext` uses for device selection,
//! stream management, and raw/pinned allocation (see
//! `gpu_prover/src/prover/context.rs` and `gpu_prover/src/prover/memory.rs`
//! in this workspace's history for the call shapes this module mirrors).
//!
//! Only compiled with `--features cuda`, and only usable on a host with a
//! CUDA toolkit installed; every test in this crate instead runs against
//! [`super::mock::MockDriver`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use era_cudart::device::{device_get_count, get_device, set_device as cuda_set_device};
use era_cudart::memory::{
    memory_copy_async, memory_get_info, memory_set_async, CudaHostAllocFlags, DeviceAllocation,
    HostAllocation,
};
use era_cudart::stream::CudaStream;

use super::{Direction, DeviceDriver, StreamId};

/// Tracks the pointer-width metadata `era_cudart`'s RAII allocation types
/// would otherwise own, since this trait's contract is address-in/address-out.
enum Tracked {
    Device(DeviceAllocation<u8>),
    Host(HostAllocation<u8>),
}

/// A [`DeviceDriver`] that dispatches to the CUDA runtime via `era_cudart`.
pub struct CudaDriver {
    allocations: Mutex<HashMap<usize, Tracked>>,
    streams: Mutex<HashMap<u64, CudaStream>>,
    next_stream: AtomicU64,
}

impl CudaDriver {
    /// Probes the CUDA runtime for the device count; fails fatally (via
    /// [`crate::error::fatal`]) if no CUDA-capable devices are visible, since
    /// constructing this driver at all implies the `cuda` feature was
    /// deliberately enabled.
    pub fn new() -> Self {
        if device_get_count().unwrap_or(0) == 0 {
            crate::error::fatal("no CUDA-capable devices visible to this process");
        }
        Self {
            allocations: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            next_stream: AtomicU64::new(1),
        }
    }

    fn track(&self, address: usize, tracked: Tracked) {
        self.allocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address, tracked);
    }

    fn untrack(&self, address: usize) -> Option<Tracked> {
        self.allocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&address)
    }
}

impl Default for CudaDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceDriver for CudaDriver {
    fn device_count(&self) -> u32 {
        device_get_count().unwrap_or(0) as u32
    }

    fn set_device(&self, device: u32) {
        if let Err(e) = cuda_set_device(device as i32) {
            crate::error::fatal(format!("cudaSetDevice({device}) failed: {e:?}"));
        }
    }

    fn get_memory_usage(&self) -> (usize, usize) {
        match memory_get_info() {
            Ok((available, total)) => (available, total),
            Err(e) => crate::error::fatal(format!("cudaMemGetInfo failed: {e:?}")),
        }
    }

    fn malloc(&self, size: usize) -> Option<usize> {
        let allocation = DeviceAllocation::<u8>::alloc(size).ok()?;
        let address = allocation.as_ptr() as usize;
        self.track(address, Tracked::Device(allocation));
        Some(address)
    }

    fn free(&self, address: usize) {
        // Dropping the tracked `DeviceAllocation` runs `cudaFree`.
        self.untrack(address);
    }

    fn malloc_pinned(&self, size: usize) -> Option<usize> {
        let allocation = HostAllocation::<u8>::alloc(size, CudaHostAllocFlags::DEFAULT).ok()?;
        let address = allocation.as_ptr() as usize;
        self.track(address, Tracked::Host(allocation));
        Some(address)
    }

    fn free_pinned(&self, address: usize, _size: usize) {
        self.untrack(address);
    }

    fn malloc_pinned_mapped(&self, size: usize) -> Option<usize> {
        let allocation = HostAllocation::<u8>::alloc(size, CudaHostAllocFlags::MAPPED).ok()?;
        let address = allocation.as_ptr() as usize;
        self.track(address, Tracked::Host(allocation));
        Some(address)
    }

    fn free_pinned_mapped(&self, address: usize) {
        self.untrack(address);
    }

    fn memset_sync(&self, address: usize, byte: u8, size: usize) {
        let stream = CudaStream::create().unwrap_or_else(|e| {
            crate::error::fatal(format!("cudaStreamCreate failed: {e:?}"))
        });
        let slice = unsafe { std::slice::from_raw_parts_mut(address as *mut u8, size) };
        if let Err(e) = memory_set_async(slice, byte, &stream) {
            crate::error::fatal(format!("cudaMemsetAsync failed: {e:?}"));
        }
        stream
            .synchronize()
            .unwrap_or_else(|e| crate::error::fatal(format!("cudaStreamSynchronize failed: {e:?}")));
        stream
            .destroy()
            .unwrap_or_else(|e| crate::error::fatal(format!("cudaStreamDestroy failed: {e:?}")));
    }

    fn create_stream(&self) -> StreamId {
        let stream = CudaStream::create().unwrap_or_else(|e| {
            crate::error::fatal(format!("cudaStreamCreate failed: {e:?}"))
        });
        let id = self.next_stream.fetch_add(1, Ordering::Relaxed);
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, stream);
        StreamId(id)
    }

    fn memcpy(&self, dst: usize, src: usize, len: usize, _direction: Direction, stream: StreamId) {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let Some(cuda_stream) = streams.get(&stream.0) else {
            crate::error::fatal("memcpy on unknown stream");
        };
        let dst_slice = unsafe { std::slice::from_raw_parts_mut(dst as *mut u8, len) };
        let src_slice = unsafe { std::slice::from_raw_parts(src as *const u8, len) };
        if let Err(e) = memory_copy_async(dst_slice, src_slice, cuda_stream) {
            crate::error::fatal(format!("cudaMemcpyAsync failed: {e:?}"));
        }
    }

    fn wait_for_stream(&self, stream: StreamId) {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cuda_stream) = streams.get(&stream.0) {
            if let Err(e) = cuda_stream.synchronize() {
                crate::error::fatal(format!("cudaStreamSynchronize failed: {e:?}"));
            }
        }
    }

    fn destroy_stream(&self, stream: StreamId) {
        if let Some(cuda_stream) = self
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&stream.0)
        {
            let _ = cuda_stream.destroy();
        }
    }
}

/// `get_device()` is exposed for `config`'s parameter resolution, which
/// mirrors `gpu_prover::prover::context::DeviceProperties::new`'s use of the
/// currently-active device.
pub fn current_device() -> i32 {
    get_device().unwrap_or(0)
}
