//! The device driver façade.
//!
//! Covers raw device allocation, pinned/mapped host allocation,
//! memory-usage queries, device selection, stream-based host↔device copies,
//! and a synchronous memset. Addresses are opaque `usize` handles on both
//! sides of this trait — device-resident addresses are never dereferenced by
//! the host (see [`crate::metadata_cache`]).
//!
//! [`mock`] backs every test and the default build; [`cuda`] is a real
//! `era_cudart`-backed implementation gated behind the `cuda` feature.

pub mod mock;

#[cfg(feature = "cuda")]
pub mod cuda;

/// Direction of a stream-ordered memory copy, mirroring `cudaMemcpyKind`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
}

/// Opaque handle to a driver-owned stream.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct StreamId(pub u64);

/// The façade a base system allocator and the metadata cache allocate,
/// release, and copy through. One implementation is constructed per process
/// and shared by every device's buddy allocator.
pub trait DeviceDriver: Send + Sync {
    /// Number of accelerator devices visible to this process.
    fn device_count(&self) -> u32;

    /// Makes `device` the current device for this thread's subsequent calls.
    fn set_device(&self, device: u32);

    /// `(available, total)` bytes on the current device.
    fn get_memory_usage(&self) -> (usize, usize);

    /// Allocates `size` bytes of device memory on the current device.
    fn malloc(&self, size: usize) -> Option<usize>;
    /// Frees a device allocation previously returned by [`malloc`](Self::malloc).
    fn free(&self, address: usize);

    /// Allocates `size` bytes of page-locked host memory.
    fn malloc_pinned(&self, size: usize) -> Option<usize>;
    /// Frees a pinned host allocation.
    fn free_pinned(&self, address: usize, size: usize);

    /// Allocates `size` bytes of page-locked host memory mapped into the
    /// current device's address space.
    fn malloc_pinned_mapped(&self, size: usize) -> Option<usize>;
    /// Frees a pinned-and-mapped host allocation.
    fn free_pinned_mapped(&self, address: usize);

    /// Synchronously fills `size` bytes at `address` with `byte`.
    fn memset_sync(&self, address: usize, byte: u8, size: usize);

    /// Creates a new stream on the current device.
    fn create_stream(&self) -> StreamId;
    /// Enqueues an async copy of `len` bytes from `src` to `dst` on `stream`.
    fn memcpy(&self, dst: usize, src: usize, len: usize, direction: Direction, stream: StreamId);
    /// Blocks the calling thread until `stream`'s work has completed.
    fn wait_for_stream(&self, stream: StreamId);
    /// Destroys a stream created with [`create_stream`](Self::create_stream).
    fn destroy_stream(&self, stream: StreamId);
}
