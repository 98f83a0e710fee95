//! Base system allocators: the bottom of the stack, one ordered list of
//! "sources" per place.
//!
//! In place of the original's `template <typename BaseAllocator> class
//! BuddyAllocator`, [`crate::buddy::BuddyAllocator`] is generic over a
//! `BaseAllocator` trait object implementor, monomorphized per place
//! (`BuddyAllocator<cpu::CpuAllocator>`, `BuddyAllocator<gpu::GpuAllocator>`).

pub mod cpu;
pub mod gpu;

/// A byte-producing strategy at the bottom of the buddy's stack.
///
/// Implementations hold an ordered list of concrete sources internally;
/// `malloc` walks them in order and reports which one produced the chunk as
/// the `origin_index`, `free` dispatches back to that same source.
pub trait BaseAllocator {
    /// Requests `size` bytes, returning `(address, origin_index)` of the
    /// first source able to satisfy it, or `None` if every source failed.
    fn malloc(&self, size: usize) -> Option<(usize, usize)>;

    /// Returns a `size`-byte allocation at `address` to the source
    /// identified by `origin_index`.
    ///
    /// `origin_index` must be a valid index into this allocator's source
    /// list — fatal invariant violation otherwise.
    fn free(&self, address: usize, size: usize, origin_index: usize);

    /// Whether this base allocator's chunks live in device memory.
    ///
    /// An associated function rather than a method: this ties the answer to
    /// the *place* (the monomorphized type), not to instance state,
    /// mirroring the original's `static bool uses_gpu()`.
    fn uses_gpu() -> bool;
}

pub(crate) fn free_out_of_range(origin_index: usize, source_count: usize) -> ! {
    crate::error::fatal(crate::error::Error::invariant(format!(
        "free() origin_index {origin_index} out of range for {source_count} sources"
    )))
}
