//! The buddy allocator core.
//!
//! Mirrors `original_source/majel/malloc/detail/buddy_allocator.h`'s
//! `BuddyAllocator<BaseAllocator>`, generic here over [`BaseAllocator`]
//! instead of a C++ template parameter. One instance manages all chunks
//! obtained from a single base allocator; the façade owns one CPU instance
//! and one per device.

use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use crate::base::BaseAllocator;
use crate::block::{BlockType, MemoryBlockHeader};
use crate::driver::DeviceDriver;
use crate::error;
use crate::metadata_cache::MetadataCache;
use crate::util::align;

/// `(origin_index, total_size, address)` — lexicographic order gives the
/// lower-bound walk in [`find_best_existing_allocation_with_space`] the
/// "prefer lower origins, don't starve higher ones" behavior directly.
type AllocationSet = BTreeSet<(usize, usize, usize)>;

const FILL_BYTE: u8 = 0xFF;

struct BuddyState {
    allocation_set: AllocationSet,
    cache: MetadataCache,
    total_used: usize,
    total_free: usize,
    fallback_allocations: usize,
    maximum_allocation_size: usize,
    should_initialize_allocations: bool,
}

/// A buddy sub-allocator over chunks obtained from one [`BaseAllocator`].
pub struct BuddyAllocator<B: BaseAllocator> {
    base: B,
    driver: Arc<dyn DeviceDriver>,
    minimum_allocation_size: usize,
    /// Recomputes `maximum_allocation_size` from current device capacity.
    /// `Some` only for device-backed instances, matching
    /// `refill_allocations_`'s "recompute from the live device-capacity
    /// knob" step, which does not apply to the host buddy.
    capacity_probe: Option<Box<dyn Fn() -> usize + Send + Sync>>,
    state: Mutex<BuddyState>,
}

impl<B: BaseAllocator> BuddyAllocator<B> {
    pub fn new(
        base: B,
        driver: Arc<dyn DeviceDriver>,
        minimum_allocation_size: usize,
        maximum_allocation_size: usize,
        should_initialize_allocations: bool,
        capacity_probe: Option<Box<dyn Fn() -> usize + Send + Sync>>,
    ) -> Self {
        BuddyAllocator {
            base,
            driver,
            minimum_allocation_size,
            capacity_probe,
            state: Mutex::new(BuddyState {
                allocation_set: BTreeSet::new(),
                cache: MetadataCache::new(B::uses_gpu()),
                total_used: 0,
                total_free: 0,
                fallback_allocations: 0,
                maximum_allocation_size,
                should_initialize_allocations,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BuddyState> {
        self.state
            .lock()
            .unwrap_or_else(|_| error::fatal("buddy allocator mutex poisoned"))
    }

    /// Requests `unaligned_size` usable bytes; returns the payload address,
    /// or `None` if every base source is exhausted.
    pub fn malloc(&self, unaligned_size: usize) -> Option<usize> {
        let size = align(
            unaligned_size + MemoryBlockHeader::overhead(),
            std::mem::size_of::<usize>().max(self.minimum_allocation_size),
        );
        let mut state = self.lock();

        if size > state.maximum_allocation_size {
            log::trace!("malloc: huge path for {size} bytes");
            let (address, origin_index) = self.base.malloc(size)?;
            let header = MemoryBlockHeader::initialize(BlockType::HugeChunk, origin_index, size, None, None);
            state.cache.store(address, header);
            maybe_initialize(&state, &*self.driver, MemoryBlockHeader::data_ptr(address), header.payload_size);
            return Some(MemoryBlockHeader::data_ptr(address));
        }

        let candidate = find_best_existing_allocation_with_space(&state.allocation_set, size)
            .or_else(|| refill_allocations(&mut state, &self.base, self.capacity_probe.as_deref()));
        let (origin_index, total_size, address) = candidate?;

        state.allocation_set.remove(&(origin_index, total_size, address));
        state.total_free -= size;
        state.total_used += size;

        let block_address = split_and_prepare_allocation(&mut state, address, size);
        let payload = MemoryBlockHeader::data_ptr(block_address);
        let payload_size = size - MemoryBlockHeader::overhead();
        maybe_initialize(&state, &*self.driver, payload, payload_size);
        log::trace!("malloc: returning {size} bytes at {payload:#x} (origin {origin_index})");
        Some(payload)
    }

    /// Releases a payload pointer previously returned by [`malloc`](Self::malloc).
    pub fn free(&self, payload_ptr: usize) {
        let block_address = MemoryBlockHeader::from_data_ptr(payload_ptr);
        let mut state = self.lock();
        let mut header = state.cache.load(block_address, &*self.driver);

        if header.block_type == BlockType::HugeChunk {
            log::trace!("free: huge chunk at {block_address:#x}");
            self.base.free(block_address, header.total_size, header.origin_index);
            state.cache.invalidate(block_address);
            return;
        }

        header.block_type = BlockType::Free;
        state.total_used -= header.total_size;
        state.total_free += header.total_size;

        let mut final_address = block_address;
        let mut final_header = header;

        if let Some(right) = final_header.right_buddy {
            let right_address = right.get();
            let right_header = state.cache.load(right_address, &*self.driver);
            let has_right_buddy = right_header.block_type != BlockType::HugeChunk
                && right_header.block_type != BlockType::Invalid;
            if has_right_buddy && right_header.block_type == BlockType::Free {
                state.allocation_set.remove(&(
                    right_header.origin_index,
                    right_header.total_size,
                    right_address,
                ));
                merge(&mut state, &mut final_header, final_address, right_address, right_header);
            }
        }

        if let Some(left) = final_header.left_buddy {
            let left_address = left.get();
            let left_header = state.cache.load(left_address, &*self.driver);
            if left_header.block_type == BlockType::Free {
                state.allocation_set.remove(&(
                    left_header.origin_index,
                    left_header.total_size,
                    left_address,
                ));
                let mut merged_left = left_header;
                merge(&mut state, &mut merged_left, left_address, final_address, final_header);
                final_address = left_address;
                final_header = merged_left;
            }
        }

        state.cache.store(final_address, final_header);
        state.allocation_set.insert((
            final_header.origin_index,
            final_header.total_size,
            final_address,
        ));

        maybe_initialize(
            &state,
            &*self.driver,
            MemoryBlockHeader::data_ptr(final_address),
            final_header.payload_size,
        );

        clean_allocations(&mut state, &self.base, B::uses_gpu());
    }

    /// Bytes currently handed out to callers. Excludes huge-chunk bytes and
    /// free chunks retained from the base allocator — see DESIGN.md.
    pub fn memory_used(&self) -> usize {
        self.lock().total_used
    }

    #[cfg(test)]
    fn total_free(&self) -> usize {
        self.lock().total_free
    }

    #[cfg(test)]
    fn fallback_allocations(&self) -> usize {
        self.lock().fallback_allocations
    }
}

impl<B: BaseAllocator> Drop for BuddyAllocator<B> {
    /// Releases every tracked base allocation. A set containing a split
    /// sub-block (`total_size != maximum_allocation_size`) means the
    /// allocator was torn down while still holding live user allocations,
    /// which this crate treats as a fatal invariant violation rather than
    /// risk mis-freeing part of a chunk back to the base.
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        for &(origin_index, total_size, address) in state.allocation_set.iter() {
            if total_size != state.maximum_allocation_size {
                // Panicking in `drop` while already unwinding aborts the
                // process immediately instead of propagating the original
                // panic; log and stop releasing instead so a panic earlier
                // in this thread (e.g. a guard-mismatch test) doesn't turn
                // into an uncatchable double panic.
                if std::thread::panicking() {
                    log::error!(
                        "teardown with undrained split block at {address:#x} during unwind; skipping remaining release"
                    );
                    return;
                }
                error::fatal(error::Error::invariant(format!(
                    "teardown with undrained split block at {address:#x} (total_size {total_size} != maximum {})",
                    state.maximum_allocation_size
                )));
            }
            state.cache.invalidate(address);
            self.base.free(address, state.maximum_allocation_size, origin_index);
        }
        state.allocation_set.clear();
    }
}

fn maybe_initialize(state: &BuddyState, driver: &dyn DeviceDriver, payload: usize, payload_size: usize) {
    if state.should_initialize_allocations {
        driver.memset_sync(payload, FILL_BYTE, payload_size);
    }
}

/// Walks the set preferring the lowest origin index with enough space,
/// advancing to higher origins only when the lowest nonempty one can't
/// satisfy the request.
fn find_best_existing_allocation_with_space(
    set: &AllocationSet,
    size: usize,
) -> Option<(usize, usize, usize)> {
    let mut next_index = 0usize;
    loop {
        let probe = (next_index, size, 0usize);
        let &(origin, total_size, address) = set.range(probe..).next()?;
        if origin == next_index || total_size >= size {
            return Some((origin, total_size, address));
        }
        next_index = origin;
    }
}

fn refill_allocations<B: BaseAllocator>(
    state: &mut BuddyState,
    base: &B,
    capacity_probe: Option<&(dyn Fn() -> usize + Send + Sync)>,
) -> Option<(usize, usize, usize)> {
    if B::uses_gpu() && state.allocation_set.is_empty() {
        if let Some(probe) = capacity_probe {
            state.maximum_allocation_size = probe();
        }
    }
    let size = state.maximum_allocation_size;
    let (address, origin_index) = base.malloc(size)?;
    log::debug!("refill: new {size}-byte chunk at {address:#x} (origin {origin_index})");
    let header = MemoryBlockHeader::initialize(BlockType::Free, origin_index, size, None, None);
    state.cache.store(address, header);
    state.total_free += size;
    if origin_index > 0 {
        state.fallback_allocations += 1;
        log::warn!("refill: fallback allocation from origin {origin_index}");
    }
    state.allocation_set.insert((origin_index, size, address));
    Some((origin_index, size, address))
}

/// Carves `size` bytes off the block at `address`, leaving any remainder as
/// a new `Free` buddy. `address` must already have been removed from
/// `allocation_set` by the caller.
fn split_and_prepare_allocation(state: &mut BuddyState, address: usize, size: usize) -> usize {
    let mut header = state.cache.load(address, &NullDriver);
    debug_assert!(header.total_size >= size);

    if header.total_size > size {
        let tail_address = address + size;
        let tail_size = header.total_size - size;
        let original_right = header.right_buddy;
        let tail_header = MemoryBlockHeader::initialize(
            BlockType::Free,
            header.origin_index,
            tail_size,
            NonZeroUsize::new(address),
            original_right,
        );
        state.cache.store(tail_address, tail_header);

        if let Some(right) = original_right {
            let mut right_header = state.cache.load(right.get(), &NullDriver);
            right_header.left_buddy = NonZeroUsize::new(tail_address);
            state.cache.store(right.get(), right_header);
        }

        header.total_size = size;
        header.right_buddy = NonZeroUsize::new(tail_address);
        header.block_type = BlockType::ArenaChunk;
        header.payload_size = size - MemoryBlockHeader::overhead();
        state.cache.store(address, header);

        state
            .allocation_set
            .insert((tail_header.origin_index, tail_header.total_size, tail_address));
    } else {
        header.block_type = BlockType::ArenaChunk;
        state.cache.store(address, header);
    }
    address
}

/// `left` absorbs `right`: `left.total_size += right.total_size`,
/// `left.right_buddy = right.right_buddy` (fixing up that node's
/// `left_buddy` if it exists), and `right` is invalidated in the cache.
fn merge(
    state: &mut BuddyState,
    left_header: &mut MemoryBlockHeader,
    left_address: usize,
    right_address: usize,
    right_header: MemoryBlockHeader,
) {
    left_header.total_size += right_header.total_size;
    left_header.payload_size = left_header.total_size - MemoryBlockHeader::overhead();
    left_header.right_buddy = right_header.right_buddy;
    if let Some(new_right) = right_header.right_buddy {
        let mut new_right_header = state.cache.load(new_right.get(), &NullDriver);
        new_right_header.left_buddy = NonZeroUsize::new(left_address);
        state.cache.store(new_right.get(), new_right_header);
    }
    state.cache.invalidate(right_address);
}

fn is_fallback(uses_gpu: bool, origin_index: usize) -> bool {
    uses_gpu && origin_index > 0
}

/// Release pressure: give chunks back to the base allocator, fallback
/// origins first.
fn clean_allocations<B: BaseAllocator>(state: &mut BuddyState, base: &B, uses_gpu: bool) {
    while state.fallback_allocations > 0 {
        let entry = state
            .allocation_set
            .iter()
            .rev()
            .find(|&&(origin, total_size, _)| {
                total_size == state.maximum_allocation_size && is_fallback(uses_gpu, origin)
            })
            .copied();
        match entry {
            Some((origin_index, total_size, address)) => {
                log::debug!("clean_allocations: releasing fallback chunk at {address:#x}");
                state.allocation_set.remove(&(origin_index, total_size, address));
                state.cache.invalidate(address);
                base.free(address, total_size, origin_index);
                state.total_free -= total_size;
                state.fallback_allocations -= 1;
            }
            None => break,
        }
    }

    while should_free_allocations(state) {
        let entry = state
            .allocation_set
            .range(..(1, 0, 0))
            .rev()
            .find(|&&(_, total_size, _)| total_size == state.maximum_allocation_size)
            .copied();
        match entry {
            Some((origin_index, total_size, address)) => {
                log::debug!("clean_allocations: releasing idle chunk at {address:#x}");
                state.allocation_set.remove(&(origin_index, total_size, address));
                state.cache.invalidate(address);
                base.free(address, total_size, origin_index);
                state.total_free -= total_size;
            }
            None => break,
        }
    }
}

fn should_free_allocations(state: &BuddyState) -> bool {
    (state.total_used + state.maximum_allocation_size) * 2 < state.total_free
}

/// A driver that is never actually called: `split_and_prepare_allocation`
/// and `merge` only touch headers already guaranteed resident in the
/// metadata cache (they were just loaded or just constructed in this same
/// critical section), so the device-mode cache-miss path can't trigger here.
struct NullDriver;

impl DeviceDriver for NullDriver {
    fn device_count(&self) -> u32 {
        0
    }
    fn set_device(&self, _device: u32) {}
    fn get_memory_usage(&self) -> (usize, usize) {
        (0, 0)
    }
    fn malloc(&self, _size: usize) -> Option<usize> {
        None
    }
    fn free(&self, _address: usize) {}
    fn malloc_pinned(&self, _size: usize) -> Option<usize> {
        None
    }
    fn free_pinned(&self, _address: usize, _size: usize) {}
    fn malloc_pinned_mapped(&self, _size: usize) -> Option<usize> {
        None
    }
    fn free_pinned_mapped(&self, _address: usize) {}
    fn memset_sync(&self, _address: usize, _byte: u8, _size: usize) {}
    fn create_stream(&self) -> crate::driver::StreamId {
        error::fatal("NullDriver: unexpected device-mode cache miss inside buddy internals")
    }
    fn memcpy(&self, _dst: usize, _src: usize, _len: usize, _direction: crate::driver::Direction, _stream: crate::driver::StreamId) {}
    fn wait_for_stream(&self, _stream: crate::driver::StreamId) {}
    fn destroy_stream(&self, _stream: crate::driver::StreamId) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::cpu::CpuAllocator;
    use crate::base::gpu::GpuAllocator;
    use crate::config::set_allow_gpu_memory_use;
    use crate::driver::mock::MockDriver;
    use serial_test::serial;

    fn cpu_buddy(maximum: usize, minimum: usize) -> BuddyAllocator<CpuAllocator> {
        let driver: Arc<dyn DeviceDriver> = Arc::new(MockDriver::single(0));
        let base = CpuAllocator::new(driver.clone(), false);
        BuddyAllocator::new(base, driver, minimum, maximum, false, None)
    }

    #[test]
    fn scenario_1_single_alloc_free() {
        let buddy = cpu_buddy(4096, 256);
        let p = buddy.malloc(100).unwrap();
        assert_ne!(p, 0);
        buddy.free(p);
        assert_eq!(buddy.memory_used(), 0);
    }

    #[test]
    fn scenario_2_coalescing() {
        let buddy = cpu_buddy(4096, 256);
        let a = buddy.malloc(1000).unwrap();
        let b = buddy.malloc(1000).unwrap();
        let c = buddy.malloc(1000).unwrap();
        buddy.free(b);
        buddy.free(a);
        buddy.free(c);
        assert_eq!(buddy.memory_used(), 0);
        assert_eq!(buddy.total_free(), 4096);
    }

    #[test]
    fn scenario_3_huge_path_bypasses_allocation_set() {
        let buddy = cpu_buddy(4096, 256);
        let p = buddy.malloc(10000).unwrap();
        assert_eq!(buddy.total_free(), 0);
        buddy.free(p);
        assert_eq!(buddy.memory_used(), 0);
    }

    #[test]
    fn scenario_5_best_fit_across_origins() {
        let buddy = cpu_buddy(4096, 256);
        let mut set = AllocationSet::new();
        set.insert((0, 256, 0x1000));
        set.insert((0, 1024, 0x2000));
        set.insert((1, 512, 0x3000));
        let best = find_best_existing_allocation_with_space(&set, 512).unwrap();
        assert_eq!(best, (0, 1024, 0x2000));
        let _ = buddy;
    }

    #[test]
    #[serial]
    fn scenario_4_fallback_released_before_preferred() {
        set_allow_gpu_memory_use(true);
        // Each refill pulls a full chunk; the native source satisfies only
        // the first before the mock device is exhausted, forcing the
        // second chunk onto the pinned-mapped fallback (origin 1).
        let driver: Arc<dyn DeviceDriver> = Arc::new(MockDriver::single(1024));
        let base = GpuAllocator::new(driver.clone(), 0, 1024, 2048);
        let buddy = BuddyAllocator::new(base, driver, 256, 1024, false, None);

        let a = buddy.malloc(900).unwrap();
        let b = buddy.malloc(900).unwrap();
        assert_eq!(buddy.fallback_allocations(), 1);

        buddy.free(a);
        buddy.free(b);
        // both chunks now idle and one is a fallback chunk; clean_allocations
        // should have released the fallback chunk during the second free.
        assert_eq!(buddy.fallback_allocations(), 0);
    }

    #[test]
    fn scenario_6_guard_corruption_is_fatal() {
        let result = std::panic::catch_unwind(|| {
            let buddy = cpu_buddy(4096, 256);
            let p = buddy.malloc(100).unwrap();
            let block_address = MemoryBlockHeader::from_data_ptr(p);
            unsafe {
                let byte = block_address as *mut u8;
                *byte = byte.read().wrapping_add(1);
            }
            buddy.free(p);
        });
        assert!(result.is_err());
    }

    #[test]
    fn scenario_7_idle_preferred_chunks_are_released_under_pressure() {
        let buddy = cpu_buddy(256, 64);
        let full_payload = 256 - MemoryBlockHeader::overhead();
        let keep = buddy.malloc(full_payload).unwrap();
        let idle: Vec<usize> = (0..5).map(|_| buddy.malloc(full_payload).unwrap()).collect();
        for &p in &idle {
            buddy.free(p);
        }
        // Five idle full-size origin-0 chunks against one still-used chunk
        // crosses should_free_allocations' threshold; the normal-release
        // phase (not the fallback phase, since this base has only origin 0)
        // must actually return at least one chunk to the base allocator
        // instead of hoarding all of them.
        assert!(buddy.total_free() < 5 * 256);
        buddy.free(keep);
    }

    #[test]
    fn p1_alignment_and_overhead() {
        let buddy = cpu_buddy(4096, 256);
        let p = buddy.malloc(13).unwrap();
        assert_eq!(p % std::mem::align_of::<MemoryBlockHeader>(), 0);
        assert!(p >= MemoryBlockHeader::from_data_ptr(p) + MemoryBlockHeader::overhead());
        buddy.free(p);
    }

    #[test]
    fn p5_malloc_free_pair_is_memory_neutral() {
        let buddy = cpu_buddy(4096, 256);
        let before = buddy.memory_used();
        let p = buddy.malloc(300).unwrap();
        buddy.free(p);
        assert_eq!(buddy.memory_used(), before);
    }

    #[test]
    fn p7_round_trip_zero_after_every_pair() {
        let buddy = cpu_buddy(4096, 256);
        assert_eq!(buddy.memory_used(), 0);
        for size in [64, 500, 2000] {
            let p = buddy.malloc(size).unwrap();
            assert_ne!(buddy.memory_used(), 0);
            buddy.free(p);
            assert_eq!(buddy.memory_used(), 0);
        }
    }
}
