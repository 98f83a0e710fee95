//! Memory block headers and their corruption-detecting guards.
//!
//! Mirrors `original_source/majel/malloc/detail/memory_block.h` and
//! `memory_block_metadata.{h,cc}`: every chunk the buddy tracks is prefixed
//! by a fixed-size header describing its type, buddy links, and two guard
//! hashes computed over the rest of the header. `left_buddy`/`right_buddy`
//! are `Option<NonZeroUsize>` rather than raw nullable pointers — address
//! `0` is never a valid block address, so this keeps the header
//! pointer-width without a separate "has buddy" flag.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;

/// What a tracked block currently holds.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum BlockType {
    /// On a free list, available for `malloc` to carve from.
    Free = 0,
    /// A live user allocation produced by splitting a chunk.
    ArenaChunk = 1,
    /// A live user allocation larger than `maximum_allocation_size`, passed
    /// through to the base allocator unchanged.
    HugeChunk = 2,
    /// Sentinel for a header that has not been initialized, or one that
    /// failed guard validation.
    Invalid = 3,
}

const GUARD_SEED_BEGIN: u64 = 1;
const GUARD_SEED_END: u64 = 2;

/// Fixed-size metadata immediately preceding a block's payload bytes.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct MemoryBlockHeader {
    pub block_type: BlockType,
    pub origin_index: usize,
    pub payload_size: usize,
    pub total_size: usize,
    pub left_buddy: Option<NonZeroUsize>,
    pub right_buddy: Option<NonZeroUsize>,
    guard_begin: u64,
    guard_end: u64,
}

impl MemoryBlockHeader {
    /// Size of the header itself — the per-block overhead subtracted from
    /// every requested size and added to every base allocation size.
    pub fn overhead() -> usize {
        std::mem::size_of::<MemoryBlockHeader>()
    }

    /// Builds a freshly-initialized header for a region of `size` bytes,
    /// with guards already computed.
    pub fn initialize(
        block_type: BlockType,
        origin_index: usize,
        size: usize,
        left_buddy: Option<NonZeroUsize>,
        right_buddy: Option<NonZeroUsize>,
    ) -> Self {
        let mut header = MemoryBlockHeader {
            block_type,
            origin_index,
            payload_size: size.saturating_sub(Self::overhead()),
            total_size: size,
            left_buddy,
            right_buddy,
            guard_begin: 0,
            guard_end: 0,
        };
        header.update_guards();
        header
    }

    fn hash_fields(&self, seed: u64) -> u64 {
        let mut hasher = DefaultHasher::new();
        hasher.write_u64(seed);
        (self.block_type as u8).hash(&mut hasher);
        self.origin_index.hash(&mut hasher);
        self.payload_size.hash(&mut hasher);
        self.total_size.hash(&mut hasher);
        self.left_buddy.map(NonZeroUsize::get).unwrap_or(0).hash(&mut hasher);
        self.right_buddy.map(NonZeroUsize::get).unwrap_or(0).hash(&mut hasher);
        hasher.finish()
    }

    /// Recomputes both guard hashes from the current field values. Must be
    /// called after every mutation to the header before it is stored.
    pub fn update_guards(&mut self) {
        self.guard_begin = self.hash_fields(GUARD_SEED_BEGIN);
        self.guard_end = self.hash_fields(GUARD_SEED_END);
    }

    /// Whether both guards still match the current field values.
    pub fn check_guards(&self) -> bool {
        self.guard_begin == self.hash_fields(GUARD_SEED_BEGIN)
            && self.guard_end == self.hash_fields(GUARD_SEED_END)
    }

    /// The payload address for a block header stored at `block_address`.
    pub fn data_ptr(block_address: usize) -> usize {
        block_address + Self::overhead()
    }

    /// The block address for a payload pointer returned by [`data_ptr`](Self::data_ptr).
    pub fn from_data_ptr(payload_address: usize) -> usize {
        payload_address - Self::overhead()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_header_passes_guard_check() {
        let header = MemoryBlockHeader::initialize(BlockType::Free, 0, 4096, None, None);
        assert!(header.check_guards());
        assert_eq!(header.payload_size, 4096 - MemoryBlockHeader::overhead());
    }

    #[test]
    fn mutating_a_field_without_updating_guards_fails_check() {
        let mut header = MemoryBlockHeader::initialize(BlockType::Free, 0, 4096, None, None);
        header.total_size = 2048;
        assert!(!header.check_guards());
        header.update_guards();
        assert!(header.check_guards());
    }

    #[test]
    fn data_ptr_round_trips() {
        let block_address = 0x1000;
        let payload = MemoryBlockHeader::data_ptr(block_address);
        assert_eq!(MemoryBlockHeader::from_data_ptr(payload), block_address);
        assert_eq!(payload - block_address, MemoryBlockHeader::overhead());
    }

    #[test]
    fn guard_corruption_is_detected() {
        let mut header = MemoryBlockHeader::initialize(BlockType::ArenaChunk, 1, 1024, None, None);
        assert!(header.check_guards());
        header.origin_index = 2;
        assert!(!header.check_guards(), "corrupting a field without updating guards must fail validation");
    }
}
