//! Boundary-tag layout and the codecs that read and write it.
//!
//! # Chunk layout
//!
//! Every chunk, free or used, starts with a header of metadata words. The
//! payload handed to callers begins at [`PAYLOAD_OFFSET`] and overlaps the two
//! free-list links, which only exist while the chunk is free.
//!
//! ```text
//!  chunk                                                   next chunk
//!    │                                                         │
//!    ▼                                                         ▼
//!    ┌───────────┬───────┬────────────┬───────────┬─────┬───────────┬─────
//!    │ prev_phys │  tag  │ size|flags │ prev_free │ ... │ prev_phys │ ...
//!    └───────────┴───────┴────────────┴───────────┴─────┴───────────┴─────
//!                                     ├────────── payload (size) ──────────┤
//! ```
//!
//! The `prev_phys` word of a chunk is stored in the last word of its physical
//! predecessor's payload, so it is only meaningful while that predecessor is
//! free. The address of the physical successor is never stored: it is derived
//! from the address and size of the chunk.
//!
//! The `tag` word holds the allocation epoch of a used chunk and
//! [`TOMBSTONE`] once the chunk is released.

use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;

use crate::arena::MemoryRegion;

/// Width of one metadata word.
pub const WORD: u64 = size_of::<u64>() as u64;

const PREV_PHYSICAL_OFFSET: u64 = 0;
const TAG_OFFSET: u64 = PREV_PHYSICAL_OFFSET + WORD;
const SIZE_OFFSET: u64 = TAG_OFFSET + WORD;
const PREV_FREE_OFFSET: u64 = SIZE_OFFSET + WORD;
const NEXT_FREE_OFFSET: u64 = PREV_FREE_OFFSET + WORD;

/// Offset of the payload from the start of its chunk.
pub const PAYLOAD_OFFSET: u64 = PREV_FREE_OFFSET;

/// Bytes each chunk spends on metadata that is not part of some payload.
pub const CHUNK_OVERHEAD: u64 = 2 * WORD;

/// Smallest payload able to hold both free-list links and the successor's
/// `prev_phys` word.
pub const MIN_CHUNK_SIZE: u64 = 3 * WORD;

/// A free chunk is split only if the remainder can become a chunk of its own.
pub const SPLIT_THRESHOLD: u64 = MIN_CHUNK_SIZE + CHUNK_OVERHEAD;

/// Tag value of a chunk that is not owned by any view.
pub const TOMBSTONE: u64 = 0;

/// Offset of a chunk (or of one of its fields) inside an arena.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Debug, derive_more::Display,
)]
#[debug("Address({_0:#x})")]
#[display("{_0:#x}")]
pub struct Address(u64);

impl Address {
    /// Sentinel for "no chunk".
    pub const NULL: Self = Self(u64::MAX);

    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == Self::NULL.0
    }

    #[must_use]
    pub const fn add(self, delta: u64) -> Self {
        Self(self.0 + delta)
    }

    /// Offset of the first payload byte of the chunk at `self`.
    #[must_use]
    pub const fn payload(self) -> u64 {
        self.0 + PAYLOAD_OFFSET
    }
}

bitflags! {
    /// Flag bits kept in the low bits of the size word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChunkFlags: u64 {
        const FREE = 1 << 0;
        const PREV_FREE = 1 << 1;
    }
}

/// Field-level access to boundary tags.
///
/// Implementors only provide word storage; the field contract is shared, so
/// every backend lays out and interprets the tags identically.
pub trait MetadataCodec: Send {
    fn read_word(&self, field: Address) -> u64;

    fn write_word(&mut self, field: Address, value: u64);

    /// Forgets the header of a chunk that has been absorbed by a neighbor.
    fn forget(&mut self, _chunk: Address) {}

    /// Writes a complete size word, flags included.
    fn init_header(&mut self, chunk: Address, size: u64, flags: ChunkFlags) {
        debug_assert_eq!(size & ChunkFlags::all().bits(), 0);
        self.write_word(chunk.add(SIZE_OFFSET), size | flags.bits());
        self.write_word(chunk.add(TAG_OFFSET), TOMBSTONE);
    }

    fn size(&self, chunk: Address) -> u64 {
        self.read_word(chunk.add(SIZE_OFFSET)) & !ChunkFlags::all().bits()
    }

    fn set_size(&mut self, chunk: Address, size: u64) {
        debug_assert_eq!(size & ChunkFlags::all().bits(), 0);
        let flags = self.flags(chunk);
        self.write_word(chunk.add(SIZE_OFFSET), size | flags.bits());
    }

    fn flags(&self, chunk: Address) -> ChunkFlags {
        ChunkFlags::from_bits_truncate(self.read_word(chunk.add(SIZE_OFFSET)))
    }

    fn set_flag(&mut self, chunk: Address, flag: ChunkFlags, value: bool) {
        let field = chunk.add(SIZE_OFFSET);
        let mut word = self.read_word(field);
        if value {
            word |= flag.bits();
        } else {
            word &= !flag.bits();
        }
        self.write_word(field, word);
    }

    fn is_free(&self, chunk: Address) -> bool {
        self.flags(chunk).contains(ChunkFlags::FREE)
    }

    fn set_free(&mut self, chunk: Address, free: bool) {
        self.set_flag(chunk, ChunkFlags::FREE, free);
    }

    fn is_prev_free(&self, chunk: Address) -> bool {
        self.flags(chunk).contains(ChunkFlags::PREV_FREE)
    }

    fn set_prev_free(&mut self, chunk: Address, free: bool) {
        self.set_flag(chunk, ChunkFlags::PREV_FREE, free);
    }

    fn prev_physical(&self, chunk: Address) -> Address {
        Address(self.read_word(chunk.add(PREV_PHYSICAL_OFFSET)))
    }

    fn set_prev_physical(&mut self, chunk: Address, prev: Address) {
        self.write_word(chunk.add(PREV_PHYSICAL_OFFSET), prev.0);
    }

    fn next_physical(&self, chunk: Address) -> Address {
        chunk.add(CHUNK_OVERHEAD + self.size(chunk))
    }

    fn prev_in_list(&self, chunk: Address) -> Address {
        Address(self.read_word(chunk.add(PREV_FREE_OFFSET)))
    }

    fn set_prev_in_list(&mut self, chunk: Address, prev: Address) {
        self.write_word(chunk.add(PREV_FREE_OFFSET), prev.0);
    }

    fn next_in_list(&self, chunk: Address) -> Address {
        Address(self.read_word(chunk.add(NEXT_FREE_OFFSET)))
    }

    fn set_next_in_list(&mut self, chunk: Address, next: Address) {
        self.write_word(chunk.add(NEXT_FREE_OFFSET), next.0);
    }

    fn tag(&self, chunk: Address) -> u64 {
        self.read_word(chunk.add(TAG_OFFSET))
    }

    fn set_tag(&mut self, chunk: Address, tag: u64) {
        self.write_word(chunk.add(TAG_OFFSET), tag);
    }
}

/// Stores boundary tags inside the arena memory itself.
#[derive(Debug)]
pub struct InBandCodec {
    region: Arc<MemoryRegion>,
}

impl InBandCodec {
    #[must_use]
    pub fn new(region: Arc<MemoryRegion>) -> Self {
        Self { region }
    }
}

impl MetadataCodec for InBandCodec {
    fn read_word(&self, field: Address) -> u64 {
        self.region.load_word(field.get())
    }

    fn write_word(&mut self, field: Address, value: u64) {
        self.region.store_word(field.get(), value);
    }
}

/// Stores boundary tags in a table keyed by field address.
///
/// Used when the arena is not addressable memory (a file of extents, or a
/// simulated region). Fields never written read as zero.
#[derive(Debug, Default)]
pub struct SideTableCodec {
    words: HashMap<Address, u64>,
}

impl SideTableCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of metadata words currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

impl MetadataCodec for SideTableCodec {
    fn read_word(&self, field: Address) -> u64 {
        self.words.get(&field).copied().unwrap_or(0)
    }

    fn write_word(&mut self, field: Address, value: u64) {
        self.words.insert(field, value);
    }

    fn forget(&mut self, chunk: Address) {
        for offset in [
            PREV_PHYSICAL_OFFSET,
            TAG_OFFSET,
            SIZE_OFFSET,
            PREV_FREE_OFFSET,
            NEXT_FREE_OFFSET,
        ] {
            self.words.remove(&chunk.add(offset));
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    fn exercise_fields<C: MetadataCodec>(codec: &mut C) {
        let chunk = Address::new(64);
        codec.init_header(chunk, 128, ChunkFlags::FREE);
        assert_eq!(codec.size(chunk), 128);
        assert!(codec.is_free(chunk));
        assert!(!codec.is_prev_free(chunk));
        assert_eq!(codec.tag(chunk), TOMBSTONE);

        codec.set_prev_free(chunk, true);
        codec.set_size(chunk, 256);
        assert_eq!(codec.size(chunk), 256);
        assert_eq!(codec.flags(chunk), ChunkFlags::FREE | ChunkFlags::PREV_FREE);

        codec.set_free(chunk, false);
        assert!(!codec.is_free(chunk));
        assert!(codec.is_prev_free(chunk));
        assert_eq!(codec.size(chunk), 256);

        codec.set_prev_physical(chunk, Address::NULL);
        assert!(codec.prev_physical(chunk).is_null());
        codec.set_prev_in_list(chunk, Address::new(8));
        codec.set_next_in_list(chunk, Address::new(16));
        assert_eq!(codec.prev_in_list(chunk), Address::new(8));
        assert_eq!(codec.next_in_list(chunk), Address::new(16));

        codec.set_tag(chunk, 42);
        assert_eq!(codec.tag(chunk), 42);

        assert_eq!(
            codec.next_physical(chunk),
            Address::new(64 + CHUNK_OVERHEAD + 256)
        );
    }

    #[test]
    fn test_in_band_codec() {
        let region = Arc::new(MemoryRegion::new(4096).unwrap());
        let mut codec = InBandCodec::new(Arc::clone(&region));
        exercise_fields(&mut codec);
        // the payload starts right after the size word
        assert_eq!(region.load_word(64 + PAYLOAD_OFFSET), 8);
    }

    #[test]
    fn test_side_table_codec() {
        let mut codec = SideTableCodec::new();
        assert_eq!(codec.size(Address::new(0)), 0);
        exercise_fields(&mut codec);
        assert!(!codec.is_empty());
        codec.forget(Address::new(64));
        assert!(codec.is_empty());
    }

    #[test]
    fn test_layout_constants() {
        assert_eq!(PAYLOAD_OFFSET, 24);
        assert_eq!(CHUNK_OVERHEAD, 16);
        assert_eq!(SPLIT_THRESHOLD, 40);
        assert_eq!(Address::new(16).payload(), 40);
        assert_eq!(Address::new(0x20).to_string(), "0x20");
    }
}
