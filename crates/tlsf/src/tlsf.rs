//! TLSF allocation, splitting and coalescing over boundary tags.
//!
//! [`Tlsf`] is not synchronized; [`BufferAllocator`](crate::BufferAllocator)
//! wraps it in a lock. Every method here runs inside that critical section.

use snafu::ensure;

use crate::{
    codec::{Address, CHUNK_OVERHEAD, ChunkFlags, MIN_CHUNK_SIZE, MetadataCodec, PAYLOAD_OFFSET,
        SPLIT_THRESHOLD, TOMBSTONE, WORD},
    config::MIN_ALIGNMENT,
    error::{CorruptedMetadataSnafu, DoubleReleaseSnafu, ReleaseError},
    index::{FIRST_LEVEL_COUNT, FreeListIndex},
};

/// Physical description of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    pub address: Address,
    pub size: u64,
    pub free: bool,
}

/// Result of a full walk over an arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaSnapshot {
    /// Chunks in address order.
    pub chunks: Vec<ChunkInfo>,
    /// Bytes covered by the chunk chain, including per-chunk overhead.
    pub covered_bytes: u64,
}

impl ArenaSnapshot {
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.chunks.iter().filter(|c| c.free).map(|c| c.size).sum()
    }

    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.chunks.iter().filter(|c| !c.free).map(|c| c.size).sum()
    }

    #[must_use]
    pub fn free_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| c.free).count()
    }

    #[must_use]
    pub fn largest_free(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| c.free)
            .map(|c| c.size)
            .max()
            .unwrap_or(0)
    }
}

pub struct Tlsf<C> {
    codec: C,
    index: FreeListIndex,
    alignment: u64,
    total_size: u64,
}

impl<C> Tlsf<C>
where
    C: MetadataCodec,
{
    /// Formats an arena of `total_size` bytes as one free chunk.
    pub fn new(mut codec: C, alignment: u64, total_size: u64) -> Self {
        assert!(alignment.is_power_of_two() && alignment >= 4);
        assert!(total_size >= PAYLOAD_OFFSET + MIN_CHUNK_SIZE);
        assert!(total_size.is_multiple_of(WORD));

        let mut index = FreeListIndex::new(alignment);
        let first = Address::new(0);
        codec.set_prev_physical(first, Address::NULL);
        codec.init_header(first, total_size - PAYLOAD_OFFSET, ChunkFlags::FREE);
        index.insert(&mut codec, first);

        Self {
            codec,
            index,
            alignment,
            total_size,
        }
    }

    /// Payload bytes of the single chunk covering a fresh arena.
    #[must_use]
    pub fn usable_size(&self) -> u64 {
        self.total_size - PAYLOAD_OFFSET
    }

    /// Whether a chunk starting at `address` would run past the arena.
    #[must_use]
    pub fn is_end_of_arena(&self, address: Address) -> bool {
        address.get() + WORD >= self.total_size
    }

    /// Aligned payload size actually reserved for a request of `size` bytes,
    /// or `None` if no arena could hold it.
    #[must_use]
    pub fn adjust_request(&self, size: u64) -> Option<u64> {
        let adjusted = size.checked_next_multiple_of(self.alignment)?;
        (adjusted <= self.usable_size()).then_some(adjusted.max(MIN_CHUNK_SIZE))
    }

    /// Takes a free chunk able to hold `size` bytes and tags it with `epoch`.
    pub fn allocate(&mut self, size: u64, epoch: u64) -> Result<Option<Address>, ReleaseError> {
        debug_assert!(size > 0 && epoch != TOMBSTONE);
        let Some(adjusted) = self.adjust_request(size) else {
            return Ok(None);
        };
        let Some(chunk) = self.pick_free(adjusted)? else {
            return Ok(None);
        };

        self.trim(chunk, adjusted);
        let next = self.codec.next_physical(chunk);
        if !self.is_end_of_arena(next) {
            self.codec.set_prev_free(next, false);
        }
        self.codec.set_free(chunk, false);
        self.codec.set_tag(chunk, epoch);
        Ok(Some(chunk))
    }

    /// Returns the chunk at `chunk`, which must be tagged with `epoch`, and
    /// coalesces it with its free neighbors.
    pub fn release(&mut self, chunk: Address, epoch: u64) -> Result<(), ReleaseError> {
        self.check_owned(chunk, epoch)?;

        self.codec.set_free(chunk, true);
        self.codec.set_tag(chunk, TOMBSTONE);
        let next = self.codec.next_physical(chunk);
        if !self.is_end_of_arena(next) {
            self.codec.set_prev_physical(next, chunk);
            self.codec.set_prev_free(next, true);
        }

        let chunk = self.merge_prev(chunk)?;
        let chunk = self.merge_next(chunk)?;
        self.index.insert(&mut self.codec, chunk);
        Ok(())
    }

    /// Payload size of a live chunk owned by the view tagged `epoch`.
    pub fn owned_size(&self, chunk: Address, epoch: u64) -> Result<u64, ReleaseError> {
        self.check_owned(chunk, epoch)?;
        Ok(self.codec.size(chunk))
    }

    fn check_owned(&self, chunk: Address, epoch: u64) -> Result<(), ReleaseError> {
        ensure!(
            !chunk.is_null() && epoch != TOMBSTONE,
            DoubleReleaseSnafu {
                address: chunk,
                epoch
            }
        );
        ensure!(
            chunk.get() < self.total_size
                && chunk.get().is_multiple_of(MIN_ALIGNMENT)
                && chunk.payload() < self.total_size,
            CorruptedMetadataSnafu {
                address: chunk,
                reason: "address is outside the arena",
            }
        );
        ensure!(
            !self.codec.is_free(chunk) && self.codec.tag(chunk) == epoch,
            DoubleReleaseSnafu {
                address: chunk,
                epoch
            }
        );
        ensure!(
            chunk.payload() + self.codec.size(chunk) <= self.total_size,
            CorruptedMetadataSnafu {
                address: chunk,
                reason: "chunk size runs past the end of the arena",
            }
        );
        Ok(())
    }

    fn pick_free(&mut self, size: u64) -> Result<Option<Address>, ReleaseError> {
        let rounded = self.index.round_up(size);
        if let Some(bucket) = self.index.search_suitable(self.index.mapping(rounded)) {
            let chunk = self.index.head(bucket);
            self.index.remove(&mut self.codec, chunk)?;
            return Ok(Some(chunk));
        }

        // Nothing in the covering buckets; members of the request's own bucket
        // may still be large enough.
        let mut chunk = self.index.head(self.index.mapping(size));
        while !chunk.is_null() {
            if self.codec.size(chunk) >= size {
                self.index.remove(&mut self.codec, chunk)?;
                return Ok(Some(chunk));
            }
            chunk = self.codec.next_in_list(chunk);
        }
        Ok(None)
    }

    /// Splits the tail of a free chunk beyond `size` into a new free chunk.
    fn trim(&mut self, chunk: Address, size: u64) {
        let chunk_size = self.codec.size(chunk);
        if chunk_size < size + SPLIT_THRESHOLD {
            return;
        }

        let remainder = chunk.add(CHUNK_OVERHEAD + size);
        let remainder_size = chunk_size - size - CHUNK_OVERHEAD;
        self.codec.set_prev_physical(remainder, chunk);
        self.codec
            .init_header(remainder, remainder_size, ChunkFlags::FREE);

        let next = self.codec.next_physical(remainder);
        if !self.is_end_of_arena(next) {
            self.codec.set_prev_physical(next, remainder);
            self.codec.set_prev_free(next, true);
        }

        self.codec.set_size(chunk, size);
        self.index.insert(&mut self.codec, remainder);
        tracing::trace!(%chunk, size, %remainder, remainder_size, "split chunk");
    }

    /// Grows `left` over its physical successor `right`.
    fn absorb(&mut self, left: Address, right: Address) -> Address {
        let next = self.codec.next_physical(right);
        let merged = self.codec.size(left) + self.codec.size(right) + CHUNK_OVERHEAD;
        self.codec.set_size(left, merged);
        if !self.is_end_of_arena(next) {
            self.codec.set_prev_physical(next, left);
            self.codec.set_prev_free(next, true);
        }
        self.codec.forget(right);
        tracing::trace!(%left, %right, merged, "merged chunks");
        left
    }

    fn merge_prev(&mut self, chunk: Address) -> Result<Address, ReleaseError> {
        if !self.codec.is_prev_free(chunk) {
            return Ok(chunk);
        }
        let prev = self.codec.prev_physical(chunk);
        ensure!(
            !prev.is_null() && prev < chunk && self.codec.is_free(prev),
            CorruptedMetadataSnafu {
                address: chunk,
                reason: "previous chunk is flagged free but is not",
            }
        );
        ensure!(
            self.codec.next_physical(prev) == chunk,
            CorruptedMetadataSnafu {
                address: chunk,
                reason: "previous chunk does not end at this chunk",
            }
        );
        self.index.remove(&mut self.codec, prev)?;
        Ok(self.absorb(prev, chunk))
    }

    fn merge_next(&mut self, chunk: Address) -> Result<Address, ReleaseError> {
        let next = self.codec.next_physical(chunk);
        if self.is_end_of_arena(next) || !self.codec.is_free(next) {
            return Ok(chunk);
        }
        self.index.remove(&mut self.codec, next)?;
        Ok(self.absorb(chunk, next))
    }

    /// Walks the physical chain and every free list, checking that they agree.
    pub fn check_consistency(&self) -> Result<ArenaSnapshot, ReleaseError> {
        let mut chunks = Vec::new();
        let mut covered_bytes = 0;
        let mut chunk = Address::new(0);
        let mut prev: Option<ChunkInfo> = None;
        while !self.is_end_of_arena(chunk) {
            let info = ChunkInfo {
                address: chunk,
                size: self.codec.size(chunk),
                free: self.codec.is_free(chunk),
            };
            let corrupted = |reason: &'static str| {
                CorruptedMetadataSnafu {
                    address: chunk,
                    reason,
                }
                .fail()
            };
            if info.size < MIN_CHUNK_SIZE || chunk.payload() + info.size > self.total_size {
                return corrupted("chunk size is out of range");
            }
            let prev_free = prev.is_some_and(|p| p.free);
            if self.codec.is_prev_free(chunk) != prev_free {
                return corrupted("previous-free flag disagrees with the previous chunk");
            }
            if info.free && !self.index.is_listed(self.index.mapping(info.size)) {
                return corrupted("free chunk maps to an empty bucket");
            }
            if prev_free && info.free {
                return corrupted("adjacent free chunks were not coalesced");
            }
            if prev_free && prev.is_some_and(|p| self.codec.prev_physical(chunk) != p.address) {
                return corrupted("previous-physical link is stale");
            }
            covered_bytes += info.size + CHUNK_OVERHEAD;
            chunks.push(info);
            prev = Some(info);
            chunk = self.codec.next_physical(chunk);
        }

        for first in 0..FIRST_LEVEL_COUNT as u32 {
            let summarized = self.index.first_level_bitmap() & (1 << first) != 0;
            ensure!(
                summarized == (self.index.second_level_bitmap(first) != 0),
                CorruptedMetadataSnafu {
                    address: Address::NULL,
                    reason: "first-level bitmap disagrees with the second level",
                }
            );
        }

        let mut listed = 0;
        for bucket in self.index.listed_buckets() {
            let mut member = self.index.head(bucket);
            ensure!(
                !member.is_null(),
                CorruptedMetadataSnafu {
                    address: member,
                    reason: "bitmap marks an empty bucket",
                }
            );
            let mut prev_member = Address::NULL;
            while !member.is_null() {
                ensure!(
                    self.codec.is_free(member)
                        && self.index.mapping(self.codec.size(member)) == bucket
                        && self.codec.prev_in_list(member) == prev_member,
                    CorruptedMetadataSnafu {
                        address: member,
                        reason: "free list member is misplaced",
                    }
                );
                listed += 1;
                prev_member = member;
                member = self.codec.next_in_list(member);
            }
        }
        let free = chunks.iter().filter(|c| c.free).count();
        ensure!(
            listed == free,
            CorruptedMetadataSnafu {
                address: Address::NULL,
                reason: "free chunk count disagrees with the free lists",
            }
        );
        ensure!(
            covered_bytes + WORD == self.total_size,
            CorruptedMetadataSnafu {
                address: Address::NULL,
                reason: "chunk chain does not cover the arena",
            }
        );

        Ok(ArenaSnapshot {
            chunks,
            covered_bytes,
        })
    }
}
