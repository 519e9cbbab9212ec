//! Two-level segregated free-list index.
//!
//! Free chunks are kept in 64 × 64 intrusive doubly-linked lists. The first
//! level splits sizes by power of two, the second level splits each power of
//! two linearly into 64 ranges. Sizes below `64 × alignment` are handled by a
//! linear first row (`first == 0`) with one list per alignment step.
//!
//! Two bitmaps record which lists are non-empty, so finding a list able to
//! satisfy a request costs two bit scans.

use snafu::ensure;

use crate::{
    codec::{Address, MetadataCodec},
    config::MAX_ALIGNMENT,
    error::{CorruptedMetadataSnafu, ReleaseError},
};

pub const FIRST_LEVEL_COUNT: usize = u64::BITS as usize;
pub const SECOND_LEVEL_COUNT: usize = u64::BITS as usize;
const SECOND_LEVEL_LOG2: u32 = SECOND_LEVEL_COUNT.trailing_zeros();

/// Coordinates of one free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Bucket {
    pub first: u32,
    pub second: u32,
}

impl Bucket {
    #[must_use]
    pub const fn new(first: u32, second: u32) -> Self {
        Self { first, second }
    }
}

const fn log2(value: u64) -> u32 {
    u64::BITS - value.leading_zeros() - 1
}

pub struct FreeListIndex {
    first_level: u64,
    second_level: [u64; FIRST_LEVEL_COUNT],
    heads: Box<[[Address; SECOND_LEVEL_COUNT]; FIRST_LEVEL_COUNT]>,
    alignment_log2: u32,
}

impl FreeListIndex {
    /// Creates an empty index for the given power-of-two alignment.
    #[must_use]
    pub fn new(alignment: u64) -> Self {
        assert!(alignment.is_power_of_two() && alignment <= MAX_ALIGNMENT);
        Self {
            first_level: 0,
            second_level: [0; FIRST_LEVEL_COUNT],
            heads: Box::new([[Address::NULL; SECOND_LEVEL_COUNT]; FIRST_LEVEL_COUNT]),
            alignment_log2: alignment.trailing_zeros(),
        }
    }

    /// Smallest size handled by the logarithmic rows.
    #[must_use]
    pub const fn linear_limit(&self) -> u64 {
        (SECOND_LEVEL_COUNT as u64) << self.alignment_log2
    }

    /// Number of unused low rows dropped from the logarithmic part.
    const fn first_level_shift(&self) -> u32 {
        SECOND_LEVEL_LOG2 + self.alignment_log2 - 1
    }

    /// Maps a size to the list it belongs to.
    #[must_use]
    pub fn mapping(&self, size: u64) -> Bucket {
        if size < self.linear_limit() {
            #[expect(clippy::cast_possible_truncation)]
            let second = (size >> self.alignment_log2) as u32;
            return Bucket::new(0, second);
        }
        let first = log2(size);
        #[expect(clippy::cast_possible_truncation)]
        let second = ((size >> (first - SECOND_LEVEL_LOG2)) ^ (1 << SECOND_LEVEL_LOG2)) as u32;
        Bucket::new(first - self.first_level_shift(), second)
    }

    /// Rounds `size` up so that every chunk in `mapping(round_up(size))` is
    /// at least `size` bytes. Saturates at `u64::MAX`.
    #[must_use]
    pub fn round_up(&self, size: u64) -> u64 {
        if size < self.linear_limit() {
            return size;
        }
        size.saturating_add((1 << (log2(size) - SECOND_LEVEL_LOG2)) - 1)
    }

    /// Finds the first non-empty list at or above `bucket`.
    #[must_use]
    pub fn search_suitable(&self, bucket: Bucket) -> Option<Bucket> {
        let mut first = bucket.first;
        let mut second_map = self.second_level[first as usize] & (!0 << bucket.second);
        if second_map == 0 {
            let first_map = self.first_level & (!0u64).checked_shl(first + 1).unwrap_or(0);
            if first_map == 0 {
                return None;
            }
            first = first_map.trailing_zeros();
            second_map = self.second_level[first as usize];
        }
        Some(Bucket::new(first, second_map.trailing_zeros()))
    }

    #[must_use]
    pub fn head(&self, bucket: Bucket) -> Address {
        self.heads[bucket.first as usize][bucket.second as usize]
    }

    #[must_use]
    pub fn is_listed(&self, bucket: Bucket) -> bool {
        self.second_level[bucket.first as usize] & (1 << bucket.second) != 0
    }

    #[must_use]
    pub fn first_level_bitmap(&self) -> u64 {
        self.first_level
    }

    #[must_use]
    pub fn second_level_bitmap(&self, first: u32) -> u64 {
        self.second_level[first as usize]
    }

    /// Non-empty lists in ascending order.
    pub fn listed_buckets(&self) -> impl Iterator<Item = Bucket> + '_ {
        (0..FIRST_LEVEL_COUNT as u32)
            .filter(|first| self.first_level & (1 << first) != 0)
            .flat_map(move |first| {
                let map = self.second_level[first as usize];
                (0..SECOND_LEVEL_COUNT as u32)
                    .filter(move |second| map & (1 << second) != 0)
                    .map(move |second| Bucket::new(first, second))
            })
    }

    /// Pushes a free chunk at the head of the list matching its size.
    pub fn insert<C>(&mut self, codec: &mut C, chunk: Address) -> Bucket
    where
        C: MetadataCodec + ?Sized,
    {
        let bucket = self.mapping(codec.size(chunk));
        let head = self.head(bucket);
        if !head.is_null() {
            codec.set_prev_in_list(head, chunk);
        }
        codec.set_next_in_list(chunk, head);
        codec.set_prev_in_list(chunk, Address::NULL);
        self.heads[bucket.first as usize][bucket.second as usize] = chunk;

        self.first_level |= 1 << bucket.first;
        self.second_level[bucket.first as usize] |= 1 << bucket.second;
        bucket
    }

    /// Unlinks a free chunk from the list matching its size.
    pub fn remove<C>(&mut self, codec: &mut C, chunk: Address) -> Result<Bucket, ReleaseError>
    where
        C: MetadataCodec + ?Sized,
    {
        ensure!(
            codec.is_free(chunk),
            CorruptedMetadataSnafu {
                address: chunk,
                reason: "chunk taken from a free list is marked used",
            }
        );
        let bucket = self.mapping(codec.size(chunk));
        let prev = codec.prev_in_list(chunk);
        let next = codec.next_in_list(chunk);
        ensure!(
            !prev.is_null() || self.head(bucket) == chunk,
            CorruptedMetadataSnafu {
                address: chunk,
                reason: "free chunk is not linked in its bucket",
            }
        );

        if !prev.is_null() {
            codec.set_next_in_list(prev, next);
        }
        if !next.is_null() {
            codec.set_prev_in_list(next, prev);
        }

        if prev.is_null() {
            self.heads[bucket.first as usize][bucket.second as usize] = next;
            if next.is_null() {
                self.second_level[bucket.first as usize] &= !(1 << bucket.second);
                if self.second_level[bucket.first as usize] == 0 {
                    self.first_level &= !(1 << bucket.first);
                }
            }
        }
        Ok(bucket)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ChunkFlags, SideTableCodec};

    fn free_chunk(codec: &mut SideTableCodec, offset: u64, size: u64) -> Address {
        let chunk = Address::new(offset);
        codec.init_header(chunk, size, ChunkFlags::FREE);
        chunk
    }

    #[test]
    fn test_mapping_linear_region() {
        let index = FreeListIndex::new(4);
        assert_eq!(index.linear_limit(), 256);
        assert_eq!(index.mapping(24), Bucket::new(0, 6));
        assert_eq!(index.mapping(100), Bucket::new(0, 25));
        assert_eq!(index.mapping(255), Bucket::new(0, 63));
    }

    #[test]
    fn test_mapping_logarithmic_region() {
        let index = FreeListIndex::new(4);
        assert_eq!(index.mapping(256), Bucket::new(1, 0));
        assert_eq!(index.mapping(260), Bucket::new(1, 1));
        assert_eq!(index.mapping(511), Bucket::new(1, 63));
        assert_eq!(index.mapping(512), Bucket::new(2, 0));
        assert_eq!(index.mapping(1024), Bucket::new(3, 0));
        assert_eq!(index.mapping(1 << 20), Bucket::new(13, 0));

        let index = FreeListIndex::new(512);
        assert_eq!(index.linear_limit(), 32768);
        assert_eq!(index.mapping(1024), Bucket::new(0, 2));
        assert_eq!(index.mapping(32768), Bucket::new(1, 0));

        let index = FreeListIndex::new(MAX_ALIGNMENT);
        assert_eq!(index.linear_limit(), 1 << 63);
        assert_eq!(index.mapping(1 << 57), Bucket::new(0, 1));
        assert_eq!(index.mapping(u64::MAX), Bucket::new(1, 63));
    }

    #[test]
    fn test_round_up_reaches_covering_bucket() {
        let index = FreeListIndex::new(4);
        assert_eq!(index.round_up(100), 100);
        assert_eq!(index.round_up(1024), 1039);
        assert_eq!(index.mapping(index.round_up(1024)), Bucket::new(3, 0));
        assert_eq!(index.mapping(index.round_up(1025)), Bucket::new(3, 1));
        assert_eq!(index.round_up(u64::MAX - 7), u64::MAX);
        assert_eq!(index.mapping(u64::MAX), Bucket::new(56, 63));

        // every size mapped to the rounded bucket is large enough
        for size in (256..8192).step_by(4) {
            let bucket = index.mapping(index.round_up(size));
            let smallest = (size / 2..).find(|&s| index.mapping(s) == bucket).unwrap();
            assert!(smallest >= size, "size {size} -> {bucket:?}");
        }
    }

    #[test]
    fn test_insert_search_remove() {
        let mut codec = SideTableCodec::new();
        let mut index = FreeListIndex::new(4);
        assert_eq!(index.search_suitable(Bucket::new(0, 0)), None);

        let small = free_chunk(&mut codec, 0, 100);
        let large = free_chunk(&mut codec, 1000, 4096);
        assert_eq!(index.insert(&mut codec, small), Bucket::new(0, 25));
        assert_eq!(index.insert(&mut codec, large), Bucket::new(5, 0));
        assert_eq!(index.first_level_bitmap(), 0b10_0001);
        assert_eq!(index.second_level_bitmap(0), 1 << 25);

        assert_eq!(
            index.search_suitable(Bucket::new(0, 10)),
            Some(Bucket::new(0, 25))
        );
        assert_eq!(
            index.search_suitable(Bucket::new(0, 26)),
            Some(Bucket::new(5, 0))
        );
        assert_eq!(index.search_suitable(Bucket::new(5, 1)), None);
        assert_eq!(index.search_suitable(Bucket::new(63, 0)), None);

        index.remove(&mut codec, small).unwrap();
        assert_eq!(index.first_level_bitmap(), 0b10_0000);
        assert!(index.head(Bucket::new(0, 25)).is_null());
        index.remove(&mut codec, large).unwrap();
        assert_eq!(index.first_level_bitmap(), 0);
        assert_eq!(index.listed_buckets().count(), 0);
    }

    #[test]
    fn test_list_keeps_other_members() {
        let mut codec = SideTableCodec::new();
        let mut index = FreeListIndex::new(4);
        let a = free_chunk(&mut codec, 0, 64);
        let b = free_chunk(&mut codec, 200, 64);
        let c = free_chunk(&mut codec, 400, 64);
        for chunk in [a, b, c] {
            index.insert(&mut codec, chunk);
        }
        let bucket = index.mapping(64);
        assert_eq!(index.head(bucket), c);

        index.remove(&mut codec, b).unwrap();
        assert_eq!(codec.next_in_list(c), a);
        assert_eq!(codec.prev_in_list(a), c);
        assert!(index.is_listed(bucket));

        index.remove(&mut codec, c).unwrap();
        assert_eq!(index.head(bucket), a);
        assert!(codec.prev_in_list(a).is_null());
        assert!(index.is_listed(bucket));

        index.remove(&mut codec, a).unwrap();
        assert!(!index.is_listed(bucket));
        assert_eq!(
            index.listed_buckets().collect::<Vec<_>>(),
            Vec::<Bucket>::new()
        );
    }

    #[test]
    fn test_remove_detects_unlinked_chunk() {
        let mut codec = SideTableCodec::new();
        let mut index = FreeListIndex::new(4);
        let listed = free_chunk(&mut codec, 0, 64);
        index.insert(&mut codec, listed);

        let stray = free_chunk(&mut codec, 500, 64);
        codec.set_prev_in_list(stray, Address::NULL);
        assert!(matches!(
            index.remove(&mut codec, stray),
            Err(ReleaseError::CorruptedMetadata { .. })
        ));

        codec.set_free(listed, false);
        assert!(matches!(
            index.remove(&mut codec, listed),
            Err(ReleaseError::CorruptedMetadata { .. })
        ));
    }
}
