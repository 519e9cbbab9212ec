//! Two-level segregated fit (TLSF) allocator for off-heap buffer arenas.
//!
//! The crate manages one contiguous arena, either a block of process memory
//! or a file, and hands out byte ranges of it as [`BufferView`]s. Allocation
//! and release are O(1): free chunks are filed in 64 × 64 size-segregated
//! lists indexed by two bitmaps, and released chunks are merged with their
//! free physical neighbors through boundary tags.
//!
//! # Components
//!
//! - [`arena`]: the backing stores ([`MemoryRegion`], [`FileRegion`]).
//! - [`codec`]: the boundary-tag layout and the two ways of storing it
//!   ([`InBandCodec`] inside the arena, [`SideTableCodec`] beside it).
//! - [`BufferAllocator`]: the thread-safe entry point.
//! - [`BufferView`] / [`RawView`]: access to a live allocation.
//!
//! # Usage
//!
//! ```rust
//! use tlsf::{ArenaConfig, BufferAllocator};
//!
//! let allocator = BufferAllocator::new(ArenaConfig::with_total_size(1 << 20)).unwrap();
//!
//! let mut view = allocator.allocate(4096).unwrap();
//! view.put_at(100, b"payload").unwrap();
//! let mut buf = [0u8; 7];
//! view.get_at(100, &mut buf).unwrap();
//! assert_eq!(&buf, b"payload");
//!
//! allocator.release(view);
//! ```
//!
//! Requests that no single chunk can satisfy can be split:
//!
//! ```rust
//! use tlsf::{ArenaConfig, BufferAllocator};
//!
//! let config = ArenaConfig {
//!     alignment: 512,
//!     ..ArenaConfig::with_total_size(64 * 1024)
//! };
//! let allocator = BufferAllocator::new(config).unwrap();
//! let pieces = allocator.allocate_multi(2048).unwrap();
//! let total: u64 = pieces.iter().map(|view| view.size()).sum();
//! assert_eq!(total, 2048);
//! allocator.release_all(pieces);
//! ```

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod arena;
pub mod codec;

mod allocator;
mod config;
mod error;
mod index;
mod pool;
mod tlsf;
mod view;

pub use self::{
    allocator::{AllocatorStats, BufferAllocator},
    arena::{FileRegion, MemoryRegion, Region},
    codec::{Address, InBandCodec, MetadataCodec, SideTableCodec},
    config::{
        ArenaConfig, DEFAULT_AVAILABLE_RATIO, DEFAULT_HANDLE_POOL_CAPACITY, MAX_ALIGNMENT, MIN_ALIGNMENT,
    },
    error::{AllocError, ConfigError, ReleaseError, ViewError},
    tlsf::{ArenaSnapshot, ChunkInfo},
    view::{BufferView, RawView},
};
