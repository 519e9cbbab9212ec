//! The allocator façade shared between threads.

use std::{
    fmt,
    fs::File,
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use snafu::{ResultExt as _, ensure};
use spin::Mutex as SpinMutex;

use crate::{
    arena::{FileRegion, MemoryRegion, Region},
    codec::{InBandCodec, MetadataCodec, SideTableCodec},
    config::ArenaConfig,
    error::{AllocError, CapacityExhaustedSnafu, ConfigSnafu, InvalidSizeSnafu, RegionSnafu,
        ReleaseError},
    pool::{Binding, HandlePool},
    tlsf::{ArenaSnapshot, Tlsf},
    view::{BufferView, RawView},
};

/// Point-in-time allocator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Views currently live.
    pub occupied: u64,
    /// Successful allocations since construction, pieces counted one by one.
    pub allocated: u64,
    pub released: u64,
    /// Requests that ended in `CapacityExhausted`.
    pub failures: u64,
    /// Sum of the requested sizes of live views.
    pub outstanding_bytes: u64,
    /// Handles waiting in the pool.
    pub pooled_handles: usize,
    /// Allocations served with a recycled handle.
    pub reused_handles: u64,
}

#[derive(Debug, Default)]
struct Counters {
    allocated: AtomicU64,
    released: AtomicU64,
    failures: AtomicU64,
    outstanding_bytes: AtomicU64,
}

impl Counters {
    fn on_allocate(&self, size: u64) {
        self.allocated.fetch_add(1, Ordering::Relaxed);
        self.outstanding_bytes.fetch_add(size, Ordering::Relaxed);
    }

    fn on_release(&self, size: u64) {
        self.released.fetch_add(1, Ordering::Relaxed);
        self.outstanding_bytes.fetch_sub(size, Ordering::Relaxed);
    }

    fn on_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

struct Inner<C> {
    tlsf: Tlsf<C>,
    pool: HandlePool,
    next_epoch: u64,
}

impl<C> Inner<C>
where
    C: MetadataCodec,
{
    fn allocate(&mut self, size: u64) -> Option<Box<Binding>> {
        let epoch = self.next_epoch;
        match self.tlsf.allocate(size, epoch) {
            Ok(Some(address)) => {
                self.next_epoch += 1;
                Some(self.pool.take(address, size, epoch))
            }
            Ok(None) => None,
            Err(err) => fatal(err),
        }
    }

    /// Undoes an allocation made under the same lock.
    fn rollback(&mut self, binding: Box<Binding>) {
        if let Err(err) = self.tlsf.release(binding.address, binding.epoch) {
            fatal(err);
        }
        self.pool.give(binding);
    }
}

#[track_caller]
fn fatal(err: ReleaseError) -> ! {
    tracing::error!(%err, "arena metadata invariant violated");
    snafu_utils::report(err)
}

/// Thread-safe TLSF allocator over one arena.
///
/// Every metadata access happens under a single spin lock; copies through a
/// [`BufferView`] happen outside it.
///
/// # Example
///
/// ```rust
/// use tlsf::{ArenaConfig, BufferAllocator};
///
/// let allocator = BufferAllocator::new(ArenaConfig::with_total_size(64 * 1024)).unwrap();
/// let a = allocator.allocate(1024).unwrap();
/// let b = allocator.allocate(2048).unwrap();
/// assert_eq!(allocator.stats().occupied, 2);
///
/// allocator.release(a);
/// allocator.release(b);
/// let snapshot = allocator.check_consistency().unwrap();
/// assert_eq!(snapshot.free_chunks(), 1);
/// ```
pub struct BufferAllocator<C = InBandCodec> {
    region: Arc<dyn Region>,
    inner: SpinMutex<Inner<C>>,
    config: ArenaConfig,
    usable_size: u64,
    counters: Counters,
}

impl<C> fmt::Debug for BufferAllocator<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferAllocator")
            .field("region", &self.region)
            .field("config", &self.config)
            .field("usable_size", &self.usable_size)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl BufferAllocator<InBandCodec> {
    /// Creates an allocator over a fresh block of process memory.
    pub fn new(config: ArenaConfig) -> Result<Self, AllocError> {
        config.validate().context(ConfigSnafu)?;
        let region = Arc::new(MemoryRegion::new(config.effective_total_size()).context(RegionSnafu)?);
        let codec = InBandCodec::new(Arc::clone(&region));
        Ok(Self::with_codec(config, region, codec))
    }
}

impl BufferAllocator<SideTableCodec> {
    /// Creates an allocator managing extents of `file`, which is resized to
    /// the arena size. Metadata is kept in memory.
    pub fn with_file(config: ArenaConfig, file: File) -> Result<Self, AllocError> {
        config.validate().context(ConfigSnafu)?;
        let region = FileRegion::new(file, config.effective_total_size()).context(RegionSnafu)?;
        Self::with_region(config, Arc::new(region))
    }

    /// Creates an allocator over an arbitrary region, with metadata kept in
    /// memory.
    pub fn with_region(config: ArenaConfig, region: Arc<dyn Region>) -> Result<Self, AllocError> {
        config.validate().context(ConfigSnafu)?;
        let total_size = config.effective_total_size();
        if region.len() < total_size {
            let err = io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("region of {} bytes cannot hold an arena of {total_size} bytes", region.len()),
            );
            return Err(err).context(RegionSnafu);
        }
        Ok(Self::with_codec(config, region, SideTableCodec::new()))
    }
}

impl<C> BufferAllocator<C>
where
    C: MetadataCodec,
{
    fn with_codec(config: ArenaConfig, region: Arc<dyn Region>, codec: C) -> Self {
        let tlsf = Tlsf::new(codec, config.alignment, config.effective_total_size());
        let usable_size = tlsf.usable_size();
        tracing::info!(
            total_size = config.effective_total_size(),
            alignment = config.alignment,
            usable_size,
            capacity = config.nominal_capacity(),
            "arena created"
        );
        Self {
            region,
            inner: SpinMutex::new(Inner {
                tlsf,
                pool: HandlePool::new(config.handle_pool_capacity),
                next_epoch: 1,
            }),
            config,
            usable_size,
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    /// Bytes advertised to capacity-based callers, a fixed share of the arena.
    #[must_use]
    pub fn total_capacity(&self) -> u64 {
        self.config.nominal_capacity()
    }

    #[must_use]
    pub fn alignment(&self) -> u64 {
        self.config.alignment
    }

    /// Largest request a fresh arena can satisfy.
    #[must_use]
    pub fn usable_size(&self) -> u64 {
        self.usable_size
    }

    fn view(&self, binding: Box<Binding>) -> BufferView {
        self.counters.on_allocate(binding.size);
        BufferView::new(Arc::clone(&self.region), binding)
    }

    fn exhausted(&self, size: u64) -> AllocError {
        self.counters.on_failure();
        tracing::debug!(size, "no free chunk large enough");
        CapacityExhaustedSnafu { size }.build()
    }

    /// Allocates one contiguous chunk of at least `size` bytes.
    pub fn allocate(&self, size: u64) -> Result<BufferView, AllocError> {
        ensure!(size > 0, InvalidSizeSnafu { size });
        if size > self.usable_size {
            return Err(self.exhausted(size));
        }
        let binding = self.inner.lock().allocate(size);
        match binding {
            Some(binding) => Ok(self.view(binding)),
            None => Err(self.exhausted(size)),
        }
    }

    /// Allocates `size` bytes, split into pieces if no single chunk is large
    /// enough.
    ///
    /// The returned views, concatenated in order, make up one logical buffer.
    /// Pieces are at most `alignment()` bytes each. Either every piece is
    /// allocated or none is.
    pub fn allocate_multi(&self, size: u64) -> Result<Vec<BufferView>, AllocError> {
        ensure!(size > 0, InvalidSizeSnafu { size });
        if size > self.usable_size {
            return Err(self.exhausted(size));
        }
        let alignment = self.alignment();
        let mut inner = self.inner.lock();
        if let Some(binding) = inner.allocate(size) {
            drop(inner);
            return Ok(vec![self.view(binding)]);
        }
        if size <= alignment {
            drop(inner);
            return Err(self.exhausted(size));
        }

        let mut pieces = Vec::new();
        let mut remaining = size;
        while remaining > 0 {
            let piece = remaining.min(alignment);
            let Some(binding) = inner.allocate(piece) else {
                let count = pieces.len();
                for binding in pieces {
                    inner.rollback(binding);
                }
                drop(inner);
                tracing::debug!(size, count, "rolled back partial multi-chunk allocation");
                return Err(self.exhausted(size));
            };
            pieces.push(binding);
            remaining -= piece;
        }
        drop(inner);

        tracing::debug!(size, pieces = pieces.len(), "allocated in pieces");
        Ok(pieces.into_iter().map(|binding| self.view(binding)).collect())
    }

    /// Returns a view's chunk to the arena.
    ///
    /// # Panics
    ///
    /// Panics with a full error report if the chunk's metadata shows it was
    /// already released or is corrupted.
    #[track_caller]
    pub fn release(&self, view: BufferView) {
        if let Err(err) = self.try_release(view) {
            fatal(err);
        }
    }

    /// Like [`release`](Self::release), but reports defects to the caller.
    pub fn try_release(&self, view: BufferView) -> Result<(), ReleaseError> {
        let binding = view.into_binding();
        let Binding {
            address,
            size,
            epoch,
        } = *binding;
        let mut inner = self.inner.lock();
        inner.pool.give(binding);
        inner.tlsf.release(address, epoch)?;
        drop(inner);
        self.counters.on_release(size);
        Ok(())
    }

    /// Releases a chunk described by a [`RawView`].
    ///
    /// Fails with [`ReleaseError::DoubleRelease`] if the chunk is not live or
    /// has been reallocated since `raw` was taken.
    pub fn release_raw(&self, raw: RawView) -> Result<(), ReleaseError> {
        self.inner.lock().tlsf.release(raw.address, raw.epoch)?;
        self.counters.on_release(raw.size);
        Ok(())
    }

    /// Releases every piece of a multi-chunk allocation.
    #[track_caller]
    pub fn release_all<I>(&self, views: I)
    where
        I: IntoIterator<Item = BufferView>,
    {
        for view in views {
            self.release(view);
        }
    }

    /// Payload bytes reserved for the chunk of a live view.
    pub fn chunk_size(&self, view: &BufferView) -> Result<u64, ReleaseError> {
        self.inner.lock().tlsf.owned_size(view.address(), view.epoch())
    }

    #[must_use]
    pub fn stats(&self) -> AllocatorStats {
        let (pooled_handles, reused_handles) = {
            let inner = self.inner.lock();
            (inner.pool.len(), inner.pool.reused())
        };
        let allocated = self.counters.allocated.load(Ordering::Relaxed);
        let released = self.counters.released.load(Ordering::Relaxed);
        AllocatorStats {
            occupied: allocated.saturating_sub(released),
            allocated,
            released,
            failures: self.counters.failures.load(Ordering::Relaxed),
            outstanding_bytes: self.counters.outstanding_bytes.load(Ordering::Relaxed),
            pooled_handles,
            reused_handles,
        }
    }

    /// Walks every chunk and free list and checks that the metadata agrees.
    pub fn check_consistency(&self) -> Result<ArenaSnapshot, ReleaseError> {
        self.inner.lock().tlsf.check_consistency()
    }

    /// Tears the arena down. Views still alive keep the backing store mapped
    /// but their chunks are no longer tracked.
    pub fn close(self) {
        let stats = self.stats();
        if stats.occupied > 0 {
            tracing::warn!(
                occupied = stats.occupied,
                outstanding_bytes = stats.outstanding_bytes,
                "arena closed with live views"
            );
        }
        tracing::info!(
            allocated = stats.allocated,
            released = stats.released,
            failures = stats.failures,
            "arena closed"
        );
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(total_size: u64) -> BufferAllocator {
        BufferAllocator::new(ArenaConfig {
            handle_pool_capacity: 8,
            ..ArenaConfig::with_total_size(total_size)
        })
        .unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let err = BufferAllocator::new(ArenaConfig {
            alignment: 3,
            ..ArenaConfig::for_testing()
        })
        .unwrap_err();
        assert!(matches!(err, AllocError::Config { .. }));
    }

    #[test]
    fn test_zero_size_is_invalid() {
        let allocator = allocator(4096);
        assert!(matches!(
            allocator.allocate(0),
            Err(AllocError::InvalidSize { size: 0, .. })
        ));
        assert!(matches!(
            allocator.allocate_multi(0),
            Err(AllocError::InvalidSize { .. })
        ));
    }

    #[test]
    fn test_view_size_is_requested_size() {
        let allocator = allocator(4096);
        let view = allocator.allocate(10).unwrap();
        assert_eq!(view.size(), 10);
        assert_eq!(allocator.chunk_size(&view).unwrap(), 24);
        allocator.release(view);
    }

    #[test]
    fn test_epochs_increase() {
        let allocator = allocator(4096);
        let a = allocator.allocate(8).unwrap();
        let b = allocator.allocate(8).unwrap();
        assert!(b.epoch() > a.epoch());
        allocator.release_all([a, b]);
    }

    #[test]
    fn test_handles_are_recycled() {
        let allocator = allocator(4096);
        for _ in 0..3 {
            let view = allocator.allocate(32).unwrap();
            allocator.release(view);
        }
        let stats = allocator.stats();
        assert_eq!(stats.reused_handles, 2);
        assert_eq!(stats.pooled_handles, 1);
        assert_eq!(stats.allocated, 3);
        assert_eq!(stats.released, 3);
        assert_eq!(stats.occupied, 0);
    }

    #[test]
    fn test_try_release_of_stale_raw_view() {
        let allocator = allocator(4096);
        let raw = allocator.allocate(64).unwrap().into_raw();
        allocator.release_raw(raw).unwrap();
        let err = allocator.release_raw(raw).unwrap_err();
        assert!(err.is_double_release());

        // the chunk is reused by a later allocation with a new epoch
        let view = allocator.allocate(64).unwrap();
        assert_eq!(view.address(), raw.address);
        assert!(allocator.release_raw(raw).unwrap_err().is_double_release());
        allocator.try_release(view).unwrap();
        assert_eq!(allocator.check_consistency().unwrap().free_chunks(), 1);
    }

    #[test]
    #[should_panic(expected = "Critical error occurred")]
    fn test_release_panics_on_double_release() {
        let allocator = allocator(4096);
        let view = allocator.allocate(64).unwrap();
        let raw = RawView {
            address: view.address(),
            size: view.size(),
            epoch: view.epoch(),
        };
        allocator.release_raw(raw).unwrap();
        allocator.release(view);
    }

    #[test]
    fn test_failures_are_counted() {
        let allocator = allocator(4096);
        let err = allocator.allocate(1 << 20).unwrap_err();
        assert!(err.is_capacity_exhausted());
        assert_eq!(allocator.stats().failures, 1);
    }

    #[test]
    fn test_oversized_requests_are_exhausted() {
        let allocator = allocator(4096);
        let victim = allocator.allocate(64).unwrap();
        let before = allocator.check_consistency().unwrap();
        for size in [u64::MAX, u64::MAX - 7, allocator.usable_size() + 1] {
            assert!(allocator.allocate(size).unwrap_err().is_capacity_exhausted());
            assert!(
                allocator
                    .allocate_multi(size)
                    .unwrap_err()
                    .is_capacity_exhausted()
            );
        }
        assert_eq!(allocator.check_consistency().unwrap(), before);
        assert_eq!(allocator.stats().failures, 6);
        assert_eq!(allocator.stats().occupied, 1);
        allocator.release(victim);
    }

    #[test]
    fn test_total_capacity_uses_ratio() {
        let allocator = allocator(6400);
        assert_eq!(allocator.total_capacity(), 5120);
        assert_eq!(allocator.usable_size(), 6400 - 24);
        allocator.close();
    }
}
