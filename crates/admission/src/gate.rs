//! Sector-based admission control in front of an allocator.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use snafu::{ResultExt as _, ensure};
use tlsf::{
    AllocError, AllocatorStats, BufferAllocator, BufferView, InBandCodec, MetadataCodec,
    ReleaseError,
};

use crate::{
    config::GateConfig,
    error::{
        AllocatorSnafu, ExceedsCapacitySnafu, FragmentationSnafu, GateError, InvalidSizeSnafu,
        TimeoutSnafu,
    },
    semaphore::FairSemaphore,
};

/// Point-in-time gate counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateStats {
    pub total_sectors: u64,
    pub available_sectors: u64,
    /// Sectors held by live allocations.
    pub granted_sectors: u64,
    pub timeouts: u64,
    /// Requests that got their sectors but no chunk.
    pub fragmentation_failures: u64,
    pub allocator: AllocatorStats,
}

#[derive(Debug, Default)]
struct Counters {
    granted_sectors: AtomicU64,
    timeouts: AtomicU64,
    fragmentation_failures: AtomicU64,
}

/// Bounds the bytes handed out by an allocator, making callers wait for
/// capacity instead of failing outright.
///
/// Capacity is counted in sectors. A request first takes `size / sector_size`
/// tokens from a [`FairSemaphore`], then allocates. Holding tokens does not
/// guarantee a chunk: the allocator may still be too fragmented, in which
/// case the tokens are returned and the request fails with
/// [`GateError::Fragmentation`].
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
///
/// use admission::AdmissionGate;
///
/// let gate = AdmissionGate::new(512 * 10, 512, "nvme0").unwrap();
/// assert_eq!(gate.total_sectors(), 10);
///
/// let view = gate.allocate(1024, Duration::ZERO).unwrap();
/// assert_eq!(gate.available_sectors(), 8);
/// gate.release(view);
/// assert_eq!(gate.available_sectors(), 10);
/// ```
pub struct AdmissionGate<C = InBandCodec> {
    allocator: BufferAllocator<C>,
    semaphore: FairSemaphore,
    sector_size: u64,
    total_sectors: u64,
    device_label: String,
    counters: Counters,
}

impl AdmissionGate<InBandCodec> {
    /// Creates a gate over a fresh in-memory arena able to hold
    /// `total_capacity` bytes.
    pub fn new(
        total_capacity: u64,
        sector_size: u64,
        device_label: impl Into<String>,
    ) -> Result<Self, GateError> {
        Self::with_config(&GateConfig::new(total_capacity, sector_size, device_label))
    }

    pub fn with_config(config: &GateConfig) -> Result<Self, GateError> {
        config.validate()?;
        let allocator = BufferAllocator::new(config.arena_config()).context(AllocatorSnafu)?;
        Self::with_allocator(allocator, config.sector_size, config.device_label.clone())
    }
}

impl<C> AdmissionGate<C>
where
    C: MetadataCodec,
{
    /// Puts a gate in front of an existing allocator, using its nominal
    /// capacity as the admission limit.
    pub fn with_allocator(
        allocator: BufferAllocator<C>,
        sector_size: u64,
        device_label: impl Into<String>,
    ) -> Result<Self, GateError> {
        let config = GateConfig {
            total_capacity: allocator.total_capacity(),
            sector_size,
            device_label: device_label.into(),
            arena: allocator.config().clone(),
        };
        config.validate()?;

        let total_sectors = config.total_capacity / sector_size;
        tracing::info!(
            device = %config.device_label,
            sector_size,
            total_sectors,
            "admission gate created"
        );
        Ok(Self {
            allocator,
            semaphore: FairSemaphore::new(total_sectors),
            sector_size,
            total_sectors,
            device_label: config.device_label,
            counters: Counters::default(),
        })
    }

    #[must_use]
    pub fn allocator(&self) -> &BufferAllocator<C> {
        &self.allocator
    }

    #[must_use]
    pub fn device_label(&self) -> &str {
        &self.device_label
    }

    #[must_use]
    pub fn sector_size(&self) -> u64 {
        self.sector_size
    }

    #[must_use]
    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    #[must_use]
    pub fn available_sectors(&self) -> u64 {
        self.semaphore.available()
    }

    fn sectors_of(&self, size: u64) -> Result<u64, GateError> {
        ensure!(
            size > 0 && size.is_multiple_of(self.sector_size),
            InvalidSizeSnafu {
                size,
                sector_size: self.sector_size,
            }
        );
        Ok(size / self.sector_size)
    }

    /// Allocates `size` bytes in one chunk, waiting up to `timeout` for
    /// capacity.
    ///
    /// `size` must be a positive multiple of the sector size. A zero timeout
    /// fails at once if the sectors are not free or another caller is
    /// already waiting; `Duration::MAX` waits without limit. Requests larger
    /// than the whole gate fail at once without queueing.
    pub fn allocate(&self, size: u64, timeout: Duration) -> Result<BufferView, GateError> {
        self.admit(size, timeout, |size| self.allocator.allocate(size))
    }

    /// Like [`allocate`](Self::allocate), but falls back to several pieces
    /// when no single chunk is large enough.
    ///
    /// The pieces, in order, form one logical buffer and must be returned
    /// together through [`release_all`](Self::release_all).
    pub fn allocate_multi(
        &self,
        size: u64,
        timeout: Duration,
    ) -> Result<Vec<BufferView>, GateError> {
        self.admit(size, timeout, |size| self.allocator.allocate_multi(size))
    }

    fn admit<T>(
        &self,
        size: u64,
        timeout: Duration,
        allocate: impl FnOnce(u64) -> Result<T, AllocError>,
    ) -> Result<T, GateError> {
        let sectors = self.sectors_of(size)?;
        ensure!(
            sectors <= self.total_sectors,
            ExceedsCapacitySnafu {
                sectors,
                total_sectors: self.total_sectors,
            }
        );
        if !self.semaphore.try_acquire(sectors, timeout) {
            self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                device = %self.device_label,
                size,
                ?timeout,
                "timed out waiting for sectors"
            );
            return TimeoutSnafu { sectors, timeout }.fail();
        }

        match allocate(size) {
            Ok(allocation) => {
                self.counters
                    .granted_sectors
                    .fetch_add(sectors, Ordering::Relaxed);
                Ok(allocation)
            }
            Err(err) => {
                self.semaphore.release(sectors);
                if !err.is_capacity_exhausted() {
                    return Err(err).context(AllocatorSnafu);
                }
                self.counters
                    .fragmentation_failures
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    device = %self.device_label,
                    size,
                    sectors,
                    "sectors granted but the arena is fragmented"
                );
                Err(err).context(FragmentationSnafu { sectors })
            }
        }
    }

    /// Returns a view to the allocator and its sectors to the gate.
    ///
    /// # Panics
    ///
    /// Panics if the allocator detects a double release or corrupted
    /// metadata.
    #[track_caller]
    pub fn release(&self, view: BufferView) {
        let sectors = view.size() / self.sector_size;
        self.allocator.release(view);
        self.return_sectors(sectors);
    }

    /// Like [`release`](Self::release), but reports allocator defects to the
    /// caller. Sectors are only returned if the release succeeds.
    pub fn try_release(&self, view: BufferView) -> Result<(), ReleaseError> {
        let sectors = view.size() / self.sector_size;
        self.allocator.try_release(view)?;
        self.return_sectors(sectors);
        Ok(())
    }

    /// Returns every piece of an [`allocate_multi`](Self::allocate_multi)
    /// result, and the sectors of the whole request.
    ///
    /// # Panics
    ///
    /// Panics if the allocator detects a double release or corrupted
    /// metadata.
    #[track_caller]
    pub fn release_all<I>(&self, views: I)
    where
        I: IntoIterator<Item = BufferView>,
    {
        let mut size = 0;
        for view in views {
            size += view.size();
            self.allocator.release(view);
        }
        self.return_sectors(size / self.sector_size);
    }

    fn return_sectors(&self, sectors: u64) {
        self.counters
            .granted_sectors
            .fetch_sub(sectors, Ordering::Relaxed);
        self.semaphore.release(sectors);
    }

    #[must_use]
    pub fn stats(&self) -> GateStats {
        GateStats {
            total_sectors: self.total_sectors,
            available_sectors: self.available_sectors(),
            granted_sectors: self.counters.granted_sectors.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            fragmentation_failures: self.counters.fragmentation_failures.load(Ordering::Relaxed),
            allocator: self.allocator.stats(),
        }
    }

    /// Shuts the gate and its allocator down.
    pub fn close(self) {
        let stats = self.stats();
        tracing::info!(
            device = %self.device_label,
            granted_sectors = stats.granted_sectors,
            timeouts = stats.timeouts,
            fragmentation_failures = stats.fragmentation_failures,
            "admission gate closed"
        );
        self.allocator.close();
    }
}
