use std::time::Duration;

use snafu::Snafu;
use snafu_utils::{Located, Location};
use tlsf::AllocError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum GateError {
    #[snafu(display("sector size {sector_size} must be a power of two"))]
    InvalidSectorSize {
        #[snafu(implicit)]
        location: Location,
        sector_size: u64,
    },
    #[snafu(display("capacity of {total_capacity} bytes holds no {sector_size}-byte sector"))]
    NoSectors {
        #[snafu(implicit)]
        location: Location,
        total_capacity: u64,
        sector_size: u64,
    },
    #[snafu(display("request of {size} bytes is not a positive multiple of {sector_size}"))]
    InvalidSize {
        #[snafu(implicit)]
        location: Location,
        size: u64,
        sector_size: u64,
    },
    #[snafu(display("{sectors} sectors requested but the gate only has {total_sectors}"))]
    ExceedsCapacity {
        #[snafu(implicit)]
        location: Location,
        sectors: u64,
        total_sectors: u64,
    },
    #[snafu(display("timed out after {timeout:?} waiting for {sectors} sectors"))]
    Timeout {
        #[snafu(implicit)]
        location: Location,
        sectors: u64,
        timeout: Duration,
    },
    #[snafu(display("{sectors} sectors granted but the arena is too fragmented"))]
    Fragmentation {
        #[snafu(implicit)]
        location: Location,
        sectors: u64,
        #[snafu(source)]
        source: AllocError,
    },
    #[snafu(display("allocator failed: {source}"))]
    Allocator {
        #[snafu(implicit)]
        location: Location,
        #[snafu(source)]
        source: AllocError,
    },
}

impl GateError {
    /// Returns `true` if the request failed for lack of capacity.
    ///
    /// Only [`ExceedsCapacity`](Self::ExceedsCapacity) can never succeed on
    /// a retry.
    #[must_use]
    pub fn is_capacity_exhausted(&self) -> bool {
        matches!(
            self,
            Self::ExceedsCapacity { .. } | Self::Timeout { .. } | Self::Fragmentation { .. }
        )
    }
}

impl Located for GateError {
    fn location(&self) -> Option<Location> {
        match self {
            Self::InvalidSectorSize { location, .. }
            | Self::NoSectors { location, .. }
            | Self::InvalidSize { location, .. }
            | Self::ExceedsCapacity { location, .. }
            | Self::Timeout { location, .. }
            | Self::Fragmentation { location, .. }
            | Self::Allocator { location, .. } => Some(*location),
        }
    }
}
