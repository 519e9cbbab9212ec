use std::io;

use snafu::Snafu;
use snafu_utils::{Located, Location};

use crate::codec::Address;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("alignment {alignment} must be a power of two between 4 and 2^57"))]
    InvalidAlignment {
        #[snafu(implicit)]
        location: Location,
        alignment: u64,
    },
    #[snafu(display("arena of {total_size} bytes is smaller than the minimum of {minimum} bytes"))]
    ArenaTooSmall {
        #[snafu(implicit)]
        location: Location,
        total_size: u64,
        minimum: u64,
    },
    #[snafu(display("available ratio {ratio} is outside 1..=10"))]
    InvalidRatio {
        #[snafu(implicit)]
        location: Location,
        ratio: u8,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AllocError {
    #[snafu(display("requested size {size} must be positive"))]
    InvalidSize {
        #[snafu(implicit)]
        location: Location,
        size: u64,
    },
    #[snafu(display("no free chunk can hold {size} bytes"))]
    CapacityExhausted {
        #[snafu(implicit)]
        location: Location,
        size: u64,
    },
    #[snafu(display("invalid arena configuration"))]
    Config {
        #[snafu(implicit)]
        location: Location,
        #[snafu(source)]
        source: ConfigError,
    },
    #[snafu(display("failed to set up the arena backing store"))]
    Region {
        #[snafu(implicit)]
        location: Location,
        #[snafu(source)]
        source: io::Error,
    },
}

impl AllocError {
    /// Returns `true` for failures a caller may retry after releasing buffers.
    #[must_use]
    pub fn is_capacity_exhausted(&self) -> bool {
        matches!(self, Self::CapacityExhausted { .. })
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ViewError {
    #[snafu(display(
        "reading {len} bytes at offset {offset} overruns a view of {size} bytes"
    ))]
    BufferUnderflow {
        #[snafu(implicit)]
        location: Location,
        offset: u64,
        len: u64,
        size: u64,
    },
    #[snafu(display(
        "writing {len} bytes at offset {offset} overruns a view of {size} bytes"
    ))]
    BufferOverflow {
        #[snafu(implicit)]
        location: Location,
        offset: u64,
        len: u64,
        size: u64,
    },
    #[snafu(display("range {offset}+{len} is outside a caller buffer of {available} bytes"))]
    ExternalRange {
        #[snafu(implicit)]
        location: Location,
        offset: usize,
        len: usize,
        available: usize,
    },
    #[snafu(display("arena I/O failed"))]
    Io {
        #[snafu(implicit)]
        location: Location,
        #[snafu(source)]
        source: io::Error,
    },
}

/// Defects detected while returning a chunk or walking the arena.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ReleaseError {
    #[snafu(display("chunk {address} released twice (epoch {epoch})"))]
    DoubleRelease {
        #[snafu(implicit)]
        location: Location,
        address: Address,
        epoch: u64,
    },
    #[snafu(display("corrupted metadata at chunk {address}: {reason}"))]
    CorruptedMetadata {
        #[snafu(implicit)]
        location: Location,
        address: Address,
        reason: &'static str,
    },
}

impl ReleaseError {
    #[must_use]
    pub fn is_double_release(&self) -> bool {
        matches!(self, Self::DoubleRelease { .. })
    }
}

impl Located for ConfigError {
    fn location(&self) -> Option<Location> {
        match self {
            Self::InvalidAlignment { location, .. }
            | Self::ArenaTooSmall { location, .. }
            | Self::InvalidRatio { location, .. } => Some(*location),
        }
    }
}

impl Located for AllocError {
    fn location(&self) -> Option<Location> {
        match self {
            Self::InvalidSize { location, .. }
            | Self::CapacityExhausted { location, .. }
            | Self::Config { location, .. }
            | Self::Region { location, .. } => Some(*location),
        }
    }
}

impl Located for ViewError {
    fn location(&self) -> Option<Location> {
        match self {
            Self::BufferUnderflow { location, .. }
            | Self::BufferOverflow { location, .. }
            | Self::ExternalRange { location, .. }
            | Self::Io { location, .. } => Some(*location),
        }
    }
}

impl Located for ReleaseError {
    fn location(&self) -> Option<Location> {
        match self {
            Self::DoubleRelease { location, .. } | Self::CorruptedMetadata { location, .. } => {
                Some(*location)
            }
        }
    }
}
