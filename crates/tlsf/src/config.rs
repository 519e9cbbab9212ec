//! Arena configuration.

use serde::{Deserialize, Serialize};
use snafu::ensure;

use crate::{
    codec::{MIN_CHUNK_SIZE, PAYLOAD_OFFSET, WORD},
    error::{ArenaTooSmallSnafu, ConfigError, InvalidAlignmentSnafu, InvalidRatioSnafu},
};

/// Smallest alignment the boundary-tag flag bits leave room for.
pub const MIN_ALIGNMENT: u64 = 4;

/// Largest alignment whose linear row still fits the index's size range.
pub const MAX_ALIGNMENT: u64 = 1 << 57;

/// Default number of recycled view handles kept around.
pub const DEFAULT_HANDLE_POOL_CAPACITY: usize = 5000;

/// Default share of the arena, in tenths, advertised as nominal capacity.
pub const DEFAULT_AVAILABLE_RATIO: u8 = 8;

/// Configuration of one arena.
///
/// # Example
///
/// ```rust
/// use tlsf::ArenaConfig;
///
/// let config = ArenaConfig::with_total_size(1 << 20);
/// assert_eq!(config.alignment, 4);
/// assert_eq!(config.nominal_capacity(), (1 << 20) * 8 / 10);
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    /// Size of the backing region in bytes, boundary tags included.
    pub total_size: u64,

    /// Granularity every request is rounded up to. Power of two, between 4
    /// and 2^57.
    pub alignment: u64,

    /// Upper bound on recycled view handles.
    pub handle_pool_capacity: usize,

    /// Tenths of `total_size` reported by `total_capacity()`.
    pub available_ratio: u8,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            total_size: 64 * 1024 * 1024,
            alignment: MIN_ALIGNMENT,
            handle_pool_capacity: DEFAULT_HANDLE_POOL_CAPACITY,
            available_ratio: DEFAULT_AVAILABLE_RATIO,
        }
    }
}

impl ArenaConfig {
    #[must_use]
    pub fn with_total_size(total_size: u64) -> Self {
        Self {
            total_size,
            ..Default::default()
        }
    }

    /// A small arena suitable for unit tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            total_size: 1024 * 1024,
            handle_pool_capacity: 16,
            ..Default::default()
        }
    }

    /// Smallest arena that can hold one minimum-size chunk.
    #[must_use]
    pub const fn minimum_total_size() -> u64 {
        PAYLOAD_OFFSET + MIN_CHUNK_SIZE
    }

    /// `total_size` rounded down to a whole number of metadata words.
    #[must_use]
    pub const fn effective_total_size(&self) -> u64 {
        self.total_size & !(WORD - 1)
    }

    /// Bytes advertised to capacity-based callers such as an admission gate.
    #[must_use]
    pub const fn nominal_capacity(&self) -> u64 {
        self.effective_total_size() / 10 * self.available_ratio as u64
            + self.effective_total_size() % 10 * self.available_ratio as u64 / 10
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(
            self.alignment.is_power_of_two()
                && (MIN_ALIGNMENT..=MAX_ALIGNMENT).contains(&self.alignment),
            InvalidAlignmentSnafu {
                alignment: self.alignment
            }
        );
        ensure!(
            (1..=10).contains(&self.available_ratio),
            InvalidRatioSnafu {
                ratio: self.available_ratio
            }
        );
        ensure!(
            self.effective_total_size() >= Self::minimum_total_size(),
            ArenaTooSmallSnafu {
                total_size: self.total_size,
                minimum: Self::minimum_total_size(),
            }
        );
        Ok(())
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        ArenaConfig::default().validate().unwrap();
        ArenaConfig::for_testing().validate().unwrap();
    }

    #[test]
    fn test_rejects_bad_alignment() {
        for alignment in [0, 2, 3, 6, 100, 1 << 58, 1 << 63] {
            let config = ArenaConfig {
                alignment,
                ..ArenaConfig::for_testing()
            };
            assert!(matches!(
                config.validate(),
                Err(ConfigError::InvalidAlignment { .. })
            ));
        }
        ArenaConfig {
            alignment: MAX_ALIGNMENT,
            ..ArenaConfig::for_testing()
        }
        .validate()
        .unwrap();
    }

    #[test]
    fn test_rejects_bad_ratio() {
        for available_ratio in [0, 11] {
            let config = ArenaConfig {
                available_ratio,
                ..ArenaConfig::for_testing()
            };
            assert!(matches!(
                config.validate(),
                Err(ConfigError::InvalidRatio { .. })
            ));
        }
    }

    #[test]
    fn test_rejects_tiny_arena() {
        let config = ArenaConfig::with_total_size(40);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ArenaTooSmall { .. })
        ));
        ArenaConfig::with_total_size(48).validate().unwrap();
    }

    #[test]
    fn test_nominal_capacity() {
        let config = ArenaConfig::with_total_size(6400);
        assert_eq!(config.nominal_capacity(), 5120);
        let config = ArenaConfig {
            available_ratio: 10,
            ..ArenaConfig::with_total_size(1001)
        };
        assert_eq!(config.effective_total_size(), 1000);
        assert_eq!(config.nominal_capacity(), 1000);
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: ArenaConfig = serde_json::from_str(r#"{"total_size": 8192}"#).unwrap();
        assert_eq!(config.total_size, 8192);
        assert_eq!(config.alignment, MIN_ALIGNMENT);
        assert_eq!(config.handle_pool_capacity, DEFAULT_HANDLE_POOL_CAPACITY);
        assert_eq!(config.available_ratio, DEFAULT_AVAILABLE_RATIO);
    }
}
