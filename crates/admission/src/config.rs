//! Gate configuration.

use serde::{Deserialize, Serialize};
use snafu::ensure;
use tlsf::{ArenaConfig, codec::WORD};

use crate::error::{GateError, InvalidSectorSizeSnafu, NoSectorsSnafu};

/// Default granularity of admission tokens.
pub const DEFAULT_SECTOR_SIZE: u64 = 512;

/// Configuration of one admission gate and the arena behind it.
///
/// `arena.total_size` is ignored: the arena is sized so that its nominal
/// capacity covers `total_capacity`.
///
/// # Example
///
/// ```rust
/// use admission::GateConfig;
///
/// let config = GateConfig::new(512 * 10, 512, "nvme0");
/// assert_eq!(config.arena_config().total_size, 6400);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Bytes admitted at once, summed over live allocations.
    pub total_capacity: u64,

    /// Size of one admission token. Power of two.
    pub sector_size: u64,

    /// Name of the device the gate fronts, used in log events.
    pub device_label: String,

    /// Settings of the underlying arena.
    pub arena: ArenaConfig,
}

impl Default for GateConfig {
    fn default() -> Self {
        let arena = ArenaConfig::default();
        Self {
            total_capacity: arena.nominal_capacity(),
            sector_size: DEFAULT_SECTOR_SIZE,
            device_label: "default".into(),
            arena,
        }
    }
}

impl GateConfig {
    #[must_use]
    pub fn new(total_capacity: u64, sector_size: u64, device_label: impl Into<String>) -> Self {
        Self {
            total_capacity,
            sector_size,
            device_label: device_label.into(),
            ..Default::default()
        }
    }

    /// Arena settings with `total_size` derived from `total_capacity`.
    #[must_use]
    pub fn arena_config(&self) -> ArenaConfig {
        let ratio = u64::from(self.arena.available_ratio.max(1));
        let total_size = self
            .total_capacity
            .saturating_mul(10)
            .div_ceil(ratio)
            .next_multiple_of(WORD);
        ArenaConfig {
            total_size,
            ..self.arena.clone()
        }
    }

    pub fn validate(&self) -> Result<(), GateError> {
        ensure!(
            self.sector_size.is_power_of_two(),
            InvalidSectorSizeSnafu {
                sector_size: self.sector_size
            }
        );
        ensure!(
            self.total_capacity >= self.sector_size,
            NoSectorsSnafu {
                total_capacity: self.total_capacity,
                sector_size: self.sector_size,
            }
        );
        Ok(())
    }
}
