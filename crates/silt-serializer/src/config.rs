use serde::{Deserialize, Serialize};

use crate::error::{SerializerError, SerializerResult};

/// Smallest accepted extent (one 4 KiB block).
const EXTENT_SIZE_MIN: u64 = 4 * 1024;

/// Largest accepted extent (1 GiB); recovery reads every slot, so bigger
/// extents stretch startup for no benefit.
const EXTENT_SIZE_MAX: u64 = 1024 * 1024 * 1024;

/// Default extent size (2 MiB).
const DEFAULT_EXTENT_SIZE: u64 = 2 * 1024 * 1024;

#[inline]
fn floor_power_of_two(value: u64) -> u64 {
    if value == 0 {
        0
    } else {
        let shift = 63_u32 - value.leading_zeros();
        1_u64 << shift
    }
}

#[inline]
fn clamp_power_of_two(value: u64, min: u64, max: u64) -> u64 {
    let clamped = value.clamp(min, max);
    if clamped.is_power_of_two() {
        return clamped;
    }
    let lower = floor_power_of_two(clamped).max(min);
    let upper = (lower << 1).min(max).max(min);
    if clamped - lower <= upper.saturating_sub(clamped) {
        lower
    } else {
        upper
    }
}

/// Configuration for the metablock layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetablockConfig {
    /// Size of one extent in the database file. Must be a power of two;
    /// [`MetablockConfig::normalized`] clamps arbitrary values.
    pub extent_size: u64,
}

impl Default for MetablockConfig {
    fn default() -> Self {
        Self {
            extent_size: DEFAULT_EXTENT_SIZE,
        }
    }
}

impl MetablockConfig {
    pub fn normalized(mut self) -> Self {
        self.extent_size = clamp_power_of_two(self.extent_size, EXTENT_SIZE_MIN, EXTENT_SIZE_MAX);
        self
    }

    pub fn validate(&self) -> SerializerResult<()> {
        if !self.extent_size.is_power_of_two()
            || !(EXTENT_SIZE_MIN..=EXTENT_SIZE_MAX).contains(&self.extent_size)
        {
            return Err(SerializerError::invalid_config(format!(
                "extent size {} must be a power of two between {EXTENT_SIZE_MIN} and {EXTENT_SIZE_MAX}",
                self.extent_size
            )));
        }
        Ok(())
    }
}
