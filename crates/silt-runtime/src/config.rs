use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RuntimeError, RuntimeResult};

/// Hard cap on the number of OS threads a pool may own (data workers plus
/// the utility worker).
pub const MAX_WORKERS: usize = 512;

/// Smallest accepted timer tick (~65 microseconds).
const TIMER_TICK_MIN_NS: u64 = 1 << 16;

/// Largest accepted timer tick (~67 milliseconds).
const TIMER_TICK_MAX_NS: u64 = 1 << 26;

/// Default timer tick (~1.05 ms, power of two as required by the wheel).
const DEFAULT_TIMER_TICK_NS: u64 = 1 << 20;

/// Default number of helper threads in the blocking-operation pool.
const DEFAULT_BLOCKING_THREADS: usize = 4;

/// Computes the largest power of two that is less than or equal to the input.
#[inline]
fn floor_power_of_two(value: u64) -> u64 {
    if value == 0 {
        0
    } else {
        let shift = 63_u32 - value.leading_zeros();
        1_u64 << shift
    }
}

/// Clamps a value to the given range and rounds to the nearest power of two.
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

/// Configuration for a [`crate::ThreadPool`].
///
/// One extra utility thread is always created on top of `workers`, so a pool
/// built from this configuration owns `workers + 1` OS threads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPoolConfig {
    /// Number of data workers (the utility worker is not counted here).
    pub workers: usize,
    /// Pin worker `i` to CPU `i % cpu_count` where the platform supports it.
    pub set_affinity: bool,
    /// Helper threads owned by the blocking-operation pool.
    pub blocking_threads: usize,
    /// Install process-wide SIGINT/SIGTERM handlers while the pool runs.
    /// Embedders and tests that manage signals themselves can opt out.
    pub install_signal_handlers: bool,
    /// Timer wheel tick resolution. Must be a power of two in nanoseconds;
    /// [`ThreadPoolConfig::normalized`] clamps arbitrary values.
    pub timer_tick: Duration,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            workers,
            set_affinity: false,
            blocking_threads: DEFAULT_BLOCKING_THREADS,
            install_signal_handlers: true,
            timer_tick: Duration::from_nanos(DEFAULT_TIMER_TICK_NS),
        }
    }
}

impl ThreadPoolConfig {
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }

    /// Returns a copy with the timer tick clamped to a supported power of
    /// two. Worker counts are validated, not adjusted.
    pub fn normalized(mut self) -> Self {
        let tick_ns = self.timer_tick.as_nanos().min(u128::from(u64::MAX)) as u64;
        let tick_ns = clamp_power_of_two(tick_ns, TIMER_TICK_MIN_NS, TIMER_TICK_MAX_NS);
        self.timer_tick = Duration::from_nanos(tick_ns);
        self
    }

    pub fn validate(&self) -> RuntimeResult<()> {
        if self.workers == 0 {
            return Err(RuntimeError::invalid_config(
                "thread pool needs at least one data worker",
            ));
        }
        if self.workers + 1 > MAX_WORKERS {
            return Err(RuntimeError::invalid_config(format!(
                "thread pool would own {} threads, limit is {MAX_WORKERS}",
                self.workers + 1
            )));
        }
        if self.blocking_threads == 0 {
            return Err(RuntimeError::invalid_config(
                "blocking pool needs at least one helper thread",
            ));
        }
        let tick_ns = self.timer_tick.as_nanos();
        if tick_ns == 0 || !u64::try_from(tick_ns).map_or(false, |ns| ns.is_power_of_two()) {
            return Err(RuntimeError::invalid_config(
                "timer tick must be a power of two in nanoseconds",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ThreadPoolConfig::default().normalized();
        config.validate().expect("default config");
    }

    #[test]
    fn normalized_clamps_tick_to_power_of_two() {
        let config = ThreadPoolConfig {
            timer_tick: Duration::from_nanos(3_000_000),
            ..ThreadPoolConfig::with_workers(2)
        }
        .normalized();
        let ns = config.timer_tick.as_nanos() as u64;
        assert!(ns.is_power_of_two());
        assert!((TIMER_TICK_MIN_NS..=TIMER_TICK_MAX_NS).contains(&ns));
        config.validate().expect("normalized config");
    }

    #[test]
    fn zero_workers_is_rejected() {
        let config = ThreadPoolConfig::with_workers(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn ragged_tick_is_rejected_without_normalization() {
        let config = ThreadPoolConfig {
            timer_tick: Duration::from_nanos(1_000_000),
            ..ThreadPoolConfig::with_workers(1)
        };
        assert!(config.validate().is_err());
    }
}
