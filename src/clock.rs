//! Monotonic tick sources for event timestamps
//!
//! Events are stamped with ticks from an injected monotonic source rather
//! than wall-clock time. The default source reads the CPU cycle counter
//! (TSC on x86_64, the virtual counter on aarch64) and calibrates it
//! against the OS clock once at startup so that `print_stats` can convert
//! tick counts to seconds. Tests inject a [`ManualTicks`] source to
//! advance time deterministically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A monotonic tick oracle
///
/// Implementations must be monotonic within a thread; ticks are compared
/// and delta-encoded, never interpreted as absolute time.
pub trait TickSource: Send + Sync {
    /// Current tick count
    fn now(&self) -> u64;

    /// Nominal ticks per second, used to convert counters to seconds
    fn ticks_per_second(&self) -> u64;
}

/// Reads the CPU cycle counter with the highest precision available
#[inline]
fn read_ticks() -> u64 {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::x86_64::_rdtsc()
    }

    #[cfg(target_arch = "aarch64")]
    unsafe {
        let value: u64;
        std::arch::asm!("mrs {}, cntvct_el0", out(reg) value);
        value
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        use once_cell::sync::Lazy;
        static START: Lazy<Instant> = Lazy::new(Instant::now);
        START.elapsed().as_nanos() as u64
    }
}

/// Cycle-counter tick source, calibrated against the OS clock at creation
pub struct CpuTicks {
    ticks_per_sec: u64,
}

impl CpuTicks {
    /// Calibration window; long enough to keep the rate estimate stable
    const CALIBRATION_WINDOW: Duration = Duration::from_millis(10);

    /// Create a calibrated cycle-counter source
    pub fn new() -> Self {
        let wall_start = Instant::now();
        let tick_start = read_ticks();
        std::thread::sleep(Self::CALIBRATION_WINDOW);
        let ticks = read_ticks().wrapping_sub(tick_start);
        let elapsed = wall_start.elapsed();

        let nanos = elapsed.as_nanos().max(1) as u64;
        let ticks_per_sec = (ticks as u128 * 1_000_000_000u128 / nanos as u128) as u64;

        Self {
            ticks_per_sec: ticks_per_sec.max(1),
        }
    }
}

impl Default for CpuTicks {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for CpuTicks {
    #[inline]
    fn now(&self) -> u64 {
        read_ticks()
    }

    fn ticks_per_second(&self) -> u64 {
        self.ticks_per_sec
    }
}

/// Manually advanced tick source for deterministic tests
pub struct ManualTicks {
    current: AtomicU64,
}

impl ManualTicks {
    /// Create a manual source starting at the given tick
    pub fn new(start: u64) -> Self {
        Self {
            current: AtomicU64::new(start),
        }
    }

    /// Advance the tick count by `delta`
    pub fn advance(&self, delta: u64) {
        self.current.fetch_add(delta, Ordering::Relaxed);
    }
}

impl TickSource for ManualTicks {
    fn now(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    fn ticks_per_second(&self) -> u64 {
        1_000_000_000
    }
}

/// Convert a tick count to seconds
pub(crate) fn to_seconds(ticks: u64, ticks_per_sec: u64) -> f64 {
    ticks as f64 / ticks_per_sec.max(1) as f64
}
