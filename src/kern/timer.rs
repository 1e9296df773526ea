//! Kernel Clock
//!
//! Time in the core is measured in jiffies: one jiffy per timer interrupt
//! processed on the boot CPU.

use core::sync::atomic::{AtomicU64, Ordering};

/// Monotonic tick clock
#[derive(Debug, Default)]
pub struct Jiffies {
    ticks: AtomicU64,
}

impl Jiffies {
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
        }
    }

    /// Current time
    #[inline]
    pub fn now(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Advance by one tick, returning the new time
    #[inline]
    pub fn advance(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Ticks elapsed since `earlier`
    pub fn since(&self, earlier: u64) -> u64 {
        self.now().saturating_sub(earlier)
    }
}
