//! Kernel Performance Counters
//!
//! Event counters for the scheduler and dispatcher. Every kernel instance
//! owns its own [`KernelCounters`], so independent instances never share
//! statistics.
//!
//! ## Counter Categories
//!
//! - **Scheduler**: context switches, ticks, idle ticks, preemptions
//! - **Interrupts**: dispatched and unhandled IRQs
//! - **Events**: posted, rejected and drained events

use core::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Counter Type
// ============================================================================

/// Named counter (atomically updated)
#[derive(Debug)]
pub struct Counter {
    value: AtomicU64,
    name: &'static str,
}

impl Counter {
    /// Create a new counter
    pub const fn new(name: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
        }
    }

    /// Increment counter by 1
    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment counter by n
    #[inline]
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get current value
    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Reset to zero
    #[inline]
    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }

    /// Get counter name
    pub fn name(&self) -> &'static str {
        self.name
    }
}

// ============================================================================
// Counter Set
// ============================================================================

/// Counters kept by a kernel instance
#[derive(Debug)]
pub struct KernelCounters {
    /// Context switches performed
    pub context_switches: Counter,
    /// Timer ticks processed
    pub ticks: Counter,
    /// Ticks on which a CPU had nothing to run
    pub idle_ticks: Counter,
    /// Threads whose slice ran out
    pub preemptions: Counter,
    /// IRQs delivered to a handler
    pub irqs_dispatched: Counter,
    /// IRQs with no handler or a masked line
    pub irqs_unhandled: Counter,
    /// Events accepted by the queue
    pub events_posted: Counter,
    /// Events refused because the queue was full
    pub events_rejected: Counter,
    /// Events taken off the queue and handled
    pub events_drained: Counter,
}

impl KernelCounters {
    pub const fn new() -> Self {
        Self {
            context_switches: Counter::new("context_switches"),
            ticks: Counter::new("ticks"),
            idle_ticks: Counter::new("idle_ticks"),
            preemptions: Counter::new("preemptions"),
            irqs_dispatched: Counter::new("irqs_dispatched"),
            irqs_unhandled: Counter::new("irqs_unhandled"),
            events_posted: Counter::new("events_posted"),
            events_rejected: Counter::new("events_rejected"),
            events_drained: Counter::new("events_drained"),
        }
    }

    fn all(&self) -> [&Counter; 9] {
        [
            &self.context_switches,
            &self.ticks,
            &self.idle_ticks,
            &self.preemptions,
            &self.irqs_dispatched,
            &self.irqs_unhandled,
            &self.events_posted,
            &self.events_rejected,
            &self.events_drained,
        ]
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in self.all() {
            counter.reset();
        }
    }

    /// Get a snapshot of all counters
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            context_switches: self.context_switches.get(),
            ticks: self.ticks.get(),
            idle_ticks: self.idle_ticks.get(),
            preemptions: self.preemptions.get(),
            irqs_dispatched: self.irqs_dispatched.get(),
            irqs_unhandled: self.irqs_unhandled.get(),
            events_posted: self.events_posted.get(),
            events_rejected: self.events_rejected.get(),
            events_drained: self.events_drained.get(),
        }
    }

    /// Log every counter at info level
    pub fn log(&self) {
        for counter in self.all() {
            log::info!("{:>18}: {}", counter.name(), counter.get());
        }
    }
}

/// Snapshot of counter values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub context_switches: u64,
    pub ticks: u64,
    pub idle_ticks: u64,
    pub preemptions: u64,
    pub irqs_dispatched: u64,
    pub irqs_unhandled: u64,
    pub events_posted: u64,
    pub events_rejected: u64,
    pub events_drained: u64,
}
