//! Common types used across Aegis
//!
//! This module defines shared identifiers and reference constants to avoid
//! circular dependencies between the subsystems.

use core::fmt;

// ============================================================================
// Reference Constants
// ============================================================================

/// Maximum number of CPUs
pub const MAX_CPUS: usize = 256;
/// Maximum number of live processes
pub const MAX_PROCESSES: usize = 4096;
/// Maximum number of threads per process
pub const MAX_THREADS_PER_PROCESS: usize = 256;
/// Number of IRQ lines in the descriptor table
pub const MAX_IRQ_HANDLERS: usize = 256;
/// Capacity of the event queue
pub const EVENT_QUEUE_CAPACITY: usize = 1024;
/// Default time slice in timer ticks
pub const TIME_QUANTUM_TICKS: u32 = 10;
/// Kernel stack size in pages
pub const KERNEL_STACK_PAGES: usize = 2;
/// User stack size in pages
pub const USER_STACK_PAGES: usize = 4;
/// Weight of every Fair entity
pub const FAIR_WEIGHT: u64 = 1024;
/// Tolerance band for load classification
pub const BALANCE_THRESHOLD: u32 = 2;
/// Page size in bytes
pub const PAGE_SIZE: usize = 4096;

/// Timer interrupt line
#[cfg(target_arch = "x86_64")]
pub const TIMER_IRQ: u32 = 32;
#[cfg(target_arch = "aarch64")]
pub const TIMER_IRQ: u32 = 27;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub const TIMER_IRQ: u32 = 0;

// ============================================================================
// Identifiers
// ============================================================================

/// Process identifier
///
/// The low 16 bits select a slot in the process table, the high 16 bits carry
/// the slot generation. A pid whose process was destroyed never resolves again,
/// even after its slot is reused; a slot is retired once its generations run
/// out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u32);

impl Pid {
    const SLOT_BITS: u32 = 16;
    const SLOT_MASK: u32 = (1 << Self::SLOT_BITS) - 1;
    /// Number of addressable process table slots
    pub const MAX_SLOTS: usize = 1 << Self::SLOT_BITS;

    /// Build a pid from a table slot and its generation
    pub const fn new(slot: usize, generation: u16) -> Self {
        Pid(((generation as u32) << Self::SLOT_BITS) | (slot as u32 & Self::SLOT_MASK))
    }

    /// Table slot
    pub const fn slot(self) -> usize {
        (self.0 & Self::SLOT_MASK) as usize
    }

    /// Slot generation
    pub const fn generation(self) -> u16 {
        (self.0 >> Self::SLOT_BITS) as u16
    }

    /// Raw value as handed to user space
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    pub const fn from_raw(raw: u32) -> Self {
        Pid(raw)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.slot(), self.generation())
    }
}

/// Thread identifier
///
/// Allocated from a per-manager counter and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(pub u32);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque device cookie handed back to an IRQ handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DevId(pub u64);

/// Scheduling priority inherited by threads from their process
pub type Priority = u32;
