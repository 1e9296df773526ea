//! Thread Management
//!
//! Threads are the unit of execution in Aegis. A thread belongs to exactly
//! one process for its whole lifetime and exclusively owns a kernel stack, a
//! user stack and its saved register context.

use core::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use spin::Mutex;

use crate::arch::Context;
use crate::memory::PageRegion;
use crate::types::{Pid, Priority, Tid};

// ============================================================================
// Thread State
// ============================================================================

/// Lifecycle state shared by threads and processes
///
/// `New -> Ready -> Running -> (Ready | Blocked | Terminated)`, and
/// `Blocked -> Ready` when an external waker fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ThreadState {
    New = 0,
    Ready = 1,
    Running = 2,
    Blocked = 3,
    Terminated = 4,
}

impl ThreadState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ThreadState::New,
            1 => ThreadState::Ready,
            2 => ThreadState::Running,
            3 => ThreadState::Blocked,
            _ => ThreadState::Terminated,
        }
    }

    /// Whether the thread may be placed on a run queue
    pub fn is_runnable(self) -> bool {
        matches!(self, ThreadState::New | ThreadState::Ready | ThreadState::Running)
    }
}

// ============================================================================
// Stacks
// ============================================================================

/// Stacks owned by a thread
#[derive(Debug, PartialEq, Eq)]
pub struct ThreadStacks {
    pub kernel: PageRegion,
    pub user: PageRegion,
}

/// `on_cpu` value of a thread no CPU holds
const NO_CPU: usize = usize::MAX;

// ============================================================================
// Thread Structure
// ============================================================================

/// A kernel thread
#[derive(Debug)]
pub struct Thread {
    /// Thread identifier
    tid: Tid,

    /// Owning process
    pid: Pid,

    /// Current lifecycle state
    state: AtomicU8,

    /// Scheduling priority
    priority: AtomicU32,

    /// CPU affinity mask; the low byte selects the target CPU
    cpu_affinity: AtomicU64,

    /// Ticks left in the current slice
    time_slice: AtomicU32,

    /// CPU the thread was last placed on
    cpu: AtomicUsize,

    /// CPU holding the thread as its current thread, `NO_CPU` when none
    on_cpu: AtomicUsize,

    /// Entry point and argument the thread was created with
    entry_point: usize,
    arg: usize,

    /// Owned stacks, taken when the thread is destroyed
    stacks: Mutex<Option<ThreadStacks>>,

    /// Saved register state
    context: Mutex<Context>,
}

impl Thread {
    /// Create a thread in the `New` state owning `stacks`
    pub fn new(
        tid: Tid,
        pid: Pid,
        priority: Priority,
        entry_point: usize,
        arg: usize,
        time_slice: u32,
        stacks: ThreadStacks,
    ) -> Self {
        Self {
            tid,
            pid,
            state: AtomicU8::new(ThreadState::New as u8),
            priority: AtomicU32::new(priority),
            cpu_affinity: AtomicU64::new(0),
            time_slice: AtomicU32::new(time_slice),
            cpu: AtomicUsize::new(0),
            on_cpu: AtomicUsize::new(NO_CPU),
            entry_point,
            arg,
            stacks: Mutex::new(Some(stacks)),
            context: Mutex::new(Context::new()),
        }
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn entry_point(&self) -> usize {
        self.entry_point
    }

    pub fn arg(&self) -> usize {
        self.arg
    }

    // ---- state ----

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move to `to` only if the thread is currently in `from`
    pub fn transition(&self, from: ThreadState, to: ThreadState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    // ---- scheduling attributes ----

    pub fn priority(&self) -> Priority {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, priority: Priority) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    pub fn cpu_affinity(&self) -> u64 {
        self.cpu_affinity.load(Ordering::Relaxed)
    }

    pub fn set_cpu_affinity(&self, mask: u64) {
        self.cpu_affinity.store(mask, Ordering::Relaxed);
    }

    /// CPU selected by the affinity mask, or CPU 0 when it is out of range
    pub fn target_cpu(&self, max_cpus: usize) -> usize {
        let cpu = (self.cpu_affinity() & 0xFF) as usize;
        if cpu >= max_cpus {
            0
        } else {
            cpu
        }
    }

    pub fn cpu(&self) -> usize {
        self.cpu.load(Ordering::Relaxed)
    }

    pub fn set_cpu(&self, cpu: usize) {
        self.cpu.store(cpu, Ordering::Relaxed);
    }

    /// CPU currently holding the thread, if any
    ///
    /// A thread stays attached to its CPU after it blocks, exits or runs out
    /// of slice, until that CPU switches away from it.
    pub fn on_cpu(&self) -> Option<usize> {
        match self.on_cpu.load(Ordering::Acquire) {
            NO_CPU => None,
            cpu => Some(cpu),
        }
    }

    /// Attach the thread to `cpu`; fails while another CPU holds it
    pub fn claim_cpu(&self, cpu: usize) -> bool {
        match self
            .on_cpu
            .compare_exchange(NO_CPU, cpu, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(owner) => owner == cpu,
        }
    }

    /// Detach the thread from `cpu`, if `cpu` holds it
    pub fn release_cpu(&self, cpu: usize) {
        let _ = self
            .on_cpu
            .compare_exchange(cpu, NO_CPU, Ordering::AcqRel, Ordering::Relaxed);
    }

    pub fn time_slice(&self) -> u32 {
        self.time_slice.load(Ordering::Relaxed)
    }

    pub fn set_time_slice(&self, ticks: u32) {
        self.time_slice.store(ticks, Ordering::Relaxed);
    }

    /// Consume one tick of the slice, returning the ticks left
    pub fn consume_tick(&self) -> u32 {
        let prev = self
            .time_slice
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |t| Some(t.saturating_sub(1)))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    // ---- owned resources ----

    /// Take the stacks out of the thread for release
    pub fn take_stacks(&self) -> Option<ThreadStacks> {
        self.stacks.lock().take()
    }

    /// Whether the thread still owns its stacks
    pub fn has_stacks(&self) -> bool {
        self.stacks.lock().is_some()
    }

    /// Run `f` with the thread's stacks, if it still owns them
    pub fn with_stacks<R>(&self, f: impl FnOnce(&ThreadStacks) -> R) -> Option<R> {
        self.stacks.lock().as_ref().map(f)
    }

    pub fn context(&self) -> &Mutex<Context> {
        &self.context
    }
}
