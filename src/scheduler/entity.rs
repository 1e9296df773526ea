//! Scheduling entities
//!
//! Every thread the scheduler knows about is represented by exactly one
//! [`SchedEntity`]. The entity refers to its thread without owning it, and
//! keeps the per-class accounting that survives dequeue and re-enqueue.

use alloc::sync::{Arc, Weak};

use crate::kern::thread::{Thread, ThreadState};
use crate::types::Tid;

/// Scheduling class, checked in declaration order by `pick_next`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedClass {
    RealTime,
    Fair,
    Deadline,
}

/// Fair-share accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FairStats {
    /// Virtual runtime; lower runs first
    pub vruntime: u64,
    /// Ticks spent running
    pub sum_exec_runtime: u64,
    /// `sum_exec_runtime` at the last vruntime update
    pub prev_sum_exec_runtime: u64,
}

/// Deadline accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeadlineParams {
    /// Ticks of budget left in the current period
    pub runtime: u64,
    /// Relative deadline
    pub deadline: u64,
    /// Replenishment period
    pub period: u64,
}

/// Per-thread scheduling state
#[derive(Debug, Clone)]
pub struct SchedEntity {
    thread: Weak<Thread>,
    tid: Tid,
    pub class: SchedClass,
    pub fair: FairStats,
    pub deadline: DeadlineParams,
    /// Jiffies at the last dispatch
    pub last_scheduled: u64,
    /// Number of dispatches
    pub scheduled_count: u64,
}

impl SchedEntity {
    pub fn new(thread: &Arc<Thread>, class: SchedClass) -> Self {
        Self {
            thread: Arc::downgrade(thread),
            tid: thread.tid(),
            class,
            fair: FairStats::default(),
            deadline: DeadlineParams::default(),
            last_scheduled: 0,
            scheduled_count: 0,
        }
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// The thread, unless it has already been dropped
    pub fn thread(&self) -> Option<Arc<Thread>> {
        self.thread.upgrade()
    }

    /// State of the thread, `None` once it is gone
    pub fn thread_state(&self) -> Option<ThreadState> {
        self.thread.upgrade().map(|t| t.state())
    }

    pub fn is_ready(&self) -> bool {
        self.thread_state() == Some(ThreadState::Ready)
    }

    /// Ready and free to be dispatched on `cpu`
    ///
    /// A ready thread still held by another CPU is not eligible until that
    /// CPU switches away from it.
    pub fn is_ready_on(&self, cpu: usize) -> bool {
        self.thread.upgrade().is_some_and(|t| {
            t.state() == ThreadState::Ready && t.on_cpu().map_or(true, |owner| owner == cpu)
        })
    }

    /// Fold the runtime accumulated since the last update into `vruntime`
    ///
    /// Every Fair entity has the same weight, so the weighted delta is the
    /// raw delta.
    pub fn update_vruntime(&mut self) -> u64 {
        let delta = self
            .fair
            .sum_exec_runtime
            .saturating_sub(self.fair.prev_sum_exec_runtime);
        self.fair.vruntime += delta;
        self.fair.prev_sum_exec_runtime = self.fair.sum_exec_runtime;
        delta
    }
}
