//! Kern subsystem - Process and thread management
//!
//! Contains the process table, threads, per-CPU run queues, the tick clock
//! and the kernel counters.

pub mod counters;
pub mod process;
pub mod runq;
pub mod thread;
pub mod timer;

pub use counters::{CounterSnapshot, KernelCounters};
pub use process::{ProcessInfo, ProcessManager, ProcessName};
pub use runq::RunQueues;
pub use thread::{Thread, ThreadStacks, ThreadState};
pub use timer::Jiffies;
