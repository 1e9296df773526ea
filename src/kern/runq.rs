//! Run Queue Management
//!
//! One ready queue per CPU. Queues are stacks: the most recently scheduled
//! thread is the first one handed out. All queues share a single lock.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::kern::thread::Thread;
use crate::types::Tid;

/// Per-CPU ready queues
pub struct RunQueues {
    queues: Mutex<Vec<VecDeque<Arc<Thread>>>>,
}

impl RunQueues {
    /// Create `cpus` empty queues
    pub fn new(cpus: usize) -> Self {
        let mut queues = Vec::with_capacity(cpus);
        queues.resize_with(cpus, VecDeque::new);
        Self {
            queues: Mutex::new(queues),
        }
    }

    /// Number of queues
    pub fn cpus(&self) -> usize {
        self.queues.lock().len()
    }

    /// Push `thread` at the head of `cpu`'s queue
    ///
    /// A thread already queued anywhere is moved rather than duplicated.
    pub fn push_front(&self, cpu: usize, thread: Arc<Thread>) -> KernelResult<()> {
        let mut queues = self.queues.lock();
        if cpu >= queues.len() {
            return Err(KernelError::InvalidArgument);
        }
        let tid = thread.tid();
        for queue in queues.iter_mut() {
            queue.retain(|t| t.tid() != tid);
        }
        queues[cpu].push_front(thread);
        Ok(())
    }

    /// Pop the head of `cpu`'s queue
    pub fn pop_front(&self, cpu: usize) -> KernelResult<Option<Arc<Thread>>> {
        let mut queues = self.queues.lock();
        let queue = queues.get_mut(cpu).ok_or(KernelError::InvalidArgument)?;
        Ok(queue.pop_front())
    }

    /// Remove `tid` from whichever queue holds it
    pub fn remove(&self, tid: Tid) -> bool {
        let mut queues = self.queues.lock();
        let mut found = false;
        for queue in queues.iter_mut() {
            let before = queue.len();
            queue.retain(|t| t.tid() != tid);
            found |= queue.len() != before;
        }
        found
    }

    pub fn len(&self, cpu: usize) -> KernelResult<usize> {
        self.queues
            .lock()
            .get(cpu)
            .map(VecDeque::len)
            .ok_or(KernelError::InvalidArgument)
    }

    /// Threads queued across all CPUs
    pub fn total(&self) -> usize {
        self.queues.lock().iter().map(VecDeque::len).sum()
    }

    /// Queued tids on `cpu`, head first
    pub fn snapshot(&self, cpu: usize) -> KernelResult<Vec<Tid>> {
        let queues = self.queues.lock();
        let queue = queues.get(cpu).ok_or(KernelError::InvalidArgument)?;
        Ok(queue.iter().map(|t| t.tid()).collect())
    }
}
