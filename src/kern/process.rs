//! Process Management
//!
//! A process owns an address space and a list of threads. Processes live in
//! a slot table; each slot carries a generation that is bumped when its
//! process is destroyed, so a stale [`Pid`] never resolves to a newer
//! process that reuses the slot.
//!
//! The process table (with its tid index) and the per-CPU run queues are
//! guarded by separate locks. When both are needed the table lock is taken
//! first.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult};
use crate::kern::runq::RunQueues;
use crate::kern::thread::{Thread, ThreadStacks, ThreadState};
use crate::memory::{AddressSpace, MemoryManager};
use crate::types::{Pid, Priority, Tid};

/// Maximum process name length in bytes
pub const PROCESS_NAME_LEN: usize = 32;

/// Bounded process name
pub type ProcessName = heapless::String<PROCESS_NAME_LEN>;

/// Copy `name` into a bounded string, dropping whole characters past the limit
fn truncate_name(name: &str) -> ProcessName {
    let mut out = ProcessName::new();
    for c in name.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

// ============================================================================
// Process Structure
// ============================================================================

/// A process record
struct Process {
    pid: Pid,
    parent_pid: Option<Pid>,
    name: ProcessName,
    priority: Priority,
    entry_point: usize,
    /// Owned until the process is destroyed
    address_space: Option<AddressSpace>,
    /// Most recently created first
    threads: VecDeque<Arc<Thread>>,
    cpu_time: u64,
}

impl Process {
    /// Aggregate state derived from the threads
    fn state(&self) -> ThreadState {
        let mut state = ThreadState::New;
        for thread in &self.threads {
            match thread.state() {
                ThreadState::Running => return ThreadState::Running,
                ThreadState::Ready => state = ThreadState::Ready,
                ThreadState::Blocked if state != ThreadState::Ready => {
                    state = ThreadState::Blocked
                }
                _ => {}
            }
        }
        state
    }

    fn info(&self) -> ProcessInfo {
        ProcessInfo {
            pid: self.pid,
            parent_pid: self.parent_pid,
            name: self.name.clone(),
            state: self.state(),
            priority: self.priority,
            entry_point: self.entry_point,
            thread_count: self.threads.len(),
            cpu_time: self.cpu_time,
            asid: self.address_space.as_ref().map(|a| a.asid),
        }
    }
}

/// Snapshot of a process returned by [`ProcessManager::get_process`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub parent_pid: Option<Pid>,
    pub name: ProcessName,
    /// `Running` if any thread runs, else `Ready` if any is ready, else
    /// `Blocked` if any is blocked, else `New`
    pub state: ThreadState,
    pub priority: Priority,
    pub entry_point: usize,
    pub thread_count: usize,
    pub cpu_time: u64,
    pub asid: Option<u64>,
}

// ============================================================================
// Process Table
// ============================================================================

#[derive(Default)]
struct Slot {
    generation: u16,
    process: Option<Process>,
}

struct ProcessTable {
    slots: Vec<Slot>,
    free: Vec<usize>,
    live: usize,
    /// Thread index: tid -> owning process
    threads: BTreeMap<Tid, Pid>,
    next_tid: u32,
}

impl ProcessTable {
    fn get(&self, pid: Pid) -> Option<&Process> {
        let slot = self.slots.get(pid.slot())?;
        slot.process.as_ref().filter(|p| p.pid == pid)
    }

    fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        let slot = self.slots.get_mut(pid.slot())?;
        slot.process.as_mut().filter(|p| p.pid == pid)
    }

    fn find_thread(&self, tid: Tid) -> Option<&Arc<Thread>> {
        let pid = self.threads.get(&tid)?;
        self.get(*pid)?.threads.iter().find(|t| t.tid() == tid)
    }

    /// Reserve a slot, returning its pid
    fn allocate(&mut self) -> Option<Pid> {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None if self.slots.len() < Pid::MAX_SLOTS => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
            None => return None,
        };
        Some(Pid::new(slot, self.slots[slot].generation))
    }

    /// Empty a slot and retire its generation
    ///
    /// A slot whose generation is used up is never handed out again.
    fn release(&mut self, pid: Pid) -> Option<Process> {
        let slot = self.slots.get_mut(pid.slot())?;
        let process = slot.process.take()?;
        match slot.generation.checked_add(1) {
            Some(generation) => {
                slot.generation = generation;
                self.free.push(pid.slot());
            }
            None => log::debug!("process slot {} retired", pid.slot()),
        }
        self.live -= 1;
        Some(process)
    }
}

// ============================================================================
// Process Manager
// ============================================================================

/// Process and thread manager
pub struct ProcessManager<M: MemoryManager> {
    mem: Arc<M>,
    table: Mutex<ProcessTable>,
    run_queues: RunQueues,
    max_cpus: usize,
    max_processes: usize,
    max_threads: usize,
    time_slice: u32,
    kernel_stack_pages: usize,
    user_stack_pages: usize,
}

impl<M: MemoryManager> ProcessManager<M> {
    /// Create an empty manager allocating through `mem`
    pub fn new(config: &KernelConfig, mem: Arc<M>) -> Self {
        Self {
            mem,
            table: Mutex::new(ProcessTable {
                slots: Vec::new(),
                free: Vec::new(),
                live: 0,
                threads: BTreeMap::new(),
                next_tid: 1,
            }),
            run_queues: RunQueues::new(config.max_cpus),
            max_cpus: config.max_cpus,
            max_processes: config.max_processes,
            max_threads: config.max_threads_per_process,
            time_slice: config.time_slice_ticks,
            kernel_stack_pages: config.kernel_stack_pages,
            user_stack_pages: config.user_stack_pages,
        }
    }

    pub fn memory(&self) -> &Arc<M> {
        &self.mem
    }

    // ---- processes ----

    /// Create a process with a fresh address space
    pub fn create_process(&self, name: &str, entry_point: usize, priority: Priority) -> KernelResult<Pid> {
        self.insert_process(None, name, entry_point, priority)
    }

    /// Create a process recording `parent` as its parent
    pub fn create_child_process(
        &self,
        parent: Pid,
        name: &str,
        entry_point: usize,
        priority: Priority,
    ) -> KernelResult<Pid> {
        self.insert_process(Some(parent), name, entry_point, priority)
    }

    fn insert_process(
        &self,
        parent_pid: Option<Pid>,
        name: &str,
        entry_point: usize,
        priority: Priority,
    ) -> KernelResult<Pid> {
        let mut table = self.table.lock();

        if let Some(parent) = parent_pid {
            if table.get(parent).is_none() {
                return Err(KernelError::NotFound);
            }
        }
        if table.live >= self.max_processes {
            log::warn!("process table full ({} entries)", self.max_processes);
            return Err(KernelError::OutOfResources);
        }

        let address_space = self.mem.create_address_space().map_err(|_| {
            log::warn!("no address space for process '{}'", name);
            KernelError::OutOfResources
        })?;

        let Some(pid) = table.allocate() else {
            log::warn!("no process slot left for '{}'", name);
            self.mem.destroy_address_space(address_space);
            return Err(KernelError::OutOfResources);
        };
        table.slots[pid.slot()].process = Some(Process {
            pid,
            parent_pid,
            name: truncate_name(name),
            priority,
            entry_point,
            address_space: Some(address_space),
            threads: VecDeque::new(),
            cpu_time: 0,
        });
        table.live += 1;

        log::debug!("created process {} '{}' priority {}", pid, name, priority);
        Ok(pid)
    }

    /// Destroy a process and every thread it owns
    ///
    /// Fails with `InvalidState` while any of its threads is running.
    /// Returns the tids of the destroyed threads in list order.
    pub fn destroy_process(&self, pid: Pid) -> KernelResult<Vec<Tid>> {
        let mut table = self.table.lock();

        let process = table.get(pid).ok_or(KernelError::NotFound)?;
        if process.threads.iter().any(|t| t.state() == ThreadState::Running) {
            return Err(KernelError::InvalidState);
        }

        let mut process = table.release(pid).ok_or(KernelError::NotFound)?;
        let mut tids = Vec::with_capacity(process.threads.len());
        for thread in process.threads.drain(..) {
            table.threads.remove(&thread.tid());
            self.run_queues.remove(thread.tid());
            self.retire_thread(&thread);
            tids.push(thread.tid());
        }
        if let Some(space) = process.address_space.take() {
            self.mem.destroy_address_space(space);
        }

        log::debug!("destroyed process {} ({} threads)", pid, tids.len());
        Ok(tids)
    }

    pub fn get_process(&self, pid: Pid) -> Option<ProcessInfo> {
        self.table.lock().get(pid).map(Process::info)
    }

    pub fn process_count(&self) -> usize {
        self.table.lock().live
    }

    /// Pids of all live processes in slot order
    pub fn pids(&self) -> Vec<Pid> {
        self.table
            .lock()
            .slots
            .iter()
            .filter_map(|s| s.process.as_ref().map(|p| p.pid))
            .collect()
    }

    /// Add `ticks` to the process's CPU time
    pub fn charge_cpu_time(&self, pid: Pid, ticks: u64) -> KernelResult<()> {
        let mut table = self.table.lock();
        let process = table.get_mut(pid).ok_or(KernelError::NotFound)?;
        process.cpu_time += ticks;
        Ok(())
    }

    // ---- threads ----

    /// Create a thread in `pid` with freshly allocated stacks
    ///
    /// Either the thread is fully created or nothing is allocated.
    pub fn create_thread(&self, pid: Pid, entry_point: usize, arg: usize) -> KernelResult<Arc<Thread>> {
        let mut table = self.table.lock();

        let process = table.get(pid).ok_or(KernelError::NotFound)?;
        if process.threads.len() >= self.max_threads {
            log::warn!("process {} reached {} threads", pid, self.max_threads);
            return Err(KernelError::OutOfResources);
        }
        let priority = process.priority;

        let kernel = self
            .mem
            .alloc_pages(self.kernel_stack_pages)
            .map_err(|_| KernelError::OutOfResources)?;
        let user = match self.mem.alloc_pages(self.user_stack_pages) {
            Ok(user) => user,
            Err(_) => {
                self.mem.free(kernel);
                log::warn!("user stack allocation failed for process {}", pid);
                return Err(KernelError::OutOfResources);
            }
        };

        let tid = Tid(table.next_tid);
        table.next_tid += 1;

        let thread = Arc::new(Thread::new(
            tid,
            pid,
            priority,
            entry_point,
            arg,
            self.time_slice,
            ThreadStacks { kernel, user },
        ));

        table.threads.insert(tid, pid);
        // Checked above
        if let Some(process) = table.get_mut(pid) {
            process.threads.push_front(thread.clone());
        }

        log::debug!("created thread {} in process {}", tid, pid);
        Ok(thread)
    }

    /// Destroy a single thread
    pub fn destroy_thread(&self, tid: Tid) -> KernelResult<()> {
        let mut table = self.table.lock();

        let pid = table.threads.remove(&tid).ok_or(KernelError::NotFound)?;
        let process = table.get_mut(pid).ok_or(KernelError::NotFound)?;
        let index = process
            .threads
            .iter()
            .position(|t| t.tid() == tid)
            .ok_or(KernelError::NotFound)?;
        let thread = process.threads.remove(index).ok_or(KernelError::NotFound)?;

        self.run_queues.remove(tid);
        self.retire_thread(&thread);

        log::debug!("destroyed thread {} of process {}", tid, pid);
        Ok(())
    }

    /// Mark a thread terminated and give its stacks back
    fn retire_thread(&self, thread: &Thread) {
        thread.set_state(ThreadState::Terminated);
        if let Some(stacks) = thread.take_stacks() {
            self.mem.free(stacks.kernel);
            self.mem.free(stacks.user);
        }
    }

    pub fn get_thread(&self, tid: Tid) -> Option<Arc<Thread>> {
        self.table.lock().find_thread(tid).cloned()
    }

    /// Threads of `pid`, most recently created first
    pub fn thread_ids(&self, pid: Pid) -> KernelResult<Vec<Tid>> {
        let table = self.table.lock();
        let process = table.get(pid).ok_or(KernelError::NotFound)?;
        Ok(process.threads.iter().map(|t| t.tid()).collect())
    }

    /// Live threads across all processes
    pub fn thread_count(&self) -> usize {
        self.table.lock().threads.len()
    }

    pub fn set_priority(&self, tid: Tid, priority: Priority) -> KernelResult<()> {
        let table = self.table.lock();
        let thread = table.find_thread(tid).ok_or(KernelError::NotFound)?;
        thread.set_priority(priority);
        Ok(())
    }

    pub fn set_cpu_affinity(&self, tid: Tid, mask: u64) -> KernelResult<()> {
        let table = self.table.lock();
        let thread = table.find_thread(tid).ok_or(KernelError::NotFound)?;
        thread.set_cpu_affinity(mask);
        Ok(())
    }

    // ---- run queues ----

    /// Make a thread ready and push it onto its affinity CPU's queue
    ///
    /// Returns the CPU chosen.
    pub fn schedule_thread(&self, thread: &Arc<Thread>) -> KernelResult<usize> {
        let table = self.table.lock();
        if table.find_thread(thread.tid()).is_none() {
            return Err(KernelError::NotFound);
        }
        if !thread.state().is_runnable() {
            return Err(KernelError::InvalidState);
        }

        let cpu = thread.target_cpu(self.max_cpus);
        thread.set_state(ThreadState::Ready);
        thread.set_cpu(cpu);
        self.run_queues.push_front(cpu, thread.clone())?;

        log::trace!("thread {} queued on cpu {}", thread.tid(), cpu);
        Ok(cpu)
    }

    /// Pop the most recently queued thread on `cpu`
    pub fn get_next_runnable(&self, cpu: usize) -> KernelResult<Option<Arc<Thread>>> {
        self.run_queues.pop_front(cpu)
    }

    /// Drop `tid` from the run queues without changing its state
    pub fn remove_from_run_queue(&self, tid: Tid) -> bool {
        self.run_queues.remove(tid)
    }

    pub fn run_queue_len(&self, cpu: usize) -> KernelResult<usize> {
        self.run_queues.len(cpu)
    }

    /// Queued tids on `cpu`, head first
    pub fn run_queue(&self, cpu: usize) -> KernelResult<Vec<Tid>> {
        self.run_queues.snapshot(cpu)
    }

    // ---- blocking ----

    /// Park a ready or running thread until [`ProcessManager::wake_thread`]
    pub fn block_thread(&self, tid: Tid) -> KernelResult<()> {
        let table = self.table.lock();
        let thread = table.find_thread(tid).ok_or(KernelError::NotFound)?;
        match thread.state() {
            ThreadState::Ready | ThreadState::Running => {
                thread.set_state(ThreadState::Blocked);
                self.run_queues.remove(tid);
                log::trace!("thread {} blocked", tid);
                Ok(())
            }
            _ => Err(KernelError::InvalidState),
        }
    }

    /// Make a blocked thread ready again, returning the CPU it was queued on
    pub fn wake_thread(&self, tid: Tid) -> KernelResult<usize> {
        let thread = {
            let table = self.table.lock();
            table.find_thread(tid).ok_or(KernelError::NotFound)?.clone()
        };
        if !thread.transition(ThreadState::Blocked, ThreadState::Ready) {
            return Err(KernelError::InvalidState);
        }
        self.schedule_thread(&thread)
    }

    /// Mark a thread terminated; its resources stay until it is destroyed
    pub fn exit_thread(&self, tid: Tid) -> KernelResult<()> {
        let table = self.table.lock();
        let thread = table.find_thread(tid).ok_or(KernelError::NotFound)?;
        thread.set_state(ThreadState::Terminated);
        self.run_queues.remove(tid);
        log::debug!("thread {} exited", tid);
        Ok(())
    }
}
