//! Kernel context
//!
//! [`Kernel`] ties the process manager, the scheduler and the interrupt
//! dispatcher to the memory and architecture collaborators. Every operation
//! that touches more than one subsystem goes through here, so the PMGR run
//! queues and the scheduler's entity list never drift apart:
//!
//! - the entity list is authoritative for what runs next
//! - the PMGR run queues are the per-CPU view of ready threads, and their
//!   lengths are reported to the scheduler as CPU load

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::arch::{Arch, Context};
use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult};
use crate::interrupt::{InterruptTrigger, IrqDispatcher};
use crate::kern::counters::KernelCounters;
use crate::kern::process::ProcessManager;
use crate::kern::thread::{Thread, ThreadState};
use crate::kern::timer::Jiffies;
use crate::memory::MemoryManager;
use crate::scheduler::{LoadReport, SchedClass, SchedEntity, Scheduler};
use crate::types::{Pid, Priority, Tid};

/// Outcome of a scheduling decision on one CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Nothing is runnable; the CPU was handed to [`Arch::idle`]
    Idle,
    /// The current thread keeps the CPU
    Continue(Tid),
    /// The CPU switched threads
    Switched { from: Option<Tid>, to: Tid },
}

/// The kernel core
pub struct Kernel<M: MemoryManager, A: Arch> {
    config: KernelConfig,
    pmgr: ProcessManager<M>,
    sched: Scheduler,
    irq: IrqDispatcher,
    arch: A,
    /// Thread dispatched on each CPU
    current: Vec<Mutex<Option<Arc<Thread>>>>,
    /// Context saved while a CPU idles
    idle_contexts: Vec<Mutex<Context>>,
    counters: Arc<KernelCounters>,
    clock: Arc<Jiffies>,
}

impl<M: MemoryManager, A: Arch> Kernel<M, A> {
    /// Build a kernel from a validated configuration
    pub fn new(config: KernelConfig, mem: Arc<M>, arch: A) -> KernelResult<Arc<Self>> {
        config.validate()?;

        let counters = Arc::new(KernelCounters::new());
        let clock = Arc::new(Jiffies::new());

        let mut current = Vec::with_capacity(config.max_cpus);
        current.resize_with(config.max_cpus, || Mutex::new(None));
        let mut idle_contexts = Vec::with_capacity(config.max_cpus);
        idle_contexts.resize_with(config.max_cpus, || Mutex::new(Context::new()));

        log::info!(
            "aegis: {} cpus, {} processes x {} threads, quantum {} ticks",
            config.max_cpus,
            config.max_processes,
            config.max_threads_per_process,
            config.time_slice_ticks
        );

        Ok(Arc::new(Self {
            pmgr: ProcessManager::new(&config, mem),
            sched: Scheduler::new(&config),
            irq: IrqDispatcher::new(&config, clock.clone(), counters.clone()),
            arch,
            current,
            idle_contexts,
            counters,
            clock,
            config,
        }))
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn pmgr(&self) -> &ProcessManager<M> {
        &self.pmgr
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    pub fn irq(&self) -> &IrqDispatcher {
        &self.irq
    }

    pub fn arch(&self) -> &A {
        &self.arch
    }

    pub fn counters(&self) -> &KernelCounters {
        &self.counters
    }

    /// Jiffies since boot
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    fn check_cpu(&self, cpu: usize) -> KernelResult<()> {
        if cpu < self.current.len() {
            Ok(())
        } else {
            Err(KernelError::InvalidArgument)
        }
    }

    /// Thread dispatched on `cpu`
    pub fn current_thread(&self, cpu: usize) -> Option<Arc<Thread>> {
        self.current.get(cpu)?.lock().clone()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Create a process with one initial thread, ready to run
    pub fn spawn_process(
        &self,
        name: &str,
        entry_point: usize,
        priority: Priority,
        class: SchedClass,
    ) -> KernelResult<(Pid, Tid)> {
        let pid = self.pmgr.create_process(name, entry_point, priority)?;
        match self.spawn_thread(pid, entry_point, 0, class) {
            Ok(tid) => Ok((pid, tid)),
            Err(e) => {
                let _ = self.pmgr.destroy_process(pid);
                Err(e)
            }
        }
    }

    /// Create a thread in `pid`, give it a scheduling entity and queue it
    ///
    /// Nothing is left behind when any step fails.
    pub fn spawn_thread(&self, pid: Pid, entry_point: usize, arg: usize, class: SchedClass) -> KernelResult<Tid> {
        let thread = self.pmgr.create_thread(pid, entry_point, arg)?;
        let tid = thread.tid();

        thread.with_stacks(|stacks| {
            let mut ctx = thread.context().lock();
            self.arch.setup_initial_stack(&mut ctx, &stacks.user, entry_point, arg);
        });

        let mut entity = SchedEntity::new(&thread, class);
        if class == SchedClass::Fair {
            entity.fair.vruntime = self.sched.fair_floor();
        }
        if let Err(e) = self.sched.enqueue(entity) {
            let _ = self.pmgr.destroy_thread(tid);
            return Err(e);
        }

        match self.pmgr.schedule_thread(&thread) {
            Ok(cpu) => self.refresh_load(cpu),
            Err(e) => {
                let _ = self.sched.dequeue(tid);
                let _ = self.pmgr.destroy_thread(tid);
                return Err(e);
            }
        }

        log::debug!("spawned thread {} in process {} as {:?}", tid, pid, class);
        Ok(tid)
    }

    /// Destroy a thread, wherever it is
    ///
    /// A thread held by a CPU is taken off it; the CPU picks a new thread at
    /// its next scheduling point.
    pub fn kill_thread(&self, tid: Tid) -> KernelResult<()> {
        let thread = self.pmgr.get_thread(tid).ok_or(KernelError::NotFound)?;

        let _ = self.sched.dequeue(tid);
        self.detach(&thread);
        self.pmgr.destroy_thread(tid)?;
        self.refresh_load(thread.cpu());
        Ok(())
    }

    /// Destroy a process; fails with `InvalidState` while a thread runs
    pub fn kill_process(&self, pid: Pid) -> KernelResult<()> {
        let threads: Vec<Arc<Thread>> = self
            .pmgr
            .thread_ids(pid)?
            .into_iter()
            .filter_map(|tid| self.pmgr.get_thread(tid))
            .collect();

        let tids = self.pmgr.destroy_process(pid)?;
        for tid in tids {
            let _ = self.sched.dequeue(tid);
        }
        // Blocked or exited threads may still be held by the CPU they last ran on
        for thread in &threads {
            self.detach(thread);
        }
        self.refresh_all_loads();
        Ok(())
    }

    /// Drop `thread` from the CPU holding it
    fn detach(&self, thread: &Thread) {
        let Some(cpu) = thread.on_cpu() else {
            return;
        };
        if let Some(slot) = self.current.get(cpu) {
            let mut slot = slot.lock();
            if slot.as_ref().is_some_and(|t| t.tid() == thread.tid()) {
                *slot = None;
            }
        }
        thread.release_cpu(cpu);
    }

    /// Park a thread until [`Kernel::wake_thread`]
    pub fn block_thread(&self, tid: Tid) -> KernelResult<()> {
        let thread = self.pmgr.get_thread(tid).ok_or(KernelError::NotFound)?;
        self.pmgr.block_thread(tid)?;
        self.refresh_load(thread.cpu());
        Ok(())
    }

    pub fn wake_thread(&self, tid: Tid) -> KernelResult<()> {
        let cpu = self.pmgr.wake_thread(tid)?;
        self.refresh_load(cpu);
        Ok(())
    }

    /// Terminate a thread; it stops being scheduled but keeps its stacks
    /// until killed
    pub fn exit_thread(&self, tid: Tid) -> KernelResult<()> {
        self.pmgr.exit_thread(tid)?;
        let _ = self.sched.dequeue(tid);
        Ok(())
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Pick the next thread for `cpu` and switch to it
    pub fn schedule(&self, cpu: usize) -> KernelResult<Dispatch> {
        self.check_cpu(cpu)?;
        let mut slot = self.current[cpu].lock();
        let prev = slot.clone();

        if let Some(prev) = &prev {
            // The entity is gone if the thread exited
            let _ = self.sched.charge_descheduled(prev.tid());
        }

        let is_prev = |t: &Thread| prev.as_ref().is_some_and(|p| p.tid() == t.tid());
        let next = loop {
            let Some(entity) = self.sched.pick_next(cpu)? else {
                break None;
            };
            let Some(thread) = entity.thread() else {
                continue;
            };
            // Another CPU may have claimed it since the pick
            if !thread.claim_cpu(cpu) {
                continue;
            }
            if thread.transition(ThreadState::Ready, ThreadState::Running) {
                break Some(thread);
            }
            if !is_prev(&thread) {
                thread.release_cpu(cpu);
            }
        };

        let Some(next) = next else {
            return Ok(self.go_idle(cpu, &mut slot));
        };

        let now = self.clock.now();
        let _ = self.sched.record_dispatch(next.tid(), now);
        self.pmgr.remove_from_run_queue(next.tid());
        next.set_cpu(cpu);

        if is_prev(&next) {
            log::trace!("cpu {}: thread {} continues", cpu, next.tid());
            self.refresh_load(cpu);
            return Ok(Dispatch::Continue(next.tid()));
        }

        self.sched.switch_context(prev.as_deref(), &next);
        match &prev {
            Some(prev) => {
                if prev.state() == ThreadState::Ready {
                    if let Ok(target) = self.pmgr.schedule_thread(prev) {
                        self.refresh_load(target);
                    }
                }
                let mut from = prev.context().lock();
                self.arch.switch(&mut from, &next.context().lock());
                drop(from);
                prev.release_cpu(cpu);
            }
            None => {
                let mut from = self.idle_contexts[cpu].lock();
                self.arch.switch(&mut from, &next.context().lock());
            }
        }

        *slot = Some(next.clone());
        self.counters.context_switches.inc();
        self.refresh_load(cpu);

        let from = prev.map(|p| p.tid());
        log::trace!("cpu {}: switch {:?} -> {}", cpu, from, next.tid());
        Ok(Dispatch::Switched { from, to: next.tid() })
    }

    fn go_idle(&self, cpu: usize, slot: &mut Option<Arc<Thread>>) -> Dispatch {
        if let Some(prev) = slot.as_ref() {
            if prev.state() == ThreadState::Running {
                return Dispatch::Continue(prev.tid());
            }
            if prev.state() == ThreadState::Ready {
                if let Ok(target) = self.pmgr.schedule_thread(prev) {
                    self.refresh_load(target);
                }
            }
            let mut from = prev.context().lock();
            self.arch.switch(&mut from, &self.idle_contexts[cpu].lock());
            drop(from);
            prev.release_cpu(cpu);
            self.counters.context_switches.inc();
            *slot = None;
        }
        self.arch.idle(cpu);
        Dispatch::Idle
    }

    /// Timer interrupt work for `cpu`
    ///
    /// Advances the clock (boot CPU only), charges the running thread and
    /// reschedules when its slice ran out or it stopped running.
    pub fn timer_tick(&self, cpu: usize) -> KernelResult<Dispatch> {
        self.check_cpu(cpu)?;
        if cpu == 0 {
            self.clock.advance();
        }
        self.counters.ticks.inc();

        let current = self.current_thread(cpu);
        if let Some(thread) = &current {
            if thread.state() == ThreadState::Running {
                let _ = self.pmgr.charge_cpu_time(thread.pid(), 1);
            }
        }

        let expired = self.sched.tick(cpu)?;
        self.counters.preemptions.add(expired as u64);

        match current {
            Some(thread) if thread.state() == ThreadState::Running => Ok(Dispatch::Continue(thread.tid())),
            _ => {
                let outcome = self.schedule(cpu)?;
                if outcome == Dispatch::Idle {
                    self.counters.idle_ticks.inc();
                }
                Ok(outcome)
            }
        }
    }

    // ========================================================================
    // Load tracking
    // ========================================================================

    fn refresh_load(&self, cpu: usize) {
        if let Ok(len) = self.pmgr.run_queue_len(cpu) {
            let _ = self.sched.set_cpu_load(cpu, len as u64);
        }
    }

    fn refresh_all_loads(&self) {
        for cpu in 0..self.config.max_cpus {
            self.refresh_load(cpu);
        }
    }

    /// Refresh every CPU's load and classify it
    pub fn balance_load(&self) -> LoadReport {
        self.refresh_all_loads();
        self.sched.balance_load()
    }
}

impl<M: MemoryManager + 'static, A: Arch + 'static> Kernel<M, A> {
    /// Register the periodic timer handler on the configured line
    ///
    /// The handler holds a weak reference, so an installed timer does not
    /// keep the kernel alive.
    pub fn install_timer(self: &Arc<Self>) -> KernelResult<()> {
        let weak = Arc::downgrade(self);
        self.irq.register_irq(
            self.config.timer_irq,
            move |_, _| {
                if let Some(kernel) = weak.upgrade() {
                    let cpu = kernel.arch.current_cpu();
                    if let Err(e) = kernel.timer_tick(cpu) {
                        log::warn!("timer tick on cpu {} failed: {}", cpu, e);
                    }
                }
            },
            None,
            InterruptTrigger::Edge,
        )?;
        log::info!("timer installed on irq {}", self.config.timer_irq);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::SoftArch;
    use crate::memory::BumpMemory;

    fn kernel(cmdline: &str) -> Arc<Kernel<BumpMemory, SoftArch>> {
        let config = KernelConfig::from_cmdline(cmdline).unwrap();
        Kernel::new(config, Arc::new(BumpMemory::with_default_arena()), SoftArch::new()).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = KernelConfig::default();
        config.max_cpus = 0;
        let result = Kernel::new(config, Arc::new(BumpMemory::with_default_arena()), SoftArch::new());
        assert!(matches!(result, Err(KernelError::InvalidArgument)));
    }

    #[test]
    fn test_spawn_prepares_context() {
        let k = kernel("cpus=2");
        let (pid, tid) = k.spawn_process("init", 0x40_0000, 0, SchedClass::Fair).unwrap();
        let thread = k.pmgr().get_thread(tid).unwrap();

        assert_eq!(thread.pid(), pid);
        assert_eq!(thread.state(), ThreadState::Ready);
        assert_eq!(thread.context().lock().instruction_pointer(), 0x40_0000);
        let top = thread.with_stacks(|s| s.user.top() as u64).unwrap();
        assert!(thread.context().lock().stack_pointer() < top);

        assert!(k.scheduler().contains(tid));
        assert_eq!(k.pmgr().run_queue(0).unwrap(), [tid]);
        assert_eq!(k.scheduler().cpu_load(0).unwrap(), 1);
    }

    #[test]
    fn test_spawn_rolls_back_on_scheduler_full() {
        use crate::kern::thread::ThreadStacks;
        use crate::memory::PageRegion;

        let k = kernel("cpus=1 pmgr.max_processes=1 pmgr.max_threads=2");
        let (pid, _) = k.spawn_process("a", 0, 0, SchedClass::Fair).unwrap();

        // Fill the last scheduler slot with a thread the PMGR does not know
        let stray = Arc::new(Thread::new(
            Tid(999),
            pid,
            0,
            0,
            0,
            10,
            ThreadStacks {
                kernel: PageRegion { base: 0, pages: 2 },
                user: PageRegion { base: 0, pages: 4 },
            },
        ));
        k.scheduler().enqueue(SchedEntity::new(&stray, SchedClass::Fair)).unwrap();
        let live = k.pmgr().memory().stats().live_pages;

        assert_eq!(k.spawn_thread(pid, 0, 0, SchedClass::Fair), Err(KernelError::OutOfResources));
        assert_eq!(k.pmgr().thread_ids(pid).unwrap().len(), 1);
        assert_eq!(k.pmgr().memory().stats().live_pages, live);
        assert_eq!(k.pmgr().run_queue_len(0).unwrap(), 1);
    }

    #[test]
    fn test_schedule_switches_and_idles() {
        let k = kernel("cpus=1");
        assert_eq!(k.schedule(0), Ok(Dispatch::Idle));
        assert_eq!(k.arch().idle_calls(), 1);

        let (_, tid) = k.spawn_process("p", 0x1000, 0, SchedClass::Fair).unwrap();
        assert_eq!(k.schedule(0), Ok(Dispatch::Switched { from: None, to: tid }));
        assert_eq!(k.current_thread(0).unwrap().state(), ThreadState::Running);
        assert_eq!(k.pmgr().run_queue_len(0).unwrap(), 0);
        assert_eq!(k.arch().switch_count(), 1);
        assert_eq!(k.arch().switches()[0].to_ip, 0x1000);

        let se = k.scheduler().entity(tid).unwrap();
        assert_eq!(se.scheduled_count, 1);

        // Running thread keeps the CPU when nothing else is ready
        assert_eq!(k.schedule(0), Ok(Dispatch::Continue(tid)));
        assert_eq!(k.schedule(1), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_timer_rotates_fair_threads() {
        let k = kernel("cpus=1 sched.quantum=2");
        let (_, a) = k.spawn_process("a", 0, 0, SchedClass::Fair).unwrap();
        let (_, b) = k.spawn_process("b", 0, 0, SchedClass::Fair).unwrap();

        // First tick dispatches the lowest vruntime, list order breaks the tie
        assert_eq!(k.timer_tick(0), Ok(Dispatch::Switched { from: None, to: a }));
        assert_eq!(k.timer_tick(0), Ok(Dispatch::Continue(a)));
        // Slice expires: a has run 2 ticks, b has run none
        assert_eq!(k.timer_tick(0), Ok(Dispatch::Switched { from: Some(a), to: b }));
        assert_eq!(k.scheduler().entity(a).unwrap().fair.vruntime, 2);
        assert_eq!(k.pmgr().get_thread(a).unwrap().state(), ThreadState::Ready);
        assert_eq!(k.pmgr().run_queue(0).unwrap(), [a]);

        assert_eq!(k.counters().preemptions.get(), 1);
        assert_eq!(k.now(), 3);
    }

    #[test]
    fn test_timer_charges_process_cpu_time() {
        let k = kernel("cpus=1");
        let (pid, _) = k.spawn_process("p", 0, 0, SchedClass::RealTime).unwrap();
        for _ in 0..4 {
            k.timer_tick(0).unwrap();
        }
        // Dispatched on the first tick, charged on the next three
        assert_eq!(k.pmgr().get_process(pid).unwrap().cpu_time, 3);
    }

    #[test]
    fn test_realtime_preempts_on_next_decision() {
        let k = kernel("cpus=1");
        let (_, f) = k.spawn_process("fair", 0, 0, SchedClass::Fair).unwrap();
        let (_, rt) = k.spawn_process("rt", 0, 0, SchedClass::RealTime).unwrap();
        assert_eq!(k.schedule(0), Ok(Dispatch::Switched { from: None, to: rt }));
        k.exit_thread(rt).unwrap();
        assert_eq!(k.schedule(0), Ok(Dispatch::Switched { from: Some(rt), to: f }));
    }

    #[test]
    fn test_block_goes_idle_then_wakes() {
        let k = kernel("cpus=1");
        let (_, tid) = k.spawn_process("p", 0, 0, SchedClass::Fair).unwrap();
        k.schedule(0).unwrap();

        k.block_thread(tid).unwrap();
        assert_eq!(k.schedule(0), Ok(Dispatch::Idle));
        assert!(k.current_thread(0).is_none());

        k.wake_thread(tid).unwrap();
        assert_eq!(k.scheduler().cpu_load(0).unwrap(), 1);
        assert_eq!(k.schedule(0), Ok(Dispatch::Switched { from: None, to: tid }));
    }

    #[test]
    fn test_kill_running_thread_frees_cpu() {
        let k = kernel("cpus=1");
        let (pid, tid) = k.spawn_process("p", 0, 0, SchedClass::Fair).unwrap();
        k.schedule(0).unwrap();

        assert_eq!(k.kill_process(pid), Err(KernelError::InvalidState));
        k.kill_thread(tid).unwrap();
        assert!(k.current_thread(0).is_none());
        assert!(!k.scheduler().contains(tid));
        assert_eq!(k.schedule(0), Ok(Dispatch::Idle));
        k.kill_process(pid).unwrap();
        assert_eq!(k.pmgr().process_count(), 0);
    }

    #[test]
    fn test_kill_process_dequeues_entities() {
        let k = kernel("cpus=1");
        let (pid, t0) = k.spawn_process("p", 0, 0, SchedClass::Fair).unwrap();
        let t1 = k.spawn_thread(pid, 0, 0, SchedClass::RealTime).unwrap();
        assert_eq!(k.scheduler().len(), 2);

        k.kill_process(pid).unwrap();
        assert!(k.scheduler().is_empty());
        assert_eq!(k.scheduler().total_weight(), 0);
        assert!(k.pmgr().get_thread(t0).is_none());
        assert!(k.pmgr().get_thread(t1).is_none());
        assert_eq!(k.scheduler().cpu_load(0).unwrap(), 0);
    }

    #[test]
    fn test_install_timer() {
        let k = kernel("cpus=1 irq.timer=0");
        k.install_timer().unwrap();
        let (_, tid) = k.spawn_process("p", 0, 0, SchedClass::Fair).unwrap();

        for _ in 0..5 {
            k.irq().dispatch_irq(0).unwrap();
        }
        assert_eq!(k.irq().irq_count(0), 5);
        assert_eq!(k.now(), 5);
        assert_eq!(k.current_thread(0).unwrap().tid(), tid);
        assert_eq!(k.counters().ticks.get(), 5);
        assert_eq!(k.irq().irq_stat(0).unwrap().last_handled, 5);
    }

    #[test]
    fn test_balance_load_reports_queues() {
        let k = kernel("cpus=4");
        for _ in 0..8 {
            let (_, tid) = k.spawn_process("p", 0, 0, SchedClass::Fair).unwrap();
            k.pmgr().set_cpu_affinity(tid, 1).unwrap();
            let thread = k.pmgr().get_thread(tid).unwrap();
            k.pmgr().schedule_thread(&thread).unwrap();
        }
        let report = k.balance_load();
        assert_eq!(report.average, 2);
        assert_eq!(report.overloaded, [1]);
        assert!(report.underloaded.is_empty());
    }
}
