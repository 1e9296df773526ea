//! Multi-class scheduler for Aegis
//!
//! Keeps one [`SchedEntity`] per thread in a single list ordered by
//! enqueue time. `pick_next` scans it in class order:
//!
//! 1. **RealTime**: the first ready entity in list order wins.
//! 2. **Fair**: the ready entity with the smallest `vruntime` wins, ties go
//!    to the earlier entity.
//! 3. **Deadline**: handed to the installed [`DeadlinePolicy`], which by
//!    default selects nothing.
//!
//! The timer drives [`Scheduler::tick`], which burns time slices and
//! accounts runtime for the threads running on one CPU.

pub mod entity;
pub mod policy;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult};
use crate::kern::thread::{Thread, ThreadState};
use crate::types::Tid;

pub use entity::{DeadlineParams, FairStats, SchedClass, SchedEntity};
pub use policy::{AccountingOnly, DeadlinePolicy, EarliestDeadline, LoadBalancer, LoadReport, NoMigration};

struct SchedState {
    entities: Vec<SchedEntity>,
    /// Lowest vruntime seen at enqueue, unset until the first Fair entity
    min_vruntime: Option<u64>,
    total_weight: u64,
}

impl SchedState {
    fn position(&self, tid: Tid) -> Option<usize> {
        self.entities.iter().position(|se| se.tid() == tid)
    }

    fn find_mut(&mut self, tid: Tid) -> KernelResult<&mut SchedEntity> {
        self.entities
            .iter_mut()
            .find(|se| se.tid() == tid)
            .ok_or(KernelError::NotFound)
    }
}

/// The scheduler
pub struct Scheduler {
    state: Mutex<SchedState>,
    cpu_loads: Vec<AtomicU64>,
    capacity: usize,
    quantum: u32,
    fair_weight: u64,
    balance_threshold: u64,
    balancer: Mutex<Box<dyn LoadBalancer>>,
    deadline_policy: Mutex<Box<dyn DeadlinePolicy>>,
}

impl Scheduler {
    /// Create an empty scheduler with the default policies
    pub fn new(config: &KernelConfig) -> Self {
        let mut cpu_loads = Vec::with_capacity(config.max_cpus);
        cpu_loads.resize_with(config.max_cpus, || AtomicU64::new(0));

        Self {
            state: Mutex::new(SchedState {
                entities: Vec::new(),
                min_vruntime: None,
                total_weight: 0,
            }),
            cpu_loads,
            capacity: config.max_entities(),
            quantum: config.time_slice_ticks,
            fair_weight: config.fair_weight,
            balance_threshold: u64::from(config.balance_threshold),
            balancer: Mutex::new(Box::new(NoMigration)),
            deadline_policy: Mutex::new(Box::new(AccountingOnly)),
        }
    }

    pub fn set_load_balancer(&self, balancer: Box<dyn LoadBalancer>) {
        *self.balancer.lock() = balancer;
    }

    pub fn set_deadline_policy(&self, policy: Box<dyn DeadlinePolicy>) {
        *self.deadline_policy.lock() = policy;
    }

    fn check_cpu(&self, cpu: usize) -> KernelResult<()> {
        if cpu < self.cpu_loads.len() {
            Ok(())
        } else {
            Err(KernelError::InvalidArgument)
        }
    }

    // ========================================================================
    // Entity list
    // ========================================================================

    /// Append `entity` to the list
    pub fn enqueue(&self, entity: SchedEntity) -> KernelResult<()> {
        let mut state = self.state.lock();

        if state.entities.len() >= self.capacity {
            log::warn!("scheduler full ({} entities)", self.capacity);
            return Err(KernelError::OutOfResources);
        }
        if state.position(entity.tid()).is_some() {
            return Err(KernelError::InvalidState);
        }

        if entity.class == SchedClass::Fair {
            state.total_weight += self.fair_weight;
            let v = entity.fair.vruntime;
            state.min_vruntime = Some(state.min_vruntime.map_or(v, |m| m.min(v)));
        }

        log::trace!("enqueue thread {} as {:?}", entity.tid(), entity.class);
        state.entities.push(entity);
        Ok(())
    }

    /// Remove the entity of `tid`, returning it with its accounting
    pub fn dequeue(&self, tid: Tid) -> KernelResult<SchedEntity> {
        let mut state = self.state.lock();

        let index = state.position(tid).ok_or(KernelError::NotFound)?;
        let entity = state.entities.remove(index);
        if entity.class == SchedClass::Fair {
            state.total_weight -= self.fair_weight;
        }

        log::trace!("dequeue thread {}", tid);
        Ok(entity)
    }

    /// Select the entity to run next on `cpu` without changing any state
    ///
    /// Thread affinity is not consulted; the caller decides where the
    /// chosen thread runs. Threads still held by another CPU are skipped.
    pub fn pick_next(&self, cpu: usize) -> KernelResult<Option<SchedEntity>> {
        self.check_cpu(cpu)?;
        let state = self.state.lock();

        let mut fair: Option<&SchedEntity> = None;
        let mut deadline = Vec::new();

        for se in state.entities.iter().filter(|se| se.is_ready_on(cpu)) {
            match se.class {
                SchedClass::RealTime => return Ok(Some(se.clone())),
                SchedClass::Fair => {
                    if fair.map_or(true, |best| se.fair.vruntime < best.fair.vruntime) {
                        fair = Some(se);
                    }
                }
                SchedClass::Deadline => deadline.push(se),
            }
        }

        if let Some(se) = fair {
            return Ok(Some(se.clone()));
        }
        if deadline.is_empty() {
            return Ok(None);
        }

        let choice = self.deadline_policy.lock().select(cpu, &deadline);
        Ok(choice.and_then(|i| deadline.get(i)).map(|se| (*se).clone()))
    }

    /// Account one timer tick on `cpu`
    ///
    /// Every running thread placed on `cpu` loses a tick of its slice and
    /// gains a tick of runtime; Deadline entities also burn budget. A thread
    /// whose slice runs out becomes `Ready` with a fresh slice. Returns the
    /// number of such expirations.
    pub fn tick(&self, cpu: usize) -> KernelResult<usize> {
        self.check_cpu(cpu)?;
        let mut state = self.state.lock();
        let mut expired = 0;

        for se in state.entities.iter_mut() {
            let Some(thread) = se.thread() else {
                continue;
            };
            if thread.state() != ThreadState::Running || thread.cpu() != cpu {
                continue;
            }

            se.fair.sum_exec_runtime += 1;
            if se.class == SchedClass::Deadline {
                se.deadline.runtime = se.deadline.runtime.saturating_sub(1);
            }

            if thread.consume_tick() == 0 {
                thread.set_state(ThreadState::Ready);
                thread.set_time_slice(self.quantum);
                expired += 1;
                log::trace!("thread {} slice expired on cpu {}", se.tid(), cpu);
            }
        }

        Ok(expired)
    }

    /// Change the class of `tid`, keeping its accounting
    pub fn set_class(&self, tid: Tid, class: SchedClass) -> KernelResult<()> {
        let mut state = self.state.lock();
        let se = state.find_mut(tid)?;
        let old = se.class;
        se.class = class;
        if old != SchedClass::Fair && class == SchedClass::Fair {
            // Runtime from outside the Fair class is never charged
            se.fair.prev_sum_exec_runtime = se.fair.sum_exec_runtime;
        }

        match (old == SchedClass::Fair, class == SchedClass::Fair) {
            (false, true) => state.total_weight += self.fair_weight,
            (true, false) => state.total_weight -= self.fair_weight,
            _ => {}
        }

        log::debug!("thread {} class {:?} -> {:?}", tid, old, class);
        Ok(())
    }

    pub fn set_deadline_params(&self, tid: Tid, runtime: u64, deadline: u64, period: u64) -> KernelResult<()> {
        if runtime > deadline || (period != 0 && deadline > period) {
            return Err(KernelError::InvalidArgument);
        }
        let mut state = self.state.lock();
        let se = state.find_mut(tid)?;
        se.deadline = DeadlineParams {
            runtime,
            deadline,
            period,
        };
        Ok(())
    }

    /// Fold the runtime `tid` accumulated while running into its vruntime
    ///
    /// Called when the thread is switched out. Only Fair entities are
    /// charged; returns the vruntime added.
    pub fn charge_descheduled(&self, tid: Tid) -> KernelResult<u64> {
        let mut state = self.state.lock();
        let se = state.find_mut(tid)?;
        if se.class != SchedClass::Fair {
            return Ok(0);
        }
        Ok(se.update_vruntime())
    }

    /// Record that `tid` was dispatched at `now`
    pub fn record_dispatch(&self, tid: Tid, now: u64) -> KernelResult<()> {
        let mut state = self.state.lock();
        let se = state.find_mut(tid)?;
        se.last_scheduled = now;
        se.scheduled_count += 1;
        Ok(())
    }

    // ========================================================================
    // Context switch
    // ========================================================================

    /// State transition for a switch from `prev` to `next`
    ///
    /// `prev` returns to `Ready` only if it was still running; a thread that
    /// blocked or exited keeps its state. The register switch itself is
    /// performed by the architecture backend.
    pub fn switch_context(&self, prev: Option<&Thread>, next: &Thread) {
        if let Some(prev) = prev {
            prev.transition(ThreadState::Running, ThreadState::Ready);
        }
        next.set_state(ThreadState::Running);
    }

    // ========================================================================
    // Load tracking
    // ========================================================================

    pub fn cpu_load(&self, cpu: usize) -> KernelResult<u64> {
        self.check_cpu(cpu)?;
        Ok(self.cpu_loads[cpu].load(Ordering::Relaxed))
    }

    pub fn set_cpu_load(&self, cpu: usize, load: u64) -> KernelResult<()> {
        self.check_cpu(cpu)?;
        self.cpu_loads[cpu].store(load, Ordering::Relaxed);
        Ok(())
    }

    /// Classify CPUs against the average load and hand the result to the
    /// installed [`LoadBalancer`]
    pub fn balance_load(&self) -> LoadReport {
        let loads: Vec<u64> = self
            .cpu_loads
            .iter()
            .map(|l| l.load(Ordering::Relaxed))
            .collect();
        let average = loads.iter().sum::<u64>() / loads.len().max(1) as u64;

        let mut report = LoadReport {
            average,
            ..LoadReport::default()
        };
        for (cpu, &load) in loads.iter().enumerate() {
            if load > average + self.balance_threshold {
                report.overloaded.push(cpu);
            } else if load + self.balance_threshold < average {
                report.underloaded.push(cpu);
            }
        }

        self.balancer.lock().balance(&report);
        report
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Copy of the entity for `tid`
    pub fn entity(&self, tid: Tid) -> Option<SchedEntity> {
        let state = self.state.lock();
        state.entities.iter().find(|se| se.tid() == tid).cloned()
    }

    pub fn contains(&self, tid: Tid) -> bool {
        self.state.lock().position(tid).is_some()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_weight(&self) -> u64 {
        self.state.lock().total_weight
    }

    /// Lowest vruntime any Fair entity was enqueued with, 0 before the first
    pub fn min_vruntime(&self) -> u64 {
        self.state.lock().min_vruntime.unwrap_or(0)
    }

    /// Smallest vruntime among the Fair entities currently enqueued
    ///
    /// New Fair entities start here so they neither starve nor monopolize
    /// the CPU.
    pub fn fair_floor(&self) -> u64 {
        let state = self.state.lock();
        state
            .entities
            .iter()
            .filter(|se| se.class == SchedClass::Fair)
            .map(|se| se.fair.vruntime)
            .min()
            .unwrap_or_else(|| state.min_vruntime.unwrap_or(0))
    }

    pub fn quantum(&self) -> u32 {
        self.quantum
    }
}
