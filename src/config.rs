//! Kernel configuration
//!
//! Tunables for the process manager, scheduler and dispatcher. Defaults are
//! the reference constants from [`crate::types`]; a boot command line can
//! override them before the kernel is constructed.

use log::LevelFilter;

use crate::error::{KernelError, KernelResult};
use crate::types::*;

/// Boot-time tunables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of CPUs with a run queue
    pub max_cpus: usize,
    /// Process table capacity
    pub max_processes: usize,
    /// Thread limit per process
    pub max_threads_per_process: usize,
    /// IRQ descriptor table size
    pub max_irq_handlers: usize,
    /// Time slice handed to a thread, in ticks
    pub time_slice_ticks: u32,
    /// Kernel stack size in pages
    pub kernel_stack_pages: usize,
    /// User stack size in pages
    pub user_stack_pages: usize,
    /// Weight contributed by each Fair entity
    pub fair_weight: u64,
    /// Load classification band around the average
    pub balance_threshold: u32,
    /// Line the periodic timer is wired to
    pub timer_irq: u32,
    /// Console log level
    pub log_level: LevelFilter,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_cpus: MAX_CPUS,
            max_processes: MAX_PROCESSES,
            max_threads_per_process: MAX_THREADS_PER_PROCESS,
            max_irq_handlers: MAX_IRQ_HANDLERS,
            time_slice_ticks: TIME_QUANTUM_TICKS,
            kernel_stack_pages: KERNEL_STACK_PAGES,
            user_stack_pages: USER_STACK_PAGES,
            fair_weight: FAIR_WEIGHT,
            balance_threshold: BALANCE_THRESHOLD,
            timer_irq: TIMER_IRQ,
            log_level: LevelFilter::Info,
        }
    }
}

impl KernelConfig {
    /// Maximum number of scheduling entities
    pub fn max_entities(&self) -> usize {
        self.max_processes * self.max_threads_per_process
    }

    /// Check every tunable against the limits of the fixed-size tables
    pub fn validate(&self) -> KernelResult<()> {
        let in_range = |v: usize, max: usize| v >= 1 && v <= max;

        if !in_range(self.max_cpus, MAX_CPUS)
            || !in_range(self.max_processes, MAX_PROCESSES)
            || !in_range(self.max_threads_per_process, MAX_THREADS_PER_PROCESS)
            || !in_range(self.max_irq_handlers, MAX_IRQ_HANDLERS)
        {
            return Err(KernelError::InvalidArgument);
        }
        if self.time_slice_ticks == 0
            || self.kernel_stack_pages == 0
            || self.user_stack_pages == 0
            || self.fair_weight == 0
        {
            return Err(KernelError::InvalidArgument);
        }
        if self.timer_irq as usize >= self.max_irq_handlers {
            return Err(KernelError::InvalidArgument);
        }
        Ok(())
    }

    /// Apply `key=value` overrides from a boot command line
    ///
    /// Tokens are separated by whitespace. Tokens without `=` and unknown
    /// keys are skipped; a known key with an unparsable value fails the whole
    /// call and leaves `self` untouched.
    ///
    /// Recognized keys: `cpus`, `pmgr.max_processes`, `pmgr.max_threads`,
    /// `pmgr.kstack_pages`, `pmgr.ustack_pages`, `sched.quantum`,
    /// `sched.fair_weight`, `sched.balance_threshold`, `irq.max`,
    /// `irq.timer`, `loglevel`.
    pub fn apply_cmdline(&mut self, cmdline: &str) -> KernelResult<()> {
        let mut next = self.clone();

        for token in cmdline.split_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            match key {
                "cpus" => next.max_cpus = parse(value)?,
                "pmgr.max_processes" => next.max_processes = parse(value)?,
                "pmgr.max_threads" => next.max_threads_per_process = parse(value)?,
                "pmgr.kstack_pages" => next.kernel_stack_pages = parse(value)?,
                "pmgr.ustack_pages" => next.user_stack_pages = parse(value)?,
                "sched.quantum" => next.time_slice_ticks = parse(value)?,
                "sched.fair_weight" => next.fair_weight = parse(value)?,
                "sched.balance_threshold" => next.balance_threshold = parse(value)?,
                "irq.max" => next.max_irq_handlers = parse(value)?,
                "irq.timer" => next.timer_irq = parse(value)?,
                "loglevel" => next.log_level = parse(value)?,
                _ => log::warn!("cmdline: ignoring unknown parameter '{}'", key),
            }
        }

        *self = next;
        Ok(())
    }

    /// Build a validated configuration from a command line
    pub fn from_cmdline(cmdline: &str) -> KernelResult<Self> {
        let mut config = Self::default();
        config.apply_cmdline(cmdline)?;
        config.validate()?;
        Ok(config)
    }
}

fn parse<T: core::str::FromStr>(value: &str) -> KernelResult<T> {
    value.parse().map_err(|_| KernelError::InvalidArgument)
}
