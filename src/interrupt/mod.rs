//! Interrupt and event dispatch
//!
//! A fixed table maps IRQ lines to handlers. Hardware trap entry calls
//! [`IrqDispatcher::dispatch_irq`]; handlers run synchronously and may post
//! [`Event`]s for deferred processing. No operation here blocks: contended
//! sections are short and spin-locked, and the table lock is released
//! before a handler runs so handlers may re-enter the dispatcher.

pub mod event;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult};
use crate::kern::counters::KernelCounters;
use crate::kern::timer::Jiffies;
use crate::types::DevId;

pub use event::{Event, EventData, EventHandler, EventKind, EventQueue};

/// Interrupt handler: receives the line number and the registered cookie
pub type IrqHandler = Arc<dyn Fn(u32, Option<DevId>) + Send + Sync>;

/// Interrupt trigger mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptTrigger {
    /// Level-sensitive interrupt
    Level,
    /// Edge-triggered interrupt
    Edge,
}

/// Table entry for one IRQ line
#[derive(Clone)]
struct IrqDescriptor {
    handler: Option<IrqHandler>,
    dev_id: Option<DevId>,
    trigger: InterruptTrigger,
    enabled: bool,
    affinity: u64,
}

impl IrqDescriptor {
    const fn empty() -> Self {
        Self {
            handler: None,
            dev_id: None,
            trigger: InterruptTrigger::Level,
            enabled: true,
            affinity: u64::MAX,
        }
    }
}

/// Public view of an IRQ line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqInfo {
    pub irq: u32,
    pub registered: bool,
    pub dev_id: Option<DevId>,
    pub trigger: InterruptTrigger,
    pub enabled: bool,
    pub affinity: u64,
}

/// Delivery statistics for one IRQ line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IrqStat {
    pub irq: u32,
    /// Successful dispatches
    pub count: u64,
    /// Jiffies at the last successful dispatch
    pub last_handled: u64,
}

#[derive(Default)]
struct IrqCounters {
    count: AtomicU64,
    last_handled: AtomicU64,
}

/// IRQ table plus the deferred event queue
pub struct IrqDispatcher {
    table: Mutex<Vec<IrqDescriptor>>,
    stats: Vec<IrqCounters>,
    events: EventQueue,
    clock: Arc<Jiffies>,
    counters: Arc<KernelCounters>,
}

impl IrqDispatcher {
    pub fn new(config: &KernelConfig, clock: Arc<Jiffies>, counters: Arc<KernelCounters>) -> Self {
        let lines = config.max_irq_handlers;
        let mut stats = Vec::with_capacity(lines);
        stats.resize_with(lines, IrqCounters::default);

        Self {
            table: Mutex::new(alloc::vec![IrqDescriptor::empty(); lines]),
            stats,
            events: EventQueue::new(),
            clock,
            counters,
        }
    }

    /// Number of IRQ lines
    pub fn lines(&self) -> usize {
        self.stats.len()
    }

    fn index(&self, irq: u32) -> KernelResult<usize> {
        let index = irq as usize;
        if index < self.stats.len() {
            Ok(index)
        } else {
            Err(KernelError::InvalidArgument)
        }
    }

    // ========================================================================
    // IRQ table
    // ========================================================================

    /// Install `handler` on `irq`, replacing any previous registration
    pub fn register_irq(
        &self,
        irq: u32,
        handler: impl Fn(u32, Option<DevId>) + Send + Sync + 'static,
        dev_id: Option<DevId>,
        trigger: InterruptTrigger,
    ) -> KernelResult<()> {
        let index = self.index(irq)?;
        let mut table = self.table.lock();
        let desc = &mut table[index];
        if desc.handler.is_some() {
            log::debug!("irq {}: replacing existing handler", irq);
        }
        desc.handler = Some(Arc::new(handler));
        desc.dev_id = dev_id;
        desc.trigger = trigger;
        log::debug!("irq {}: registered ({:?})", irq, trigger);
        Ok(())
    }

    /// Remove the handler of `irq`; nothing happens if none is installed
    pub fn unregister_irq(&self, irq: u32) -> KernelResult<()> {
        let index = self.index(irq)?;
        let mut table = self.table.lock();
        let desc = &mut table[index];
        desc.handler = None;
        desc.dev_id = None;
        Ok(())
    }

    pub fn enable_irq(&self, irq: u32) -> KernelResult<()> {
        let index = self.index(irq)?;
        self.table.lock()[index].enabled = true;
        Ok(())
    }

    /// Mask `irq`; dispatches fail with `InvalidState` until it is enabled
    pub fn disable_irq(&self, irq: u32) -> KernelResult<()> {
        let index = self.index(irq)?;
        self.table.lock()[index].enabled = false;
        Ok(())
    }

    /// Record the CPUs `irq` should be routed to
    ///
    /// Routing is programmed by the interrupt controller driver; the mask is
    /// stored for it to read back.
    pub fn set_irq_affinity(&self, irq: u32, mask: u64) -> KernelResult<()> {
        let index = self.index(irq)?;
        self.table.lock()[index].affinity = mask;
        Ok(())
    }

    pub fn irq_info(&self, irq: u32) -> KernelResult<IrqInfo> {
        let index = self.index(irq)?;
        let table = self.table.lock();
        let desc = &table[index];
        Ok(IrqInfo {
            irq,
            registered: desc.handler.is_some(),
            dev_id: desc.dev_id,
            trigger: desc.trigger,
            enabled: desc.enabled,
            affinity: desc.affinity,
        })
    }

    /// Run the handler of `irq` and update its statistics
    pub fn dispatch_irq(&self, irq: u32) -> KernelResult<()> {
        let index = self.index(irq)?;

        let (handler, dev_id) = {
            let table = self.table.lock();
            let desc = &table[index];
            let Some(handler) = desc.handler.clone() else {
                drop(table);
                self.counters.irqs_unhandled.inc();
                log::warn!("irq {}: no handler", irq);
                return Err(KernelError::NotFound);
            };
            if !desc.enabled {
                drop(table);
                self.counters.irqs_unhandled.inc();
                log::trace!("irq {}: masked", irq);
                return Err(KernelError::InvalidState);
            }
            (handler, desc.dev_id)
        };

        handler(irq, dev_id);

        let stat = &self.stats[index];
        stat.count.fetch_add(1, Ordering::Relaxed);
        stat.last_handled.store(self.clock.now(), Ordering::Relaxed);
        self.counters.irqs_dispatched.inc();
        Ok(())
    }

    pub fn irq_stat(&self, irq: u32) -> KernelResult<IrqStat> {
        let index = self.index(irq)?;
        let stat = &self.stats[index];
        Ok(IrqStat {
            irq,
            count: stat.count.load(Ordering::Relaxed),
            last_handled: stat.last_handled.load(Ordering::Relaxed),
        })
    }

    /// Dispatch count of `irq`, 0 for lines outside the table
    pub fn irq_count(&self, irq: u32) -> u64 {
        self.irq_stat(irq).map_or(0, |s| s.count)
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Queue `event` for deferred handling
    pub fn post_event(&self, event: Arc<Event>) -> KernelResult<()> {
        match self.events.post(event) {
            Ok(()) => {
                self.counters.events_posted.inc();
                Ok(())
            }
            Err(e) => {
                self.counters.events_rejected.inc();
                log::warn!("event queue full, dropping event");
                Err(e)
            }
        }
    }

    /// Take the oldest pending event
    pub fn get_event(&self) -> Option<Arc<Event>> {
        self.events.pop()
    }

    /// Handle pending events until the queue is found empty
    ///
    /// Events posted by a handler during the drain are handled in the same
    /// pass. Returns the number of events taken off the queue.
    pub fn process_events(&self) -> usize {
        let mut drained = 0;
        while let Some(event) = self.get_event() {
            event.handle();
            drained += 1;
        }
        self.counters.events_drained.add(drained as u64);
        drained
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }
}
