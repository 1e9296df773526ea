//! Architecture collaborator for Aegis
//!
//! The kernel core never touches registers directly. Saved register state
//! lives in a per-thread [`Context`], and the embedding kernel supplies an
//! [`Arch`] implementation that performs the actual switch. [`SoftArch`] is
//! a hosted implementation that only records what it was asked to do.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

use crate::memory::PageRegion;

/// Saved CPU context - x86_64 variant
#[cfg(target_arch = "x86_64")]
#[repr(C)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    // x86_64 callee-saved registers (per System V ABI)
    pub rbx: u64,
    pub rbp: u64, // Frame pointer
    pub r12: u64, // Entry argument for a fresh thread
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rsp: u64,    // Stack pointer
    pub rip: u64,    // Instruction pointer (return address)
    pub rflags: u64, // Flags register
}

/// Saved CPU context - ARM64 variant
#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    pub x0: u64, // Entry argument for a fresh thread
    // ARM64 callee-saved registers
    pub x19: u64,
    pub x20: u64,
    pub x21: u64,
    pub x22: u64,
    pub x23: u64,
    pub x24: u64,
    pub x25: u64,
    pub x26: u64,
    pub x27: u64,
    pub x28: u64,
    pub x29: u64,    // Frame pointer
    pub x30: u64,    // Link register
    pub sp: u64,     // Stack pointer
    pub pc: u64,     // Program counter
    pub pstate: u64, // Processor state
}

/// Saved CPU context - generic fallback
#[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
#[repr(C)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    /// Generic registers, `regs[0]` carries the entry argument
    pub regs: [u64; 32],
    pub sp: u64,
    pub pc: u64,
    pub flags: u64,
}

impl Context {
    /// Create a new zeroed context
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepare a fresh thread to start at `entry` with `arg` on stack `sp`
    #[cfg(target_arch = "x86_64")]
    pub fn init_entry(&mut self, sp: u64, entry: u64, arg: u64) {
        *self = Self::default();
        self.rsp = sp;
        self.rbp = sp;
        self.rip = entry;
        self.r12 = arg;
        self.rflags = 0x202; // IF set
    }

    #[cfg(target_arch = "aarch64")]
    pub fn init_entry(&mut self, sp: u64, entry: u64, arg: u64) {
        *self = Self::default();
        self.sp = sp;
        self.x29 = sp;
        self.pc = entry;
        self.x0 = arg;
    }

    #[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
    pub fn init_entry(&mut self, sp: u64, entry: u64, arg: u64) {
        *self = Self::default();
        self.sp = sp;
        self.pc = entry;
        self.regs[0] = arg;
    }

    /// Saved stack pointer
    #[cfg(target_arch = "x86_64")]
    pub fn stack_pointer(&self) -> u64 {
        self.rsp
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub fn stack_pointer(&self) -> u64 {
        self.sp
    }

    /// Saved instruction pointer
    #[cfg(target_arch = "x86_64")]
    pub fn instruction_pointer(&self) -> u64 {
        self.rip
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub fn instruction_pointer(&self) -> u64 {
        self.pc
    }

    /// Argument a fresh thread receives
    #[cfg(target_arch = "x86_64")]
    pub fn entry_arg(&self) -> u64 {
        self.r12
    }

    #[cfg(target_arch = "aarch64")]
    pub fn entry_arg(&self) -> u64 {
        self.x0
    }

    #[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
    pub fn entry_arg(&self) -> u64 {
        self.regs[0]
    }
}

/// Architecture primitives the kernel core depends on
pub trait Arch: Send + Sync {
    /// Index of the executing CPU
    fn current_cpu(&self) -> usize;

    /// Save the running registers into `prev` and resume `next`
    fn switch(&self, prev: &mut Context, next: &Context);

    /// Initialize `context` so the thread starts at `entry(arg)` on `stack`
    fn setup_initial_stack(&self, context: &mut Context, stack: &PageRegion, entry: usize, arg: usize);

    /// Called when a CPU has nothing to run
    fn idle(&self, cpu: usize);
}

/// Stack pointer alignment required by both supported ABIs
const STACK_ALIGN: u64 = 16;

// ============================================================================
// Hosted Implementation
// ============================================================================

/// One recorded context switch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchRecord {
    /// Instruction pointer saved for the outgoing context
    pub from_ip: u64,
    /// Instruction pointer resumed
    pub to_ip: u64,
    /// Stack pointer resumed
    pub to_sp: u64,
}

/// Hosted architecture backend
///
/// Records switches and idle calls instead of touching hardware. The
/// reported CPU is whatever [`SoftArch::set_current_cpu`] last stored.
pub struct SoftArch {
    cpu: AtomicUsize,
    switches: Mutex<Vec<SwitchRecord>>,
    idle_calls: AtomicU64,
}

impl SoftArch {
    pub fn new() -> Self {
        Self {
            cpu: AtomicUsize::new(0),
            switches: Mutex::new(Vec::new()),
            idle_calls: AtomicU64::new(0),
        }
    }

    /// Pretend to execute on `cpu`
    pub fn set_current_cpu(&self, cpu: usize) {
        self.cpu.store(cpu, Ordering::Relaxed);
    }

    /// Switches performed so far, oldest first
    pub fn switches(&self) -> Vec<SwitchRecord> {
        self.switches.lock().clone()
    }

    pub fn switch_count(&self) -> usize {
        self.switches.lock().len()
    }

    pub fn idle_calls(&self) -> u64 {
        self.idle_calls.load(Ordering::Relaxed)
    }
}

impl Arch for SoftArch {
    fn current_cpu(&self) -> usize {
        self.cpu.load(Ordering::Relaxed)
    }

    fn switch(&self, prev: &mut Context, next: &Context) {
        self.switches.lock().push(SwitchRecord {
            from_ip: prev.instruction_pointer(),
            to_ip: next.instruction_pointer(),
            to_sp: next.stack_pointer(),
        });
    }

    fn setup_initial_stack(&self, context: &mut Context, stack: &PageRegion, entry: usize, arg: usize) {
        // Leave one slot for the fake return address
        let sp = (stack.top() as u64 & !(STACK_ALIGN - 1)) - 8;
        context.init_entry(sp, entry as u64, arg as u64);
    }

    fn idle(&self, _cpu: usize) {
        self.idle_calls.fetch_add(1, Ordering::Relaxed);
        core::hint::spin_loop();
    }
}
