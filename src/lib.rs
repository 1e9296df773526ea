//! Aegis kernel core
//!
//! This crate provides the process/thread manager, the multi-class CPU
//! scheduler and the interrupt/event dispatcher of the Aegis kernel.
//! Architecture register switching and page allocation are supplied by the
//! embedding kernel through the [`arch::Arch`] and [`memory::MemoryManager`]
//! traits.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
// Kernel-appropriate clippy configuration
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]

extern crate alloc;

// Core types
pub mod config;
pub mod error;
pub mod types;

// Collaborators
pub mod arch;
pub mod memory;

// Subsystems
pub mod console;
pub mod interrupt;
pub mod kern;
pub mod kernel;
pub mod scheduler;

pub use config::KernelConfig;
pub use error::{KernelError, KernelResult};
pub use kernel::{Dispatch, Kernel};
pub use types::{Pid, Tid};

/// Kernel version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Kernel name
pub const NAME: &str = "Aegis";
