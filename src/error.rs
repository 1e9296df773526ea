//! Kernel error type
//!
//! Every fallible operation in the core returns [`KernelResult`]. Errors are
//! plain values: they carry no allocation and can cross the syscall boundary
//! through [`KernelError::code`].

use thiserror::Error;

/// Errors reported by the process manager, scheduler and dispatcher
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelError {
    /// Unknown pid, tid or entity, or an IRQ line with no handler
    #[error("object not found")]
    NotFound,

    /// Out-of-range CPU or IRQ number, or a malformed parameter
    #[error("invalid argument")]
    InvalidArgument,

    /// A table is full or the memory collaborator refused an allocation
    #[error("out of resources")]
    OutOfResources,

    /// A bounded queue is full
    #[error("resource exhausted")]
    ResourceExhausted,

    /// The object is in a state that forbids the operation
    #[error("invalid state")]
    InvalidState,
}

impl KernelError {
    /// Negative errno-style code for the syscall layer
    pub const fn code(self) -> i32 {
        match self {
            KernelError::NotFound => -2,           // ENOENT
            KernelError::InvalidArgument => -22,   // EINVAL
            KernelError::OutOfResources => -12,    // ENOMEM
            KernelError::ResourceExhausted => -11, // EAGAIN
            KernelError::InvalidState => -16,      // EBUSY
        }
    }
}

/// Result alias used throughout the kernel core
pub type KernelResult<T> = Result<T, KernelError>;
