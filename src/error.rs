//! Kernel-wide error handling.
//!
//! Errors are values; nothing in the core unwinds. Each subsystem
//! returns [`KernelError`] (or an `Option` where the contract calls for
//! it) and the caller decides whether the condition is recovered
//! locally, surfaced to an upper layer, or fatal to the subsystem.

use core::fmt;

/// Every failure the core can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Allocation pressure not resolvable under the caller's flags.
    OutOfMemory,
    /// Misaligned address, out-of-range order, malformed command.
    InvalidArgument,
    /// Namespace id unused, VMA not found, device id unknown.
    NotFound,
    /// A new VMA would intersect an existing one.
    Overlap,
    /// Fault outside any VMA or against its protections.
    Segfault,
    /// NVMe queue cannot accept another command.
    QueueFull,
    /// A command or bring-up step exceeded its deadline.
    Timeout,
    /// NVMe status code + type, preserved verbatim from the controller.
    DeviceError { code: u16 },
    /// CSTS.CFS was observed; the controller is gone.
    ControllerDead,
    /// No driver matched, or probe returned an error.
    BindFailure,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory => write!(f, "out of memory"),
            KernelError::InvalidArgument => write!(f, "invalid argument"),
            KernelError::NotFound => write!(f, "not found"),
            KernelError::Overlap => write!(f, "region overlap"),
            KernelError::Segfault => write!(f, "segmentation fault"),
            KernelError::QueueFull => write!(f, "queue full"),
            KernelError::Timeout => write!(f, "timed out"),
            KernelError::DeviceError { code } => write!(f, "device error (status {:#05x})", code),
            KernelError::ControllerDead => write!(f, "controller fatal status"),
            KernelError::BindFailure => write!(f, "driver bind failure"),
        }
    }
}

/// Shorthand used across the core.
pub type KernelResult<T> = Result<T, KernelError>;
