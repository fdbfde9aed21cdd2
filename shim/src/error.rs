//! Error types for the signal core.
//!
//! Upcall paths never return errors to the PAL (they resume the guest,
//! invoke a terminate disposition, or pause on an internal fault), so the
//! error type here covers only the syscall-facing surface: sigaction,
//! sigprocmask and sigaltstack bookkeeping, and user-pointer validation.

use core::fmt;

/// Error returned by the syscall-facing signal operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "signal errors map to errno values and must be handled"]
pub enum SignalError {
    /// Signal number outside 1..=31.
    InvalidSignal { sig: i32 },
    /// Attempt to retarget or mask an unblockable signal.
    Unblockable { sig: i32 },
    /// A user-supplied argument failed validation.
    InvalidArgument { name: &'static str },
    /// The alternate signal stack cannot be changed while in use.
    AltStackInUse,
    /// A user buffer was not accessible for the requested access.
    BadAddress { addr: u64 },
}

impl SignalError {
    /// Conventional errno value for this error.
    pub fn errno(&self) -> i32 {
        match self {
            SignalError::InvalidSignal { .. } => 22,  // EINVAL
            SignalError::Unblockable { .. } => 22,    // EINVAL
            SignalError::InvalidArgument { .. } => 22, // EINVAL
            SignalError::AltStackInUse => 1,          // EPERM
            SignalError::BadAddress { .. } => 14,     // EFAULT
        }
    }
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalError::InvalidSignal { sig } => {
                write!(f, "invalid signal number {}", sig)
            }
            SignalError::Unblockable { sig } => {
                write!(f, "signal {} cannot be masked or ignored", sig)
            }
            SignalError::InvalidArgument { name } => {
                write!(f, "invalid argument: {}", name)
            }
            SignalError::AltStackInUse => {
                write!(f, "alternate signal stack is in use")
            }
            SignalError::BadAddress { addr } => {
                write!(f, "bad user address {:#x}", addr)
            }
        }
    }
}
