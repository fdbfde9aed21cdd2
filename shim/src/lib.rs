//! Signal delivery core for a POSIX library-OS personality.
//!
//! This crate translates platform-abstraction-layer (PAL) exception upcalls
//! and cross-thread signal sends into POSIX-compatible signal delivery to
//! guest application threads, including construction of a kernel-style
//! signal frame on the guest stack so that unmodified binaries (and their
//! libc signal machinery) can `sigreturn` normally.
//!
//! The crate is `no_std` + `alloc`. The embedder provides the global
//! allocator, a [`pal::Pal`] implementation, a [`vma::VmaProvider`] for the
//! guest address-space map, and [`process::ProcessOps`] for the exit path.
//! On the host target (`cfg(not(target_os = "none"))`) the crate links
//! `std` so the standard `#[test]` harness and the system allocator are
//! available to unit tests.

#![no_std]
#![cfg_attr(target_os = "none", deny(unsafe_op_in_unsafe_fn))]

extern crate alloc;

// Host target: link std so unit tests can use threads and the system
// allocator. The library API itself stays no_std.
#[cfg(not(target_os = "none"))]
extern crate std;

pub mod arch;
pub mod error;
pub mod pal;
pub mod process;
pub mod signal;
pub mod vma;

#[cfg(test)]
mod integration_tests;
#[cfg(test)]
mod testutil;

pub use error::SignalError;
pub use signal::{init_signal, signal_manager, SignalManager, SignalManagerConfig};
