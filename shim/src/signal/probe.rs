//! User-memory probes backing syscall buffer validation.
//!
//! `test_user_memory` / `test_user_string` return true when some byte of
//! the probed range is not accessible at the moment of probing. They are
//! advisory: the buffer may be unmapped again the instant they return.
//!
//! Two strategies, picked once per process by host type:
//!
//! - hosts that do not expose the faulting address to the exception
//!   handler (SGX-style enclaves) walk the VMA map instead of touching
//!   memory;
//! - everything else touches one byte per page under an armed probe
//!   record, and the memory-fault upcall recovers by redirecting the
//!   interrupted RIP to the probe landing.

use core::sync::atomic::Ordering;

use crate::arch::x86_64::{next_page, probe as probe_asm, PAGE_SIZE};
use crate::signal::SignalManager;

const STRATEGY_UNDECIDED: u8 = 0;
const STRATEGY_BYTE_TOUCH: u8 = 1;
const STRATEGY_VMA_WALK: u8 = 2;

/// Host type whose exception handler cannot see fault addresses.
const HOST_TYPE_SGX: &str = "Linux-SGX";

/// Quick structural check: non-nil and no address-space wrap.
fn access_ok(addr: u64, size: u64) -> bool {
    addr != 0 && size != 0 && addr.checked_add(size).is_some()
}

/// Bounded string length over raw guest memory.
///
/// # Safety
///
/// `[addr, addr + max)` must be readable.
unsafe fn strnlen(addr: u64, max: u64) -> u64 {
    let mut len = 0;
    while len < max {
        // SAFETY: within the caller-guaranteed readable range.
        let byte = unsafe { core::ptr::read_volatile((addr + len) as *const u8) };
        if byte == 0 {
            break;
        }
        len += 1;
    }
    len
}

impl SignalManager {
    fn use_vma_walk(&self) -> bool {
        match self.probe_strategy.load(Ordering::Acquire) {
            STRATEGY_BYTE_TOUCH => false,
            STRATEGY_VMA_WALK => true,
            _ => {
                let walk = self.pal.host_type() == HOST_TYPE_SGX;
                let strategy = if walk { STRATEGY_VMA_WALK } else { STRATEGY_BYTE_TOUCH };
                self.probe_strategy.store(strategy, Ordering::Release);
                walk
            }
        }
    }

    /// True when some byte of `[addr, addr + size)` is not accessible for
    /// the requested direction.
    pub fn test_user_memory(&self, addr: u64, size: u64, write: bool) -> bool {
        if size == 0 {
            return false;
        }
        if !access_ok(addr, size) {
            return true;
        }

        if self.use_vma_walk() {
            return !self.vma.covers_range(addr, size);
        }

        let Some(thread) = self.pal.current_thread() else {
            return true;
        };
        thread.tcb.disable_preempt();

        // Each thread owns its probe record, so arming it is race-free.
        let range = &thread.tcb.test_range;
        debug_assert!(!range.is_active());
        let end = addr + size - 1;
        range.arm(addr, end, probe_asm::landing_addr());

        // Touch one byte per page; a fault redirects into the landing and
        // flips has_fault.
        // SAFETY: the armed record makes the fault upcall recover any
        // touch inside [addr, end].
        unsafe { probe_asm::touch_range(addr, end, PAGE_SIZE, write) };

        let has_fault = range.disarm();
        thread.tcb.enable_preempt();
        has_fault
    }

    /// True when the NUL-terminated string at `addr` is not fully
    /// readable.
    pub fn test_user_string(&self, addr: u64) -> bool {
        if !access_ok(addr, 1) {
            return true;
        }

        if self.use_vma_walk() {
            // Length is unknown; validate page by page so an unmapped
            // tail past the NUL does not fail the probe.
            let mut addr = addr;
            let mut next = next_page(addr);
            loop {
                let maxlen = next - addr;
                if !access_ok(addr, maxlen) || !self.vma.covers_range(addr, maxlen) {
                    return true;
                }
                // SAFETY: the page was just verified addressable.
                let len = unsafe { strnlen(addr, maxlen) };
                if len < maxlen {
                    return false;
                }
                addr = next;
                next = next_page(addr);
            }
        }

        let Some(thread) = self.pal.current_thread() else {
            return true;
        };
        thread.tcb.disable_preempt();

        let range = &thread.tcb.test_range;
        debug_assert!(!range.is_active());
        range.arm(addr, next_page(addr) - 1, probe_asm::landing_addr());

        let mut faulted = false;
        let mut addr = addr;
        let mut next = next_page(addr);
        loop {
            range.start.store(addr, Ordering::SeqCst);
            range.end.store(next - 1, Ordering::SeqCst);
            let maxlen = next - addr;
            if !access_ok(addr, maxlen) {
                faulted = true;
                break;
            }
            // SAFETY: recovered by the armed record on fault.
            unsafe { probe_asm::touch_byte(addr, false) };
            if range.has_fault.load(Ordering::SeqCst) {
                faulted = true;
                break;
            }
            // The page is readable; scan it for the terminator.
            // SAFETY: one byte of this page was just touched successfully
            // and the record still guards the rest.
            let len = unsafe { strnlen(addr, maxlen) };
            if len < maxlen {
                break;
            }
            addr = next;
            next = next_page(addr);
        }

        let has_fault = range.disarm() || faulted;
        thread.tcb.enable_preempt();
        has_fault
    }

    /// Syscall-facing wrapper: EFAULT-shaped error instead of a bool.
    pub fn validate_user_buffer(
        &self,
        addr: u64,
        size: u64,
        write: bool,
    ) -> Result<(), crate::error::SignalError> {
        if self.test_user_memory(addr, size, write) {
            Err(crate::error::SignalError::BadAddress { addr })
        } else {
            Ok(())
        }
    }
}
