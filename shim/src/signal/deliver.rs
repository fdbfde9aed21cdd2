//! The delivery scheduler: one core shared by the upcall tail, the
//! syscall-return path, and the sigreturn chain path.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use log::{debug, warn};

use crate::pal::PalContext;
use crate::signal::dispose::Disposition;
use crate::signal::frame::{sigframe_of_ucontext, UContext};
use crate::signal::queue::try_box;
use crate::signal::thread::{ShimThread, FLAG_MAY_DELIVER_SIGNAL};
use crate::signal::types::{Siginfo, NUM_KNOWN_SIGS, SIGCHLD, SI_USER};
use crate::signal::SignalManager;

/// One signal picked for delivery, with its resolved disposition.
struct Deliverable {
    sig: i32,
    record: Box<Siginfo>,
    disposition: Disposition,
}

impl SignalManager {
    /// Scheduler core: pick the lowest-numbered unmasked pending signal
    /// and resolve it. Ignored signals drain their whole queue and the
    /// scan continues; an empty pending count ends it early.
    ///
    /// `only` restricts the scan to one signal number (used by the upcall
    /// tail, which has just queued that signal).
    fn get_signal_to_deliver(&self, thread: &ShimThread, only: Option<i32>) -> Option<Deliverable> {
        if thread.has_signal() == 0 {
            return None;
        }

        let (begin, end) = match only {
            Some(sig) => (sig, sig + 1),
            None => (1, NUM_KNOWN_SIGS + 1),
        };

        for sig in begin..end {
            if thread.sig_mask().contains(sig) {
                continue;
            }
            let Some(record) = thread.fetch_signal(sig) else {
                continue;
            };

            match self.get_sighandler(thread, sig) {
                Disposition::Ignore => {
                    // Queued only because it was masked at send time (or
                    // ignored since): drop it and everything behind it.
                    drop(record);
                    while let Some(stale) = thread.fetch_signal(sig) {
                        drop(stale);
                    }
                    if thread.has_signal() == 0 {
                        return None;
                    }
                }
                disposition => {
                    return Some(Deliverable { sig, record, disposition });
                }
            }
        }
        None
    }

    /// Entry A: tail of an upcall, `ctx` is the interrupted context. When
    /// the context is not guest code (or absent), only the may-deliver
    /// flag is set and delivery defers to the syscall-return path.
    pub(crate) fn handle_signal_on_upcall(
        &self,
        thread: &Arc<ShimThread>,
        sig: i32,
        ctx: Option<&mut PalContext>,
    ) {
        let ctx = match ctx {
            Some(ctx) if !self.context_is_internal(ctx) && !self.context_is_pal(ctx) => ctx,
            _ => {
                thread.tcb.set_flag(FLAG_MAY_DELIVER_SIGNAL);
                return;
            }
        };

        let only = if sig != 0 { Some(sig) } else { None };
        let Some(deliverable) = self.get_signal_to_deliver(thread, only) else {
            return;
        };

        match deliverable.disposition {
            Disposition::Internal(kind) => {
                self.internal_kill(thread, deliverable.sig, &deliverable.record, kind);
            }
            Disposition::User { handler, restorer } => {
                debug!("{} handled", crate::signal::types::signal_name(deliverable.sig));
                // SAFETY: ctx is a guest context, so its stack pointer
                // (or the configured alternate stack) is guest stack
                // memory; the PAL resumes from the rewritten context.
                unsafe {
                    self.setup_sigframe(
                        thread,
                        deliverable.sig,
                        &deliverable.record,
                        ctx,
                        handler,
                        restorer,
                    );
                }
            }
            Disposition::Ignore => unreachable!("scheduler core filters ignored signals"),
        }
    }

    /// Mark pending work for the dispatch loop without a usable context.
    pub fn handle_signal(&self) {
        let Some(thread) = self.pal.current_thread() else {
            return;
        };
        if thread.has_signal() == 0 {
            return;
        }
        let depth = thread.tcb.disable_preempt();
        if depth > 1 {
            debug!("signal delayed (preempt depth {})", depth);
        } else {
            self.handle_signal_on_upcall(&thread, 0, None);
        }
        thread.tcb.enable_preempt();
    }

    /// The may-deliver handshake at syscall return: clear, test, re-set.
    /// A producer racing with the clear re-sets the flag itself, so a
    /// deliverable signal is never missed; a spurious flag only costs one
    /// no-op pass through [`Self::deliver_signal_on_sysret`].
    pub fn handle_sysret_signal(&self) {
        let Some(thread) = self.pal.current_thread() else {
            return;
        };
        thread.tcb.clear_flag(FLAG_MAY_DELIVER_SIGNAL);
        if thread.has_signal() > 0 {
            thread.tcb.set_flag(FLAG_MAY_DELIVER_SIGNAL);
        }
    }

    /// Entry B: about to return from a syscall to the app. Delivers one
    /// pending signal against the stub's saved register block; the
    /// completed syscall's return value is preserved in the frame so the
    /// handler observes it. Returns the value to place in RAX.
    ///
    /// Note: syscalls that swap the mask across a blocking wait
    /// (sigsuspend, pselect, ppoll, sigwaitinfo) restore the user mask
    /// before reaching this point, so a signal that was deliverable only
    /// during the wait can be missed here.
    pub fn deliver_signal_on_sysret(&self, syscall_ret: u64) -> u64 {
        let Some(thread) = self.pal.current_thread() else {
            return syscall_ret;
        };
        thread.tcb.clear_flag(FLAG_MAY_DELIVER_SIGNAL);

        let Some(deliverable) = self.get_signal_to_deliver(&thread, None) else {
            return syscall_ret;
        };

        match deliverable.disposition {
            Disposition::Internal(kind) => {
                self.internal_kill(&thread, deliverable.sig, &deliverable.record, kind);
                syscall_ret
            }
            Disposition::User { handler, restorer } => {
                let regs_ptr = thread.tcb.saved_regs.load(Ordering::Acquire);
                debug_assert!(!regs_ptr.is_null());
                if regs_ptr.is_null() {
                    warn!(
                        "no saved register block at sysret (TID = {}); dropping signal {}",
                        thread.tid, deliverable.sig
                    );
                    return syscall_ret;
                }
                // SAFETY: the stub published this block for the current
                // syscall and the thread is still inside the stub.
                unsafe {
                    self.setup_sigframe_on_sysret(
                        &thread,
                        deliverable.sig,
                        &deliverable.record,
                        &mut *regs_ptr,
                        syscall_ret,
                        handler,
                        restorer,
                    );
                }
                if thread.has_signal() > 0 {
                    thread.tcb.set_flag(FLAG_MAY_DELIVER_SIGNAL);
                }
                // The handler entry convention wants RAX = 0.
                0
            }
            Disposition::Ignore => unreachable!("scheduler core filters ignored signals"),
        }
    }

    /// Entry C: called from sigreturn with the unwound user ucontext. If
    /// another signal is pending, chain into its handler without
    /// returning to the app, reusing the existing sigframe storage and
    /// rewriting only the restorer, the handler entry, and the argument
    /// registers. Returns true when a chained delivery was set up.
    ///
    /// # Safety
    ///
    /// `user_uc` must be the ucontext of a frame this core built on the
    /// current thread's stack, and the thread must be inside the
    /// sigreturn syscall (saved register block published).
    pub unsafe fn handle_next_signal(&self, user_uc: *mut UContext) -> bool {
        let Some(thread) = self.pal.current_thread() else {
            return false;
        };
        let Some(deliverable) = self.get_signal_to_deliver(&thread, None) else {
            return false;
        };

        match deliverable.disposition {
            Disposition::Internal(kind) => {
                self.internal_kill(&thread, deliverable.sig, &deliverable.record, kind);
                true
            }
            Disposition::User { handler, restorer } => {
                let frame = sigframe_of_ucontext(user_uc);
                let regs_ptr = thread.tcb.saved_regs.load(Ordering::Acquire);
                debug_assert!(!regs_ptr.is_null());
                if regs_ptr.is_null() {
                    return false;
                }
                // SAFETY: per the function contract, frame is this core's
                // own sigframe and regs is the stub's live block.
                unsafe {
                    (*frame).restorer = restorer;
                    let regs = &mut *regs_ptr;
                    regs.rsp = frame as u64;
                    regs.rip = handler;
                    regs.rdi = deliverable.sig as u64;
                    regs.rsi = &(*frame).info as *const Siginfo as u64;
                    regs.rdx = user_uc as u64;
                }
                true
            }
            Disposition::Ignore => unreachable!("scheduler core filters ignored signals"),
        }
    }

    /// Drain every queue at thread exit. Only internal terminate
    /// dispositions still run (the thread is leaving; user handlers make
    /// no sense); everything else is freed. At most one terminate
    /// disposition fires: production process hooks do not return from it,
    /// and re-entering the kill path from the thread that already won the
    /// termination gate would spin forever.
    pub fn handle_exit_signal(&self) {
        let Some(thread) = self.pal.current_thread() else {
            return;
        };
        while thread.has_signal() > 0 {
            for sig in 1..=NUM_KNOWN_SIGS {
                while let Some(record) = thread.fetch_signal(sig) {
                    if !thread.sig_mask().contains(sig) {
                        if let Disposition::Internal(kind) = self.get_sighandler(&thread, sig) {
                            self.internal_kill(&thread, sig, &record, kind);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Cross-thread send: queue `info` on `thread` and optionally wake it
    /// so a blocked syscall returns. Unmasked-and-ignored signals are
    /// discarded outright (SIGCHLD even when masked) so they cannot leak
    /// queue slots.
    pub fn append_signal(
        &self,
        thread: &Arc<ShimThread>,
        sig: i32,
        info: Option<Siginfo>,
        need_interrupt: bool,
    ) {
        let mut need_interrupt = need_interrupt;
        let mut handles = thread.handles_lock().lock();

        if let Disposition::Ignore = self.resolve_disposition_locked(&mut handles, sig) {
            if !thread.sig_mask().contains(sig) || sig == SIGCHLD {
                return;
            }
            // Masked and ignored: keep the record (the disposition may
            // change before unmasking) but do not interrupt the target.
            need_interrupt = false;
        }

        let info = info.unwrap_or_else(|| Siginfo::new(sig, SI_USER));
        let Some(record) = try_box(info) else {
            return;
        };

        match thread.queue_signal(sig, record) {
            Ok(()) => {
                if need_interrupt {
                    debug!("resuming thread {}", thread.tid);
                    self.process.wake(thread);
                    self.pal.thread_resume(thread.pal_handle);
                }
            }
            Err(rejected) => {
                warn!("signal queue is full (TID = {}, SIG = {})", thread.tid, sig);
                drop(rejected);
            }
        }
    }
}
