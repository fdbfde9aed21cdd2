//! Translation of PAL exception upcalls into queued signals.
//!
//! Every handler runs on the thread that raised the event, with the PAL's
//! saved context as an in/out parameter, and finishes by handing the event
//! back to the PAL. Faults whose interrupted IP lies inside library-OS or
//! PAL text are bugs, not guest signals; they are reported and the thread
//! parks.

use alloc::sync::Arc;

use log::{debug, error};

use crate::arch::x86_64::SYSCALL_OPCODE;
use crate::pal::{PalContext, PalEventHandle};
use crate::signal::queue::try_box;
use crate::signal::sysentry::emulate_syscall_return;
use crate::signal::thread::ShimThread;
use crate::signal::types::{
    Siginfo, BUS_ADRERR, FPE_INTDIV, ILL_ILLOPC, SEGV_ACCERR, SEGV_MAPERR, SIGBUS, SIGFPE, SIGILL,
    SIGINT, SIGSEGV, SIGTERM, SI_USER,
};
use crate::signal::SignalManager;
use crate::vma::VmaFlags;

impl SignalManager {
    pub(crate) fn context_is_pal(&self, ctx: &PalContext) -> bool {
        self.pal.pal_text_range().contains(&ctx.rip)
    }

    pub(crate) fn context_is_internal(&self, ctx: &PalContext) -> bool {
        self.config.libos_text.contains(&ctx.rip)
    }

    fn current_thread(&self) -> Option<Arc<ShimThread>> {
        self.pal.current_thread()
    }

    /// True when the event did not occur in guest execution: internal
    /// helper thread, library-OS text, or PAL text.
    fn event_is_internal(&self, ctx: &PalContext) -> bool {
        let internal_tid = self.current_thread().map(|t| t.is_internal).unwrap_or(true);
        internal_tid || self.context_is_internal(ctx) || self.context_is_pal(ctx)
    }

    /// Report a hardware fault that hit the library OS itself, then park.
    fn internal_fault(&self, what: &str, addr: u64, ctx: &PalContext) {
        let tid = self.current_thread().map(|t| t.tid).unwrap_or(0);
        if self.context_is_internal(ctx) {
            error!(
                "{} at {:#010x} (IP = +{:#x}, TID = {})",
                what,
                addr,
                ctx.rip - self.config.libos_text.start,
                tid
            );
        } else {
            error!("{} at {:#010x} (IP = {:#010x}, TID = {})", what, addr, ctx.rip, tid);
        }
        self.process.fatal_pause();
    }

    /// Queue a signal for the current thread and, when the preemption
    /// depth permits, deliver it right away against `ctx`.
    pub(crate) fn deliver_signal(&self, info: Siginfo, ctx: Option<&mut PalContext>) {
        let Some(thread) = self.current_thread() else {
            // Nothing to deliver to before the first guest thread starts
            // or after the last one died.
            return;
        };
        if !thread.is_alive() {
            return;
        }

        let sig = info.si_signo;
        let Some(record) = try_box(info) else {
            // Allocation failure on an asynchronous path: drop silently.
            return;
        };

        let depth = thread.tcb.disable_preempt();
        if let Err(rejected) = thread.queue_signal(sig, record) {
            log::warn!("signal queue is full (TID = {}, SIG = {})", thread.tid, sig);
            drop(rejected);
        }
        if depth <= 1 {
            self.handle_signal_on_upcall(&thread, sig, ctx);
        }
        thread.tcb.enable_preempt();
    }

    // -- upcalls -------------------------------------------------------------

    pub fn arithmetic_error_upcall(&self, handle: PalEventHandle, arg: u64, ctx: &mut PalContext) {
        if self.event_is_internal(ctx) {
            self.internal_fault("Internal arithmetic fault", arg, ctx);
        } else {
            debug!("arithmetic fault at {:#010x}", ctx.rip);
            self.deliver_signal(
                Siginfo::new(SIGFPE, FPE_INTDIV).with_addr(arg),
                Some(ctx),
            );
        }
        self.pal.exception_return(handle);
    }

    pub fn memfault_upcall(&self, handle: PalEventHandle, arg: u64, ctx: &mut PalContext) {
        // An active memory probe owns faults inside its range: flag it and
        // resume at the recovery address instead of raising a signal.
        if let Some(thread) = self.current_thread() {
            let range = &thread.tcb.test_range;
            if range.covers(arg) {
                range.has_fault.store(true, core::sync::atomic::Ordering::SeqCst);
                ctx.rip = range.cont_addr.load(core::sync::atomic::Ordering::SeqCst);
                self.pal.exception_return(handle);
                return;
            }
        }

        if self.event_is_internal(ctx) {
            self.internal_fault("Internal memory fault", arg, ctx);
            self.pal.exception_return(handle);
            return;
        }

        debug!("memory fault at {:#010x} (IP = {:#010x})", arg, ctx.rip);

        let (signo, code) = if arg == 0 {
            (SIGSEGV, SEGV_MAPERR)
        } else {
            match self.vma.lookup(arg) {
                None => (SIGSEGV, SEGV_MAPERR),
                Some(vma) => {
                    if vma.flags.contains(VmaFlags::INTERNAL) {
                        self.internal_fault("Internal memory fault with VMA", arg, ctx);
                        self.pal.exception_return(handle);
                        return;
                    }
                    if vma.file.is_some() {
                        if arg > vma.file_end_projection() {
                            // The mapping is fine but the file no longer
                            // backs this page.
                            (SIGBUS, BUS_ADRERR)
                        } else if ctx.err & 4 != 0 && !vma.flags.contains(VmaFlags::WRITE) {
                            (SIGSEGV, SEGV_ACCERR)
                        } else {
                            (SIGBUS, BUS_ADRERR)
                        }
                    } else {
                        (SIGSEGV, SEGV_ACCERR)
                    }
                }
            }
        };

        self.deliver_signal(Siginfo::new(signo, code).with_addr(arg), Some(ctx));
        self.pal.exception_return(handle);
    }

    pub fn illegal_upcall(&self, handle: PalEventHandle, arg: u64, ctx: &mut PalContext) {
        let guest_vma = self
            .vma
            .lookup(arg)
            .map(|vma| !vma.flags.contains(VmaFlags::INTERNAL))
            .unwrap_or(false);

        if self.event_is_internal(ctx) || !guest_vma {
            self.internal_fault("Internal illegal fault", arg, ctx);
            self.pal.exception_return(handle);
            return;
        }

        debug!("illegal instruction at {:#010x}", ctx.rip);

        if self.emulate_syscall_instruction(ctx) {
            self.pal.exception_return(handle);
            return;
        }

        self.deliver_signal(Siginfo::new(SIGILL, ILL_ILLOPC).with_addr(arg), Some(ctx));
        self.pal.exception_return(handle);
    }

    /// Recognize a prohibited host `syscall` instruction at (or just
    /// before) the faulting IP and rewrite the context to enter the
    /// syscall trampoline instead, mirroring what the instruction itself
    /// would have done to RCX and R11.
    fn emulate_syscall_instruction(&self, ctx: &mut PalContext) -> bool {
        let wrapper = self.config.stub_windows.syscall_wrapper;
        if wrapper == 0 {
            return false;
        }
        let rip = ctx.rip;

        if self.config.enable_sigsys_emulation && self.pal.host_type() == "Linux" {
            // Seccomp hosts report the fault with the IP after the
            // instruction.
            // SAFETY: rip lies in a guest VMA (checked by the caller);
            // the two bytes before it are readable guest text.
            let before = unsafe { core::ptr::read((rip - 2) as *const [u8; 2]) };
            if before == SYSCALL_OPCODE {
                ctx.rcx = rip;
                ctx.r11 = ctx.efl;
                ctx.rip = wrapper;
                return true;
            }
        }

        // SGX-style hosts fault on the instruction itself.
        // SAFETY: rip lies in a guest VMA; two bytes at it are readable.
        let at = unsafe { core::ptr::read(rip as *const [u8; 2]) };
        if at == SYSCALL_OPCODE {
            ctx.rcx = rip + 2;
            ctx.r11 = ctx.efl;
            ctx.rip = wrapper;
            return true;
        }
        false
    }

    pub fn quit_upcall(&self, handle: PalEventHandle, _arg: u64, ctx: &mut PalContext) {
        self.emulate_stub_windows(ctx);
        if !self.current_is_internal() {
            self.deliver_signal(Siginfo::new(SIGTERM, SI_USER).with_pid(0), Some(ctx));
        }
        self.pal.exception_return(handle);
    }

    pub fn suspend_upcall(&self, handle: PalEventHandle, _arg: u64, ctx: &mut PalContext) {
        self.emulate_stub_windows(ctx);
        if !self.current_is_internal() {
            self.deliver_signal(Siginfo::new(SIGINT, SI_USER).with_pid(0), Some(ctx));
        }
        self.pal.exception_return(handle);
    }

    pub fn resume_upcall(&self, handle: PalEventHandle, _arg: u64, ctx: &mut PalContext) {
        let Some(thread) = self.current_thread() else {
            return;
        };
        self.emulate_stub_windows(ctx);
        if !thread.is_internal {
            let depth = thread.tcb.disable_preempt();
            if depth <= 1 {
                self.handle_signal_on_upcall(&thread, 0, Some(ctx));
            }
            thread.tcb.enable_preempt();
        }
        self.pal.exception_return(handle);
    }

    fn current_is_internal(&self) -> bool {
        self.current_thread().map(|t| t.is_internal).unwrap_or(true)
    }

    fn emulate_stub_windows(&self, ctx: &mut PalContext) {
        if let Some(thread) = self.current_thread() {
            // SAFETY: the stub windows and the saved-regs protocol are the
            // ones registered at init; inside those windows the context
            // satisfies the emulation contract.
            unsafe { emulate_syscall_return(&self.config.stub_windows, &thread.tcb, ctx) };
        }
    }
}
