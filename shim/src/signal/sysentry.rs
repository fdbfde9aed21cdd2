//! Cooperation with the syscall entry/exit assembly stubs.
//!
//! The stubs save the guest register block on the thread control block
//! before entering library-OS code and publish a handful of label
//! addresses at init. When an asynchronous upcall interrupts one of two
//! well-known windows (the register-restore epilogue or the final
//! sigpending check), the interrupted context is still a library-OS
//! context, but the syscall is semantically complete. The emulation below
//! rewrites such a context into the equivalent "already returned to app"
//! state so signal delivery can proceed as if the syscall had finished.

use core::sync::atomic::Ordering;

use crate::pal::PalContext;
use crate::signal::thread::ShimTcb;

/// Guest register block the syscall stub saves on entry. Field order
/// mirrors the stub's push sequence; the layout is locked by a test.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ShimRegs {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rflags: u64,
    pub rip: u64,
    pub rsp: u64,
}

/// Label addresses published by the syscall stubs. Zero means the label is
/// not present (e.g. in builds without the assembly dispatcher).
#[derive(Debug, Clone, Copy, Default)]
pub struct StubWindows {
    /// First instruction of the register-restore epilogue.
    pub return_begin: u64,
    /// The final indirect jump back to the app, fed from `tmp_rip`.
    pub return_before_jmp: u64,
    /// One past the epilogue.
    pub return_end: u64,
    /// Begin/end of the tight sigpending-check loop.
    pub sigpending_begin: u64,
    pub sigpending_end: u64,
    /// Entry trampoline for emulated `syscall` instructions.
    pub syscall_wrapper: u64,
}

impl StubWindows {
    fn in_return_window(&self, rip: u64) -> bool {
        self.return_begin != 0 && self.return_begin <= rip && rip <= self.return_end
    }

    fn in_sigpending_window(&self, rip: u64) -> bool {
        self.sigpending_begin != 0 && self.sigpending_begin <= rip && rip <= self.sigpending_end
    }
}

/// Rewrite `ctx` to the "back in app" state when its RIP lies inside one
/// of the stub windows; otherwise leave it untouched.
///
/// # Safety
///
/// When RIP is inside the sigpending window, `ctx.rsp` must point at the
/// stub's live stack (the faked `ret` loads the return address from it).
/// The saved-regs pointer, when consumed, must be the block the stub
/// published for the current syscall.
pub unsafe fn emulate_syscall_return(windows: &StubWindows, tcb: &ShimTcb, ctx: &mut PalContext) {
    let rip = ctx.rip;

    if windows.return_before_jmp != 0 && rip == windows.return_before_jmp {
        // The epilogue already restored everything except the final jump
        // through tmp_rip; take the jump here.
        debug_assert!(tcb.saved_regs.load(Ordering::Acquire).is_null());
        ctx.rip = tcb.tmp_rip.load(Ordering::Acquire);
    } else if windows.in_return_window(rip) {
        // Mid-epilogue: the saved block is still authoritative. Consume it
        // first so later code cannot restore it twice.
        let regs_ptr = tcb
            .saved_regs
            .swap(core::ptr::null_mut(), Ordering::AcqRel);
        debug_assert!(!regs_ptr.is_null());
        if regs_ptr.is_null() {
            return;
        }
        // SAFETY: the stub published a valid block for this syscall and
        // the swap above gave us exclusive use of it.
        let regs = unsafe { &*regs_ptr };
        ctx.r15 = regs.r15;
        ctx.r14 = regs.r14;
        ctx.r13 = regs.r13;
        ctx.r12 = regs.r12;
        ctx.r11 = regs.r11;
        ctx.r10 = regs.r10;
        ctx.r9 = regs.r9;
        ctx.r8 = regs.r8;
        ctx.rcx = regs.rcx;
        ctx.rdx = regs.rdx;
        ctx.rsi = regs.rsi;
        ctx.rdi = regs.rdi;
        ctx.rbx = regs.rbx;
        ctx.rbp = regs.rbp;
        ctx.efl = regs.rflags;
        ctx.rsp = regs.rsp;
        ctx.rip = regs.rip;
    } else if windows.in_sigpending_window(rip) {
        // Fake the trailing `ret`: the pending check is skipped because
        // the caller is about to deliver the signal anyway.
        // SAFETY: per the function contract, rsp points at the stub stack
        // and its top slot holds the return address.
        unsafe {
            let rsp = ctx.rsp as *const u64;
            ctx.rip = core::ptr::read(rsp);
            ctx.rsp += 8;
        }
    }
}
