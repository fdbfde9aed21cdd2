//! Signal-frame construction on the guest stack.
//!
//! The frame is the kernel-style `rt_sigframe`: the restorer pointer at
//! the stack top (so the handler's `ret` enters the libc trampoline),
//! then the `ucontext`, the `siginfo`, and above it all the extended FPU
//! area. The frame is built bottom-up so every self-pointer (the
//! mcontext's FPU pointer, the argument registers) is known when written.

use core::mem::{offset_of, size_of};

use bitflags::bitflags;
use log::debug;

use crate::arch::x86_64::xstate::{
    xstate_reset, xstate_save, FpState, XregsState, FPU_LAYOUT, XSTATE_ALIGN,
};
use crate::arch::x86_64::{pack_csgsfs, RED_ZONE_SIZE, USER_CS, USER_SS};
use crate::pal::context::{PalContext, NGREG, REG_CR2, REG_CSGSFS, REG_EFL, REG_ERR, REG_OLDMASK,
    REG_R10, REG_R11, REG_R12, REG_R13, REG_R14, REG_R15, REG_R8, REG_R9, REG_RAX, REG_RBP,
    REG_RBX, REG_RCX, REG_RDI, REG_RDX, REG_RIP, REG_RSI, REG_RSP, REG_TRAPNO};
use crate::signal::sysentry::ShimRegs;
use crate::signal::thread::ShimThread;
use crate::signal::types::{SigSet, Siginfo, StackT};
use crate::signal::SignalManager;

bitflags! {
    /// `uc_flags` bits the host kernel understands.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UcFlags: u64 {
        /// Extended state present behind the fxsave image.
        const FP_XSTATE = 0x1;
        /// The SS slot in CSGSFS is valid.
        const SIGCONTEXT_SS = 0x2;
        /// sigreturn must restore SS strictly.
        const STRICT_RESTORE_SS = 0x4;
    }
}

/// Machine context inside the ucontext; `gregs` uses the gregset order of
/// [`crate::pal::context`].
#[repr(C)]
#[derive(Clone, Copy)]
pub struct MContext {
    pub gregs: [u64; NGREG],
    pub fpregs: *mut FpState,
    pub reserved: [u64; 8],
}

/// The ucontext delivered to handlers.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct UContext {
    pub uc_flags: u64,
    pub uc_link: *mut UContext,
    pub uc_stack: StackT,
    pub uc_mcontext: MContext,
    pub uc_sigmask: SigSet,
}

/// The on-stack signal frame, consumed by `sigreturn`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Sigframe {
    /// Trampoline address the handler returns into.
    pub restorer: u64,
    pub uc: UContext,
    pub info: Siginfo,
}

/// Offset of the ucontext inside the frame; the stack math keeps the
/// ucontext 16-byte aligned, which places `restorer` at "8 mod 16" as if
/// the handler had just been entered by a `call`.
pub const SIGFRAME_UC_OFFSET: usize = offset_of!(Sigframe, uc);

/// Recover the enclosing frame from the ucontext pointer handed to a
/// handler (the `container_of` step used by the sigreturn chain path).
pub fn sigframe_of_ucontext(uc: *mut UContext) -> *mut Sigframe {
    (uc as usize - SIGFRAME_UC_OFFSET) as *mut Sigframe
}

impl SignalManager {
    /// Choose the stack for a frame and lay out the extended FPU area and
    /// the frame below it. Returns the frame and FPU area addresses.
    pub(crate) fn get_signal_stack(
        &self,
        thread: &ShimThread,
        current_sp: u64,
        xstate_size: u32,
    ) -> (*mut Sigframe, *mut XregsState) {
        let ss = thread.signal_altstack();
        let sp = if ss.is_disabled() || ss.contains(current_sp) {
            // Already on the alternate stack, or no alternate stack:
            // stay on the current one, below the red zone.
            current_sp - RED_ZONE_SIZE
        } else {
            ss.ss_sp + ss.ss_size
        };

        let xstate_addr = ::x86_64::align_down(sp - xstate_size as u64, XSTATE_ALIGN);

        let tail = (size_of::<Sigframe>() - SIGFRAME_UC_OFFSET) as u64;
        let uc_addr = ::x86_64::align_down(xstate_addr - tail, 16);
        let frame_addr = uc_addr - SIGFRAME_UC_OFFSET as u64;

        (frame_addr as *mut Sigframe, xstate_addr as *mut XregsState)
    }

    /// Build a frame from an interrupted PAL context and rewrite the
    /// context to enter `handler` (upcall-path delivery).
    ///
    /// # Safety
    ///
    /// `ctx.rsp` (or the thread's alternate stack) must point at writable
    /// guest stack memory with room for the frame; `ctx.fpregs`, when
    /// non-nil, must point at a readable save area.
    pub(crate) unsafe fn setup_sigframe(
        &self,
        thread: &ShimThread,
        sig: i32,
        info: &Siginfo,
        ctx: &mut PalContext,
        handler: u64,
        restorer: u64,
    ) {
        let xstate = ctx.fpregs;
        let xstate_size = unsafe { crate::arch::x86_64::xstate::xstate_size_get(xstate) };

        let (frame, user_xstate) = self.get_signal_stack(thread, ctx.rsp, xstate_size);

        // SAFETY: frame and user_xstate lie in the guest stack region the
        // caller vouched for.
        unsafe {
            (*frame).restorer = restorer;
            let uc = &mut (*frame).uc;
            let mut flags = UcFlags::SIGCONTEXT_SS | UcFlags::STRICT_RESTORE_SS;
            uc.uc_link = core::ptr::null_mut();
            uc.uc_stack = thread.signal_altstack();

            // The PAL context leads with the register file in gregset
            // order; copy it bitwise.
            core::ptr::copy_nonoverlapping(ctx.gregs(), uc.uc_mcontext.gregs.as_mut_ptr(), NGREG);
            uc.uc_mcontext.reserved = [0; 8];

            (*frame).info = *info;

            if xstate_size > 0 {
                uc.uc_mcontext.fpregs = &mut (*user_xstate).fpstate;
                core::ptr::copy_nonoverlapping(
                    xstate as *const u8,
                    user_xstate as *mut u8,
                    xstate_size as usize,
                );
                if FPU_LAYOUT.xstate_enabled {
                    flags |= UcFlags::FP_XSTATE;
                }
            } else {
                uc.uc_mcontext.fpregs = core::ptr::null_mut();
            }

            // Delivered mask stays empty for now; capturing the user mask
            // needs a peek at the queue front before the fetch commits.
            uc.uc_sigmask = SigSet::EMPTY;
            uc.uc_flags = flags.bits();

            // Enter the handler: System V argument registers, frame as
            // the new stack, FPU state now owned by the user frame.
            ctx.fpregs = core::ptr::null_mut();
            ctx.rsp = frame as u64;
            ctx.rip = handler;
            ctx.rdi = sig as u64;
            ctx.rsi = &(*frame).info as *const Siginfo as u64;
            ctx.rdx = uc as *mut UContext as u64;
            ctx.rax = 0;
        }

        debug!(
            "delivering signal {} to handler {:#x}, sigframe {:p}",
            sig, handler, frame
        );
    }

    /// Build a frame from the syscall stub's saved register block and
    /// rewrite the block to enter `handler` (sysret-path delivery). The
    /// completed syscall's return value lands in the saved RAX so the
    /// handler sees it in the ucontext.
    ///
    /// # Safety
    ///
    /// `regs.rsp` (or the alternate stack) must point at writable guest
    /// stack memory with room for the frame and the live FPU save area.
    pub(crate) unsafe fn setup_sigframe_on_sysret(
        &self,
        thread: &ShimThread,
        sig: i32,
        info: &Siginfo,
        regs: &mut ShimRegs,
        syscall_ret: u64,
        handler: u64,
        restorer: u64,
    ) {
        let layout = *FPU_LAYOUT;
        let (frame, user_xstate) = self.get_signal_stack(thread, regs.rsp, layout.save_area_size());

        // SAFETY: frame and user_xstate lie in the guest stack region the
        // caller vouched for.
        unsafe {
            (*frame).restorer = restorer;
            let uc = &mut (*frame).uc;
            let mut flags = UcFlags::SIGCONTEXT_SS | UcFlags::STRICT_RESTORE_SS;
            uc.uc_link = core::ptr::null_mut();
            uc.uc_stack = thread.signal_altstack();

            let gregs = &mut uc.uc_mcontext.gregs;
            gregs[REG_R8] = regs.r8;
            gregs[REG_R9] = regs.r9;
            gregs[REG_R10] = regs.r10;
            gregs[REG_R11] = regs.r11;
            gregs[REG_R12] = regs.r12;
            gregs[REG_R13] = regs.r13;
            gregs[REG_R14] = regs.r14;
            gregs[REG_R15] = regs.r15;
            gregs[REG_RDI] = regs.rdi;
            gregs[REG_RSI] = regs.rsi;
            gregs[REG_RBP] = regs.rbp;
            gregs[REG_RBX] = regs.rbx;
            gregs[REG_RDX] = regs.rdx;
            gregs[REG_RAX] = syscall_ret;
            gregs[REG_RCX] = regs.rcx;
            gregs[REG_RSP] = regs.rsp;
            gregs[REG_RIP] = regs.rip;
            gregs[REG_EFL] = regs.rflags;
            gregs[REG_CSGSFS] = pack_csgsfs(USER_CS, 0, 0, USER_SS);
            gregs[REG_ERR] = info.si_errno as u64;
            gregs[REG_TRAPNO] = info.si_code as u64;
            gregs[REG_OLDMASK] = 0;
            gregs[REG_CR2] = info.si_addr;
            uc.uc_mcontext.reserved = [0; 8];

            (*frame).info = *info;

            // The interrupted FPU state was never spilled by the syscall
            // path; capture it live into the frame, then hand the handler
            // a clean FPU.
            uc.uc_mcontext.fpregs = &mut (*user_xstate).fpstate;
            xstate_save(user_xstate);
            if layout.xstate_enabled {
                flags |= UcFlags::FP_XSTATE;
            }

            uc.uc_sigmask = SigSet::EMPTY;
            uc.uc_flags = flags.bits();

            xstate_reset();
            regs.rsp = frame as u64;
            regs.rip = handler;
            regs.rdi = sig as u64;
            regs.rsi = &(*frame).info as *const Siginfo as u64;
            regs.rdx = uc as *mut UContext as u64;
        }

        debug!(
            "delivering signal {} on sysret to handler {:#x}, sigframe {:p}",
            sig, handler, frame
        );
    }
}
