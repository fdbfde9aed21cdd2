//! Platform abstraction layer interface consumed by the signal core.
//!
//! The PAL surfaces hardware exceptions and host process-control events as
//! upcalls on the thread that raised them, and provides the few thread
//! primitives the core needs (resume, yield). The core registers one
//! upcall per event class at init; each upcall receives an opaque event
//! handle, a numeric argument (fault address or auxiliary datum) and the
//! saved context, mutates the context, and finishes with
//! [`Pal::exception_return`].

pub mod context;

pub use context::PalContext;

use alloc::sync::Arc;
use core::ops::Range;

use crate::signal::thread::ShimThread;

/// Event classes the core handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PalEvent {
    /// Divide error and friends.
    ArithmeticError,
    /// Page fault / protection fault. Argument is the faulting address.
    Memfault,
    /// Illegal or prohibited instruction. Argument is the faulting address.
    Illegal,
    /// Host asked the process to quit.
    Quit,
    /// Host suspend request (interactive interrupt).
    Suspend,
    /// Host resumed the thread; pending signals should be re-examined.
    Resume,
}

impl PalEvent {
    pub const COUNT: usize = 6;

    pub fn index(self) -> usize {
        match self {
            PalEvent::ArithmeticError => 0,
            PalEvent::Memfault => 1,
            PalEvent::Illegal => 2,
            PalEvent::Quit => 3,
            PalEvent::Suspend => 4,
            PalEvent::Resume => 5,
        }
    }
}

/// Opaque handle identifying an in-flight exception; passed back to the
/// PAL to resume the interrupted thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PalEventHandle(pub usize);

/// An installed exception upcall.
pub type Upcall = Arc<dyn Fn(PalEventHandle, u64, &mut PalContext) + Send + Sync>;

/// Operations the signal core consumes from the PAL.
pub trait Pal: Send + Sync {
    /// Install `upcall` for `event`, replacing any previous handler.
    fn set_exception_handler(&self, event: PalEvent, upcall: Upcall);

    /// Resume the interrupted thread from the (possibly rewritten) context
    /// associated with `handle`.
    fn exception_return(&self, handle: PalEventHandle);

    /// Wake a thread blocked in a host call.
    fn thread_resume(&self, pal_handle: u64);

    /// Yield the current host thread.
    fn thread_yield(&self);

    /// Host type string, e.g. `"Linux"` or `"Linux-SGX"`. Drives the
    /// memory-probe strategy and the seccomp emulation gate.
    fn host_type(&self) -> &str;

    /// Text range of the PAL itself; faults inside it are internal bugs.
    fn pal_text_range(&self) -> Range<u64>;

    /// Control block of the thread the current upcall or syscall runs on.
    /// Upcalls are delivered on the signaled thread, so the PAL always
    /// knows it. `None` before the guest has any thread.
    fn current_thread(&self) -> Option<Arc<ShimThread>>;
}
