//! Signal delivery: queues, classification, disposition, frames, and the
//! delivery scheduler.
//!
//! The pieces hang off [`SignalManager`], which owns the PAL, the VMA
//! lookup, and the process hooks. Production code builds one manager at
//! boot via [`init_signal`]; its methods are spread over the submodules by
//! concern (fault classification in [`fault`], frame construction in
//! [`frame`], scheduling in [`deliver`], and so on).

pub mod deliver;
pub mod dispose;
pub mod fault;
pub mod frame;
pub mod probe;
pub mod queue;
pub mod sysentry;
pub mod thread;
pub mod types;

use alloc::sync::Arc;
use core::ops::Range;
use core::sync::atomic::{AtomicBool, AtomicU8};

use spin::Once;

use crate::pal::{Pal, PalEvent};
use crate::process::ProcessOps;
use crate::signal::sysentry::StubWindows;
use crate::vma::VmaProvider;

/// Static configuration handed to the manager at init.
#[derive(Debug, Clone)]
pub struct SignalManagerConfig {
    /// Text range of the library OS itself; hardware faults with the
    /// interrupted IP inside it are internal bugs, not guest signals.
    pub libos_text: Range<u64>,
    /// Label addresses published by the syscall stubs.
    pub stub_windows: StubWindows,
    /// Emulate seccomp-killed `syscall` instructions as SIGSYS entry.
    /// Off by default; only meaningful on plain Linux hosts.
    pub enable_sigsys_emulation: bool,
}

impl Default for SignalManagerConfig {
    fn default() -> Self {
        SignalManagerConfig {
            libos_text: 0..0,
            stub_windows: StubWindows::default(),
            enable_sigsys_emulation: false,
        }
    }
}

/// The signal core. One per process.
pub struct SignalManager {
    pub(crate) pal: Arc<dyn Pal>,
    pub(crate) vma: Arc<dyn VmaProvider>,
    pub(crate) process: Arc<dyn ProcessOps>,
    pub(crate) config: SignalManagerConfig,
    /// Cached memory-probe strategy; see [`probe`].
    pub(crate) probe_strategy: AtomicU8,
    /// One-winner gate for whole-process termination.
    pub(crate) kill_gate: AtomicBool,
}

impl SignalManager {
    pub fn new(
        pal: Arc<dyn Pal>,
        vma: Arc<dyn VmaProvider>,
        process: Arc<dyn ProcessOps>,
        config: SignalManagerConfig,
    ) -> Arc<Self> {
        Arc::new(SignalManager {
            pal,
            vma,
            process,
            config,
            probe_strategy: AtomicU8::new(0),
            kill_gate: AtomicBool::new(false),
        })
    }

    /// Register the six exception upcalls with the PAL.
    pub fn register_upcalls(self: &Arc<Self>) {
        macro_rules! install {
            ($event:expr, $method:ident) => {{
                let manager = Arc::clone(self);
                self.pal.set_exception_handler(
                    $event,
                    Arc::new(
                        move |handle: crate::pal::PalEventHandle,
                              arg: u64,
                              ctx: &mut crate::pal::PalContext| {
                            manager.$method(handle, arg, ctx)
                        },
                    ),
                );
            }};
        }
        install!(PalEvent::ArithmeticError, arithmetic_error_upcall);
        install!(PalEvent::Memfault, memfault_upcall);
        install!(PalEvent::Illegal, illegal_upcall);
        install!(PalEvent::Quit, quit_upcall);
        install!(PalEvent::Suspend, suspend_upcall);
        install!(PalEvent::Resume, resume_upcall);
    }
}

static SIGNAL_MANAGER: Once<Arc<SignalManager>> = Once::new();

/// Build the process-wide manager, register its upcalls, and publish it.
/// Later calls return the already-initialized instance.
pub fn init_signal(
    pal: Arc<dyn Pal>,
    vma: Arc<dyn VmaProvider>,
    process: Arc<dyn ProcessOps>,
    config: SignalManagerConfig,
) -> Arc<SignalManager> {
    let manager = SIGNAL_MANAGER.call_once(|| {
        let manager = SignalManager::new(pal, vma, process, config);
        manager.register_upcalls();
        manager
    });
    Arc::clone(manager)
}

/// The process-wide manager, once [`init_signal`] has run.
pub fn signal_manager() -> Option<Arc<SignalManager>> {
    SIGNAL_MANAGER.get().cloned()
}
