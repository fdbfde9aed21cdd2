//! Disposition resolution and the internal terminate path.

use core::sync::atomic::Ordering;

use log::debug;

use crate::process::term_wait_status;
use crate::signal::thread::ShimThread;
use crate::signal::types::{
    default_action, signal_name, DefaultAction, KernelSigaction, Siginfo, NUM_KNOWN_SIGS,
    SA_RESETHAND, SIGABRT, SIGINT, SIGKILL, SIGTERM, SIG_DFL, SIG_IGN,
};
use crate::signal::SignalManager;

/// How a terminate disposition marks the wait status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalKill {
    /// Plain termination.
    Term,
    /// Termination with the core-dump marker bit. No core file is written.
    Core,
}

/// Effective disposition of a signal at the moment of resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Run a user handler on a signal frame.
    User { handler: u64, restorer: u64 },
    /// Terminate in the library OS without building a frame.
    Internal(InternalKill),
    /// Discard.
    Ignore,
}

impl SignalManager {
    /// Resolve the disposition of `sig` with the table guard already held.
    /// `SA_RESETHAND` entries are cleared here, atomically with the read,
    /// so two racing resolutions observe the user handler at most once.
    pub(crate) fn resolve_disposition_locked(
        &self,
        handles: &mut [Option<KernelSigaction>; NUM_KNOWN_SIGS as usize],
        sig: i32,
    ) -> Disposition {
        let slot = &mut handles[(sig - 1) as usize];
        let mut handler = SIG_DFL;
        let mut restorer = 0u64;
        if let Some(act) = *slot {
            handler = act.handler;
            restorer = act.restorer;
            if act.flags & SA_RESETHAND != 0 {
                *slot = None;
            }
        }

        if handler == SIG_IGN {
            return Disposition::Ignore;
        }
        if handler != SIG_DFL {
            return Disposition::User { handler, restorer };
        }
        match default_action(sig) {
            DefaultAction::Term => Disposition::Internal(InternalKill::Term),
            DefaultAction::Core => Disposition::Internal(InternalKill::Core),
            DefaultAction::Ign => Disposition::Ignore,
        }
    }

    /// Resolve the disposition of `sig`, taking the table lock.
    pub(crate) fn get_sighandler(&self, thread: &ShimThread, sig: i32) -> Disposition {
        let mut handles = thread.handles_lock().lock();
        self.resolve_disposition_locked(&mut handles, sig)
    }

    /// Terminate on a default disposition. Called directly by the
    /// scheduler instead of building a frame; production process hooks do
    /// not return control to guest code from here.
    pub(crate) fn internal_kill(
        &self,
        thread: &ShimThread,
        sig: i32,
        info: &Siginfo,
        kind: InternalKill,
    ) {
        let status = term_wait_status(sig, kind == InternalKill::Core);
        debug!("killed by {}", signal_name(sig));

        if sig == SIGABRT || (info.si_pid == 0 && (sig == SIGTERM || sig == SIGINT)) {
            // Kill the whole process: SIGABRT always, SIGTERM/SIGINT when
            // the host (not a guest process) sent them. A single winner
            // drives the teardown; latecomers spin until torn down.
            if self.kill_gate.swap(true, Ordering::SeqCst) {
                loop {
                    self.pal.thread_yield();
                }
            }
            self.process.kill_process(thread.tgid, SIGKILL);
            while !self.process.is_last_thread(thread) {
                self.pal.thread_yield();
            }
        }

        thread.mark_dead();
        self.process.thread_exit(status);
    }
}
