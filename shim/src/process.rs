//! Process-lifecycle hooks consumed by the terminate dispositions and the
//! cross-thread append path. The thread table, wait bookkeeping, and the
//! actual teardown live outside this crate.

use crate::signal::thread::ShimThread;

/// Marker OR'd into a wait status when the disposition was
/// terminate-with-core. No core file is produced; only the status bit is
/// surfaced.
pub const WCOREDUMP_BIT: i32 = 0x80;

/// Encode the wait status for termination by `sig`.
pub fn term_wait_status(sig: i32, core: bool) -> i32 {
    if core {
        sig | WCOREDUMP_BIT
    } else {
        sig
    }
}

/// Operations the signal core invokes on the surrounding process layer.
pub trait ProcessOps: Send + Sync {
    /// Terminate the calling thread (or the whole process if it is the
    /// last one) with the given wait status. Production implementations do
    /// not return control to guest code afterwards.
    fn thread_exit(&self, status: i32);

    /// Send `sig` to every thread of the thread group.
    fn kill_process(&self, tgid: u32, sig: i32);

    /// True when `thread` is the only live thread of its group.
    fn is_last_thread(&self, thread: &ShimThread) -> bool;

    /// Wake a thread blocked on a library-OS condition (so an interrupted
    /// syscall can return EINTR). The PAL-level resume is separate.
    fn wake(&self, thread: &ShimThread);

    /// Park after an internal fault has been reported. The surrounding
    /// system treats this as a bug; production implementations spin or
    /// trap into a debugger.
    fn fatal_pause(&self);
}
