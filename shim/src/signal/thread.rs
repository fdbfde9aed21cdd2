//! Per-thread signal state: queues, mask, dispositions, alternate stack,
//! and the control-block fields the upcall and syscall paths cooperate
//! through.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, AtomicU64, Ordering};

use spin::Mutex;

use crate::error::SignalError;
use crate::signal::queue::SignalRing;
use crate::signal::sysentry::ShimRegs;
use crate::signal::types::{
    KernelSigaction, SigSet, Siginfo, StackT, NUM_KNOWN_SIGS, SIGKILL, SIGSTOP, SS_DISABLE,
    SS_ONSTACK,
};

/// TCB flag: queued work may need delivery at the next syscall return.
pub const FLAG_MAY_DELIVER_SIGNAL: u64 = 1 << 0;

/// Single-slot probe record consulted by the memory-fault upcall. Written
/// only by the owning thread; the upcall runs on the same thread, so no
/// lock is needed on the fault path.
#[derive(Debug)]
pub struct TestRange {
    pub start: AtomicU64,
    pub end: AtomicU64,
    /// Recovery address the fault upcall redirects RIP to; nil when no
    /// probe is active.
    pub cont_addr: AtomicU64,
    pub has_fault: AtomicBool,
}

impl TestRange {
    const fn new() -> Self {
        TestRange {
            start: AtomicU64::new(0),
            end: AtomicU64::new(0),
            cont_addr: AtomicU64::new(0),
            has_fault: AtomicBool::new(false),
        }
    }

    pub fn is_active(&self) -> bool {
        self.cont_addr.load(Ordering::Acquire) != 0
    }

    /// True when a fault at `addr` belongs to the active probe.
    pub fn covers(&self, addr: u64) -> bool {
        self.is_active()
            && addr >= self.start.load(Ordering::Acquire)
            && addr <= self.end.load(Ordering::Acquire)
    }

    pub fn arm(&self, start: u64, end: u64, cont_addr: u64) {
        self.has_fault.store(false, Ordering::Release);
        self.start.store(start, Ordering::Release);
        self.end.store(end, Ordering::Release);
        self.cont_addr.store(cont_addr, Ordering::Release);
    }

    /// Clear the record and report whether a fault was caught.
    pub fn disarm(&self) -> bool {
        let faulted = self.has_fault.swap(false, Ordering::AcqRel);
        self.cont_addr.store(0, Ordering::Release);
        self.start.store(0, Ordering::Release);
        self.end.store(0, Ordering::Release);
        faulted
    }
}

/// Control-block fields shared between the upcall context and the syscall
/// entry/exit stubs.
#[derive(Debug)]
pub struct ShimTcb {
    /// Flag word; see [`FLAG_MAY_DELIVER_SIGNAL`].
    pub flags: AtomicU64,
    /// Preemption-disable depth. Upcalls bump it; delivery only proceeds
    /// at depth <= 1.
    preempt: AtomicI64,
    /// Register block the syscall stub saved on entry; nil once consumed
    /// or after returning to the app.
    pub saved_regs: AtomicPtr<ShimRegs>,
    /// Scratch slot holding the app return address during the stub's
    /// final jump window.
    pub tmp_rip: AtomicU64,
    /// Active memory-probe record.
    pub test_range: TestRange,
}

impl ShimTcb {
    fn new() -> Self {
        ShimTcb {
            flags: AtomicU64::new(0),
            preempt: AtomicI64::new(0),
            saved_regs: AtomicPtr::new(core::ptr::null_mut()),
            tmp_rip: AtomicU64::new(0),
            test_range: TestRange::new(),
        }
    }

    pub fn set_flag(&self, flag: u64) {
        self.flags.fetch_or(flag, Ordering::SeqCst);
    }

    pub fn clear_flag(&self, flag: u64) {
        self.flags.fetch_and(!flag, Ordering::SeqCst);
    }

    pub fn test_flag(&self, flag: u64) -> bool {
        self.flags.load(Ordering::SeqCst) & flag != 0
    }

    /// Returns the new depth; the caller was outermost when it is <= 1.
    pub fn disable_preempt(&self) -> i64 {
        self.preempt.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn enable_preempt(&self) {
        let prev = self.preempt.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
    }

    pub fn preempt_depth(&self) -> i64 {
        self.preempt.load(Ordering::SeqCst)
    }
}

/// A guest thread as the signal core sees it.
pub struct ShimThread {
    pub tid: u32,
    pub tgid: u32,
    /// Handle the PAL uses to resume this thread.
    pub pal_handle: u64,
    /// Library-OS helper threads take no guest signals; their faults are
    /// internal bugs.
    pub is_internal: bool,

    pub tcb: ShimTcb,

    alive: AtomicBool,
    /// Queued-but-undelivered record count across all rings.
    has_signal: AtomicI64,
    rings: [SignalRing; NUM_KNOWN_SIGS as usize],
    /// Blocked-signal mask.
    mask: AtomicU64,
    /// Disposition table, one optional entry per signal. The lock also
    /// serializes the append path against disposition changes.
    handles: Mutex<[Option<KernelSigaction>; NUM_KNOWN_SIGS as usize]>,
    altstack: Mutex<StackT>,
}

impl ShimThread {
    pub fn new(tid: u32, tgid: u32, pal_handle: u64) -> Self {
        ShimThread {
            tid,
            tgid,
            pal_handle,
            is_internal: false,
            tcb: ShimTcb::new(),
            alive: AtomicBool::new(true),
            has_signal: AtomicI64::new(0),
            rings: core::array::from_fn(|_| SignalRing::new()),
            mask: AtomicU64::new(0),
            handles: Mutex::new([None; NUM_KNOWN_SIGS as usize]),
            altstack: Mutex::new(StackT::disabled()),
        }
    }

    pub fn new_internal(tid: u32, tgid: u32, pal_handle: u64) -> Self {
        let mut thread = Self::new(tid, tgid, pal_handle);
        thread.is_internal = true;
        thread
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    // -- queues --------------------------------------------------------------

    pub fn ring(&self, sig: i32) -> &SignalRing {
        debug_assert!((1..=NUM_KNOWN_SIGS).contains(&sig));
        &self.rings[(sig - 1) as usize]
    }

    pub fn has_signal(&self) -> i64 {
        self.has_signal.load(Ordering::SeqCst)
    }

    /// Queue one record. On success bumps the pending count and sets the
    /// may-deliver flag; on overflow hands the record back.
    pub fn queue_signal(&self, sig: i32, record: Box<Siginfo>) -> Result<(), Box<Siginfo>> {
        self.ring(sig).enqueue(record)?;
        self.has_signal.fetch_add(1, Ordering::SeqCst);
        self.tcb.set_flag(FLAG_MAY_DELIVER_SIGNAL);
        Ok(())
    }

    /// Fetch the oldest queued record of `sig`, decrementing the pending
    /// count.
    pub fn fetch_signal(&self, sig: i32) -> Option<Box<Siginfo>> {
        let record = self.ring(sig).dequeue()?;
        self.has_signal.fetch_sub(1, Ordering::SeqCst);
        Some(record)
    }

    // -- mask ----------------------------------------------------------------

    pub fn sig_mask(&self) -> SigSet {
        SigSet::from_raw(self.mask.load(Ordering::SeqCst))
    }

    /// Replace the mask. SIGKILL and SIGSTOP are scrubbed unconditionally.
    pub fn set_sig_mask(&self, set: SigSet) {
        let mut set = set;
        set.remove(SIGKILL);
        set.remove(SIGSTOP);
        self.mask.store(set.raw(), Ordering::SeqCst);
    }

    // -- dispositions --------------------------------------------------------

    pub fn handles_lock(&self) -> &Mutex<[Option<KernelSigaction>; NUM_KNOWN_SIGS as usize]> {
        &self.handles
    }

    /// Install or clear a disposition. SIGKILL and SIGSTOP cannot be
    /// retargeted.
    pub fn set_sigaction(
        &self,
        sig: i32,
        act: Option<KernelSigaction>,
    ) -> Result<Option<KernelSigaction>, SignalError> {
        if !(1..=NUM_KNOWN_SIGS).contains(&sig) {
            return Err(SignalError::InvalidSignal { sig });
        }
        if (sig == SIGKILL || sig == SIGSTOP) && act.is_some() {
            return Err(SignalError::Unblockable { sig });
        }
        let mut handles = self.handles.lock();
        let old = handles[(sig - 1) as usize];
        handles[(sig - 1) as usize] = act;
        Ok(old)
    }

    pub fn sigaction(&self, sig: i32) -> Result<Option<KernelSigaction>, SignalError> {
        if !(1..=NUM_KNOWN_SIGS).contains(&sig) {
            return Err(SignalError::InvalidSignal { sig });
        }
        Ok(self.handles.lock()[(sig - 1) as usize])
    }

    // -- alternate stack -----------------------------------------------------

    pub fn signal_altstack(&self) -> StackT {
        *self.altstack.lock()
    }

    /// Install a new alternate stack. Rejected while the current stack
    /// pointer is on the configured one.
    pub fn set_signal_altstack(&self, ss: StackT, current_sp: u64) -> Result<StackT, SignalError> {
        if ss.ss_flags & !(SS_DISABLE | SS_ONSTACK) != 0 {
            return Err(SignalError::InvalidArgument { name: "ss_flags" });
        }
        let mut altstack = self.altstack.lock();
        if !altstack.is_disabled() && altstack.contains(current_sp) {
            return Err(SignalError::AltStackInUse);
        }
        let old = *altstack;
        *altstack = ss;
        Ok(old)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::types::{SIGCHLD, SIGUSR1, SIGUSR2, SIG_IGN};

    fn thread() -> ShimThread {
        ShimThread::new(10, 10, 0)
    }

    // -- Pending count -------------------------------------------------------

    #[test]
    fn test_queue_fetch_accounting() {
        let t = thread();
        assert_eq!(t.has_signal(), 0);
        t.queue_signal(SIGUSR1, Box::new(Siginfo::new(SIGUSR1, 0)))
            .unwrap();
        t.queue_signal(SIGUSR2, Box::new(Siginfo::new(SIGUSR2, 0)))
            .unwrap();
        assert_eq!(t.has_signal(), 2);
        assert!(t.tcb.test_flag(FLAG_MAY_DELIVER_SIGNAL));

        assert!(t.fetch_signal(SIGUSR1).is_some());
        assert!(t.fetch_signal(SIGUSR1).is_none());
        assert!(t.fetch_signal(SIGUSR2).is_some());
        assert_eq!(t.has_signal(), 0);
        // Every ring is empty once the count hits zero.
        for sig in 1..=NUM_KNOWN_SIGS {
            assert!(t.ring(sig).is_empty());
        }
    }

    // -- Mask ----------------------------------------------------------------

    #[test]
    fn test_mask_scrubs_unblockable() {
        let t = thread();
        let mut set = SigSet::EMPTY;
        set.add(SIGKILL);
        set.add(SIGSTOP);
        set.add(SIGUSR1);
        t.set_sig_mask(set);
        let mask = t.sig_mask();
        assert!(mask.contains(SIGUSR1));
        assert!(!mask.contains(SIGKILL));
        assert!(!mask.contains(SIGSTOP));
    }

    // -- Dispositions --------------------------------------------------------

    #[test]
    fn test_sigaction_rejects_kill_stop() {
        let t = thread();
        let act = KernelSigaction {
            handler: SIG_IGN,
            flags: 0,
            restorer: 0,
            mask: SigSet::EMPTY,
        };
        assert_eq!(
            t.set_sigaction(SIGKILL, Some(act)),
            Err(SignalError::Unblockable { sig: SIGKILL })
        );
        assert_eq!(
            t.set_sigaction(SIGSTOP, Some(act)),
            Err(SignalError::Unblockable { sig: SIGSTOP })
        );
        // Querying them is fine.
        assert_eq!(t.sigaction(SIGKILL).unwrap(), None);
        // Other signals install normally.
        assert_eq!(t.set_sigaction(SIGCHLD, Some(act)).unwrap(), None);
        assert_eq!(t.sigaction(SIGCHLD).unwrap(), Some(act));
    }

    #[test]
    fn test_sigaction_range_check() {
        let t = thread();
        assert_eq!(
            t.sigaction(0),
            Err(SignalError::InvalidSignal { sig: 0 })
        );
        assert_eq!(
            t.sigaction(32),
            Err(SignalError::InvalidSignal { sig: 32 })
        );
    }

    // -- Alternate stack -----------------------------------------------------

    #[test]
    fn test_altstack_in_use_rejected() {
        let t = thread();
        let ss = StackT::new(0x7000_0000, 0, 0x4000);
        t.set_signal_altstack(ss, 0x1000).unwrap();
        // SP inside the configured stack: change refused.
        let err = t.set_signal_altstack(StackT::disabled(), 0x7000_2000);
        assert_eq!(err, Err(SignalError::AltStackInUse));
        // SP elsewhere: change allowed.
        let old = t.set_signal_altstack(StackT::disabled(), 0x1000).unwrap();
        assert_eq!(old, ss);
    }

    // -- Probe record --------------------------------------------------------

    #[test]
    fn test_test_range_lifecycle() {
        let t = thread();
        assert!(!t.tcb.test_range.is_active());
        t.tcb.test_range.arm(0x1000, 0x1fff, 0xdead);
        assert!(t.tcb.test_range.covers(0x1000));
        assert!(t.tcb.test_range.covers(0x1fff));
        assert!(!t.tcb.test_range.covers(0x2000));
        t.tcb.test_range.has_fault.store(true, Ordering::Release);
        assert!(t.tcb.test_range.disarm());
        assert!(!t.tcb.test_range.is_active());
        assert!(!t.tcb.test_range.disarm());
    }
}
