//! Fixed-capacity lock-free ring, one per (thread, signal number).
//!
//! Producers are asynchronous upcalls and cross-thread sends, which may
//! not block on a lock the interrupted thread itself holds; the consumer
//! is the single per-thread dispatch loop. Enqueue reserves a slot with a
//! CAS on `tail` before publishing the record pointer, so a failed CAS
//! never loses a slot and a consumer that sees the advanced tail but a nil
//! slot treats the queue as transiently empty. Dequeue nils the slot
//! first and re-publishes it if the CAS on `head` loses.

use alloc::alloc::{alloc, Layout};
use alloc::boxed::Box;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::signal::types::Siginfo;

/// Slots per ring. One slot always stays unused to distinguish full from
/// empty, so each ring holds at most `RING_CAPACITY - 1` records.
pub const RING_CAPACITY: usize = 32;

/// Fallible boxing: signal records are allocated on asynchronous paths
/// where an allocation failure cannot be surfaced and must drop the signal
/// instead of unwinding through the upcall.
pub(crate) fn try_box<T>(value: T) -> Option<Box<T>> {
    let layout = Layout::new::<T>();
    debug_assert!(layout.size() > 0);
    // SAFETY: layout is non-zero-sized; a nil return is handled.
    let ptr = unsafe { alloc(layout) } as *mut T;
    if ptr.is_null() {
        return None;
    }
    // SAFETY: ptr is freshly allocated with T's layout and uniquely owned.
    unsafe {
        ptr.write(value);
        Some(Box::from_raw(ptr))
    }
}

/// Lock-free ring of queued signal records for one signal number.
pub struct SignalRing {
    head: AtomicUsize,
    tail: AtomicUsize,
    slots: [AtomicPtr<Siginfo>; RING_CAPACITY],
}

impl SignalRing {
    pub fn new() -> Self {
        const NIL: AtomicPtr<Siginfo> = AtomicPtr::new(core::ptr::null_mut());
        SignalRing {
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            slots: [NIL; RING_CAPACITY],
        }
    }

    /// Enqueue a record. On success the ring owns the record; on a full
    /// ring the record is handed back for the caller to free and log.
    pub fn enqueue(&self, record: Box<Siginfo>) -> Result<(), Box<Siginfo>> {
        let mut old_tail;
        loop {
            let head = self.head.load(Ordering::Acquire);
            old_tail = self.tail.load(Ordering::Acquire);

            let next = (old_tail + 1) % RING_CAPACITY;
            if next == head {
                return Err(record);
            }

            if self
                .tail
                .compare_exchange(old_tail, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        // Slot reserved; publish the record. A concurrent fetch that
        // observes the nil slot before this store backs off.
        let ptr = Box::into_raw(record);
        self.slots[old_tail].store(ptr, Ordering::Release);
        Ok(())
    }

    /// Dequeue the oldest committed record, or `None` when the ring is
    /// empty or the front producer has not published yet.
    pub fn dequeue(&self) -> Option<Box<Siginfo>> {
        loop {
            let old_head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);

            if old_head == tail {
                return None;
            }

            let ptr = self.slots[old_head].swap(core::ptr::null_mut(), Ordering::AcqRel);
            if ptr.is_null() {
                // Producer reserved the slot but is mid-publish.
                return None;
            }

            let next = (old_head + 1) % RING_CAPACITY;
            if self
                .head
                .compare_exchange(old_head, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // SAFETY: the pointer came from Box::into_raw in enqueue
                // and ownership transferred to us with the slot swap.
                return Some(unsafe { Box::from_raw(ptr) });
            }

            // Lost the head race: put the record back for the winner.
            self.slots[old_head].store(ptr, Ordering::Release);
        }
    }

    /// Approximate emptiness, for quiescent-state assertions.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }
}

impl Default for SignalRing {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SignalRing {
    fn drop(&mut self) {
        while self.dequeue().is_some() {}
    }
}
