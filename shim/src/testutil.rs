//! Mock PAL, VMA map, and process hooks for unit and scenario tests.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Range;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::{Mutex, RwLock};

use crate::pal::{Pal, PalContext, PalEvent, PalEventHandle, Upcall};
use crate::process::ProcessOps;
use crate::signal::sysentry::{ShimRegs, StubWindows};
use crate::signal::thread::ShimThread;
use crate::signal::{SignalManager, SignalManagerConfig};
use crate::vma::{VmaInfo, VmaProvider};

/// Addresses no allocator hands out on x86-64 hosts, so fabricated text
/// ranges never collide with real test buffers.
const LIBOS_TEXT: Range<u64> = 0xffff_8000_0000_0000..0xffff_8000_0100_0000;
const PAL_TEXT: Range<u64> = 0xffff_9000_0000_0000..0xffff_9000_0100_0000;
const SYSCALL_WRAPPER: u64 = 0x60_0000;

// ============================================================================
// Mock PAL
// ============================================================================

pub struct MockPal {
    handlers: Mutex<[Option<Upcall>; PalEvent::COUNT]>,
    current: RwLock<Option<Arc<ShimThread>>>,
    host_type: Mutex<&'static str>,
    returned: Mutex<Vec<PalEventHandle>>,
    resumed: Mutex<Vec<u64>>,
}

impl MockPal {
    pub fn new(host_type: &'static str) -> Arc<Self> {
        const NONE: Option<Upcall> = None;
        Arc::new(MockPal {
            handlers: Mutex::new([NONE; PalEvent::COUNT]),
            current: RwLock::new(None),
            host_type: Mutex::new(host_type),
            returned: Mutex::new(Vec::new()),
            resumed: Mutex::new(Vec::new()),
        })
    }

    pub fn set_current_thread(&self, thread: Arc<ShimThread>) {
        *self.current.write() = Some(thread);
    }

    pub fn clear_current_thread(&self) {
        *self.current.write() = None;
    }

    pub fn set_host_type(&self, host_type: &'static str) {
        *self.host_type.lock() = host_type;
    }

    /// Deliver an event through the registered upcall, the way the real
    /// PAL would.
    pub fn raise(&self, event: PalEvent, handle: PalEventHandle, arg: u64, ctx: &mut PalContext) {
        let handler = self.handlers.lock()[event.index()].clone();
        let handler = handler.expect("no upcall registered for event");
        handler(handle, arg, ctx);
    }

    pub fn returned_events(&self) -> Vec<PalEventHandle> {
        self.returned.lock().clone()
    }

    pub fn resumed_handles(&self) -> Vec<u64> {
        self.resumed.lock().clone()
    }
}

impl Pal for MockPal {
    fn set_exception_handler(&self, event: PalEvent, upcall: Upcall) {
        self.handlers.lock()[event.index()] = Some(upcall);
    }

    fn exception_return(&self, handle: PalEventHandle) {
        self.returned.lock().push(handle);
    }

    fn thread_resume(&self, pal_handle: u64) {
        self.resumed.lock().push(pal_handle);
    }

    fn thread_yield(&self) {}

    fn host_type(&self) -> &str {
        *self.host_type.lock()
    }

    fn pal_text_range(&self) -> Range<u64> {
        PAL_TEXT.clone()
    }

    fn current_thread(&self) -> Option<Arc<ShimThread>> {
        self.current.read().clone()
    }
}

// ============================================================================
// Mock VMA map
// ============================================================================

pub struct MockVma {
    regions: Mutex<Vec<VmaInfo>>,
}

impl MockVma {
    pub fn new() -> Arc<Self> {
        Arc::new(MockVma { regions: Mutex::new(Vec::new()) })
    }

    pub fn add(&self, vma: VmaInfo) {
        self.regions.lock().push(vma);
    }
}

impl VmaProvider for MockVma {
    fn lookup(&self, addr: u64) -> Option<VmaInfo> {
        self.regions.lock().iter().copied().find(|v| v.contains(addr))
    }

    fn covers_range(&self, addr: u64, len: u64) -> bool {
        let end = match addr.checked_add(len) {
            Some(end) => end,
            None => return false,
        };
        let mut cur = addr;
        while cur < end {
            match self.lookup(cur) {
                Some(vma) => cur = vma.start + vma.len,
                None => return false,
            }
        }
        true
    }
}

// ============================================================================
// Mock process hooks
// ============================================================================

pub struct MockProcess {
    exited: Mutex<Option<i32>>,
    killed: Mutex<Option<(u32, i32)>>,
    woken: Mutex<Vec<u32>>,
    paused: AtomicBool,
}

impl MockProcess {
    pub fn new() -> Arc<Self> {
        Arc::new(MockProcess {
            exited: Mutex::new(None),
            killed: Mutex::new(None),
            woken: Mutex::new(Vec::new()),
            paused: AtomicBool::new(false),
        })
    }

    pub fn exited_with(&self) -> Option<i32> {
        *self.exited.lock()
    }

    pub fn killed_group(&self) -> Option<(u32, i32)> {
        *self.killed.lock()
    }

    pub fn woken(&self, tid: u32) -> bool {
        self.woken.lock().contains(&tid)
    }

    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

impl ProcessOps for MockProcess {
    fn thread_exit(&self, status: i32) {
        let mut exited = self.exited.lock();
        if exited.is_none() {
            *exited = Some(status);
        }
    }

    fn kill_process(&self, tgid: u32, sig: i32) {
        *self.killed.lock() = Some((tgid, sig));
    }

    fn is_last_thread(&self, _thread: &ShimThread) -> bool {
        true
    }

    fn wake(&self, thread: &ShimThread) {
        self.woken.lock().push(thread.tid);
    }

    fn fatal_pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Rig
// ============================================================================

/// One isolated manager with its mocks and a single guest thread.
pub struct TestRig {
    pub manager: Arc<SignalManager>,
    pub pal: Arc<MockPal>,
    pub vma: Arc<MockVma>,
    pub process: Arc<MockProcess>,
    pub thread: Arc<ShimThread>,
}

impl TestRig {
    pub fn new() -> Self {
        Self::build("Linux", false)
    }

    pub fn sgx() -> Self {
        Self::build("Linux-SGX", false)
    }

    /// Rig whose single thread is a library-OS helper thread.
    pub fn internal() -> Self {
        Self::build("Linux", true)
    }

    fn build(host_type: &'static str, internal: bool) -> Self {
        let pal = MockPal::new(host_type);
        let vma = MockVma::new();
        let process = MockProcess::new();
        let thread = if internal {
            Arc::new(ShimThread::new_internal(10, 10, 0x77))
        } else {
            Arc::new(ShimThread::new(10, 10, 0x77))
        };
        pal.set_current_thread(Arc::clone(&thread));

        let config = SignalManagerConfig {
            libos_text: LIBOS_TEXT,
            stub_windows: StubWindows {
                syscall_wrapper: SYSCALL_WRAPPER,
                ..StubWindows::default()
            },
            enable_sigsys_emulation: false,
        };
        let manager = SignalManager::new(pal.clone(), vma.clone(), process.clone(), config);

        TestRig { manager, pal, vma, process, thread }
    }

    /// An instruction pointer in guest code.
    pub fn guest_ip(&self) -> u64 {
        0x40_1000
    }

    /// An instruction pointer inside library-OS text.
    pub fn libos_ip(&self) -> u64 {
        LIBOS_TEXT.start + 0x1000
    }

    pub fn syscall_wrapper(&self) -> u64 {
        SYSCALL_WRAPPER
    }

    pub fn install_saved_regs(&self, regs: &mut ShimRegs) {
        self.thread
            .tcb
            .saved_regs
            .store(regs as *mut ShimRegs, Ordering::Release);
    }

    pub fn clear_saved_regs(&self) {
        self.thread
            .tcb
            .saved_regs
            .store(core::ptr::null_mut(), Ordering::Release);
    }
}

// ============================================================================
// Guest stack stand-in
// ============================================================================

/// Heap buffer standing in for a guest stack; frame builders write real
/// frames into it.
pub struct GuestStack {
    buf: Vec<u8>,
}

impl GuestStack {
    pub fn new() -> Self {
        GuestStack { buf: alloc::vec![0u8; 256 * 1024] }
    }

    pub fn base(&self) -> u64 {
        self.buf.as_ptr() as u64
    }

    pub fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    /// A 16-byte-aligned stack pointer near the top, with headroom above.
    pub fn top(&self) -> u64 {
        (self.base() + self.len() - 64) & !15
    }
}
