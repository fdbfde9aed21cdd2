//! End-to-end scenarios through the registered upcalls: host fault in,
//! guest handler (or wait status) out.

use alloc::boxed::Box;

use crate::arch::x86_64::probe::landing_addr;
use crate::pal::{PalContext, PalEvent, PalEventHandle};
use crate::signal::frame::UContext;
use crate::signal::sysentry::ShimRegs;
use crate::signal::thread::FLAG_MAY_DELIVER_SIGNAL;
use crate::signal::types::{
    KernelSigaction, SigSet, Siginfo, BUS_ADRERR, SEGV_ACCERR, SIGBUS, SIGSEGV, SIGUSR1, SIGUSR2,
    SIG_IGN, SI_USER,
};
use crate::testutil::{GuestStack, TestRig};
use crate::vma::{FileBacking, VmaFlags, VmaInfo};

fn handler_act(handler: u64) -> KernelSigaction {
    KernelSigaction { handler, flags: 0, restorer: 0x9000, mask: SigSet::EMPTY }
}

fn guest_ctx(rig: &TestRig, rsp: u64) -> PalContext {
    let mut ctx = PalContext::zeroed();
    ctx.rip = rig.guest_ip();
    ctx.rsp = rsp;
    ctx
}

/// S1: a write to address 0 terminates the process with the core bit.
#[test]
fn test_null_dereference_terminates_with_core_status() {
    let rig = TestRig::new();
    rig.manager.register_upcalls();

    let mut ctx = guest_ctx(&rig, 0x7fff_0000);
    ctx.err = 4;
    rig.pal
        .raise(PalEvent::Memfault, PalEventHandle(11), 0, &mut ctx);

    assert_eq!(rig.process.exited_with(), Some(0x80 | SIGSEGV));
    assert!(!rig.thread.is_alive());
    assert_eq!(rig.pal.returned_events(), alloc::vec![PalEventHandle(11)]);
}

/// S2: a write fault on a read-only file mapping classifies as
/// SIGSEGV/SEGV_ACCERR.
#[test]
fn test_write_to_readonly_mapping_is_accerr() {
    let rig = TestRig::new();
    rig.manager.register_upcalls();
    rig.vma.add(VmaInfo {
        start: 0x20_0000,
        len: 0x2000,
        flags: VmaFlags::READ,
        file: Some(FileBacking { offset: 0, size: 0x2000 }),
    });

    // Park immediate delivery so the classified record can be inspected.
    rig.thread.tcb.disable_preempt();
    let mut ctx = guest_ctx(&rig, 0x7fff_0000);
    ctx.err = 4;
    rig.pal
        .raise(PalEvent::Memfault, PalEventHandle(0), 0x20_0800, &mut ctx);

    let info = rig.thread.fetch_signal(SIGSEGV).unwrap();
    assert_eq!(info.si_code, SEGV_ACCERR);
    assert_eq!(info.si_addr, 0x20_0800);
}

/// S3: a fault past the end-of-file projection of a mapping raises
/// SIGBUS/BUS_ADRERR.
#[test]
fn test_fault_past_eof_is_sigbus() {
    let rig = TestRig::new();
    rig.manager.register_upcalls();
    rig.vma.add(VmaInfo {
        start: 0x30_0000,
        len: 0x4000,
        flags: VmaFlags::READ | VmaFlags::WRITE,
        file: Some(FileBacking { offset: 0, size: 0x1000 }),
    });

    rig.thread.tcb.disable_preempt();
    let mut ctx = guest_ctx(&rig, 0x7fff_0000);
    rig.pal
        .raise(PalEvent::Memfault, PalEventHandle(0), 0x30_2000, &mut ctx);

    let info = rig.thread.fetch_signal(SIGBUS).unwrap();
    assert_eq!(info.si_code, BUS_ADRERR);
}

/// S4: an ignored signal is discarded on append; after installing a real
/// handler the next append is delivered exactly once.
#[test]
fn test_ignored_then_handled_append() {
    let rig = TestRig::new();
    let stack = GuestStack::new();

    rig.thread
        .set_sigaction(SIGUSR1, Some(handler_act(SIG_IGN)))
        .unwrap();
    rig.manager.append_signal(&rig.thread, SIGUSR1, None, true);
    assert_eq!(rig.thread.has_signal(), 0);

    rig.thread
        .set_sigaction(SIGUSR1, Some(handler_act(0x5000)))
        .unwrap();
    rig.manager.append_signal(&rig.thread, SIGUSR1, None, true);
    assert_eq!(rig.thread.has_signal(), 1);

    let mut regs = ShimRegs::default();
    regs.rsp = stack.top();
    regs.rip = 0x40_2000;
    rig.install_saved_regs(&mut regs);

    assert_eq!(rig.manager.deliver_signal_on_sysret(0), 0);
    assert_eq!(regs.rip, 0x5000);
    assert_eq!(regs.rdi, SIGUSR1 as u64);
    assert_eq!(rig.thread.has_signal(), 0);

    // Exactly once: nothing further to deliver.
    regs.rip = 0x40_2000;
    assert_eq!(rig.manager.deliver_signal_on_sysret(33), 33);
    assert_eq!(regs.rip, 0x40_2000);
    rig.clear_saved_regs();
}

/// S5: three sends while masked, then unmask; the first delivery happens
/// at sysret and the remaining two chain through sigreturn.
#[test]
fn test_mask_unmask_delivers_all_queued() {
    let rig = TestRig::new();
    let stack = GuestStack::new();
    rig.thread
        .set_sigaction(SIGUSR2, Some(handler_act(0x5000)))
        .unwrap();

    let mut mask = SigSet::EMPTY;
    mask.add(SIGUSR2);
    rig.thread.set_sig_mask(mask);

    for _ in 0..3 {
        rig.manager
            .append_signal(&rig.thread, SIGUSR2, Some(Siginfo::new(SIGUSR2, SI_USER)), false);
    }
    assert_eq!(rig.thread.has_signal(), 3);
    assert!(rig.thread.tcb.test_flag(FLAG_MAY_DELIVER_SIGNAL));

    rig.thread.set_sig_mask(SigSet::EMPTY);

    let mut regs = ShimRegs::default();
    regs.rsp = stack.top();
    regs.rip = 0x40_3000;
    rig.install_saved_regs(&mut regs);

    // First delivery at syscall return.
    assert_eq!(rig.manager.deliver_signal_on_sysret(0), 0);
    assert_eq!(regs.rip, 0x5000);
    assert_eq!(rig.thread.has_signal(), 2);
    let uc = regs.rdx as *mut UContext;

    // Second and third chain on sigreturn without returning to the app.
    assert!(unsafe { rig.manager.handle_next_signal(uc) });
    assert_eq!(regs.rdi, SIGUSR2 as u64);
    assert_eq!(rig.thread.has_signal(), 1);

    assert!(unsafe { rig.manager.handle_next_signal(uc) });
    assert_eq!(rig.thread.has_signal(), 0);

    // Queue drained: sigreturn falls through to the app.
    assert!(!unsafe { rig.manager.handle_next_signal(uc) });
    rig.clear_saved_regs();
}

/// S6: a fault inside an armed probe range redirects into the landing
/// instead of raising a signal, and the probe reports it.
#[test]
fn test_probe_fault_recovers_and_reports() {
    let rig = TestRig::new();
    rig.manager.register_upcalls();

    // Fault-free probe over real memory.
    let buf = alloc::vec![0u8; 8192];
    assert!(!rig
        .manager
        .test_user_memory(buf.as_ptr() as u64, buf.len() as u64, false));

    // Simulate the faulting half: the probe armed its record and the
    // touch trapped at an unmapped page.
    let range = &rig.thread.tcb.test_range;
    range.arm(0x9_0000, 0x9_1fff, landing_addr());
    let mut ctx = guest_ctx(&rig, 0x7fff_0000);
    rig.pal
        .raise(PalEvent::Memfault, PalEventHandle(3), 0x9_1000, &mut ctx);

    // Redirected, flagged, and no signal queued.
    assert_eq!(ctx.rip, landing_addr());
    assert_eq!(rig.thread.has_signal(), 0);
    assert!(range.disarm());
    // The thread keeps running normally afterwards.
    assert!(rig.thread.is_alive());
}

/// QUIT from the host while the stub is mid-epilogue: the context is
/// rewritten to the app state first, then SIGTERM delivery terminates the
/// process (default disposition, host origin).
#[test]
fn test_host_quit_during_syscall_epilogue() {
    use crate::signal::sysentry::StubWindows;
    use crate::signal::{SignalManager, SignalManagerConfig};

    // A rig with real stub windows this time.
    let rig = TestRig::new();
    let windows = StubWindows {
        return_begin: 0xffff_8000_0010_0000,
        return_before_jmp: 0xffff_8000_0010_0030,
        return_end: 0xffff_8000_0010_0040,
        sigpending_begin: 0xffff_8000_0010_1000,
        sigpending_end: 0xffff_8000_0010_1010,
        syscall_wrapper: rig.syscall_wrapper(),
    };
    let manager = SignalManager::new(
        rig.pal.clone(),
        rig.vma.clone(),
        rig.process.clone(),
        SignalManagerConfig {
            libos_text: 0xffff_8000_0000_0000..0xffff_8000_0100_0000,
            stub_windows: windows,
            enable_sigsys_emulation: false,
        },
    );

    let mut saved = Box::new(ShimRegs::default());
    saved.rip = 0x40_5000;
    saved.rsp = 0x7fff_8000;
    saved.rflags = 0x202;
    rig.install_saved_regs(&mut saved);

    let mut ctx = PalContext::zeroed();
    ctx.rip = windows.return_begin + 8; // interrupted mid-epilogue
    manager.quit_upcall(PalEventHandle(9), 0, &mut ctx);

    // The emulation put the context back in the app...
    assert_eq!(ctx.rsp, 0x7fff_8000);
    // ...so delivery proceeded: host SIGTERM terminates the process.
    assert_eq!(rig.process.exited_with(), Some(crate::signal::types::SIGTERM));
    rig.clear_saved_regs();
}
