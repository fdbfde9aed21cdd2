//! Byte-touch primitives for the memory probe.
//!
//! The touch loops are leaf assembly routines with no prologue, so the
//! memory-fault upcall can recover from a faulting touch by pointing the
//! interrupted RIP at `__libos_probe_landing`: the landing returns to the
//! Rust caller through the untouched return address, and the caller reads
//! the fault flag from its thread's probe record.

#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    r#"
    .text
    .balign 16
    .globl __libos_probe_touch_range
    .globl __libos_probe_touch_byte
    .globl __libos_probe_landing

// __libos_probe_touch_range(start=rdi, end_inclusive=rsi, page=rdx, write=rcx)
// Touches one byte of every page in [start, end_inclusive].
__libos_probe_touch_range:
    mov rax, rdi
    lea r9, [rdx - 1]
    not r9
2:
    cmp rax, rsi
    ja 3f
    test ecx, ecx
    jz 4f
    mov r8b, byte ptr [rax]
    mov byte ptr [rax], r8b
    jmp 5f
4:
    mov r8b, byte ptr [rax]
5:
    add rax, rdx
    and rax, r9
    jmp 2b
3:
    xor eax, eax
    ret

// __libos_probe_touch_byte(addr=rdi, write=rsi)
__libos_probe_touch_byte:
    test esi, esi
    jz 6f
    mov r8b, byte ptr [rdi]
    mov byte ptr [rdi], r8b
    xor eax, eax
    ret
6:
    mov r8b, byte ptr [rdi]
    xor eax, eax
    ret

// Recovery point: the fault upcall rewrites the interrupted RIP to land
// here. Both touch routines are leaves, so the caller's return address is
// still at [rsp].
__libos_probe_landing:
    mov eax, 1
    ret
"#
);

#[cfg(target_arch = "x86_64")]
extern "C" {
    fn __libos_probe_touch_range(start: u64, end_inclusive: u64, page: u64, write: u64) -> u64;
    fn __libos_probe_touch_byte(addr: u64, write: u64) -> u64;
    /// Never called directly; only its address is taken.
    pub fn __libos_probe_landing() -> u64;
}

/// Address the fault upcall redirects to while a probe is active.
#[cfg(target_arch = "x86_64")]
pub fn landing_addr() -> u64 {
    __libos_probe_landing as usize as u64
}

/// Touch one byte of every page in `[start, end_inclusive]`.
///
/// # Safety
///
/// The caller must have installed the range in its thread's probe record so
/// that a faulting touch is recovered instead of classified as a guest
/// signal; see [`crate::signal::probe`].
#[cfg(target_arch = "x86_64")]
pub unsafe fn touch_range(start: u64, end_inclusive: u64, page: u64, write: bool) {
    unsafe {
        __libos_probe_touch_range(start, end_inclusive, page, write as u64);
    }
}

/// Touch a single byte.
///
/// # Safety
///
/// Same contract as [`touch_range`].
#[cfg(target_arch = "x86_64")]
pub unsafe fn touch_byte(addr: u64, write: bool) {
    unsafe {
        __libos_probe_touch_byte(addr, write as u64);
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub fn landing_addr() -> u64 {
    0
}

#[cfg(not(target_arch = "x86_64"))]
pub unsafe fn touch_range(_start: u64, _end_inclusive: u64, _page: u64, _write: bool) {}

#[cfg(not(target_arch = "x86_64"))]
pub unsafe fn touch_byte(_addr: u64, _write: bool) {}
