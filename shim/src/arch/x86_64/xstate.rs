//! Extended FPU state (legacy fxsave area plus XSAVE extension).
//!
//! The signal frame carries the interrupted thread's FPU state in the
//! format the host kernel uses: a 512-byte fxsave image whose
//! `sw_reserved` bytes describe the extended area, followed (when XSAVE is
//! in use) by the XSAVE header and per-feature state, terminated by a
//! trailing magic word. `sigreturn` consumes the same format, so the
//! layout and the two magic numbers must match the kernel exactly.

use core::mem::size_of;

use lazy_static::lazy_static;

/// Marks `sw_reserved` as carrying extended-state information.
pub const FP_XSTATE_MAGIC1: u32 = 0x4650_5853;
/// Trails the extended area; its presence validates `xstate_size`.
pub const FP_XSTATE_MAGIC2: u32 = 0x4650_5845;
/// Size of the trailing magic word.
pub const FP_XSTATE_MAGIC2_SIZE: u32 = 4;

/// Required alignment of the XSAVE area.
pub const XSTATE_ALIGN: u64 = 64;

/// Software-reserved bytes inside the fxsave image (Linux `fpx_sw_bytes`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FpxSwBytes {
    pub magic1: u32,
    /// Total bytes of the save area, including the trailing magic word.
    pub extended_size: u32,
    /// Feature bitmap saved in this area.
    pub xfeatures: u64,
    /// Bytes of the XSAVE image itself (fxsave + header + features).
    pub xstate_size: u32,
    pub padding: [u32; 7],
}

/// Legacy 512-byte fxsave image. Only the fields the signal core reads are
/// named; the rest stay as raw register space.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FpState {
    pub cwd: u16,
    pub swd: u16,
    pub twd: u16,
    pub fop: u16,
    pub rip: u64,
    pub rdp: u64,
    pub mxcsr: u32,
    pub mxcsr_mask: u32,
    pub st_space: [u32; 32],
    pub xmm_space: [u32; 64],
    pub reserved2: [u32; 12],
    pub sw_reserved: FpxSwBytes,
}

/// XSAVE header that follows the fxsave image in an extended area.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct XsaveHeader {
    pub xfeatures: u64,
    pub xcomp_bv: u64,
    pub reserved: [u64; 6],
}

/// Extended save area as it appears on the signal stack: the fxsave image
/// first, then the XSAVE header, then feature state of host-dependent size.
#[repr(C)]
pub struct XregsState {
    pub fpstate: FpState,
    pub header: XsaveHeader,
    // Feature state follows, sized by FpuLayout::xstate_size.
}

/// Host FPU capabilities, probed once.
#[derive(Debug, Clone, Copy)]
pub struct FpuLayout {
    /// True when the host uses XSAVE (extended area present).
    pub xstate_enabled: bool,
    /// Bytes of the XSAVE image for the currently enabled features,
    /// without the trailing magic word.
    pub xstate_size: u32,
}

impl FpuLayout {
    /// Total bytes the sysret-path frame builder reserves on the stack.
    pub fn save_area_size(&self) -> u32 {
        self.xstate_size + FP_XSTATE_MAGIC2_SIZE
    }

    #[cfg(target_arch = "x86_64")]
    fn detect() -> Self {
        // CPUID.1:ECX bit 26 = XSAVE supported, bit 27 = OS enabled it.
        let leaf1 = unsafe { core::arch::x86_64::__cpuid(1) };
        let osxsave = leaf1.ecx & (1 << 26) != 0 && leaf1.ecx & (1 << 27) != 0;
        if !osxsave {
            return FpuLayout {
                xstate_enabled: false,
                xstate_size: size_of::<FpState>() as u32,
            };
        }
        // CPUID.0xD.0:EBX = size of the XSAVE area for the current XCR0.
        let leafd = unsafe { core::arch::x86_64::__cpuid_count(0xd, 0) };
        FpuLayout {
            xstate_enabled: true,
            xstate_size: leafd.ebx,
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn detect() -> Self {
        FpuLayout {
            xstate_enabled: false,
            xstate_size: size_of::<FpState>() as u32,
        }
    }
}

lazy_static! {
    /// Host FPU layout, probed on first use.
    pub static ref FPU_LAYOUT: FpuLayout = FpuLayout::detect();
}

/// Size of the extended state attached to an interrupted context, derived
/// from the `sw_reserved` magic probe. Returns 0 for a nil pointer and the
/// legacy fxsave size when the magic words are absent.
///
/// # Safety
///
/// `xstate` must either be nil or point to a readable save area of at
/// least `sw_reserved.xstate_size + 4` bytes when the magic words claim an
/// extended area.
pub unsafe fn xstate_size_get(xstate: *const XregsState) -> u32 {
    if xstate.is_null() {
        return 0;
    }
    let sw = unsafe { (*xstate).fpstate.sw_reserved };
    if sw.magic1 == FP_XSTATE_MAGIC1 && sw.xstate_size < sw.extended_size {
        let magic2_ptr = (xstate as *const u8).wrapping_add(sw.xstate_size as usize);
        let magic2 = unsafe { core::ptr::read_unaligned(magic2_ptr as *const u32) };
        if magic2 == FP_XSTATE_MAGIC2 {
            return sw.extended_size;
        }
    }
    size_of::<FpState>() as u32
}

/// Save the live FPU state into `area` in the kernel's signal-frame format
/// and stamp `sw_reserved` plus the trailing magic word.
///
/// # Safety
///
/// `area` must be 64-byte aligned and at least `FPU_LAYOUT.save_area_size()`
/// bytes, and must not alias live Rust objects.
#[cfg(target_arch = "x86_64")]
pub unsafe fn xstate_save(area: *mut XregsState) {
    let layout = *FPU_LAYOUT;
    unsafe {
        core::ptr::write_bytes(area as *mut u8, 0, layout.save_area_size() as usize);
        if layout.xstate_enabled {
            core::arch::asm!(
                "xsave64 [{area}]",
                area = in(reg) area,
                in("eax") u32::MAX,
                in("edx") u32::MAX,
                options(nostack),
            );
        } else {
            core::arch::asm!(
                "fxsave64 [{area}]",
                area = in(reg) area,
                options(nostack),
            );
        }
        let sw = &mut (*area).fpstate.sw_reserved;
        sw.magic1 = FP_XSTATE_MAGIC1;
        sw.xstate_size = layout.xstate_size;
        sw.extended_size = layout.save_area_size();
        sw.xfeatures = if layout.xstate_enabled {
            (*area).header.xfeatures
        } else {
            0x3 // x87 + SSE
        };
        let magic2_ptr = (area as *mut u8).add(layout.xstate_size as usize) as *mut u32;
        core::ptr::write_unaligned(magic2_ptr, FP_XSTATE_MAGIC2);
    }
}

/// Put the FPU into its clean post-init state before entering the handler;
/// the interrupted state now lives on the user frame.
#[cfg(target_arch = "x86_64")]
pub fn xstate_reset() {
    const MXCSR_DEFAULT: u32 = 0x1f80;
    let mxcsr = MXCSR_DEFAULT;
    unsafe {
        core::arch::asm!(
            "fninit",
            "ldmxcsr [{mxcsr}]",
            mxcsr = in(reg) &mxcsr,
            options(nostack),
        );
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub unsafe fn xstate_save(_area: *mut XregsState) {}

#[cfg(not(target_arch = "x86_64"))]
pub fn xstate_reset() {}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use core::mem::offset_of;

    // -- Layout ------------------------------------------------------------

    #[test]
    fn test_fpstate_layout() {
        assert_eq!(size_of::<FpState>(), 512);
        assert_eq!(offset_of!(FpState, mxcsr), 24);
        assert_eq!(offset_of!(FpState, st_space), 32);
        assert_eq!(offset_of!(FpState, xmm_space), 160);
        // Linux puts fpx_sw_bytes at offset 464 of the fxsave image.
        assert_eq!(offset_of!(FpState, sw_reserved), 464);
        assert_eq!(size_of::<FpxSwBytes>(), 48);
        assert_eq!(offset_of!(XregsState, header), 512);
    }

    // -- Magic probe ---------------------------------------------------------

    #[test]
    fn test_xstate_size_nil() {
        assert_eq!(unsafe { xstate_size_get(core::ptr::null()) }, 0);
    }

    #[test]
    fn test_xstate_size_no_magic_falls_back_to_legacy() {
        let area = vec![0u8; 1024];
        let size = unsafe { xstate_size_get(area.as_ptr() as *const XregsState) };
        assert_eq!(size, 512);
    }

    #[test]
    fn test_xstate_size_with_magic() {
        let mut area = vec![0u8; 1024];
        let xstate = area.as_mut_ptr() as *mut XregsState;
        unsafe {
            (*xstate).fpstate.sw_reserved.magic1 = FP_XSTATE_MAGIC1;
            (*xstate).fpstate.sw_reserved.xstate_size = 832;
            (*xstate).fpstate.sw_reserved.extended_size = 836;
            core::ptr::write_unaligned(
                area.as_mut_ptr().add(832) as *mut u32,
                FP_XSTATE_MAGIC2,
            );
        }
        assert_eq!(unsafe { xstate_size_get(xstate as *const _) }, 836);
    }

    #[test]
    fn test_xstate_size_bad_magic2() {
        let mut area = vec![0u8; 1024];
        let xstate = area.as_mut_ptr() as *mut XregsState;
        unsafe {
            (*xstate).fpstate.sw_reserved.magic1 = FP_XSTATE_MAGIC1;
            (*xstate).fpstate.sw_reserved.xstate_size = 832;
            (*xstate).fpstate.sw_reserved.extended_size = 836;
            // magic2 missing: probe must fall back to the legacy size.
        }
        assert_eq!(unsafe { xstate_size_get(xstate as *const _) }, 512);
    }

    // -- Live save -----------------------------------------------------------

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_xstate_save_stamps_magics() {
        let layout = *FPU_LAYOUT;
        let mut area = vec![0u8; layout.save_area_size() as usize + XSTATE_ALIGN as usize];
        let base = area.as_mut_ptr() as u64;
        let aligned = ::x86_64::align_up(base, XSTATE_ALIGN) as *mut XregsState;
        unsafe { xstate_save(aligned) };
        let sw = unsafe { (*aligned).fpstate.sw_reserved };
        assert_eq!(sw.magic1, FP_XSTATE_MAGIC1);
        assert_eq!(sw.extended_size, sw.xstate_size + FP_XSTATE_MAGIC2_SIZE);
        let magic2 = unsafe {
            core::ptr::read_unaligned(
                (aligned as *const u8).add(sw.xstate_size as usize) as *const u32
            )
        };
        assert_eq!(magic2, FP_XSTATE_MAGIC2);
    }
}
