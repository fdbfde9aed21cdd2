//! Guest address-space map interface consumed by the fault classifier and
//! the memory probe. The map itself (insertion, splitting, locking) lives
//! with the memory subsystem; the signal core only looks regions up.

use bitflags::bitflags;

bitflags! {
    /// Permissions and kind of a mapped region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmaFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        /// Region owned by the library OS; guest faults on it are bugs.
        const INTERNAL = 1 << 4;
    }
}

/// File backing of a region, when present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileBacking {
    /// Offset of the mapping within the file.
    pub offset: u64,
    /// Current size of the file.
    pub size: u64,
}

/// One mapped region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmaInfo {
    pub start: u64,
    pub len: u64,
    pub flags: VmaFlags,
    pub file: Option<FileBacking>,
}

impl VmaInfo {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.start + self.len
    }

    /// End-of-file projected into this mapping: the mapping base plus the
    /// file offset plus the current file size. Faults above it hit pages
    /// the file does not back. Meaningless for anonymous regions.
    pub fn file_end_projection(&self) -> u64 {
        match self.file {
            Some(f) => self.start + f.offset + f.size,
            None => self.start + self.len,
        }
    }
}

/// Lookup interface over the guest VMA map. Implementations take their own
/// reader lock; the signal core never holds it across a suspension point.
pub trait VmaProvider: Send + Sync {
    /// Region containing `addr`, if any.
    fn lookup(&self, addr: u64) -> Option<VmaInfo>;

    /// True when every page of `[addr, addr+len)` is covered by a
    /// contiguous run of regions.
    fn covers_range(&self, addr: u64, len: u64) -> bool;
}
