//! Syscall-shaped entry points for file mappings
//!
//! These translate raw user arguments into [`ProcessMemory`] calls and
//! results into the values returned to user space.

use log::warn;
use nos_api::FileHandle;

use crate::mmap::{MapFlags, ProcessMemory, Prot};

/// Returned by `sys_mmap` on failure
pub const MAP_FAILED: usize = usize::MAX;

/// Open files of the calling process, indexed by descriptor
pub trait FileTable {
    fn file(&self, fd: usize) -> Option<FileHandle>;
}

impl FileTable for [Option<FileHandle>] {
    fn file(&self, fd: usize) -> Option<FileHandle> {
        self.get(fd)?.clone()
    }
}

/// `mmap(addr, length, prot, flags, fd, offset)`; returns the base address
/// or [`MAP_FAILED`].
#[allow(clippy::too_many_arguments)]
pub fn sys_mmap<F: FileTable + ?Sized>(
    pm: &mut ProcessMemory,
    files: &F,
    addr: usize,
    length: usize,
    prot: u32,
    flags: u32,
    fd: usize,
    offset: u64,
) -> usize {
    let (Some(prot), Some(flags)) = (Prot::from_bits(prot), MapFlags::from_bits(flags)) else {
        return MAP_FAILED;
    };
    let Some(file) = files.file(fd) else {
        warn!("mmap: bad descriptor {}", fd);
        return MAP_FAILED;
    };
    pm.mmap(addr, length, prot, flags, &file, offset)
        .unwrap_or(MAP_FAILED)
}

/// `munmap(addr, length)`; 0 on success, -1 otherwise. Pages are unmapped
/// even when write-back fails.
pub fn sys_munmap(pm: &mut ProcessMemory, addr: usize, length: usize) -> isize {
    match pm.munmap(addr, length) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}
