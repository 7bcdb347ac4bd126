//! NOS Memory Management
//!
//! This crate provides the per-process virtual-memory layer:
//!
//! - **Physical**: the frame allocator contract and a fixed frame arena
//! - **Page tables**: three-level Sv39 walk, map, unmap and teardown
//! - **Address spaces**: grow, shrink, fork and destroy of one process image
//! - **User copy**: checked transfers between kernel buffers and user memory
//! - **Mapped files**: lazily populated `mmap` regions and `munmap` write-back

#![cfg_attr(not(test), no_std)]
#![warn(clippy::all)]

extern crate alloc;

pub mod address_space;
pub mod config;
pub mod error;
pub mod mmap;
pub mod page_table;
pub mod physical;
pub mod syscall;
pub mod user_copy;
pub mod virtual_mem;

pub use address_space::AddressSpace;
pub use config::{MmapConfig, MAX_REGIONS};
pub use error::{VmError, VmResult};
pub use mmap::{MapFlags, MappedRegion, ProcessMemory, Prot, RegionTable};
pub use page_table::{PageTable, PageTableEntry, PteFlags, PteSlot, PTE_COUNT};
pub use physical::{
    page_round_down, page_round_up, FrameAllocator, FrameArena, PhysAddr, PhysMemory, PAGE_SHIFT,
    PAGE_SIZE,
};
pub use syscall::{sys_mmap, sys_munmap, FileTable, MAP_FAILED};
pub use user_copy::{copy_in, copy_in_str, copy_out};
pub use virtual_mem::{VirtAddr, MAXVA};
