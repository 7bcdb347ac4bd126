//! Per-process address space
//!
//! An [`AddressSpace`] owns exactly one page table and tracks the process
//! size: the highest byte address ever requested, heap growth and mapped
//! regions included. Teardown is explicit through [`AddressSpace::destroy`].

use alloc::sync::Arc;

use crate::error::{VmError, VmResult};
use crate::page_table::{PageTable, PteFlags};
use crate::physical::{PhysMemory, PAGE_SIZE};

pub struct AddressSpace {
    page_table: PageTable,
    size: usize,
}

impl AddressSpace {
    /// Create an empty address space
    pub fn new(mem: Arc<dyn PhysMemory>) -> VmResult<Self> {
        Ok(Self {
            page_table: PageTable::new(mem)?,
            size: 0,
        })
    }

    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    /// Process size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Raise the size to `size` without touching mappings. Used by callers
    /// that install their own entries above the old size.
    pub(crate) fn set_size(&mut self, size: usize) {
        self.size = size;
    }

    /// Load bootstrap code into a single zeroed page at address 0
    pub fn load_initcode(&mut self, code: &[u8]) -> VmResult<()> {
        if code.len() >= PAGE_SIZE {
            panic!("load_initcode: more than a page");
        }
        let mem = self.page_table.memory().clone();
        self.size = self.page_table.grow(self.size, PAGE_SIZE)?;
        if let Some(pa) = self.page_table.translate_user(0) {
            mem.write(pa, code);
        }
        Ok(())
    }

    /// Grow to `new_size` with zero-filled read/write/execute user pages.
    /// On failure the size is left unchanged.
    pub fn grow(&mut self, new_size: usize) -> VmResult<usize> {
        self.size = self.page_table.grow(self.size, new_size)?;
        Ok(self.size)
    }

    /// Shrink to `new_size`, releasing whole pages above it
    pub fn shrink(&mut self, new_size: usize) -> usize {
        self.size = self.page_table.shrink(self.size, new_size);
        self.size
    }

    /// Grow or shrink by `delta` bytes, returning the previous size
    pub fn resize(&mut self, delta: isize) -> VmResult<usize> {
        let old = self.size;
        if delta >= 0 {
            let new_size = old.checked_add(delta as usize).ok_or(VmError::InvalidRange)?;
            self.grow(new_size)?;
        } else {
            self.shrink(old.saturating_sub(delta.unsigned_abs()));
        }
        Ok(old)
    }

    /// Duplicate this address space with independent frames
    pub fn fork(&self) -> VmResult<AddressSpace> {
        let child = PageTable::new(self.page_table.memory().clone())?;
        if let Err(err) = self.page_table.copy_into(&child, self.size) {
            child.free_walk();
            return Err(err);
        }
        log::debug!("address space forked: {} bytes", self.size);
        Ok(AddressSpace {
            page_table: child,
            size: self.size,
        })
    }

    /// Release every user frame and page-table node
    pub fn destroy(self) {
        self.page_table.free(self.size);
    }

    /// Whether `va` is mapped with all of `flags`
    pub fn is_mapped(&self, va: usize, flags: PteFlags) -> bool {
        self.page_table
            .lookup(va)
            .is_some_and(|pte| pte.is_valid() && pte.flags().contains(flags))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_mem::MAXVA;
    use crate::physical::FrameArena;

    const BASE: usize = 0x8000_0000;

    fn arena(nframes: usize) -> Arc<FrameArena> {
        Arc::new(FrameArena::new(BASE, nframes))
    }

    #[test]
    fn test_lifecycle_returns_all_frames() {
        let arena = arena(32);
        let mut space = AddressSpace::new(arena.clone()).unwrap();
        assert_eq!(space.grow(5 * PAGE_SIZE), Ok(5 * PAGE_SIZE));
        assert_eq!(space.shrink(2 * PAGE_SIZE), 2 * PAGE_SIZE);
        assert_eq!(space.size(), 2 * PAGE_SIZE);
        space.destroy();
        assert_eq!(arena.free_frames(), arena.total_frames());
    }

    #[test]
    fn test_failed_grow_keeps_size() {
        let arena = arena(5);
        let mut space = AddressSpace::new(arena.clone()).unwrap();
        space.grow(PAGE_SIZE).unwrap();
        assert_eq!(space.grow(10 * PAGE_SIZE), Err(VmError::NoMemory));
        assert_eq!(space.size(), PAGE_SIZE);
        assert!(space.is_mapped(0, PteFlags::U));
        assert!(!space.is_mapped(PAGE_SIZE, PteFlags::U));
    }

    #[test]
    fn test_resize() {
        let arena = arena(16);
        let mut space = AddressSpace::new(arena).unwrap();
        assert_eq!(space.resize(3 * PAGE_SIZE as isize), Ok(0));
        assert_eq!(space.resize(-(PAGE_SIZE as isize)), Ok(3 * PAGE_SIZE));
        assert_eq!(space.size(), 2 * PAGE_SIZE);
        assert!(!space.is_mapped(2 * PAGE_SIZE, PteFlags::V));
    }

    #[test]
    fn test_grow_past_maxva_is_rejected() {
        let arena = arena(8);
        let mut space = AddressSpace::new(arena.clone()).unwrap();
        space.grow(PAGE_SIZE).unwrap();
        assert_eq!(space.grow(MAXVA + PAGE_SIZE), Err(VmError::InvalidRange));
        assert_eq!(space.resize(isize::MAX), Err(VmError::InvalidRange));
        space.set_size(usize::MAX - 1);
        assert_eq!(space.resize(2), Err(VmError::InvalidRange));
        space.set_size(PAGE_SIZE);
        assert_eq!(space.size(), PAGE_SIZE);
        space.destroy();
        assert_eq!(arena.free_frames(), arena.total_frames());
    }

    #[test]
    fn test_load_initcode() {
        let arena = arena(8);
        let mut space = AddressSpace::new(arena.clone()).unwrap();
        space.load_initcode(&[0x13, 0x05, 0x00, 0x00]).unwrap();
        assert_eq!(space.size(), PAGE_SIZE);
        let pa = space.page_table().translate_user(0).unwrap();
        let mut code = [0u8; 6];
        arena.read(pa, &mut code);
        assert_eq!(code, [0x13, 0x05, 0x00, 0x00, 0, 0]);
    }

    #[test]
    fn test_fork_is_independent() {
        let arena = arena(32);
        let mut parent = AddressSpace::new(arena.clone()).unwrap();
        parent.grow(2 * PAGE_SIZE).unwrap();
        let parent_pa = parent.page_table().translate_user(PAGE_SIZE).unwrap();
        arena.write(parent_pa, &[7; 16]);

        let child = parent.fork().unwrap();
        assert_eq!(child.size(), parent.size());
        let child_pa = child.page_table().translate_user(PAGE_SIZE).unwrap();
        assert_ne!(child_pa, parent_pa);

        arena.write(parent_pa, &[9; 16]);
        let mut buf = [0u8; 16];
        arena.read(child_pa, &mut buf);
        assert_eq!(buf, [7; 16]);

        child.destroy();
        parent.destroy();
        assert_eq!(arena.free_frames(), arena.total_frames());
    }

    #[test]
    fn test_failed_fork_releases_child() {
        let arena = arena(8);
        let mut parent = AddressSpace::new(arena.clone()).unwrap();
        parent.grow(2 * PAGE_SIZE).unwrap();
        let free_before = arena.free_frames();
        assert!(parent.fork().is_err());
        assert_eq!(arena.free_frames(), free_before);
    }
}
