//! Page table management module
//!
//! A page table is a three-level radix tree of 512-entry nodes. Every node
//! occupies one physical frame obtained from the injected [`PhysMemory`]; the
//! tree is reachable only from its root, and nodes are returned to the
//! allocator by explicit teardown ([`PageTable::free_walk`]).
//!
//! Entries use the Sv39 encoding: physical page number in bits 10.., flags in
//! the low ten bits. Bit 8 (software-reserved) marks a page declared by a
//! file mapping. Such a page is either *unbacked* (no frame yet, populated on
//! fault) or *backed*.

use alloc::sync::Arc;
use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::error::{VmError, VmResult};
use crate::physical::{page_round_down, page_round_up, PhysAddr, PhysMemory, PAGE_SIZE};
use crate::virtual_mem::{VirtAddr, MAXVA};

/// Number of entries in one page-table node
pub const PTE_COUNT: usize = 512;

const_assert_eq!(PTE_COUNT * core::mem::size_of::<u64>(), PAGE_SIZE);

bitflags! {
    /// Page table entry flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PteFlags: u64 {
        /// Valid
        const V = 1 << 0;
        /// Readable
        const R = 1 << 1;
        /// Writable
        const W = 1 << 2;
        /// Executable
        const X = 1 << 3;
        /// User accessible
        const U = 1 << 4;
        /// Declared by a file mapping (software flag)
        const MAPPED = 1 << 8;
    }
}

impl PteFlags {
    /// Permission bits that make an entry a leaf
    pub const RWX: Self = Self::R.union(Self::W).union(Self::X);
}

/// Mask of the flag bits inside an entry
const FLAG_MASK: u64 = 0x3ff;
const PPN_SHIFT: u64 = 10;

/// One page-table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const EMPTY: Self = Self(0);

    /// Leaf or table entry pointing at frame `pa`
    pub fn new(pa: PhysAddr, flags: PteFlags) -> Self {
        debug_assert!(pa.is_page_aligned());
        Self(((pa.as_usize() as u64 >> 12) << PPN_SHIFT) | flags.bits())
    }

    /// Entry linking to a child node
    pub fn table(child: PhysAddr) -> Self {
        Self::new(child, PteFlags::V)
    }

    /// Entry declaring a mapped-file page that has no frame yet
    pub fn declared(flags: PteFlags) -> Self {
        Self((flags | PteFlags::V | PteFlags::MAPPED).bits())
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & FLAG_MASK)
    }

    /// Physical address encoded in the entry (zero for unbacked pages)
    pub fn pa(self) -> PhysAddr {
        PhysAddr::new(((self.0 >> PPN_SHIFT) << 12) as usize)
    }

    pub fn is_valid(self) -> bool {
        self.flags().contains(PteFlags::V)
    }

    pub fn is_user(self) -> bool {
        self.flags().contains(PteFlags::U)
    }

    /// Leaf entries carry a permission bit or the mapped-file mark;
    /// a valid entry with neither links to a child node.
    pub fn is_leaf(self) -> bool {
        self.flags().intersects(PteFlags::RWX | PteFlags::MAPPED)
    }

    pub fn is_table(self) -> bool {
        self.is_valid() && !self.is_leaf()
    }

    pub fn is_declared(self) -> bool {
        self.flags().contains(PteFlags::MAPPED)
    }

    /// Backing frame of a valid leaf, `None` while a declared page is unbacked
    pub fn frame(self) -> Option<PhysAddr> {
        let pa = self.pa();
        (self.is_valid() && self.is_leaf() && pa.as_usize() != 0).then_some(pa)
    }
}

/// Location of one entry: a node frame and an index into it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PteSlot {
    node: PhysAddr,
    index: usize,
}

impl PteSlot {
    fn new(node: PhysAddr, index: usize) -> Self {
        debug_assert!(index < PTE_COUNT);
        Self { node, index }
    }

    fn pa(self) -> PhysAddr {
        self.node.add(self.index * core::mem::size_of::<u64>())
    }
}

/// Root of a three-level page table
pub struct PageTable {
    mem: Arc<dyn PhysMemory>,
    root: PhysAddr,
}

impl PageTable {
    /// Create an empty page table. Fails if no frame is available for the root.
    pub fn new(mem: Arc<dyn PhysMemory>) -> VmResult<Self> {
        let root = mem.alloc_frame().ok_or(VmError::NoMemory)?;
        mem.zero_frame(root);
        Ok(Self { mem, root })
    }

    pub fn root(&self) -> PhysAddr {
        self.root
    }

    pub fn memory(&self) -> &Arc<dyn PhysMemory> {
        &self.mem
    }

    pub fn read_entry(&self, slot: PteSlot) -> PageTableEntry {
        PageTableEntry::from_bits(self.mem.read_u64(slot.pa()))
    }

    pub fn write_entry(&self, slot: PteSlot, pte: PageTableEntry) {
        self.mem.write_u64(slot.pa(), pte.bits());
    }

    /// Find the leaf-level slot for `va`. With `alloc`, missing interior nodes
    /// are allocated, zeroed and linked; without it a missing node yields
    /// [`VmError::NotMapped`].
    pub fn walk(&self, va: usize, alloc: bool) -> VmResult<PteSlot> {
        if va >= MAXVA {
            panic!("walk: va {:#x} out of range", va);
        }
        let va = VirtAddr::new(va);
        let mut node = self.root;
        for level in (1..=2).rev() {
            let slot = PteSlot::new(node, va.vpn(level));
            let pte = self.read_entry(slot);
            if pte.is_valid() {
                if pte.is_leaf() {
                    panic!("walk: leaf at level {}", level);
                }
                node = pte.pa();
            } else {
                if !alloc {
                    return Err(VmError::NotMapped(va.as_usize()));
                }
                let child = self.mem.alloc_frame().ok_or(VmError::NoMemory)?;
                self.mem.zero_frame(child);
                self.write_entry(slot, PageTableEntry::table(child));
                node = child;
            }
        }
        Ok(PteSlot::new(node, va.vpn(0)))
    }

    /// Entry for `va`, or `None` when no leaf-level node covers it
    pub fn lookup(&self, va: usize) -> Option<PageTableEntry> {
        self.walk(va, false).ok().map(|slot| self.read_entry(slot))
    }

    /// Physical address backing user page `va`.
    ///
    /// Absent, supervisor-only and not-yet-backed entries all read as
    /// unmapped, as does anything at or above `MAXVA`.
    pub fn translate_user(&self, va: usize) -> Option<PhysAddr> {
        if va >= MAXVA {
            return None;
        }
        let pte = self.lookup(va)?;
        if !pte.is_valid() || !pte.is_user() {
            return None;
        }
        pte.frame()
    }

    /// Map `[va, va + size)` onto consecutive frames starting at `pa`.
    ///
    /// Panics if any covered entry is already valid. If a node cannot be
    /// allocated, the leaves this call installed are cleared again and
    /// [`VmError::NoMemory`] is returned; interior nodes stay linked.
    pub fn map_pages(&self, va: usize, size: usize, pa: PhysAddr, perm: PteFlags) -> VmResult<()> {
        if size == 0 {
            panic!("map_pages: size");
        }
        let first = page_round_down(va);
        let last = page_round_down(va + size - 1);
        let mut a = first;
        let mut pa = pa.page_round_down();
        loop {
            let slot = match self.walk(a, true) {
                Ok(slot) => slot,
                Err(err) => {
                    self.clear_leaves(first, a);
                    return Err(err);
                }
            };
            if self.read_entry(slot).is_valid() {
                panic!("map_pages: remap {:#x}", a);
            }
            self.write_entry(slot, PageTableEntry::new(pa, perm | PteFlags::V));
            if a == last {
                return Ok(());
            }
            a += PAGE_SIZE;
            pa = pa.add(PAGE_SIZE);
        }
    }

    fn clear_leaves(&self, start: usize, end: usize) {
        for a in (start..end).step_by(PAGE_SIZE) {
            if let Ok(slot) = self.walk(a, false) {
                self.write_entry(slot, PageTableEntry::EMPTY);
            }
        }
    }

    /// Install a declared, unbacked mapped-file page at `va`.
    ///
    /// Returns `Ok(false)` without touching the entry if it is already valid.
    pub fn declare(&self, va: usize, flags: PteFlags) -> VmResult<bool> {
        let slot = self.walk(va, true)?;
        if self.read_entry(slot).is_valid() {
            return Ok(false);
        }
        self.write_entry(slot, PageTableEntry::declared(flags));
        Ok(true)
    }

    /// Remove `npages` mappings starting at page-aligned `va`, optionally
    /// returning their frames to the allocator.
    ///
    /// Pages that are already unmapped, including ones whose interior nodes
    /// were never allocated, are skipped. Panics on a non-leaf entry.
    pub fn unmap(&self, va: usize, npages: usize, free: bool) {
        if va % PAGE_SIZE != 0 {
            panic!("unmap: {:#x} not aligned", va);
        }
        for a in (va..va + npages * PAGE_SIZE).step_by(PAGE_SIZE) {
            let Ok(slot) = self.walk(a, false) else {
                continue;
            };
            let pte = self.read_entry(slot);
            if !pte.is_valid() {
                continue;
            }
            if !pte.is_leaf() {
                panic!("unmap: not a leaf at {:#x}", a);
            }
            if free {
                if let Some(pa) = pte.frame() {
                    self.mem.free_frame(pa);
                }
            }
            self.write_entry(slot, PageTableEntry::EMPTY);
        }
    }

    /// Revoke user access to `va`, used for stack guard pages
    pub fn clear_user(&self, va: usize) {
        let slot = match self.walk(va, false) {
            Ok(slot) => slot,
            Err(_) => panic!("clear_user: no entry for {:#x}", va),
        };
        let pte = self.read_entry(slot);
        let flags = pte.flags() - PteFlags::U;
        self.write_entry(slot, PageTableEntry::from_bits((pte.bits() & !FLAG_MASK) | flags.bits()));
    }

    /// Tear down the interior nodes and the root. All leaves must already
    /// be unmapped; a remaining leaf is fatal.
    pub fn free_walk(self) {
        self.free_node(self.root);
    }

    fn free_node(&self, node: PhysAddr) {
        for index in 0..PTE_COUNT {
            let slot = PteSlot::new(node, index);
            let pte = self.read_entry(slot);
            if pte.is_table() {
                self.free_node(pte.pa());
                self.write_entry(slot, PageTableEntry::EMPTY);
            } else if pte.is_valid() {
                panic!("free_walk: leaf");
            }
        }
        self.mem.free_frame(node);
    }

    /// Unmap and free user memory below `size`, then the nodes themselves
    pub fn free(self, size: usize) {
        if size > 0 {
            self.unmap(0, page_round_up(size) / PAGE_SIZE, true);
        }
        self.free_walk();
    }

    /// Copy every mapping below `size` into `new`, duplicating frames.
    ///
    /// Declared pages that have no frame yet are re-declared in `new` with
    /// nothing to copy. On failure everything already installed in `new` is
    /// unmapped and freed.
    pub fn copy_into(&self, new: &PageTable, size: usize) -> VmResult<()> {
        let mut va = 0;
        while va < size {
            if let Err(err) = self.copy_page(new, va) {
                new.unmap(0, va / PAGE_SIZE, true);
                return Err(err);
            }
            va += PAGE_SIZE;
        }
        Ok(())
    }

    fn copy_page(&self, new: &PageTable, va: usize) -> VmResult<()> {
        let Some(pte) = self.lookup(va) else {
            return Ok(());
        };
        if !pte.is_valid() {
            return Ok(());
        }
        let flags = pte.flags();
        let Some(pa) = pte.frame() else {
            if !new.declare(va, flags)? {
                panic!("copy: remap {:#x}", va);
            }
            return Ok(());
        };
        let mem = self.mem.alloc_frame().ok_or(VmError::NoMemory)?;
        self.mem.copy_frame(pa, mem);
        if let Err(err) = new.map_pages(va, PAGE_SIZE, mem, flags) {
            self.mem.free_frame(mem);
            return Err(err);
        }
        Ok(())
    }

    /// Allocate zeroed user pages to grow from `old_size` to `new_size`.
    ///
    /// Returns the new size. On failure only the pages added by this call are
    /// released and the caller keeps `old_size`.
    pub fn grow(&self, old_size: usize, new_size: usize) -> VmResult<usize> {
        if new_size < old_size {
            return Ok(old_size);
        }
        if new_size > MAXVA {
            return Err(VmError::InvalidRange);
        }
        let start = page_round_up(old_size);
        let mut a = start;
        while a < new_size {
            let Some(mem) = self.mem.alloc_frame() else {
                self.shrink(a, start);
                return Err(VmError::NoMemory);
            };
            self.mem.zero_frame(mem);
            let perm = PteFlags::RWX | PteFlags::U;
            if let Err(err) = self.map_pages(a, PAGE_SIZE, mem, perm) {
                self.mem.free_frame(mem);
                self.shrink(a, start);
                return Err(err);
            }
            a += PAGE_SIZE;
        }
        Ok(new_size)
    }

    /// Release whole pages to bring the size from `old_size` down to
    /// `new_size`. Returns the new size.
    pub fn shrink(&self, old_size: usize, new_size: usize) -> usize {
        if new_size >= old_size {
            return old_size;
        }
        let (from, to) = (page_round_up(new_size), page_round_up(old_size));
        if from < to {
            self.unmap(from, (to - from) / PAGE_SIZE, true);
        }
        new_size
    }
}
