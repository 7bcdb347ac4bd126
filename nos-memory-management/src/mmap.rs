//! Memory-mapped file regions
//!
//! `mmap` only reserves page-table entries: every page of a new region is
//! declared (valid, user, mapped) without a frame. The first access faults,
//! and [`ProcessMemory::handle_page_fault`] allocates a zeroed frame, fills it
//! from the file and installs it with the region's permissions.
//!
//! `munmap` writes shared writable regions back to their file before the
//! pages go away, in chunks that fit a single file-system transaction.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;
use log::{debug, trace, warn};
use nos_api::FileHandle;

use crate::address_space::AddressSpace;
use crate::config::{MmapConfig, MAX_REGIONS};
use crate::error::{VmError, VmResult};
use crate::page_table::{PageTableEntry, PteFlags};
use crate::physical::{page_round_down, page_round_up, PhysMemory, PAGE_SIZE};
use crate::virtual_mem::MAXVA;

bitflags! {
    /// Requested access to a mapping
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

bitflags! {
    /// Sharing mode of a mapping
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Stores reach the file on unmap
        const SHARED = 1 << 0;
        /// Stores stay private to the process
        const PRIVATE = 1 << 1;
    }
}

impl Prot {
    /// Leaf permissions of a populated page
    pub fn pte_flags(self) -> PteFlags {
        let mut flags = PteFlags::empty();
        if self.contains(Prot::READ) {
            flags |= PteFlags::R;
        }
        if self.contains(Prot::WRITE) {
            flags |= PteFlags::W;
        }
        if self.contains(Prot::EXEC) {
            flags |= PteFlags::X;
        }
        flags
    }
}

/// One file mapping of a process
#[derive(Clone)]
pub struct MappedRegion {
    base: usize,
    len: usize,
    prot: Prot,
    flags: MapFlags,
    file: FileHandle,
    offset: u64,
}

impl MappedRegion {
    pub fn base(&self) -> usize {
        self.base
    }

    /// Length in bytes, always whole pages
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn end(&self) -> usize {
        self.base + self.len
    }

    pub fn prot(&self) -> Prot {
        self.prot
    }

    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    pub fn file(&self) -> &FileHandle {
        &self.file
    }

    /// File offset backing `base`
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn contains(&self, va: usize) -> bool {
        self.base <= va && va < self.end()
    }

    /// File offset backing `va`
    pub fn file_offset(&self, va: usize) -> u64 {
        self.offset + (va - self.base) as u64
    }

    fn writes_back(&self) -> bool {
        self.flags.contains(MapFlags::SHARED) && self.prot.contains(Prot::WRITE)
    }

    /// The part of this region starting at `at`
    fn split_off(&self, at: usize) -> MappedRegion {
        MappedRegion {
            base: at,
            len: self.end() - at,
            offset: self.file_offset(at),
            ..self.clone()
        }
    }
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("base", &format_args!("{:#x}", self.base))
            .field("len", &self.len)
            .field("prot", &self.prot)
            .field("flags", &self.flags)
            .field("offset", &self.offset)
            .finish()
    }
}

/// Fixed set of region slots; live regions never overlap
#[derive(Clone, Debug)]
pub struct RegionTable {
    slots: [Option<MappedRegion>; MAX_REGIONS],
}

impl Default for RegionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionTable {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
        }
    }

    /// Slot of the region containing `va`
    pub fn find(&self, va: usize) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|r| r.contains(va)))
    }

    pub fn get(&self, index: usize) -> Option<&MappedRegion> {
        self.slots.get(index)?.as_ref()
    }

    pub fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    fn insert(&mut self, region: MappedRegion) -> VmResult<usize> {
        let index = self.free_slot().ok_or(VmError::NoRegionSlot)?;
        self.slots[index] = Some(region);
        Ok(index)
    }

    fn remove(&mut self, index: usize) -> Option<MappedRegion> {
        self.slots[index].take()
    }

    fn get_mut(&mut self, index: usize) -> Option<&mut MappedRegion> {
        self.slots[index].as_mut()
    }

    /// Live regions in slot order
    pub fn iter(&self) -> impl Iterator<Item = &MappedRegion> {
        self.slots.iter().flatten()
    }

    /// Number of live regions
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Address space of one process together with its file mappings
pub struct ProcessMemory {
    space: AddressSpace,
    regions: RegionTable,
    config: MmapConfig,
}

impl ProcessMemory {
    pub fn new(mem: Arc<dyn PhysMemory>, config: MmapConfig) -> VmResult<Self> {
        Ok(Self {
            space: AddressSpace::new(mem)?,
            regions: RegionTable::new(),
            config,
        })
    }

    pub fn space(&self) -> &AddressSpace {
        &self.space
    }

    pub fn space_mut(&mut self) -> &mut AddressSpace {
        &mut self.space
    }

    pub fn regions(&self) -> &RegionTable {
        &self.regions
    }

    pub fn config(&self) -> &MmapConfig {
        &self.config
    }

    /// Map `len` bytes of `file` starting at `offset`.
    ///
    /// The region is placed at the first page boundary above both the process
    /// size and every live region, never at page zero. The process size grows
    /// to cover it. `hint` is ignored. Returns the base
    /// address of the new region.
    pub fn mmap(
        &mut self,
        _hint: usize,
        len: usize,
        prot: Prot,
        flags: MapFlags,
        file: &FileHandle,
        offset: u64,
    ) -> VmResult<usize> {
        if len == 0 || len > MAXVA {
            return Err(VmError::InvalidRange);
        }
        if flags.contains(MapFlags::SHARED | MapFlags::PRIVATE) || flags.is_empty() {
            return Err(VmError::InvalidRange);
        }
        if prot.contains(Prot::READ) && !file.readable() {
            warn!("mmap: file not readable");
            return Err(VmError::PermissionDenied);
        }
        if flags.contains(MapFlags::SHARED) && prot.contains(Prot::WRITE) && !file.writable() {
            warn!("mmap: shared writable mapping of a read-only file");
            return Err(VmError::PermissionDenied);
        }
        if self.regions.free_slot().is_none() {
            warn!("mmap: no free region slot");
            return Err(VmError::NoRegionSlot);
        }

        let base = self.placement();
        let npages = page_round_up(len) / PAGE_SIZE;
        let end = base
            .checked_add(npages * PAGE_SIZE)
            .filter(|&end| end <= MAXVA)
            .ok_or(VmError::InvalidRange)?;
        self.declare_range(base, npages)?;
        self.space.set_size(end);

        let region = MappedRegion {
            base,
            len: npages * PAGE_SIZE,
            prot,
            flags,
            file: Arc::clone(file),
            offset,
        };
        self.regions.insert(region)?;
        debug!("mmap: {} pages at {:#x}, offset {}", npages, base, offset);
        Ok(base)
    }

    /// Lowest page boundary above the process size, every live region and
    /// page zero
    fn placement(&self) -> usize {
        let top = self.regions.iter().map(MappedRegion::end).max().unwrap_or(0);
        page_round_up(self.space.size()).max(top).max(PAGE_SIZE)
    }

    fn declare_range(&self, base: usize, npages: usize) -> VmResult<()> {
        let pt = self.space.page_table();
        for i in 0..npages {
            let va = base + i * PAGE_SIZE;
            let declared = pt.declare(va, PteFlags::U);
            if !matches!(declared, Ok(true)) {
                pt.unmap(base, i, false);
                return Err(declared.err().unwrap_or(VmError::InvalidRange));
            }
        }
        Ok(())
    }

    /// Populate the mapped page containing `va` after an access fault.
    ///
    /// Fails with [`VmError::SegmentationFault`] when `va` is not a declared,
    /// still unbacked page of a live region.
    pub fn handle_page_fault(&mut self, va: usize) -> VmResult<()> {
        if va >= MAXVA {
            return Err(VmError::SegmentationFault(va));
        }
        let page = page_round_down(va);
        let pt = self.space.page_table();
        let slot = pt.walk(page, false).map_err(|_| VmError::SegmentationFault(va))?;
        let pte = pt.read_entry(slot);
        if !pte.is_valid() || !pte.is_declared() || pte.frame().is_some() {
            return Err(VmError::SegmentationFault(va));
        }
        let region = self
            .regions
            .find(page)
            .and_then(|index| self.regions.get(index))
            .ok_or(VmError::SegmentationFault(va))?;

        let mem = pt.memory();
        let pa = mem.alloc_frame().ok_or(VmError::NoMemory)?;
        mem.zero_frame(pa);
        let mut contents = vec![0u8; PAGE_SIZE];
        match region.file.read_at(region.file_offset(page), &mut contents) {
            Ok(n) => mem.write(pa, &contents[..n]),
            Err(err) => {
                mem.free_frame(pa);
                warn!("fault at {:#x}: file read failed: {}", va, err);
                return Err(VmError::Io(err));
            }
        }
        pt.write_entry(slot, PageTableEntry::new(pa, pte.flags() | region.prot.pte_flags()));
        trace!("fault at {:#x}: populated page {:#x}", va, page);
        Ok(())
    }

    /// Remove the mapping of `[addr, addr + len)`.
    ///
    /// The range is widened to whole pages and clipped to the region that
    /// contains `addr`; an address outside every region is a no-op. Shared
    /// writable regions are written back first. A failed write-back is
    /// reported as [`VmError::Io`] but the pages are unmapped regardless.
    pub fn munmap(&mut self, addr: usize, len: usize) -> VmResult<()> {
        if len == 0 || len > MAXVA {
            return Err(VmError::InvalidRange);
        }
        let Some(index) = self.regions.find(addr) else {
            return Ok(());
        };
        let Some(region) = self.regions.get(index).cloned() else {
            return Ok(());
        };
        let low = page_round_down(addr);
        let high = page_round_up(addr.saturating_add(len).min(region.end()));
        let interior = low > region.base && high < region.end();
        if interior && self.regions.free_slot().is_none() {
            warn!("munmap: no slot to split region at {:#x}", region.base);
            return Err(VmError::NoRegionSlot);
        }

        let written = if region.writes_back() {
            self.write_back(&region, low, high)
        } else {
            Ok(())
        };

        if low == region.base && high == region.end() {
            self.regions.remove(index);
            debug!("munmap: region at {:#x} removed", region.base);
        } else if interior {
            if let Some(head) = self.regions.get_mut(index) {
                head.len = low - region.base;
            }
            self.regions.insert(region.split_off(high))?;
            debug!("munmap: region at {:#x} split at [{:#x}, {:#x})", region.base, low, high);
        } else if low > region.base {
            if let Some(head) = self.regions.get_mut(index) {
                head.len = low - region.base;
            }
        } else if let Some(tail) = self.regions.get_mut(index) {
            *tail = region.split_off(high);
        }

        self.space
            .page_table()
            .unmap(low, (high - low) / PAGE_SIZE, true);
        written
    }

    /// Write the backed pages of `[low, high)` to the region's file.
    ///
    /// Unbacked pages were never touched and are skipped. A short write ends
    /// the write-back quietly; a failed one is returned.
    fn write_back(&self, region: &MappedRegion, low: usize, high: usize) -> VmResult<()> {
        let pt = self.space.page_table();
        let mem = pt.memory();
        let chunk = self.config.writeback_chunk();
        let mut buf = vec![0u8; chunk];
        let mut va = low;
        while va < high {
            let mut n = 0;
            while n < chunk && va + n < high {
                let a = va + n;
                let page = page_round_down(a);
                let Some(pa) = pt.translate_user(page) else {
                    break;
                };
                let take = (chunk - n).min(page + PAGE_SIZE - a).min(high - a);
                mem.read(pa.add(a - page), &mut buf[n..n + take]);
                n += take;
            }
            if n == 0 {
                va = page_round_down(va) + PAGE_SIZE;
                continue;
            }
            let written = region
                .file
                .write_at(region.file_offset(va), &buf[..n])
                .map_err(|err| {
                    warn!("munmap: write-back at {:#x} failed: {}", va, err);
                    VmError::Io(err)
                })?;
            if written < n {
                warn!("munmap: short write-back at {:#x}", va);
                return Ok(());
            }
            va += n;
        }
        Ok(())
    }

    /// Duplicate the address space and the region table. Each file handle is
    /// duplicated; pages not yet populated stay declared in the child.
    pub fn fork(&self) -> VmResult<ProcessMemory> {
        Ok(ProcessMemory {
            space: self.space.fork()?,
            regions: self.regions.clone(),
            config: self.config,
        })
    }

    /// Unmap every region, writing back shared ones, and free the address
    /// space.
    pub fn exit(mut self) {
        let live: Vec<(usize, usize)> = self.regions.iter().map(|r| (r.base, r.len)).collect();
        for (base, len) in live {
            if let Err(err) = self.munmap(base, len) {
                warn!("exit: unmap of {:#x} failed: {}", base, err);
            }
        }
        self.space.destroy();
    }
}
