//! Physical memory management module
//!
//! Page-table nodes and user pages both live in physical frames handed out by
//! an injected allocator. [`PhysMemory`] is the contract the rest of the crate
//! programs against; [`FrameArena`] is a fixed pool of frames implementing it.

use alloc::boxed::Box;
use alloc::vec::Vec;
use spin::Mutex;
use static_assertions::const_assert_eq;

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;
/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

const_assert_eq!(1 << PAGE_SHIFT, PAGE_SIZE);

/// Byte written over a frame when it is handed out
const ALLOC_JUNK: u8 = 0x05;
/// Byte written over a frame when it is returned
const FREE_JUNK: u8 = 0x01;

/// Align address down to page boundary
#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Align address up to page boundary
#[inline]
pub const fn page_round_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// A physical address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(pub usize);

impl PhysAddr {
    /// Creates a new physical address from a raw usize value.
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the physical address as a raw usize value.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the offset within the current page.
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Checks if the physical address is page-aligned.
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Rounds down the physical address to the previous page boundary.
    pub const fn page_round_down(self) -> Self {
        Self(page_round_down(self.0))
    }

    /// Returns the address `bytes` further on.
    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }
}

/// Opaque allocator of page-aligned physical frames
pub trait FrameAllocator: Send + Sync {
    /// Allocate one frame. Contents are unspecified.
    fn alloc_frame(&self) -> Option<PhysAddr>;

    /// Return a frame obtained from [`FrameAllocator::alloc_frame`]
    fn free_frame(&self, pa: PhysAddr);
}

/// Access to physical memory.
///
/// Every access stays inside one frame: `pa.page_offset() + len` must not
/// exceed `PAGE_SIZE`.
pub trait PhysMemory: FrameAllocator {
    fn read(&self, pa: PhysAddr, buf: &mut [u8]);

    fn write(&self, pa: PhysAddr, data: &[u8]);

    fn fill(&self, pa: PhysAddr, value: u8, len: usize);

    /// Duplicate the whole frame `src` into `dst`
    fn copy_frame(&self, src: PhysAddr, dst: PhysAddr) {
        let mut page = [0u8; PAGE_SIZE];
        self.read(src, &mut page);
        self.write(dst, &page);
    }

    fn zero_frame(&self, pa: PhysAddr) {
        self.fill(pa, 0, PAGE_SIZE);
    }

    fn read_u64(&self, pa: PhysAddr) -> u64 {
        let mut raw = [0u8; 8];
        self.read(pa, &mut raw);
        u64::from_le_bytes(raw)
    }

    fn write_u64(&self, pa: PhysAddr, value: u64) {
        self.write(pa, &value.to_le_bytes());
    }
}

type Frame = [u8; PAGE_SIZE];

/// Fixed pool of physical frames starting at `base`.
///
/// `base` must be non-zero and page-aligned, so a zero frame number never
/// names a real frame.
pub struct FrameArena {
    base: usize,
    frames: Vec<Mutex<Box<Frame>>>,
    free_list: Mutex<Vec<usize>>,
}

impl FrameArena {
    /// Create an arena of `nframes` frames starting at physical address `base`
    pub fn new(base: usize, nframes: usize) -> Self {
        assert!(base != 0 && base % PAGE_SIZE == 0, "frame arena: bad base {:#x}", base);
        let frames = (0..nframes)
            .map(|_| Mutex::new(Box::new([FREE_JUNK; PAGE_SIZE])))
            .collect();
        // Lowest frame numbers are handed out first.
        let free_list = (0..nframes).rev().collect();
        log::debug!("frame arena: {} frames at {:#x}", nframes, base);
        Self {
            base,
            frames,
            free_list: Mutex::new(free_list),
        }
    }

    /// Number of frames currently free
    pub fn free_frames(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Total number of frames in the arena
    pub fn total_frames(&self) -> usize {
        self.frames.len()
    }

    fn index_of(&self, pa: PhysAddr) -> usize {
        let addr = pa.page_round_down().as_usize();
        if addr < self.base || addr >= self.base + self.frames.len() * PAGE_SIZE {
            panic!("frame arena: {:#x} out of range", pa.as_usize());
        }
        (addr - self.base) >> PAGE_SHIFT
    }

    fn frame(&self, pa: PhysAddr, len: usize) -> (&Mutex<Box<Frame>>, usize) {
        let offset = pa.page_offset();
        assert!(offset + len <= PAGE_SIZE, "frame arena: access crosses a frame");
        (&self.frames[self.index_of(pa)], offset)
    }
}

impl FrameAllocator for FrameArena {
    fn alloc_frame(&self) -> Option<PhysAddr> {
        let index = self.free_list.lock().pop()?;
        self.frames[index].lock().fill(ALLOC_JUNK);
        Some(PhysAddr::new(self.base + index * PAGE_SIZE))
    }

    fn free_frame(&self, pa: PhysAddr) {
        if !pa.is_page_aligned() {
            panic!("free_frame: {:#x} not aligned", pa.as_usize());
        }
        let index = self.index_of(pa);
        self.frames[index].lock().fill(FREE_JUNK);
        self.free_list.lock().push(index);
    }
}

impl PhysMemory for FrameArena {
    fn read(&self, pa: PhysAddr, buf: &mut [u8]) {
        let (frame, offset) = self.frame(pa, buf.len());
        buf.copy_from_slice(&frame.lock()[offset..offset + buf.len()]);
    }

    fn write(&self, pa: PhysAddr, data: &[u8]) {
        let (frame, offset) = self.frame(pa, data.len());
        frame.lock()[offset..offset + data.len()].copy_from_slice(data);
    }

    fn fill(&self, pa: PhysAddr, value: u8, len: usize) {
        let (frame, offset) = self.frame(pa, len);
        frame.lock()[offset..offset + len].fill(value);
    }

    fn copy_frame(&self, src: PhysAddr, dst: PhysAddr) {
        let page: Frame = **self.frame(src, PAGE_SIZE).0.lock();
        **self.frame(dst, PAGE_SIZE).0.lock() = page;
    }
}
