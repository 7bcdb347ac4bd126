//! Common test utilities
//!
//! An in-memory file and helpers shared by the memory integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use nos_api::{File, FileHandle};
use nos_memory_management::{FrameArena, PhysMemory, ProcessMemory, MmapConfig, PAGE_SIZE};
use spin::Mutex;

pub const ARENA_BASE: usize = 0x8000_0000;

/// File backed by a byte vector that grows on write
pub struct MemFile {
    data: Mutex<Vec<u8>>,
    readable: bool,
    writable: bool,
}

impl MemFile {
    pub fn new(data: &[u8], readable: bool, writable: bool) -> Arc<MemFile> {
        Arc::new(MemFile {
            data: Mutex::new(data.to_vec()),
            readable,
            writable,
        })
    }

    /// Current contents, as seen by reopening the file
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl File for MemFile {
    fn readable(&self) -> bool {
        self.readable
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> nos_api::Result<usize> {
        let data = self.data.lock();
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> nos_api::Result<usize> {
        let mut data = self.data.lock();
        let end = offset as usize + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(buf);
        Ok(buf.len())
    }
}

pub fn handle(file: &Arc<MemFile>) -> FileHandle {
    file.clone()
}

pub fn arena(nframes: usize) -> Arc<FrameArena> {
    Arc::new(FrameArena::new(ARENA_BASE, nframes))
}

/// A process whose heap already covers `heap` bytes
pub fn process(arena: &Arc<FrameArena>, heap: usize) -> ProcessMemory {
    let mut pm = ProcessMemory::new(arena.clone(), MmapConfig::default()).unwrap();
    pm.space_mut().grow(heap).unwrap();
    pm
}

/// Read user memory through the page table, faulting mapped pages in
pub fn read_user(pm: &mut ProcessMemory, va: usize, buf: &mut [u8]) {
    touch(pm, va, buf.len());
    nos_memory_management::copy_in(pm.space().page_table(), buf, va).unwrap();
}

/// Write user memory through the page table, faulting mapped pages in
pub fn write_user(pm: &mut ProcessMemory, va: usize, data: &[u8]) {
    touch(pm, va, data.len());
    nos_memory_management::copy_out(pm.space().page_table(), va, data).unwrap();
}

fn touch(pm: &mut ProcessMemory, va: usize, len: usize) {
    let first = va & !(PAGE_SIZE - 1);
    for page in (first..va + len).step_by(PAGE_SIZE) {
        if pm.space().page_table().translate_user(page).is_none() {
            pm.handle_page_fault(page).unwrap();
        }
    }
}

/// Whether two frames hold identical bytes
pub fn same_contents(mem: &dyn PhysMemory, a: nos_memory_management::PhysAddr, b: nos_memory_management::PhysAddr) -> bool {
    let (mut x, mut y) = ([0u8; PAGE_SIZE], [0u8; PAGE_SIZE]);
    mem.read(a, &mut x);
    mem.read(b, &mut y);
    x == y
}
