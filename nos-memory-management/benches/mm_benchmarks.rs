//! Memory management benchmarks

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use nos_api::{File, FileHandle};
use nos_memory_management::{
    copy_in, copy_out, AddressSpace, FrameArena, MapFlags, MmapConfig, ProcessMemory, Prot,
    PAGE_SIZE,
};

const BASE: usize = 0x8000_0000;

struct Pattern;

impl File for Pattern {
    fn readable(&self) -> bool {
        true
    }

    fn writable(&self) -> bool {
        true
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> nos_api::Result<usize> {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = (offset as usize + i) as u8;
        }
        Ok(buf.len())
    }

    fn write_at(&self, _offset: u64, buf: &[u8]) -> nos_api::Result<usize> {
        Ok(buf.len())
    }
}

fn bench_grow_and_destroy(c: &mut Criterion) {
    let arena = Arc::new(FrameArena::new(BASE, 256));
    c.bench_function("address_space_grow_64_pages", |b| {
        b.iter(|| {
            let mut space = AddressSpace::new(arena.clone()).unwrap();
            space.grow(black_box(64 * PAGE_SIZE)).unwrap();
            space.destroy();
        })
    });
}

fn bench_fork(c: &mut Criterion) {
    let arena = Arc::new(FrameArena::new(BASE, 256));
    let mut parent = AddressSpace::new(arena.clone()).unwrap();
    parent.grow(32 * PAGE_SIZE).unwrap();
    c.bench_function("address_space_fork_32_pages", |b| {
        b.iter(|| parent.fork().unwrap().destroy())
    });
}

fn bench_user_copy(c: &mut Criterion) {
    let arena = Arc::new(FrameArena::new(BASE, 64));
    let mut space = AddressSpace::new(arena).unwrap();
    space.grow(8 * PAGE_SIZE).unwrap();
    let data = vec![0x5au8; 4 * PAGE_SIZE];
    let mut back = vec![0u8; 4 * PAGE_SIZE];
    c.bench_function("copy_out_in_16k_unaligned", |b| {
        b.iter(|| {
            copy_out(space.page_table(), black_box(123), &data).unwrap();
            copy_in(space.page_table(), &mut back, black_box(123)).unwrap();
        })
    });
}

fn bench_mmap_fault_munmap(c: &mut Criterion) {
    let arena = Arc::new(FrameArena::new(BASE, 128));
    let file: FileHandle = Arc::new(Pattern);
    c.bench_function("mmap_fault_munmap_16_pages", |b| {
        b.iter(|| {
            let mut pm = ProcessMemory::new(arena.clone(), MmapConfig::default()).unwrap();
            let base = pm
                .mmap(0, 16 * PAGE_SIZE, Prot::READ | Prot::WRITE, MapFlags::SHARED, &file, 0)
                .unwrap();
            for page in 0..16 {
                pm.handle_page_fault(base + page * PAGE_SIZE).unwrap();
            }
            pm.munmap(black_box(base), 16 * PAGE_SIZE).unwrap();
            pm.exit();
        })
    });
}

criterion_group!(
    benches,
    bench_grow_and_destroy,
    bench_fork,
    bench_user_copy,
    bench_mmap_fault_munmap
);

criterion_main!(benches);
