//! Sharded block buffer cache
//!
//! A fixed pool of block-sized buffers, split into shards by a hash of
//! `(dev, blockno)`. Each shard owns a recency list of slots and a spin lock
//! guarding that list and the bookkeeping of its slots (identity, validity,
//! reference count). Block contents sit behind a per-slot [`Sleeplock`], held
//! by whoever got the buffer from [`BufferCache::read`].
//!
//! Lock order: a shard lock is never held while waiting for a sleeplock.
//! A miss first recycles a free slot of its own shard. Only when there is
//! none does it drop the shard lock and take a cache-wide eviction lock
//! before locking the shard again, so at most one thread ever holds two
//! shard locks at a time.
//!
//! A [`BufGuard`] exists only while its slot is locked, so writing or
//! releasing a buffer the caller does not hold cannot be expressed.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use log::{debug, trace};
use nos_api::{BlockDevice, Sleeplock, SleeplockGuard, BSIZE};
use spin::{Mutex, Once};

use crate::config::CacheConfig;
use crate::hash::bucket;
use crate::lru::LruLists;

/// Device id of a slot that has never held a block
const NO_DEV: u32 = u32::MAX;

struct Slot {
    dev: AtomicU32,
    blockno: AtomicU32,
    valid: AtomicBool,
    refcnt: AtomicU32,
    data: Sleeplock<[u8; BSIZE]>,
}

impl Slot {
    fn new() -> Self {
        Self {
            dev: AtomicU32::new(NO_DEV),
            blockno: AtomicU32::new(0),
            valid: AtomicBool::new(false),
            refcnt: AtomicU32::new(0),
            data: Sleeplock::new([0; BSIZE]),
        }
    }

    fn holds(&self, dev: u32, blockno: u32) -> bool {
        self.dev.load(Ordering::Relaxed) == dev && self.blockno.load(Ordering::Relaxed) == blockno
    }
}

/// Counters of one shard
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that found the block already cached
    pub hits: u64,
    /// Lookups that had to recycle a slot
    pub misses: u64,
    /// Slots taken over from another shard
    pub steals: u64,
}

impl CacheStats {
    fn merge(self, other: CacheStats) -> CacheStats {
        CacheStats {
            hits: self.hits + other.hits,
            misses: self.misses + other.misses,
            steals: self.steals + other.steals,
        }
    }
}

/// Block buffer cache over one block device
pub struct BufferCache {
    config: CacheConfig,
    device: Box<dyn BlockDevice>,
    slots: Box<[Slot]>,
    shards: Box<[Mutex<CacheStats>]>,
    lru: LruLists,
    evict: Mutex<()>,
}

impl BufferCache {
    /// Build the pool. Slots are dealt round-robin onto the shards.
    pub fn new(config: CacheConfig, device: Box<dyn BlockDevice>) -> Self {
        let slots: Vec<Slot> = (0..config.nbuf).map(|_| Slot::new()).collect();
        let shards: Vec<Mutex<CacheStats>> =
            (0..config.nbucket).map(|_| Mutex::new(CacheStats::default())).collect();
        let lru = LruLists::new(config.nbuf, config.nbucket);
        for slot in 0..config.nbuf {
            lru.push_front(slot % config.nbucket, slot);
        }
        debug!("bcache: {} buffers in {} shards", config.nbuf, config.nbucket);
        Self {
            config,
            device,
            slots: slots.into_boxed_slice(),
            shards: shards.into_boxed_slice(),
            lru,
            evict: Mutex::new(()),
        }
    }

    pub fn config(&self) -> CacheConfig {
        self.config
    }

    fn shard_of(&self, dev: u32, blockno: u32) -> usize {
        bucket(dev, blockno, self.config.nbucket)
    }

    /// Slot of `list` currently naming `(dev, blockno)`. Caller holds the
    /// shard lock.
    fn lookup(&self, list: usize, dev: u32, blockno: u32) -> Option<usize> {
        self.lru.iter_mru(list).find(|&slot| self.slots[slot].holds(dev, blockno))
    }

    /// Least recently used unreferenced slot of `list`. Caller holds the
    /// shard lock.
    fn unreferenced(&self, list: usize) -> Option<usize> {
        self.lru
            .iter_lru(list)
            .find(|&slot| self.slots[slot].refcnt.load(Ordering::Relaxed) == 0)
    }

    /// Take a reference on the slot for `(dev, blockno)`, recycling a free
    /// slot on a miss. The returned slot is not locked yet.
    fn get(&self, dev: u32, blockno: u32) -> usize {
        let id = self.shard_of(dev, blockno);
        {
            let mut stats = self.shards[id].lock();
            if let Some(slot) = self.lookup(id, dev, blockno) {
                self.slots[slot].refcnt.fetch_add(1, Ordering::Relaxed);
                stats.hits += 1;
                return slot;
            }
            if let Some(slot) = self.unreferenced(id) {
                stats.misses += 1;
                self.claim(slot, dev, blockno);
                return slot;
            }
        }

        let _evict = self.evict.lock();
        let mut stats = self.shards[id].lock();
        // Someone else may have brought the block in meanwhile.
        if let Some(slot) = self.lookup(id, dev, blockno) {
            self.slots[slot].refcnt.fetch_add(1, Ordering::Relaxed);
            stats.hits += 1;
            return slot;
        }
        stats.misses += 1;
        let slot = match self.unreferenced(id) {
            Some(slot) => slot,
            None => self.steal(id, &mut stats),
        };
        self.claim(slot, dev, blockno);
        slot
    }

    /// Rename an unreferenced slot to `(dev, blockno)` with one reference.
    /// Caller holds the lock of the shard listing it.
    fn claim(&self, slot: usize, dev: u32, blockno: u32) {
        let s = &self.slots[slot];
        s.dev.store(dev, Ordering::Relaxed);
        s.blockno.store(blockno, Ordering::Relaxed);
        s.valid.store(false, Ordering::Relaxed);
        s.refcnt.store(1, Ordering::Relaxed);
    }

    /// Move a free slot from some other shard into shard `id`, visiting the
    /// shards after `id` in order. Holds at most one foreign shard lock.
    fn steal(&self, id: usize, stats: &mut CacheStats) -> usize {
        let n = self.config.nbucket;
        for victim in (1..n).map(|k| (id + k) % n) {
            let _victim_lock = self.shards[victim].lock();
            if let Some(slot) = self.unreferenced(victim) {
                self.lru.move_to_front(id, slot);
                stats.steals += 1;
                trace!("bcache: slot {} moved from shard {} to {}", slot, victim, id);
                return slot;
            }
        }
        panic!("bget: no buffers");
    }

    /// Lock the payload of a referenced slot
    fn hold(&self, slot: usize, dev: u32, blockno: u32) -> BufGuard<'_> {
        BufGuard {
            cache: self,
            slot,
            dev,
            blockno,
            data: Some(self.slots[slot].data.lock()),
        }
    }

    /// Return the buffer for block `blockno` of `dev`, locked, with its
    /// contents read from the device if they were not cached.
    pub fn read(&self, dev: u32, blockno: u32) -> BufGuard<'_> {
        let slot = self.get(dev, blockno);
        let mut buf = self.hold(slot, dev, blockno);
        let s = &self.slots[slot];
        if !s.valid.load(Ordering::Acquire) {
            self.device.read_block(dev, blockno, &mut buf[..]);
            s.valid.store(true, Ordering::Release);
        }
        buf
    }

    /// Write the buffer's contents to the device
    pub fn write(&self, buf: &BufGuard<'_>) {
        self.device.write_block(buf.dev, buf.blockno, &buf[..]);
    }

    /// Unlock the buffer and drop the caller's reference
    pub fn release(&self, buf: BufGuard<'_>) {
        drop(buf);
    }

    /// Keep the buffer's slot from being recycled after release
    pub fn pin(&self, buf: &BufGuard<'_>) -> PinnedBuf {
        let _shard = self.shards[self.shard_of(buf.dev, buf.blockno)].lock();
        self.slots[buf.slot].refcnt.fetch_add(1, Ordering::Relaxed);
        PinnedBuf {
            slot: buf.slot,
            dev: buf.dev,
            blockno: buf.blockno,
        }
    }

    pub fn unpin(&self, pin: PinnedBuf) {
        let _shard = self.shards[self.shard_of(pin.dev, pin.blockno)].lock();
        let refcnt = &self.slots[pin.slot].refcnt;
        if refcnt.load(Ordering::Relaxed) == 0 {
            panic!("bunpin: refcnt");
        }
        refcnt.fetch_sub(1, Ordering::Relaxed);
    }

    fn unref(&self, slot: usize, dev: u32, blockno: u32) {
        let id = self.shard_of(dev, blockno);
        let _shard = self.shards[id].lock();
        let refcnt = &self.slots[slot].refcnt;
        if refcnt.load(Ordering::Relaxed) == 0 {
            panic!("brelse: refcnt");
        }
        if refcnt.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.lru.move_to_front(id, slot);
        }
    }

    /// Reference count of the slot naming `(dev, blockno)`, if any
    pub fn refcnt(&self, dev: u32, blockno: u32) -> Option<u32> {
        let id = self.shard_of(dev, blockno);
        let _shard = self.shards[id].lock();
        self.lookup(id, dev, blockno)
            .map(|slot| self.slots[slot].refcnt.load(Ordering::Relaxed))
    }

    /// Whether the contents of `(dev, blockno)` are in memory
    pub fn is_cached(&self, dev: u32, blockno: u32) -> bool {
        let id = self.shard_of(dev, blockno);
        let _shard = self.shards[id].lock();
        self.lookup(id, dev, blockno)
            .is_some_and(|slot| self.slots[slot].valid.load(Ordering::Acquire))
    }

    /// Counters summed over all shards
    pub fn stats(&self) -> CacheStats {
        self.shards
            .iter()
            .map(|shard| *shard.lock())
            .fold(CacheStats::default(), CacheStats::merge)
    }

    pub fn shard_stats(&self, shard: usize) -> CacheStats {
        *self.shards[shard].lock()
    }
}

/// A locked, referenced buffer. Dropping it releases the buffer.
pub struct BufGuard<'a> {
    cache: &'a BufferCache,
    slot: usize,
    dev: u32,
    blockno: u32,
    data: Option<SleeplockGuard<'a, [u8; BSIZE]>>,
}

impl BufGuard<'_> {
    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    /// Index of the pool slot behind this buffer
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Always true for a live guard: the slot lock is held from
    /// [`BufferCache::read`] until the guard is dropped.
    pub fn holding(&self) -> bool {
        self.data.is_some()
    }
}

impl Deref for BufGuard<'_> {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &Self::Target {
        match &self.data {
            Some(data) => &**data,
            None => panic!("buf: not held"),
        }
    }
}

impl DerefMut for BufGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.data {
            Some(data) => &mut **data,
            None => panic!("buf: not held"),
        }
    }
}

impl Drop for BufGuard<'_> {
    fn drop(&mut self) {
        if self.data.take().is_none() {
            panic!("brelse: not held");
        }
        self.cache.unref(self.slot, self.dev, self.blockno);
    }
}

/// Extra reference on a buffer slot, taken with [`BufferCache::pin`]
#[must_use = "a pinned buffer is never recycled until unpinned"]
#[derive(Debug)]
pub struct PinnedBuf {
    slot: usize,
    dev: u32,
    blockno: u32,
}

static BCACHE: Once<BufferCache> = Once::new();

/// Set up the process-wide cache. Later calls keep the first instance.
pub fn init(config: CacheConfig, device: Box<dyn BlockDevice>) -> &'static BufferCache {
    BCACHE.call_once(|| BufferCache::new(config, device))
}

/// The process-wide cache
pub fn bcache() -> &'static BufferCache {
    match BCACHE.get() {
        Some(cache) => cache,
        None => panic!("bcache: not initialized"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[derive(Default)]
    struct Disk {
        reads: AtomicUsize,
        writes: AtomicUsize,
    }

    struct SharedDisk(Arc<Disk>);

    impl BlockDevice for SharedDisk {
        fn read_block(&self, _dev: u32, blockno: u32, buf: &mut [u8]) {
            self.0.reads.fetch_add(1, Ordering::SeqCst);
            buf.fill(blockno as u8);
        }

        fn write_block(&self, _dev: u32, _blockno: u32, _buf: &[u8]) {
            self.0.writes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn cache(nbuf: usize, nbucket: usize) -> (Arc<Disk>, BufferCache) {
        let disk = Arc::new(Disk::default());
        let config = CacheConfig::new(nbuf, nbucket).unwrap();
        (disk.clone(), BufferCache::new(config, Box::new(SharedDisk(disk))))
    }

    /// Blocks of device 1 that hash to shard `shard`
    fn blocks_in(shard: usize, nbucket: usize) -> impl Iterator<Item = u32> {
        (0..).filter(move |&b| bucket(1, b, nbucket) == shard)
    }

    #[test]
    fn test_read_hit_and_miss() {
        let (disk, cache) = cache(4, 2);
        let buf = cache.read(1, 3);
        assert_eq!(buf[0], 3);
        assert!(buf.holding());
        cache.release(buf);
        assert_eq!(cache.refcnt(1, 3), Some(0));

        let buf = cache.read(1, 3);
        assert_eq!(buf[BSIZE - 1], 3);
        drop(buf);
        assert_eq!(disk.reads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1, steals: 0 });
    }

    #[test]
    fn test_write_reaches_device() {
        let (disk, cache) = cache(4, 2);
        let mut buf = cache.read(1, 9);
        buf[0] = 42;
        cache.write(&buf);
        drop(buf);
        assert_eq!(disk.writes.load(Ordering::SeqCst), 1);
        // The modified contents stay cached.
        assert_eq!(cache.read(1, 9)[0], 42);
    }

    #[test]
    fn test_release_makes_slot_most_recent() {
        let (_disk, cache) = cache(3, 1);
        for b in 0..3 {
            drop(cache.read(1, b));
        }
        // Touch block 0 again so block 1 is now the longest idle.
        drop(cache.read(1, 0));
        drop(cache.read(1, 7));
        assert!(cache.is_cached(1, 0));
        assert!(!cache.is_cached(1, 1));
        assert!(cache.is_cached(1, 2));
        assert!(cache.is_cached(1, 7));
    }

    #[test]
    fn test_steal_from_other_shard() {
        let (_disk, cache) = cache(4, 2);
        let mut blocks = blocks_in(0, 2);
        let held: Vec<_> = (0..3).map(|_| cache.read(1, blocks.next().unwrap())).collect();
        assert_eq!(cache.shard_stats(0).steals, 1);
        assert_eq!(cache.shard_stats(1), CacheStats::default());
        drop(held);

        // Shard 1 still has its other slot.
        let other = blocks_in(1, 2).next().unwrap();
        drop(cache.read(1, other));
        assert_eq!(cache.shard_stats(1).steals, 0);
    }

    #[test]
    fn test_local_miss_skips_eviction_lock() {
        let (disk, cache) = cache(4, 2);
        let cache = Arc::new(cache);
        let evicting = cache.evict.lock();
        let (tx, rx) = std::sync::mpsc::channel();
        let reader = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                let block = blocks_in(1, 2).next().unwrap();
                drop(cache.read(1, block));
                tx.send(block).unwrap();
            })
        };
        let block = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        drop(evicting);
        reader.join().unwrap();
        assert!(cache.is_cached(1, block));
        assert_eq!(disk.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pin_survives_release() {
        let (_disk, cache) = cache(2, 1);
        let buf = cache.read(1, 1);
        let pin = cache.pin(&buf);
        drop(buf);
        assert_eq!(cache.refcnt(1, 1), Some(1));
        drop(cache.read(1, 2));
        drop(cache.read(1, 3));
        // Block 2 was recycled, the pinned block was not.
        assert!(cache.is_cached(1, 1));
        assert!(!cache.is_cached(1, 2));
        cache.unpin(pin);
        assert_eq!(cache.refcnt(1, 1), Some(0));
    }

    #[test]
    #[should_panic(expected = "bget: no buffers")]
    fn test_exhaustion_is_fatal() {
        let (_disk, cache) = cache(2, 2);
        let a = cache.read(1, 1);
        let b = cache.read(1, 2);
        let _pins = (cache.pin(&a), cache.pin(&b));
        drop((a, b));
        let _ = cache.read(1, 3);
    }
}
