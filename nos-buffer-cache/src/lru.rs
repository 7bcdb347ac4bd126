//! Intrusive recency lists over a fixed slot array
//!
//! Every slot sits on exactly one circular list. List `k` has a sentinel at
//! index `nslots + k`; `next` of the sentinel is the most recently used slot,
//! `prev` the least recently used one. Links are atomics so a slot can be
//! moved between lists while both owning shard locks are held; every link
//! change happens under the lock of each list it touches.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicUsize, Ordering};

pub(crate) struct LruLists {
    nslots: usize,
    prev: Box<[AtomicUsize]>,
    next: Box<[AtomicUsize]>,
}

impl LruLists {
    /// `nslots` slots, all unlinked, and `nlists` empty lists
    pub(crate) fn new(nslots: usize, nlists: usize) -> Self {
        // Every node starts out linked to itself.
        let links = || -> Box<[AtomicUsize]> { (0..nslots + nlists).map(AtomicUsize::new).collect() };
        Self {
            nslots,
            prev: links(),
            next: links(),
        }
    }

    fn head(&self, list: usize) -> usize {
        self.nslots + list
    }

    fn link(&self, prev: usize, next: usize) {
        self.next[prev].store(next, Ordering::Relaxed);
        self.prev[next].store(prev, Ordering::Relaxed);
    }

    /// Insert `slot` at the most recently used end of `list`
    pub(crate) fn push_front(&self, list: usize, slot: usize) {
        let head = self.head(list);
        let first = self.next[head].load(Ordering::Relaxed);
        self.link(slot, first);
        self.link(head, slot);
    }

    /// Unlink `slot` from whatever list holds it
    pub(crate) fn remove(&self, slot: usize) {
        let prev = self.prev[slot].load(Ordering::Relaxed);
        let next = self.next[slot].load(Ordering::Relaxed);
        self.link(prev, next);
        self.link(slot, slot);
    }

    pub(crate) fn move_to_front(&self, list: usize, slot: usize) {
        self.remove(slot);
        self.push_front(list, slot);
    }

    /// Slots of `list`, most recently used first
    pub(crate) fn iter_mru(&self, list: usize) -> impl Iterator<Item = usize> + '_ {
        let head = self.head(list);
        let mut cur = head;
        core::iter::from_fn(move || {
            cur = self.next[cur].load(Ordering::Relaxed);
            (cur != head).then_some(cur)
        })
    }

    /// Slots of `list`, least recently used first
    pub(crate) fn iter_lru(&self, list: usize) -> impl Iterator<Item = usize> + '_ {
        let head = self.head(list);
        let mut cur = head;
        core::iter::from_fn(move || {
            cur = self.prev[cur].load(Ordering::Relaxed);
            (cur != head).then_some(cur)
        })
    }
}
