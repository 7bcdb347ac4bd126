//! Synchronization primitives for NOS memory subsystems
//!
//! Two kinds of locks are used:
//!
//! - structural locks (`spin::Mutex`) for short bookkeeping sections that
//!   never span I/O;
//! - `Sleeplock` for payloads whose holder may block on I/O. A waiter gives
//!   the processor away through the registered yield hook instead of burning
//!   its time slice.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

pub use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
pub use spin::{Mutex, MutexGuard, Once};

/// Spins between two calls of the yield hook
const SPINS_BEFORE_YIELD: u32 = 64;

static YIELD_HOOK: Once<fn()> = Once::new();

/// Register the scheduler's yield function. Only the first registration
/// takes effect.
pub fn set_yield_hook(hook: fn()) {
    YIELD_HOOK.call_once(|| hook);
}

fn yield_now() {
    match YIELD_HOOK.get() {
        Some(hook) => hook(),
        None => core::hint::spin_loop(),
    }
}

/// Long-term lock whose waiters yield the processor
pub struct Sleeplock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for Sleeplock<T> {}
unsafe impl<T: ?Sized + Send> Send for Sleeplock<T> {}

impl<T> Sleeplock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Sleeplock<T> {
    /// Acquire the sleeplock, yielding while another holder has it
    pub fn lock(&self) -> SleeplockGuard<'_, T> {
        let mut spin_count = 0;
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
            spin_count += 1;
            if spin_count >= SPINS_BEFORE_YIELD {
                yield_now();
                spin_count = 0;
            }
        }
        SleeplockGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<SleeplockGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SleeplockGuard { lock: self })
        } else {
            None
        }
    }

    /// Check if the lock is currently held
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

pub struct SleeplockGuard<'a, T: ?Sized> {
    lock: &'a Sleeplock<T>,
}

impl<T: ?Sized> Deref for SleeplockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard exists only while `locked` is set by us.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SleeplockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard exists only while `locked` is set by us.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SleeplockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
