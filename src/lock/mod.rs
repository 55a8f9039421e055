//! Locking primitives.
//!
//! spec.md §4.1 describes two lock flavors built on one raw mutual-exclusion
//! contract: spinlocks (busy-wait, never slept across) and sleeplocks
//! (blocking, may be held across voluntary suspension). Both are expressed
//! here as `Lock<R, T>` for a raw lock strategy `R: RawLock`, mirroring the
//! split the teacher kernel uses between `RawSpinlock`/`RawSleeplock` and a
//! shared `Lock`/`Guard` wrapper — we just implement the raw strategies on
//! top of `std::sync` instead of a hand-rolled atomic-exchange loop, since
//! the actual CPU spin-wait is part of the hardware boundary this crate
//! does not model (spec.md §1).

pub mod sleeplock;
pub mod spinlock;

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

pub use sleeplock::Sleeplock;
pub use spinlock::Spinlock;

/// A raw mutual-exclusion strategy. `acquire`/`release` must nest correctly
/// with whatever external bookkeeping (cli depth, owning pid, ...) the
/// concrete strategy keeps.
pub trait RawLock {
    fn acquire(&self);
    fn release(&self);
    fn holding(&self) -> bool;
}

/// A lock guarding `T` with raw strategy `R`.
pub struct Lock<R: RawLock, T> {
    pub(crate) raw: R,
    data: UnsafeCell<T>,
    name: &'static str,
}

unsafe impl<R: RawLock + Sync, T: Send> Sync for Lock<R, T> {}
unsafe impl<R: RawLock + Send, T: Send> Send for Lock<R, T> {}

impl<R: RawLock, T> Lock<R, T> {
    pub const fn new(name: &'static str, raw: R, data: T) -> Self {
        Self {
            raw,
            data: UnsafeCell::new(data),
            name,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn lock(&self) -> Guard<'_, R, T> {
        self.raw.acquire();
        Guard { lock: self }
    }

    pub fn holding(&self) -> bool {
        self.raw.holding()
    }

    /// Escape hatch for code that must reach the data while already holding
    /// the raw lock by some other means (e.g. a condition variable wait that
    /// re-acquired it). Caller must guarantee the raw lock is held.
    pub unsafe fn data_unchecked(&self) -> *mut T {
        self.data.get()
    }
}

pub struct Guard<'s, R: RawLock, T> {
    lock: &'s Lock<R, T>,
}

impl<R: RawLock, T> Deref for Guard<'_, R, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<R: RawLock, T> DerefMut for Guard<'_, R, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<R: RawLock, T> Drop for Guard<'_, R, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

impl<'s, R: RawLock, T> Guard<'s, R, T> {
    pub fn lock_ref(&self) -> &'s Lock<R, T> {
        self.lock
    }
}
