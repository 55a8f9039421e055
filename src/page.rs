//! Physical page allocator (spec.md §4.2).
//!
//! Physical memory is modeled as a dense arena of `PGSIZE` frames
//! (spec.md §9's "arena allocation with dense indices") rather than raw
//! pointers into real DRAM, since nothing below the frame boundary (DRAM
//! controller bring-up, e820 maps, ...) is in scope (spec.md §1). Free
//! frames are threaded into a singly-linked free list *through the frame
//! contents themselves*, exactly as spec.md describes: a frame's first four
//! bytes hold the index of the next free frame once it is freed.

use crate::error::{Error, KResult};
use crate::lock::Spinlock;
use crate::param::PGSIZE;
use std::sync::atomic::{AtomicBool, Ordering};

/// Dense index of a physical frame.
pub type Pfn = u32;

const NONE: Pfn = u32::MAX;

/// One physical frame.
pub type Frame = [u8; PGSIZE];

struct FreeList {
    frames: Vec<Frame>,
    head: Pfn,
}

impl FreeList {
    fn push(&mut self, pfn: Pfn) {
        let frame = &mut self.frames[pfn as usize];
        // Catch use-after-free: scrub before threading the free list
        // pointer through the first word (spec.md §4.2).
        frame.fill(0x01);
        frame[0..4].copy_from_slice(&self.head.to_le_bytes());
        self.head = pfn;
    }

    fn pop(&mut self) -> Option<Pfn> {
        if self.head == NONE {
            return None;
        }
        let pfn = self.head;
        let next = u32::from_le_bytes(self.frames[pfn as usize][0..4].try_into().unwrap());
        self.head = next;
        Some(pfn)
    }
}

/// The kernel physical-page allocator.
///
/// `lock_enabled` mirrors spec.md §4.2's two-phase initialization: frames
/// freed via [`Kmem::kinit1`] are not protected by the allocator spinlock
/// (boot is single-threaded up to that point), `kinit2` admits the rest of
/// memory and flips the flag. We route both phases through the same
/// `Spinlock` for simplicity — uncontended acquisition is cheap and this
/// keeps a single code path — but still expose the two entry points and the
/// flag so callers and tests can observe the phase distinction spec.md
/// requires.
pub struct Kmem {
    free: Spinlock<FreeList>,
    lock_enabled: AtomicBool,
    npages: usize,
}

impl Kmem {
    /// Creates an allocator over `npages` frames, all initially *not*
    /// on the free list (as if owned by the kernel image / boot tables).
    pub fn new(npages: usize) -> Self {
        Self {
            free: Spinlock::new(
                "kmem",
                FreeList {
                    frames: vec![[0u8; PGSIZE]; npages],
                    head: NONE,
                },
            ),
            lock_enabled: AtomicBool::new(false),
            npages,
        }
    }

    pub fn npages(&self) -> usize {
        self.npages
    }

    /// Early phase: admit `[start, end)` to the free list before the
    /// allocator lock is considered enabled.
    pub fn kinit1(&self, start: Pfn, end: Pfn) {
        let mut g = self.free.lock();
        for pfn in start..end {
            g.push(pfn);
        }
    }

    /// Late phase: admit the remaining frames and enable the lock.
    pub fn kinit2(&self, start: Pfn, end: Pfn) {
        {
            let mut g = self.free.lock();
            for pfn in start..end {
                g.push(pfn);
            }
        }
        self.lock_enabled.store(true, Ordering::Release);
    }

    pub fn lock_enabled(&self) -> bool {
        self.lock_enabled.load(Ordering::Acquire)
    }

    /// Allocates one physical frame. Fails (does not panic) on exhaustion —
    /// spec.md §7 classes this as a surfaced failure, since running out of
    /// user memory is expected in normal operation.
    pub fn kalloc(&self) -> KResult<Pfn> {
        self.free.lock().pop().ok_or(Error::OutOfMemory)
    }

    /// Frees a previously allocated frame back to the pool.
    pub fn kfree(&self, pfn: Pfn) {
        assert!((pfn as usize) < self.npages, "kfree: out of range");
        self.free.lock().push(pfn);
    }

    /// Runs `f` with read access to a frame's bytes.
    pub fn with_frame<R>(&self, pfn: Pfn, f: impl FnOnce(&Frame) -> R) -> R {
        let g = self.free.lock();
        f(&g.frames[pfn as usize])
    }

    /// Runs `f` with mutable access to a frame's bytes.
    pub fn with_frame_mut<R>(&self, pfn: Pfn, f: impl FnOnce(&mut Frame) -> R) -> R {
        let mut g = self.free.lock();
        f(&mut g.frames[pfn as usize])
    }

    /// Number of frames currently on the free list (used by the leak-check
    /// testable property in spec.md §8).
    pub fn free_count(&self) -> usize {
        let g = self.free.lock();
        let mut n = 0;
        let mut cur = g.head;
        while cur != NONE {
            n += 1;
            cur = u32::from_le_bytes(g.frames[cur as usize][0..4].try_into().unwrap());
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_roundtrip() {
        let kmem = Kmem::new(16);
        kmem.kinit1(0, 16);
        assert_eq!(kmem.free_count(), 16);
        let a = kmem.kalloc().unwrap();
        let b = kmem.kalloc().unwrap();
        assert_ne!(a, b);
        assert_eq!(kmem.free_count(), 14);
        kmem.kfree(a);
        kmem.kfree(b);
        assert_eq!(kmem.free_count(), 16);
    }

    #[test]
    fn exhaustion_is_surfaced_not_fatal() {
        let kmem = Kmem::new(2);
        kmem.kinit1(0, 2);
        kmem.kalloc().unwrap();
        kmem.kalloc().unwrap();
        assert_eq!(kmem.kalloc().unwrap_err(), Error::OutOfMemory);
    }

    #[test]
    fn freed_frame_is_scrubbed() {
        let kmem = Kmem::new(2);
        let pfn = 0;
        kmem.with_frame_mut(pfn, |f| f.fill(0x42));
        kmem.kfree(pfn);
        kmem.with_frame(pfn, |f| {
            assert_eq!(f[PGSIZE - 1], 0x01);
        });
    }

    #[test]
    fn two_phase_init() {
        let kmem = Kmem::new(10);
        kmem.kinit1(0, 4);
        assert!(!kmem.lock_enabled());
        kmem.kinit2(4, 10);
        assert!(kmem.lock_enabled());
        assert_eq!(kmem.free_count(), 10);
    }
}
