//! Buffer cache (spec.md §4.4).
//!
//! A fixed array of buffers linked in one LRU list. The cache spinlock
//! protects list structure, identity (`dev`/`blockno`) and reference
//! counts; a per-buffer sleeplock serializes content access and disk
//! traffic for that buffer, so a holder may sleep (or, here, simply take
//! as long as it likes) without blocking unrelated buffers.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::block::{BlockData, BlockDevice};
use crate::lock::sleeplock::SleeplockGuard;
use crate::lock::{Sleeplock, Spinlock};
use crate::param::{BSIZE, NBUF};

struct Slot {
    dev: u32,
    blockno: u32,
    valid: bool,
    dirty: bool,
    refcnt: u32,
}

impl Slot {
    fn empty() -> Self {
        Self {
            dev: 0,
            blockno: 0,
            valid: false,
            dirty: false,
            refcnt: 0,
        }
    }
}

struct CacheMeta {
    slots: Vec<Slot>,
    /// Ordering of slot indices from most- to least-recently used.
    order: Vec<usize>,
}

pub struct BufContent {
    pub data: BlockData,
}

/// The disk block cache.
pub struct Bcache {
    meta: Spinlock<CacheMeta>,
    content: Vec<Sleeplock<BufContent>>,
    device: Arc<dyn BlockDevice>,
}

impl Bcache {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self::with_capacity(device, NBUF)
    }

    pub fn with_capacity(device: Arc<dyn BlockDevice>, nbuf: usize) -> Self {
        let mut slots = Vec::with_capacity(nbuf);
        let mut content = Vec::with_capacity(nbuf);
        for _ in 0..nbuf {
            slots.push(Slot::empty());
            content.push(Sleeplock::new("buf", BufContent { data: [0u8; BSIZE] }));
        }
        Self {
            meta: Spinlock::new("bcache", CacheMeta { slots, order: (0..nbuf).collect() }),
            content,
            device,
        }
    }

    /// Finds or repurposes a cache slot for `(dev, blockno)` and returns
    /// it locked, without touching the disk (spec.md `get`).
    pub fn get(&self, dev: u32, blockno: u32) -> BufGuard<'_> {
        let idx;
        {
            let mut meta = self.meta.lock();
            if let Some(found) = meta.slots.iter().position(|s| s.refcnt > 0 && s.dev == dev && s.blockno == blockno) {
                meta.slots[found].refcnt += 1;
                idx = found;
            } else {
                // Scan from the LRU end for an unused, clean buffer.
                let victim = match meta.order.iter().rev().copied().find(|&i| meta.slots[i].refcnt == 0) {
                    Some(i) => i,
                    None => crate::kpanic!("bget: no free buffers (dev {dev} block {blockno})"),
                };
                {
                    let slot = &mut meta.slots[victim];
                    slot.dev = dev;
                    slot.blockno = blockno;
                    slot.valid = false;
                    slot.dirty = false;
                    slot.refcnt = 1;
                }
                idx = victim;
            }
            touch_mru(&mut meta.order, idx);
        }
        BufGuard {
            cache: self,
            idx,
            dev,
            blockno,
            content: self.content[idx].lock(),
        }
    }

    /// `get` plus a disk read if the cached contents are not valid yet.
    pub fn read(&self, dev: u32, blockno: u32) -> BufGuard<'_> {
        let mut guard = self.get(dev, blockno);
        let is_valid = {
            let meta = self.meta.lock();
            meta.slots[guard.idx].valid
        };
        if !is_valid {
            self.device.read_block(blockno, &mut guard.content.data);
            self.meta.lock().slots[guard.idx].valid = true;
        }
        guard
    }

    /// Writes a locked buffer's contents to disk and marks it clean.
    pub fn write(&self, guard: &mut BufGuard<'_>) {
        assert!(self.content[guard.idx].holding(), "bwrite: buffer not locked");
        self.device.write_block(guard.blockno, &guard.content.data);
        self.meta.lock().slots[guard.idx].dirty = false;
    }

    fn mark_dirty(&self, idx: usize) {
        self.meta.lock().slots[idx].dirty = true;
    }

    /// Extra pin, independent of any held lock (used by the log to keep a
    /// dirty buffer from being recycled while a transaction references
    /// it).
    pub fn pin(&self, dev: u32, blockno: u32) {
        let mut meta = self.meta.lock();
        let idx = meta
            .slots
            .iter()
            .position(|s| s.refcnt > 0 && s.dev == dev && s.blockno == blockno)
            .expect("bpin: buffer not cached");
        meta.slots[idx].refcnt += 1;
    }

    pub fn unpin(&self, dev: u32, blockno: u32) {
        let mut meta = self.meta.lock();
        let idx = meta
            .slots
            .iter()
            .position(|s| s.refcnt > 0 && s.dev == dev && s.blockno == blockno)
            .expect("bunpin: buffer not cached");
        meta.slots[idx].refcnt -= 1;
    }
}

fn touch_mru(order: &mut Vec<usize>, idx: usize) {
    if let Some(pos) = order.iter().position(|&i| i == idx) {
        order.remove(pos);
    }
    order.insert(0, idx);
}

/// A locked buffer handle. Dropping it releases the sleeplock and, if the
/// reference count hits zero, moves the slot to the MRU end of the list
/// (spec.md `release`).
pub struct BufGuard<'a> {
    cache: &'a Bcache,
    idx: usize,
    dev: u32,
    blockno: u32,
    content: SleeplockGuard<'a, BufContent>,
}

impl BufGuard<'_> {
    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    /// Marks the buffer dirty without writing it yet (used by the log
    /// absorption path, spec.md §4.6).
    pub fn mark_dirty(&self) {
        self.cache.mark_dirty(self.idx);
    }
}

impl Deref for BufGuard<'_> {
    type Target = BlockData;
    fn deref(&self) -> &BlockData {
        &self.content.data
    }
}

impl DerefMut for BufGuard<'_> {
    fn deref_mut(&mut self) -> &mut BlockData {
        &mut self.content.data
    }
}

impl Drop for BufGuard<'_> {
    fn drop(&mut self) {
        let mut meta = self.cache.meta.lock();
        meta.slots[self.idx].refcnt -= 1;
        if meta.slots[self.idx].refcnt == 0 {
            touch_mru(&mut meta.order, self.idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBlockDevice;

    fn cache(nbuf: usize) -> Bcache {
        Bcache::with_capacity(Arc::new(MemBlockDevice::new(64)), nbuf)
    }

    #[test]
    fn read_reflects_prior_write() {
        let bc = cache(4);
        {
            let mut b = bc.read(1, 5);
            b[0] = 42;
            bc.write(&mut b);
        }
        let b = bc.read(1, 5);
        assert_eq!(b[0], 42);
    }

    #[test]
    fn same_block_shares_one_slot() {
        let bc = cache(4);
        let b1 = bc.get(1, 5);
        let b2 = bc.get(1, 5);
        assert_eq!(b1.idx, b2.idx);
    }

    #[test]
    #[should_panic(expected = "no buffers")]
    fn exhaustion_aborts() {
        let bc = cache(2);
        let _a = bc.get(1, 1);
        let _b = bc.get(1, 2);
        let _c = bc.get(1, 3);
    }

    #[test]
    fn recycled_slot_resets_valid() {
        let bc = cache(1);
        {
            let b = bc.read(1, 1);
            drop(b);
        }
        let b = bc.get(1, 2);
        assert_eq!(b.blockno(), 2);
    }
}
