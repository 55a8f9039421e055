//! Global timer ticks backing the `sleep(n)`/`uptime()` syscalls
//! (spec.md §4.11, §6 "`sleep(n_ticks)`", "`uptime()`").
//!
//! Grounded on the kaist-cp-rv6 teacher's `Kernel::ticks: Sleepablelock<u32>`
//! (`kernel.rs`) plus the periodic `ticks.wakeup(self)` in its trap handler
//! (`trap.rs`): a single counter, bumped by a simulated timer interrupt,
//! that sleepers rendezvous on through the ordinary process sleep/wakeup
//! channel mechanism (spec.md §4.10) rather than a dedicated condition
//! variable.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Error, KResult};
use crate::proc::ProcTable;

/// Sleep channel for the tick counter. An arbitrary token distinct from
/// every buffer/inode/pipe/process address used elsewhere as a channel.
const TICK_CHAN: u64 = u64::MAX;

pub struct Clock {
    ticks: AtomicU32,
}

impl Clock {
    pub fn new() -> Self {
        Self { ticks: AtomicU32::new(0) }
    }

    pub fn uptime(&self) -> u32 {
        self.ticks.load(Ordering::SeqCst)
    }

    /// Simulated timer interrupt: advances the tick count and wakes every
    /// sleeper waiting on it (spec.md §4.10 "timer interrupts ... wake
    /// sleepers").
    pub fn tick(&self, procs: &ProcTable) {
        self.ticks.fetch_add(1, Ordering::SeqCst);
        procs.wakeup(TICK_CHAN);
    }

    /// Blocks the calling process for `n` ticks, re-checking `killed` on
    /// every wake (spec.md `sleep(n_ticks)`).
    pub fn sleep_ticks(&self, procs: &ProcTable, pid: u32, n: u32) -> KResult<()> {
        let start = self.uptime();
        while self.uptime().wrapping_sub(start) < n {
            if procs.is_killed(pid) {
                return Err(Error::Killed);
            }
            procs.sleep(pid, TICK_CHAN);
        }
        Ok(())
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn uptime_advances_with_tick() {
        let clock = Clock::new();
        assert_eq!(clock.uptime(), 0);
        let procs = ProcTable::new();
        clock.tick(&procs);
        clock.tick(&procs);
        assert_eq!(clock.uptime(), 2);
    }

    #[test]
    fn sleep_ticks_wakes_after_target() {
        let clock = Arc::new(Clock::new());
        let procs = Arc::new(ProcTable::new());
        let kmem = Arc::new(crate::page::Kmem::new(64));
        kmem.kinit1(4, 64);
        let vm = crate::vm::VmSpace::empty(Arc::clone(&kmem)).unwrap();
        let dev = Arc::new(crate::block::MemBlockDevice::new(64));
        let fs = crate::fs::FileSystem::format(dev, 1, 64, 16);
        let root = fs.inodes.iget(1);
        let procs2 = Arc::clone(&procs);
        let clock2 = Arc::clone(&clock);
        let pid = procs.spawn_init(vm, b"\0", root, move |pid| {
            clock2.sleep_ticks(&procs2, pid, 3).unwrap();
        });
        for _ in 0..3 {
            thread::sleep(Duration::from_millis(5));
            clock.tick(&procs);
        }
        thread::sleep(Duration::from_millis(20));
        assert!(clock.uptime() >= 3);
    }
}
