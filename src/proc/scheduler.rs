//! Per-CPU scheduler loop and preemption (spec.md §4.10).
//!
//! Real xv6 runs one scheduler loop per physical CPU, each repeatedly
//! scanning the process table for a RUNNABLE entry and context-switching
//! onto it. In this hosted crate every process already runs on its own OS
//! thread ([`crate::proc::ProcTable::fork`]/`spawn_init`), so there is no
//! kernel stack to switch to — the OS thread scheduler already
//! time-shares RUNNABLE work the way the per-CPU loop would. What remains
//! to model explicitly is preemption: a periodic tick that asks a running
//! process to `yield`.
//!
//! `CpuRecord` stands in for spec.md's "CPU record" (APIC id, nested-cli
//! depth, saved interrupt-enable flag): the cli-nesting and intena parts
//! already live in [`crate::cpu`] as thread-locals; this type carries the
//! identifying/metadata half that a real scheduler loop would also track.

use std::sync::atomic::{AtomicU32, Ordering};

/// Metadata for one "CPU" (one scheduler loop / thread of control).
pub struct CpuRecord {
    id: u32,
    ticks_delivered: AtomicU32,
}

impl CpuRecord {
    pub fn new(id: u32) -> Self {
        Self { id, ticks_delivered: AtomicU32::new(0) }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Called by the (simulated) timer interrupt path; spec.md "Preemption
    /// ... timer interrupts ... call yield if the process is RUNNING".
    /// Returns whether the caller should yield.
    pub fn tick(&self) -> bool {
        self.ticks_delivered.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn ticks_delivered(&self) -> u32 {
        self.ticks_delivered.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_tick_requests_a_yield() {
        let cpu = CpuRecord::new(0);
        assert!(cpu.tick());
        assert!(cpu.tick());
        assert_eq!(cpu.ticks_delivered(), 2);
    }
}
