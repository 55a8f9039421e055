//! Per-CPU state (spec.md §3 "CPU record").
//!
//! On real hardware this is indexed by APIC id and accessed with
//! interrupts disabled. Here every OS thread that plays the role of a
//! "CPU" (a scheduler loop) or of a running kernel thread (a process body)
//! carries its own copy in thread-local storage, which is exactly the
//! guarantee §3 asks for: per-CPU state is never shared across threads of
//! control.

use std::cell::Cell;

thread_local! {
    /// Nesting depth of `push_off`/`pop_off` (spec.md §4.1).
    static NOFF: Cell<u32> = Cell::new(0);
    /// Whether interrupts were enabled before the outermost `push_off`.
    static INTENA: Cell<bool> = Cell::new(true);
    /// pid of the process currently running on this thread of control, if
    /// any. Used by `Sleeplock` to record/validate ownership without a
    /// dependency on the process module's internals.
    static CURRENT_PID: Cell<i32> = Cell::new(-1);
    /// Stable identity for this thread of control, used by spinlocks to
    /// detect a double-acquire by the same "CPU".
    static THREAD_TOKEN: Cell<u64> = Cell::new(0);
}

use std::sync::atomic::{AtomicU64, Ordering};
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// A stable, process-wide-unique id for whichever OS thread calls this,
/// lazily assigned on first use. Stands in for "CPU id" / "owning thread"
/// bookkeeping that real xv6 keeps in the `Cpu` struct via the `Cpu*`
/// pointer itself.
pub fn current_token() -> u64 {
    THREAD_TOKEN.with(|t| {
        let v = t.get();
        if v != 0 {
            return v;
        }
        let fresh = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        t.set(fresh);
        fresh
    })
}

/// Current pid bound to this thread of control, or `-1` if none (a
/// scheduler thread between processes, or a thread never entered through
/// the process machinery).
pub fn current_pid() -> i32 {
    CURRENT_PID.with(|p| p.get())
}

/// Bind `pid` as the process running on this thread of control. Called by
/// the scheduler immediately before handing control to a process body, and
/// reset to `-1` when the process yields control back.
pub fn set_current_pid(pid: i32) {
    CURRENT_PID.with(|p| p.set(pid));
}

/// `push_off`: nest one level of "interrupts disabled". Mirrors spec.md
/// §4.1 exactly, sans the actual CPU flag (no real interrupts exist in
/// this hosted model) — the nesting count is what
/// `Spinlock`/`sleep`-across-spinlock assertions rely on.
pub fn push_off() {
    let was_enabled = INTENA.with(|i| i.get());
    let depth = NOFF.with(|n| n.get());
    if depth == 0 {
        INTENA.with(|i| i.set(was_enabled));
    }
    NOFF.with(|n| n.set(depth + 1));
}

/// `pop_off`: undo one `push_off`. Panics if unbalanced, matching the
/// fatal-assertion discipline of spec.md §7.
pub fn pop_off() {
    let depth = NOFF.with(|n| n.get());
    assert!(depth >= 1, "pop_off: not holding any cli nesting");
    NOFF.with(|n| n.set(depth - 1));
}

/// Depth of the current `push_off` nesting on this thread of control.
pub fn noff() -> u32 {
    NOFF.with(|n| n.get())
}
