//! Fatal kernel assertions (spec.md §7 "fatal assertions").
//!
//! The teacher's bare-metal `panic.rs` installs a `#[panic_handler]` that
//! freezes the other CPUs and spins forever. Hosted on `std` there is no
//! `#[panic_handler]` to install and no other CPU thread to freeze, so the
//! closest equivalent is: log the failure with the thread that hit it, then
//! unwind that one OS thread (`crate::proc`'s per-process threads and
//! `crate::proc::scheduler`'s per-CPU threads already expect their body to
//! be able to end abruptly; they never assume a panicked thread resumes).
/// Logs `msg` at `error` level, tagged with the calling thread's token (spec.md
/// "CPU record"), then panics. Use this instead of a bare `panic!` for
/// conditions spec.md calls out as fatal assertions rather than ordinary
/// recoverable `Error`s — log corruption, a corrupt on-disk superblock, a
/// locking-discipline violation.
#[macro_export]
macro_rules! kpanic {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        log::error!("kernel panic on thread {}: {}", $crate::cpu::current_token(), msg);
        panic!("kernel panic: {}", msg);
    }};
}

#[cfg(test)]
mod tests {
    #[test]
    #[should_panic(expected = "kernel panic: disk corrupt")]
    fn kpanic_logs_then_panics() {
        let _ = env_logger::try_init();
        kpanic!("disk corrupt");
    }
}
