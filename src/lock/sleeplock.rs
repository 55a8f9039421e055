//! Sleeplocks (spec.md §4.1).
//!
//! Long-term locks that block the calling kernel thread instead of
//! busy-waiting, so they may be held across voluntary suspension (disk
//! I/O, pipe drains, ...). `acquire` is built directly on a condition
//! variable rather than routing through the generic process `sleep`/
//! `wakeup` channel mechanism in `crate::proc` — both give the same
//! observable contract ("blocks the thread; a matching release wakes all
//! waiters"), and keeping the lock module independent of the process
//! module avoids a dependency cycle (the process table itself is guarded
//! by sleeplocks' sibling, `Spinlock`).

use std::sync::{Condvar, Mutex};

use super::{Lock, RawLock};
use crate::cpu::current_pid;

struct State {
    /// pid holding the lock, or `-1` if unlocked.
    locked_by: i32,
}

pub struct RawSleeplock {
    name: &'static str,
    state: Mutex<State>,
    cv: Condvar,
}

pub type Sleeplock<T> = Lock<RawSleeplock, T>;
pub type SleeplockGuard<'s, T> = super::Guard<'s, RawSleeplock, T>;

impl RawSleeplock {
    pub const fn raw(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(State { locked_by: -1 }),
            cv: Condvar::new(),
        }
    }
}

impl RawLock for RawSleeplock {
    fn acquire(&self) {
        let mut guard = self.state.lock().unwrap();
        while guard.locked_by != -1 {
            guard = self.cv.wait(guard).unwrap();
        }
        guard.locked_by = current_pid();
    }

    fn release(&self) {
        let mut guard = self.state.lock().unwrap();
        assert!(guard.locked_by != -1, "release {}: not locked", self.name);
        guard.locked_by = -1;
        drop(guard);
        self.cv.notify_all();
    }

    fn holding(&self) -> bool {
        let guard = self.state.lock().unwrap();
        guard.locked_by == current_pid() && guard.locked_by != -1
    }
}

impl<T> Sleeplock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Lock::new(name, RawSleeplock::raw(name), data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn serializes_access() {
        let lock = Arc::new(Sleeplock::new("test", 0u32));
        let mut handles = vec![];
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    let mut g = lock.lock();
                    let v = *g;
                    thread::sleep(Duration::from_micros(1));
                    *g = v + 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 800);
    }

    #[test]
    fn contender_blocks_until_release() {
        let lock = Arc::new(Sleeplock::new("test", ()));
        let g = lock.lock();
        let lock2 = Arc::clone(&lock);
        let t = thread::spawn(move || {
            let _g = lock2.lock();
        });
        thread::sleep(Duration::from_millis(20));
        drop(g);
        t.join().unwrap();
    }
}
