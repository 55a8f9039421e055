//! Spinlocks (spec.md §4.1).
//!
//! A real spinlock busy-waits on an atomic exchange with interrupts
//! disabled. The CPU-level spin and the interrupt mask are both part of the
//! hardware boundary this crate does not model (spec.md §1); what we keep
//! faithfully is the *contract*: acquire nests `push_off`, a thread may not
//! sleep while holding one, and a double-acquire by the same thread of
//! control is a fatal assertion rather than a silent deadlock.

use std::sync::{Condvar, Mutex};

use super::{Lock, RawLock};
use crate::cpu::{self, current_token};

struct State {
    locked: bool,
    owner: u64,
}

pub struct RawSpinlock {
    name: &'static str,
    state: Mutex<State>,
    cv: Condvar,
}

pub type Spinlock<T> = Lock<RawSpinlock, T>;
pub type SpinlockGuard<'s, T> = super::Guard<'s, RawSpinlock, T>;

impl RawSpinlock {
    pub const fn raw(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(State {
                locked: false,
                owner: 0,
            }),
            cv: Condvar::new(),
        }
    }
}

impl RawLock for RawSpinlock {
    fn acquire(&self) {
        cpu::push_off();
        let me = current_token();
        let mut guard = self.state.lock().unwrap();
        assert!(
            !(guard.locked && guard.owner == me),
            "acquire {}: already held by this cpu",
            self.name
        );
        while guard.locked {
            guard = self.cv.wait(guard).unwrap();
        }
        guard.locked = true;
        guard.owner = me;
    }

    fn release(&self) {
        let me = current_token();
        let mut guard = self.state.lock().unwrap();
        assert!(
            guard.locked && guard.owner == me,
            "release {}: not held by this cpu",
            self.name
        );
        guard.locked = false;
        guard.owner = 0;
        drop(guard);
        self.cv.notify_all();
        cpu::pop_off();
    }

    fn holding(&self) -> bool {
        let guard = self.state.lock().unwrap();
        guard.locked && guard.owner == current_token()
    }
}

impl<T> Spinlock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Lock::new(name, RawSpinlock::raw(name), data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn mutual_exclusion() {
        let lock = Arc::new(Spinlock::new("test", 0u32));
        let mut handles = vec![];
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let mut g = lock.lock();
                    *g += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 8000);
    }

    #[test]
    #[should_panic(expected = "already held")]
    fn double_acquire_is_fatal() {
        let lock = Spinlock::new("test", ());
        let _g1 = lock.lock();
        let _g2 = lock.lock();
    }

    #[test]
    fn holding_reflects_owner() {
        let lock = Spinlock::new("test", ());
        assert!(!lock.holding());
        let g = lock.lock();
        assert!(lock.holding());
        drop(g);
        assert!(!lock.holding());
    }
}
