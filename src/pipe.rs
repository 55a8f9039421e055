//! Bounded in-memory byte pipe (spec.md §3 "Pipe", §4.8 "Pipe").
//!
//! A single fixed-size circular buffer shared by a read and a write
//! endpoint, with monotonically increasing byte counters (`nread`,
//! `nwrite`) rather than a wrap-aware index pair — `nwrite - nread` is the
//! occupancy and is always in `[0, PIPESIZE]`.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::{Error, KResult};
use crate::param::PIPESIZE;

/// `kill` wakes a process blocked on the process table's own
/// sleep/wakeup channel (`crate::proc::ProcTable::kill`), but a pipe
/// waiter blocks on the pipe's own condvar instead (module docs above).
/// Polling `killed` on a short timeout, rather than only after a real
/// `notify_all`, is what makes spec.md §8's "kill a sleeping reader"
/// scenario bounded: no architectural coupling between the pipe and the
/// process table is needed, just a bounded recheck interval.
const KILL_POLL: Duration = Duration::from_millis(20);

struct PipeState {
    buf: Vec<u8>,
    nread: u64,
    nwrite: u64,
    read_open: bool,
    write_open: bool,
}

/// A pipe's shared state. Wrapped in `Arc` by callers (typically
/// `crate::file::OpenFile`) so both endpoints can reach it after the
/// creating process's `fork`/`dup` fan the file descriptors out.
pub struct Pipe {
    state: Mutex<PipeState>,
    cv: Condvar,
}

impl Pipe {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PipeState {
                buf: vec![0u8; PIPESIZE],
                nread: 0,
                nwrite: 0,
                read_open: true,
                write_open: true,
            }),
            cv: Condvar::new(),
        }
    }

    /// Writes up to `src.len()` bytes, blocking while the buffer is full.
    /// `killed` is polled between bytes so a cancelled writer unwinds
    /// instead of blocking forever (spec.md `killed` is the only
    /// cancellation signal).
    pub fn write(&self, src: &[u8], killed: impl Fn() -> bool) -> KResult<usize> {
        let mut state = self.state.lock().unwrap();
        let mut written = 0;
        while written < src.len() {
            if !state.read_open || killed() {
                return Err(Error::PipeClosed);
            }
            if state.nwrite - state.nread == PIPESIZE as u64 {
                self.cv.notify_all();
                state = self.cv.wait_timeout(state, KILL_POLL).unwrap().0;
                continue;
            }
            let idx = (state.nwrite % PIPESIZE as u64) as usize;
            state.buf[idx] = src[written];
            state.nwrite += 1;
            written += 1;
        }
        self.cv.notify_all();
        Ok(written)
    }

    /// Reads up to `dst.len()` bytes. Blocks only while the pipe is empty
    /// and the write end is still open; returns `Ok(0)` once the writer
    /// has closed and the buffer has drained (pipe EOF).
    pub fn read(&self, dst: &mut [u8], killed: impl Fn() -> bool) -> KResult<usize> {
        let mut state = self.state.lock().unwrap();
        while state.nread == state.nwrite && state.write_open {
            if killed() {
                return Err(Error::PipeClosed);
            }
            state = self.cv.wait_timeout(state, KILL_POLL).unwrap().0;
        }
        let available = (state.nwrite - state.nread) as usize;
        let n = dst.len().min(available);
        for slot in dst.iter_mut().take(n) {
            let idx = (state.nread % PIPESIZE as u64) as usize;
            *slot = state.buf[idx];
            state.nread += 1;
        }
        self.cv.notify_all();
        Ok(n)
    }

    pub fn close_read(&self) {
        let mut state = self.state.lock().unwrap();
        state.read_open = false;
        self.cv.notify_all();
    }

    pub fn close_write(&self) {
        let mut state = self.state.lock().unwrap();
        state.write_open = false;
        self.cv.notify_all();
    }

    pub fn both_closed(&self) -> bool {
        let state = self.state.lock().unwrap();
        !state.read_open && !state.write_open
    }
}

impl Default for Pipe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn write_then_read_roundtrips() {
        let pipe = Pipe::new();
        pipe.write(b"hello", || false).unwrap();
        let mut buf = [0u8; 5];
        let n = pipe.read(&mut buf, || false).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn stalled_writer_wakes_when_reader_drains() {
        let pipe = Arc::new(Pipe::new());
        let filler = vec![b'a'; PIPESIZE];
        pipe.write(&filler, || false).unwrap();

        let writer_pipe = Arc::clone(&pipe);
        let writer = thread::spawn(move || writer_pipe.write(b"more", || false).unwrap());

        let mut drained = [0u8; 4];
        let n = pipe.read(&mut drained, || false).unwrap();
        assert_eq!(n, 4);
        writer.join().unwrap();
    }

    #[test]
    fn read_after_writer_closed_drains_then_returns_eof() {
        let pipe = Pipe::new();
        pipe.write(b"x", || false).unwrap();
        pipe.close_write();
        let mut buf = [0u8; 1];
        assert_eq!(pipe.read(&mut buf, || false).unwrap(), 1);
        let n = pipe.read(&mut buf, || false).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn killed_reader_unblocks_from_an_empty_pipe() {
        let pipe = Arc::new(Pipe::new());
        let killed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let killed2 = Arc::clone(&killed);
        let reader_pipe = Arc::clone(&pipe);
        let reader = thread::spawn(move || {
            let mut buf = [0u8; 1];
            reader_pipe.read(&mut buf, || killed2.load(std::sync::atomic::Ordering::SeqCst))
        });
        thread::sleep(Duration::from_millis(30));
        killed.store(true, std::sync::atomic::Ordering::SeqCst);
        let result = reader.join().unwrap();
        assert_eq!(result.unwrap_err(), Error::PipeClosed);
    }

    #[test]
    fn write_to_closed_read_end_fails() {
        let pipe = Pipe::new();
        pipe.close_read();
        let err = pipe.write(b"x", || false).unwrap_err();
        assert_eq!(err, Error::PipeClosed);
    }
}
