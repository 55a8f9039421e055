//! Console line discipline (spec.md §4.12).
//!
//! Input normally arrives from keyboard/serial interrupt handlers already
//! decoded to ASCII; those decoders (shift/ctrl/caps/escape handling) are
//! outside this crate's scope (spec.md §1 excludes the UART/keyboard/CGA
//! hardware). What lives here is everything downstream of that: the
//! 128-byte edit ring with its three indices, erase/kill-line editing,
//! end-of-line commit, and the EOF convention, reachable as a registered
//! [`crate::device::CharDevice`].

use std::sync::{Condvar, Mutex};

use crate::device::CharDevice;
use crate::error::KResult;

const INPUT_BUF: usize = 128;
const BACKSPACE: u8 = 0x08;
const DEL: u8 = 0x7f;
const CTRL_U: u8 = 0x15;
const CTRL_D: u8 = 0x04;

struct ConsoleState {
    buf: [u8; INPUT_BUF],
    /// Next index a reader will consume.
    r: u64,
    /// Index up to which committed lines are readable.
    w: u64,
    /// Index of the next byte the editor will place (`e >= w`).
    e: u64,
    /// Stand-in for CGA memory + serial output, since no real display
    /// device exists in this hosted model.
    output: Vec<u8>,
}

/// The console device: cooked input with a 128-byte ring, registered
/// under [`crate::device::CONSOLE_MAJOR`].
pub struct Console {
    state: Mutex<ConsoleState>,
    cv: Condvar,
}

impl Console {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConsoleState {
                buf: [0u8; INPUT_BUF],
                r: 0,
                w: 0,
                e: 0,
                output: Vec::new(),
            }),
            cv: Condvar::new(),
        }
    }

    /// Feeds one decoded input byte through the line discipline (spec.md
    /// "is passed through a per-source key-decoder producing ASCII bytes,
    /// and is enqueued in a 128-byte ring").
    pub fn intr(&self, c: u8) {
        let mut state = self.state.lock().unwrap();
        match c {
            BACKSPACE | DEL => {
                if state.e != state.w {
                    state.e -= 1;
                }
            }
            CTRL_U => {
                while state.e != state.w && state.buf[(state.e as usize - 1) % INPUT_BUF] != b'\n' {
                    state.e -= 1;
                }
            }
            CTRL_D => {
                // End-of-line commit with an EOF sentinel (0x00). A real
                // null byte typed at the keyboard is not representable
                // through this path, a simplification acceptable for a
                // text console.
                let e = state.e;
                state.buf[(e as usize) % INPUT_BUF] = 0;
                state.e += 1;
                state.w = state.e;
                self.cv.notify_all();
            }
            _ => {
                let e = state.e;
                state.buf[(e as usize) % INPUT_BUF] = c;
                state.e += 1;
                if c == b'\n' || c == b'\r' || state.e - state.r >= INPUT_BUF as u64 {
                    state.w = state.e;
                    self.cv.notify_all();
                }
            }
        }
    }

    fn read_locked(&self, dst: &mut [u8]) -> usize {
        let mut state = self.state.lock().unwrap();
        let mut got = 0;
        while got < dst.len() {
            while state.r == state.w {
                state = self.cv.wait(state).unwrap();
            }
            let c = state.buf[(state.r as usize) % INPUT_BUF];
            state.r += 1;
            if c == 0 {
                break;
            }
            dst[got] = c;
            got += 1;
            if c == b'\n' {
                break;
            }
        }
        got
    }

    pub fn output_snapshot(&self) -> Vec<u8> {
        self.state.lock().unwrap().output.clone()
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl CharDevice for Console {
    fn read(&self, dst: &mut [u8]) -> KResult<usize> {
        Ok(self.read_locked(dst))
    }

    fn write(&self, src: &[u8]) -> KResult<usize> {
        self.state.lock().unwrap().output.extend_from_slice(src);
        Ok(src.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_line_is_readable_after_newline() {
        let con = Console::new();
        for &b in b"hi\n" {
            con.intr(b);
        }
        let mut buf = [0u8; 8];
        let n = con.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi\n");
    }

    #[test]
    fn backspace_erases_last_uncommitted_byte() {
        let con = Console::new();
        for &b in b"hix" {
            con.intr(b);
        }
        con.intr(BACKSPACE);
        con.intr(b'\n');
        let mut buf = [0u8; 8];
        let n = con.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi\n");
    }

    #[test]
    fn kill_line_erases_whole_uncommitted_line() {
        let con = Console::new();
        for &b in b"garbage" {
            con.intr(b);
        }
        con.intr(CTRL_U);
        for &b in b"ok\n" {
            con.intr(b);
        }
        let mut buf = [0u8; 8];
        let n = con.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ok\n");
    }

    #[test]
    fn ctrl_d_at_start_of_read_yields_eof() {
        let con = Console::new();
        con.intr(CTRL_D);
        let mut buf = [0u8; 8];
        let n = con.read(&mut buf).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn write_accumulates_output() {
        let con = Console::new();
        con.write(b"hello").unwrap();
        con.write(b", world").unwrap();
        assert_eq!(con.output_snapshot(), b"hello, world");
    }
}
