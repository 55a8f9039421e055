//! Address-space layout constants (spec.md §4.3).
//!
//! Every process's page directory maps this same shape:
//!
//! ```text
//! [0, user-size)                      user text/data/heap/stack
//! [KERNBASE, KERNBASE+EXTMEM)         low device space (identity map)
//! [KERNBASE+EXTMEM, KERNEL_DATA)      kernel text + rodata, not writable
//! [KERNEL_DATA, KERNBASE+PHYSTOP)     remaining physical memory, writable
//! [DEVSPACE, 4 GiB)                   identity-mapped device window
//! ```

use crate::param::PGSIZE;

/// Start of the extended-memory identity window.
pub const EXTMEM: usize = 0x0010_0000;

/// Where the kernel half of every address space begins.
pub const KERNBASE: usize = 0x8000_0000;

/// Physical memory top mapped by the kernel window (256 MiB of simulated
/// physical memory by default).
pub const PHYSTOP: usize = 0x0E00_0000;

/// Start of the identity-mapped device window.
pub const DEVSPACE: usize = 0xFE00_0000;

/// Boundary between read-only kernel text/rodata and the writable kernel
/// heap within the kernel window. In a real link this is the `data` symbol;
/// here it is a parameter of `VmSpace::new_kernel`.
pub const KERNEL_DATA_DEFAULT: usize = KERNBASE + EXTMEM + 0x0010_0000;

/// Rounds `addr` down to a page boundary.
pub const fn pg_rounddown(addr: usize) -> usize {
    addr & !(PGSIZE - 1)
}

/// Rounds `addr` up to a page boundary.
pub const fn pg_roundup(addr: usize) -> usize {
    (addr + PGSIZE - 1) & !(PGSIZE - 1)
}
