//! Virtual memory manager (spec.md §4.3).
//!
//! Two-level 32-bit page tables over the physical frame arena of
//! [`crate::page::Kmem`]. Directory and page-table frames are ordinary
//! frames drawn from the same allocator as user data, carrying 1024 4-byte
//! PTEs each — the standard non-PAE x86 layout spec.md assumes (10 bits of
//! directory index, 10 bits of table index, 12 bits of page offset).
//!
//! A software-only `OWNED` bit (one of the three AVL bits x86 reserves for
//! OS use) distinguishes leaf pages this address space allocated and must
//! free on teardown/shrink from the shared kernel-window leaves every
//! address space maps but none of them own.

use std::sync::Arc;

use bitflags::bitflags;

use crate::error::{Error, KResult};
use crate::memlayout::{pg_roundup, DEVSPACE, EXTMEM, KERNBASE};
use crate::page::{Kmem, Pfn};
use crate::param::PGSIZE;

bitflags! {
    pub struct PteFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        /// Software bit: this leaf frame was allocated for (and is owned
        /// exclusively by) the address space holding it.
        const OWNED = 1 << 9;
    }
}

const ENTRIES: usize = PGSIZE / 4;

fn pdx(va: usize) -> usize {
    (va >> 22) & 0x3FF
}

fn ptx(va: usize) -> usize {
    (va >> 12) & 0x3FF
}

fn make_pte(pfn: Pfn, flags: PteFlags) -> u32 {
    ((pfn as u32) << 12) | flags.bits()
}

fn pte_pfn(pte: u32) -> Pfn {
    pte >> 12
}

fn pte_flags(pte: u32) -> PteFlags {
    PteFlags::from_bits_truncate(pte & 0xFFF)
}

fn read_entry(kmem: &Kmem, table: Pfn, idx: usize) -> u32 {
    kmem.with_frame(table, |f| u32::from_le_bytes(f[idx * 4..idx * 4 + 4].try_into().unwrap()))
}

fn write_entry(kmem: &Kmem, table: Pfn, idx: usize, pte: u32) {
    kmem.with_frame_mut(table, |f| f[idx * 4..idx * 4 + 4].copy_from_slice(&pte.to_le_bytes()));
}

fn zero_frame(kmem: &Kmem, pfn: Pfn) {
    kmem.with_frame_mut(pfn, |f| f.fill(0));
}

/// A process (or the kernel's own) address space: a page directory plus
/// every frame reachable through it (spec.md §3 "Address space").
pub struct VmSpace {
    kmem: Arc<Kmem>,
    pgdir: Pfn,
}

impl VmSpace {
    /// An address space with an allocated, zeroed directory and nothing
    /// else mapped.
    pub fn empty(kmem: Arc<Kmem>) -> KResult<Self> {
        let pgdir = kmem.kalloc()?;
        zero_frame(&kmem, pgdir);
        Ok(Self { kmem, pgdir })
    }

    pub fn pgdir(&self) -> Pfn {
        self.pgdir
    }

    /// Returns the page-table entry for `va`, allocating an empty
    /// second-level table if `alloc` and none exists yet. `None` means no
    /// mapping exists and `alloc` was false.
    fn walk(&self, va: usize, alloc: bool) -> KResult<Option<(Pfn, usize)>> {
        let pde = read_entry(&self.kmem, self.pgdir, pdx(va));
        let pt_pfn = if pde & PteFlags::PRESENT.bits() != 0 {
            pte_pfn(pde)
        } else {
            if !alloc {
                return Ok(None);
            }
            let fresh = self.kmem.kalloc()?;
            zero_frame(&self.kmem, fresh);
            let new_pde = make_pte(fresh, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER);
            write_entry(&self.kmem, self.pgdir, pdx(va), new_pde);
            fresh
        };
        Ok(Some((pt_pfn, ptx(va))))
    }

    /// Maps one page. Aborts the process (a programmer error, spec.md
    /// §4.3) if a present mapping already occupies `va`.
    pub fn map_page(&self, va: usize, pfn: Pfn, flags: PteFlags) -> KResult<()> {
        let (pt_pfn, idx) = self.walk(va, true)?.expect("walk with alloc=true always returns Some");
        let existing = read_entry(&self.kmem, pt_pfn, idx);
        assert!(
            existing & PteFlags::PRESENT.bits() == 0,
            "map_page: remapping already-present va {:#x}",
            va
        );
        write_entry(&self.kmem, pt_pfn, idx, make_pte(pfn, flags | PteFlags::PRESENT));
        Ok(())
    }

    /// Looks up the mapping for `va`, if present.
    pub fn lookup(&self, va: usize) -> Option<(Pfn, PteFlags)> {
        let (pt_pfn, idx) = self.walk(va, false).ok()??;
        let pte = read_entry(&self.kmem, pt_pfn, idx);
        if pte & PteFlags::PRESENT.bits() == 0 {
            return None;
        }
        Some((pte_pfn(pte), pte_flags(pte)))
    }

    /// Unmaps `npages` pages starting at `va` (which must be page
    /// aligned). If `free`, owned leaf frames are returned to the
    /// allocator; kernel-window leaves are never owned and are simply
    /// unlinked.
    pub fn unmap_range(&self, va: usize, npages: usize, free: bool) {
        assert_eq!(va % PGSIZE, 0, "unmap_range: unaligned va");
        for i in 0..npages {
            let page_va = va + i * PGSIZE;
            let (pt_pfn, idx) = self
                .walk(page_va, false)
                .ok()
                .flatten()
                .unwrap_or_else(|| panic!("unmap_range: {:#x} not mapped", page_va));
            let pte = read_entry(&self.kmem, pt_pfn, idx);
            assert!(pte & PteFlags::PRESENT.bits() != 0, "unmap_range: {:#x} not mapped", page_va);
            if free && pte & PteFlags::OWNED.bits() != 0 {
                self.kmem.kfree(pte_pfn(pte));
            }
            write_entry(&self.kmem, pt_pfn, idx, 0);
        }
    }

    /// Clears the user-accessible bit on the mapping for `va` (used to
    /// install a guard page under the user stack).
    pub fn clear_user_access(&self, va: usize) {
        let (pt_pfn, idx) = self.walk(va, false).ok().flatten().expect("clear_user_access: not mapped");
        let pte = read_entry(&self.kmem, pt_pfn, idx);
        write_entry(&self.kmem, pt_pfn, idx, pte & !PteFlags::USER.bits());
    }

    /// Builds a fresh kernel address space: the kernel window only, no
    /// user mappings.
    pub fn new_kernel(kmem: Arc<Kmem>, kernel_data_boundary: usize) -> KResult<Self> {
        let space = Self::empty(kmem)?;
        space.map_kernel_window(kernel_data_boundary)?;
        Ok(space)
    }

    /// Maps the portion of physical memory this arena actually has behind
    /// `[KERNBASE, KERNBASE+PHYSTOP)`, split into the always-writable low
    /// extended-memory window, read-only kernel text/rodata, and the
    /// writable remainder (spec.md §4.3). The identity-mapped device
    /// window above `DEVSPACE` is out of scope (spec.md §1 excludes real
    /// MMIO) and is intentionally left unmapped here.
    pub fn map_kernel_window(&self, kernel_data_boundary: usize) -> KResult<()> {
        let npages = self.kmem.npages();
        let phys_top = npages * PGSIZE;
        let mut pa = 0usize;
        while pa < phys_top {
            let va = KERNBASE + pa;
            let flags = if pa < EXTMEM {
                PteFlags::WRITABLE
            } else if KERNBASE + pa < kernel_data_boundary {
                PteFlags::empty()
            } else {
                PteFlags::WRITABLE
            };
            self.map_page(va, (pa / PGSIZE) as Pfn, flags)?;
            pa += PGSIZE;
        }
        let _ = DEVSPACE;
        Ok(())
    }

    /// Installs `image` (must fit in one page) as the sole mapping of a
    /// freshly created user address space (spec.md "Install an initial
    /// user program").
    pub fn uvm_first(&self, image: &[u8]) -> KResult<()> {
        assert!(image.len() < PGSIZE, "uvm_first: image too large for one page");
        let pfn = self.kmem.kalloc()?;
        zero_frame(&self.kmem, pfn);
        self.kmem.with_frame_mut(pfn, |f| f[..image.len()].copy_from_slice(image));
        self.map_page(0, pfn, PteFlags::WRITABLE | PteFlags::USER | PteFlags::OWNED)?;
        Ok(())
    }

    /// Grows a user address space from `old_size` to `new_size` bytes,
    /// allocating zeroed, writable, user-accessible frames. On allocation
    /// failure, frees whatever pages it had already mapped and returns the
    /// old size unchanged (spec.md §7).
    pub fn uvm_alloc(&self, old_size: usize, new_size: usize) -> KResult<usize> {
        if new_size <= old_size {
            return Ok(old_size);
        }
        let old_top = pg_roundup(old_size);
        let new_top = pg_roundup(new_size);
        let mut mapped = 0usize;
        let mut va = old_top;
        while va < new_top {
            match self.kmem.kalloc() {
                Ok(pfn) => {
                    zero_frame(&self.kmem, pfn);
                    self.map_page(va, pfn, PteFlags::WRITABLE | PteFlags::USER | PteFlags::OWNED)?;
                    mapped += 1;
                    va += PGSIZE;
                }
                Err(e) => {
                    if mapped > 0 {
                        self.unmap_range(old_top, mapped, true);
                    }
                    return Err(e);
                }
            }
        }
        Ok(new_size)
    }

    /// Shrinks a user address space from `old_size` to `new_size` bytes,
    /// freeing whole pages.
    pub fn uvm_dealloc(&self, old_size: usize, new_size: usize) -> usize {
        if new_size >= old_size {
            return old_size;
        }
        let old_top = pg_roundup(old_size);
        let new_top = pg_roundup(new_size);
        if new_top < old_top {
            self.unmap_range(new_top, (old_top - new_top) / PGSIZE, true);
        }
        new_size
    }

    /// Duplicates every owned user page of `self` into `dst`, preserving
    /// per-page permission flags (spec.md "Duplicate a user address space
    /// for fork"). On failure, `dst` is left untouched by the caller's
    /// responsibility to tear it down (spec.md §7 "failures during
    /// copyuvm unwind via freevm").
    pub fn copy_uvm(&self, dst: &VmSpace, size: usize) -> KResult<()> {
        let mut va = 0usize;
        while va < size {
            let (pfn, flags) = self
                .lookup(va)
                .unwrap_or_else(|| panic!("copy_uvm: {:#x} not mapped", va));
            let new_pfn = dst.kmem.kalloc()?;
            let bytes = self.kmem.with_frame(pfn, |src| *src);
            dst.kmem.with_frame_mut(new_pfn, |d| d.copy_from_slice(&bytes));
            dst.map_page(va, new_pfn, (flags & (PteFlags::WRITABLE | PteFlags::USER)) | PteFlags::OWNED)?;
            va += PGSIZE;
        }
        Ok(())
    }

    /// Tears down a user address space entirely: frees owned user frames
    /// up to `size`, then the page-table and directory frames.
    pub fn free_vm(self, size: usize) {
        if size > 0 {
            self.unmap_range(0, pg_roundup(size) / PGSIZE, true);
        }
        for pdx_i in 0..ENTRIES {
            let pde = read_entry(&self.kmem, self.pgdir, pdx_i);
            if pde & PteFlags::PRESENT.bits() != 0 {
                self.kmem.kfree(pte_pfn(pde));
            }
        }
        self.kmem.kfree(self.pgdir);
    }

    /// Translates a user virtual address to kernel-readable/writable bytes,
    /// failing unless the page is present and user-accessible (spec.md
    /// "Translate a user virtual address").
    fn check_user_page(&self, va: usize) -> KResult<Pfn> {
        match self.lookup(pg_down(va)) {
            Some((pfn, flags)) if flags.contains(PteFlags::USER) => Ok(pfn),
            _ => Err(Error::BadAddress),
        }
    }

    /// Copies `src` into the user address range starting at `dst_va`,
    /// straddling pages as needed.
    pub fn copy_out(&self, dst_va: usize, src: &[u8]) -> KResult<()> {
        let mut remaining = src;
        let mut va = dst_va;
        while !remaining.is_empty() {
            let pfn = self.check_user_page(va)?;
            let page_off = va % PGSIZE;
            let n = remaining.len().min(PGSIZE - page_off);
            self.kmem.with_frame_mut(pfn, |f| f[page_off..page_off + n].copy_from_slice(&remaining[..n]));
            remaining = &remaining[n..];
            va += n;
        }
        Ok(())
    }

    /// Copies `dst.len()` bytes from the user address range starting at
    /// `src_va` into `dst`.
    pub fn copy_in(&self, src_va: usize, dst: &mut [u8]) -> KResult<()> {
        let mut written = 0usize;
        let mut va = src_va;
        while written < dst.len() {
            let pfn = self.check_user_page(va)?;
            let page_off = va % PGSIZE;
            let n = (dst.len() - written).min(PGSIZE - page_off);
            self.kmem.with_frame(pfn, |f| dst[written..written + n].copy_from_slice(&f[page_off..page_off + n]));
            written += n;
            va += n;
        }
        Ok(())
    }

    /// Copies a NUL-terminated string of at most `max` bytes (including
    /// the NUL) from user memory starting at `src_va` into `dst`. Returns
    /// the string length, not including the NUL.
    pub fn copy_in_str(&self, src_va: usize, dst: &mut [u8]) -> KResult<usize> {
        let max = dst.len().min(usize::MAX);
        let mut va = src_va;
        let mut n = 0usize;
        loop {
            if n >= max {
                return Err(Error::BadAddress);
            }
            let pfn = self.check_user_page(va)?;
            let page_off = va % PGSIZE;
            let byte = self.kmem.with_frame(pfn, |f| f[page_off]);
            dst[n] = byte;
            if byte == 0 {
                return Ok(n);
            }
            n += 1;
            va += 1;
        }
    }
}

fn pg_down(va: usize) -> usize {
    va & !(PGSIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memlayout::KERNEL_DATA_DEFAULT;

    fn kmem(npages: usize) -> Arc<Kmem> {
        let kmem = Arc::new(Kmem::new(npages));
        kmem.kinit1(4, npages as u32);
        kmem
    }

    #[test]
    fn uvm_first_and_copyout_copyin() {
        let km = kmem(64);
        let vs = VmSpace::empty(km).unwrap();
        vs.uvm_first(b"hello\0").unwrap();
        vs.copy_out(1, b"E").unwrap();
        let mut buf = [0u8; 5];
        vs.copy_in(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hEllo");
    }

    #[test]
    fn copy_in_str_stops_at_nul() {
        let km = kmem(64);
        let vs = VmSpace::empty(km).unwrap();
        vs.uvm_first(b"abc\0ignored").unwrap();
        let mut buf = [0u8; 16];
        let n = vs.copy_in_str(0, &mut buf).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf[..3], b"abc");
    }

    #[test]
    fn grow_and_shrink() {
        let km = kmem(64);
        let vs = VmSpace::empty(km).unwrap();
        vs.uvm_first(b"x").unwrap();
        let sz = vs.uvm_alloc(PGSIZE, PGSIZE * 3).unwrap();
        assert_eq!(sz, PGSIZE * 3);
        assert!(vs.lookup(PGSIZE).is_some());
        assert!(vs.lookup(PGSIZE * 2).is_some());
        let sz = vs.uvm_dealloc(sz, PGSIZE);
        assert_eq!(sz, PGSIZE);
        assert!(vs.lookup(PGSIZE).is_none());
    }

    #[test]
    #[should_panic(expected = "remapping already-present")]
    fn double_map_aborts() {
        let km = kmem(64);
        let vs = VmSpace::empty(km).unwrap();
        let pfn = vs.kmem.kalloc().unwrap();
        vs.map_page(0, pfn, PteFlags::WRITABLE).unwrap();
        let pfn2 = vs.kmem.kalloc().unwrap();
        vs.map_page(0, pfn2, PteFlags::WRITABLE).unwrap();
    }

    #[test]
    fn fork_copies_contents_independently() {
        let km = kmem(64);
        let parent = VmSpace::empty(Arc::clone(&km)).unwrap();
        parent.uvm_first(b"parent").unwrap();
        let child = VmSpace::empty(km).unwrap();
        parent.copy_uvm(&child, PGSIZE).unwrap();
        child.copy_out(0, b"CHILD!").unwrap();
        let mut pbuf = [0u8; 6];
        let mut cbuf = [0u8; 6];
        parent.copy_in(0, &mut pbuf).unwrap();
        child.copy_in(0, &mut cbuf).unwrap();
        assert_eq!(&pbuf, b"parent");
        assert_eq!(&cbuf, b"CHILD!");
    }

    #[test]
    fn kernel_window_has_no_user_access_above_kernbase() {
        let km = kmem(256);
        let vs = VmSpace::new_kernel(km, KERNBASE + EXTMEM + KERNEL_DATA_DEFAULT - KERNBASE).unwrap();
        assert!(vs.lookup(KERNBASE).map(|(_, f)| !f.contains(PteFlags::USER)).unwrap_or(true));
    }
}
