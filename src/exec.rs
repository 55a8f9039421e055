//! `exec`: load an ELF image into a fresh address space (spec.md §4.9
//! `exec`, §6 "ELF loader").
//!
//! This crate models the kernel side of `exec` only: resolving the path,
//! building the new address space, loading `PT_LOAD` segments, and laying
//! out `argv`. There is no user-mode instruction stream in this hosted
//! crate to actually jump into (spec.md §1 excludes the CPU itself from
//! scope) — the entry point and initial stack pointer this module computes
//! are exactly the values a real `exec` would install into the trap frame
//! before returning to user mode.

use std::sync::Arc;

use zerocopy::FromBytes;

use crate::elf::{ElfHeader, ProgramHeader};
use crate::error::{Error, KResult};
use crate::fs::inode::{namex, DiskInodeType, InodeRef};
use crate::fs::FileSystem;
use crate::memlayout::pg_roundup;
use crate::page::Kmem;
use crate::param::{MAXARG, PGSIZE};
use crate::vm::{PteFlags, VmSpace};

pub struct ExecResult {
    pub vmspace: VmSpace,
    pub size: usize,
    pub entry: u32,
    pub stack_pointer: usize,
}

/// Loads `path`, resolved against `root`/`cwd`, as a new user address
/// space with `argv` laid out on its stack. On any failure the partially
/// built address space is freed and the caller's existing address space
/// is left untouched (spec.md §7 "failures during exec unwind by freeing
/// the new address space").
pub fn exec(
    fs: &FileSystem,
    kmem: &Arc<Kmem>,
    root: InodeRef,
    cwd: InodeRef,
    path: &str,
    argv: &[&str],
) -> KResult<ExecResult> {
    if argv.len() > MAXARG {
        return Err(Error::InvalidArgument);
    }
    let (ip, _) = namex(fs, &fs.inodes, root, cwd, path, false)?;
    let mut locked = fs.inodes.ilock(fs, ip);
    if locked.kind() != DiskInodeType::File {
        fs.inodes.iunlock(locked);
        crate::fs::inode::iput(&fs.inodes, fs, ip);
        return Err(Error::NotADirectory);
    }

    let header_bytes_len = std::mem::size_of::<ElfHeader>();
    let mut header_buf = vec![0u8; header_bytes_len];
    if locked.read(fs, &mut header_buf, 0, header_bytes_len as u32)? as usize != header_bytes_len {
        fs.inodes.iunlock(locked);
        crate::fs::inode::iput(&fs.inodes, fs, ip);
        return Err(Error::BadElf);
    }
    let header = match ElfHeader::parse(&header_buf) {
        Ok(h) => h,
        Err(e) => {
            fs.inodes.iunlock(locked);
            crate::fs::inode::iput(&fs.inodes, fs, ip);
            return Err(e);
        }
    };

    let vm = VmSpace::empty(Arc::clone(kmem))?;
    let result = load_program(fs, &mut locked, &header, vm);
    fs.inodes.iunlock(locked);
    crate::fs::inode::iput(&fs.inodes, fs, ip);
    let (vm, sz) = result?;

    // Guard the fully-loaded address space across stack layout: on any
    // failure here the guard's drop frees it, leaving the caller's own
    // address space untouched, same as the teacher's `exec`.
    let vm = scopeguard::guard(vm, move |vm| vm.free_vm(sz));
    let (stack_top, argv_sp) = build_stack(&vm, sz, argv)?;
    let vm = scopeguard::ScopeGuard::into_inner(vm);
    Ok(ExecResult { vmspace: vm, size: stack_top, entry: header.entry, stack_pointer: argv_sp })
}

fn load_program(fs: &FileSystem, ip: &mut crate::fs::inode::Inode<'_>, header: &ElfHeader, vm: VmSpace) -> KResult<(VmSpace, usize)> {
    let mut sz = 0usize;
    let ph_size = std::mem::size_of::<ProgramHeader>();
    for i in 0..header.phnum {
        let off = header.phoff + i as u32 * ph_size as u32;
        let mut buf = vec![0u8; ph_size];
        if ip.read(fs, &mut buf, off, ph_size as u32)? as usize != ph_size {
            vm.free_vm(sz);
            return Err(Error::BadElf);
        }
        let ph = match ProgramHeader::read_from(&buf[..]) {
            Some(ph) => ph,
            None => {
                vm.free_vm(sz);
                return Err(Error::BadElf);
            }
        };
        if !ph.is_load() {
            continue;
        }
        let top = ph.vaddr as usize + ph.memsz as usize;
        match vm.uvm_alloc(sz, top) {
            Ok(new_sz) => sz = new_sz,
            Err(e) => {
                vm.free_vm(sz);
                return Err(e);
            }
        }
        if let Err(e) = load_segment(fs, ip, &vm, ph.vaddr as usize, ph.offset, ph.filesz) {
            vm.free_vm(sz);
            return Err(e);
        }
    }
    Ok((vm, sz))
}

fn load_segment(fs: &FileSystem, ip: &mut crate::fs::inode::Inode<'_>, vm: &VmSpace, vaddr: usize, file_off: u32, filesz: u32) -> KResult<()> {
    let mut copied = 0u32;
    while copied < filesz {
        let chunk = (filesz - copied).min(PGSIZE as u32);
        let mut buf = vec![0u8; chunk as usize];
        let n = ip.read(fs, &mut buf, file_off + copied, chunk)?;
        if n != chunk {
            return Err(Error::BadElf);
        }
        vm.copy_out(vaddr + copied as usize, &buf)?;
        copied += chunk;
    }
    Ok(())
}

/// Appends one guard-protected stack page and lays `argv` onto it, cdecl
/// style: strings at the top, then a NUL-terminated pointer array, then
/// `argc`/`argv` words at the final stack pointer (spec.md "lay down argv
/// at the top").
fn build_stack(vm: &VmSpace, sz: usize, argv: &[&str]) -> KResult<(usize, usize)> {
    let stack_base = pg_roundup(sz);
    let stack_top = stack_base + PGSIZE;
    let new_sz = vm.uvm_alloc(stack_base, stack_top)?;
    vm.clear_user_access(stack_base);

    let mut sp = stack_top;
    let mut arg_addrs = Vec::with_capacity(argv.len());
    for arg in argv.iter().rev() {
        let bytes_len = arg.len() + 1;
        sp -= bytes_len;
        sp &= !0x3;
        let mut bytes = arg.as_bytes().to_vec();
        bytes.push(0);
        vm.copy_out(sp, &bytes)?;
        arg_addrs.push(sp as u32);
    }
    arg_addrs.reverse();

    sp -= (arg_addrs.len() + 1) * 4;
    sp &= !0x3;
    let argv_array_addr = sp;
    for (i, addr) in arg_addrs.iter().enumerate() {
        vm.copy_out(argv_array_addr + i * 4, &addr.to_le_bytes())?;
    }
    vm.copy_out(argv_array_addr + arg_addrs.len() * 4, &0u32.to_le_bytes())?;

    sp -= 8;
    vm.copy_out(sp, &(argv.len() as u32).to_le_bytes())?;
    vm.copy_out(sp + 4, &(argv_array_addr as u32).to_le_bytes())?;

    Ok((new_sz, sp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBlockDevice;
    use crate::elf::ElfHeader;
    use zerocopy::AsBytes;

    fn build_fs_with_program(contents: &[u8]) -> (FileSystem, InodeRef) {
        let dev = Arc::new(MemBlockDevice::new(2048));
        let fs = FileSystem::format(dev, 1, 2048, 256);
        fs.log.begin_op();
        let ip = fs.inodes.alloc(&fs, DiskInodeType::File).unwrap();
        {
            let mut locked = fs.inodes.ilock(&fs, ip);
            locked.write(&fs, contents, 0, contents.len() as u32).unwrap();
            fs.inodes.iunlock(locked);
        }
        let root = fs.inodes.iget(1);
        {
            let mut dir = fs.inodes.ilock(&fs, root);
            dir.dir_link(&fs, "prog", ip.inum()).unwrap();
            fs.inodes.iunlock(dir);
        }
        fs.log.end_op(&fs.bcache);
        (fs, root)
    }

    fn make_elf(text: &[u8]) -> Vec<u8> {
        let ph_off = std::mem::size_of::<ElfHeader>() as u32;
        let data_off = ph_off + std::mem::size_of::<ProgramHeader>() as u32;
        let header = ElfHeader {
            magic: [0x7f, b'E', b'L', b'F'],
            ident: [0; 12],
            kind: 2,
            machine: 3,
            version: 1,
            entry: 0,
            phoff: ph_off,
            shoff: 0,
            flags: 0,
            ehsize: std::mem::size_of::<ElfHeader>() as u16,
            phentsize: std::mem::size_of::<ProgramHeader>() as u16,
            phnum: 1,
            shentsize: 0,
            shnum: 0,
            shstrndx: 0,
        };
        let ph = ProgramHeader {
            kind: 1,
            offset: data_off,
            vaddr: 0,
            paddr: 0,
            filesz: text.len() as u32,
            memsz: text.len() as u32,
            flags: 0,
            align: 4,
        };
        let mut bytes = header.as_bytes().to_vec();
        bytes.extend_from_slice(ph.as_bytes());
        bytes.extend_from_slice(text);
        bytes
    }

    #[test]
    fn exec_loads_segment_and_lays_out_argv() {
        let elf = make_elf(b"program text");
        let (fs, root) = build_fs_with_program(&elf);
        let kmem = Arc::new(Kmem::new(512));
        kmem.kinit1(4, 512);
        let result = exec(&fs, &kmem, root, root, "prog", &["prog", "arg1"]).unwrap();
        let mut buf = [0u8; 12];
        result.vmspace.copy_in(0, &mut buf).unwrap();
        assert_eq!(&buf, b"program text");
        assert!(result.stack_pointer < result.size);
    }

    #[test]
    fn exec_on_missing_path_fails_without_touching_caller() {
        let dev = Arc::new(MemBlockDevice::new(256));
        let fs = FileSystem::format(dev, 1, 256, 32);
        let root = fs.inodes.iget(1);
        let kmem = Arc::new(Kmem::new(64));
        kmem.kinit1(4, 64);
        let err = exec(&fs, &kmem, root, root, "nope", &[]).unwrap_err();
        assert_eq!(err, Error::NotFound);
    }
}
