//! The `Kernel` value: every singleton subsystem threaded through one
//! struct (spec.md §9 "Global state... tests construct a private kernel
//! instance by threading these through a single `kernel` value rather
//! than as process-wide statics").
//!
//! This is the seam every syscall handler (`crate::syscall`) and every
//! integration-style test drives the kernel through: process table, file
//! system (buffer cache + log + inode cache), global open-file table,
//! device majors, and the physical page allocator.

use std::sync::Arc;

use crate::block::BlockDevice;
use crate::clock::Clock;
use crate::console::Console;
use crate::device::{DeviceTable, CONSOLE_MAJOR};
use crate::error::{Error, KResult};
use crate::exec::exec as exec_impl;
use crate::file::FileHandle;
use crate::fs::inode::{namex, DiskInodeType, InodeRef};
use crate::fs::FileSystem;
use crate::page::Kmem;
use crate::param::{DEFAULT_NPAGES, NOFILE};
use crate::pipe::Pipe;
use crate::proc::{ProcState, ProcTable};
use crate::stat::Stat;
use crate::vm::VmSpace;

pub struct Kernel {
    pub kmem: Arc<Kmem>,
    pub fs: Arc<FileSystem>,
    pub files: Arc<crate::file::FileTable>,
    pub devices: Arc<DeviceTable>,
    pub procs: Arc<ProcTable>,
    pub console: Arc<Console>,
    pub clock: Clock,
    root: InodeRef,
}

impl Kernel {
    /// Builds a fresh kernel over a brand-new file system image (spec.md
    /// §9's defined boot initialization order, compressed: page allocator,
    /// then file system singletons, then the console device, then the
    /// first process).
    pub fn new(device: Arc<dyn BlockDevice>, nblocks: u32, ninodes: u32) -> Arc<Self> {
        let kmem = Arc::new(Kmem::new(DEFAULT_NPAGES));
        kmem.kinit1(4, DEFAULT_NPAGES as u32 / 2);
        kmem.kinit2(DEFAULT_NPAGES as u32 / 2, DEFAULT_NPAGES as u32);

        let fs = Arc::new(FileSystem::format(device, 1, nblocks, ninodes));
        let root = fs.inodes.iget(1);

        let mut devices = DeviceTable::new();
        let console = Arc::new(Console::new());
        devices.register(CONSOLE_MAJOR, Arc::clone(&console) as Arc<dyn crate::device::CharDevice>);

        Arc::new(Self {
            kmem,
            fs,
            files: Arc::new(crate::file::FileTable::new()),
            devices: Arc::new(devices),
            procs: Arc::new(ProcTable::new()),
            console,
            clock: Clock::new(),
            root,
        })
    }

    pub fn root(&self) -> InodeRef {
        self.root
    }

    fn killed_check(&self, pid: u32) -> impl Fn() -> bool + '_ {
        move || self.procs.is_killed(pid)
    }

    /// Spawns the first process: a built-in one-page image, cwd = root
    /// (spec.md `userinit`).
    pub fn userinit(self: &Arc<Self>, image: &[u8], body: impl FnOnce(u32) + Send + 'static) -> u32 {
        let vm = VmSpace::new_kernel(Arc::clone(&self.kmem), crate::memlayout::KERNEL_DATA_DEFAULT)
            .expect("userinit: kernel address space");
        let cwd = self.fs.inodes.idup(self.root);
        let pid = self.procs.spawn_init(vm, image, cwd, body);
        log::info!("spawned init process (pid {pid})");
        pid
    }

    /// Duplicates the parent's address space, open files, and cwd into a
    /// new process, bumping reference counts the raw `ProcTable::fork`
    /// cannot reach on its own (spec.md `fork`).
    pub fn fork(self: &Arc<Self>, parent_pid: u32, child_body: impl FnOnce(u32) + Send + 'static) -> KResult<u32> {
        let (parent_vm_size, parent_files, parent_cwd) = self
            .procs
            .with_proc(parent_pid, |p| (p.sz, p.files, p.cwd))
            .ok_or(Error::NoSuchProc)?;

        let child_pid = self.procs.fork(parent_pid, child_body)?;

        let child_vm = VmSpace::empty(Arc::clone(&self.kmem))?;
        self.procs.with_proc_mut(child_pid, |p| p.vmspace = Some(child_vm));
        // Copy contents: needs both address spaces live simultaneously,
        // which `with_proc`/`with_proc_mut` (one slot at a time, table
        // lock held) cannot express, so reach in via the accessor below.
        self.copy_parent_address_space(parent_pid, child_pid, parent_vm_size)?;

        for slot in parent_files.iter().flatten() {
            self.files.dup(*slot);
        }
        self.procs.with_proc_mut(child_pid, |p| {
            p.files = parent_files;
            p.cwd = parent_cwd.map(|c| self.fs.inodes.idup(c));
        });

        log::debug!("fork: pid {parent_pid} -> child pid {child_pid}");
        Ok(child_pid)
    }

    fn copy_parent_address_space(&self, parent_pid: u32, child_pid: u32, size: usize) -> KResult<()> {
        let parent_has = self.procs.with_proc(parent_pid, |_| ()).is_some();
        if !parent_has {
            return Err(Error::NoSuchProc);
        }
        // Take both vmspaces out under the table lock briefly, copy
        // outside it (page allocation may fail and must not happen while
        // holding the process table lock — spec.md §5), then restore.
        let parent_vm = self.procs.with_proc_mut(parent_pid, |p| p.vmspace.take()).flatten();
        let child_vm = self.procs.with_proc_mut(child_pid, |p| p.vmspace.take()).flatten();
        let result = match (&parent_vm, &child_vm) {
            (Some(pvm), Some(cvm)) => pvm.copy_uvm(cvm, size),
            _ => Err(Error::NoSuchProc),
        };
        if let Some(pvm) = parent_vm {
            self.procs.with_proc_mut(parent_pid, |p| p.vmspace = Some(pvm));
        }
        if let Some(cvm) = child_vm {
            self.procs.with_proc_mut(child_pid, |p| p.vmspace = Some(cvm));
        }
        result
    }

    pub fn growproc(&self, pid: u32, n: isize) -> KResult<usize> {
        self.procs.grow(pid, n)
    }

    /// `getpid()`: trivial, but routed through `Kernel` like every other
    /// syscall body so `crate::syscall::dispatch` never special-cases it.
    pub fn getpid(&self, pid: u32) -> u32 {
        pid
    }

    /// Current timer-tick count (spec.md `uptime()`).
    pub fn uptime(&self) -> u32 {
        self.clock.uptime()
    }

    /// Simulated timer interrupt: advances the tick counter and wakes
    /// every process sleeping on it (spec.md §4.10 preemption source,
    /// §4.11 `sys_sleep`/`sys_uptime`). Real callers are a periodic timer;
    /// tests call this directly.
    pub fn tick(&self) {
        self.clock.tick(&self.procs);
    }

    /// `sleep(n_ticks)`: blocks the calling process for `n` ticks, or
    /// fails if killed while waiting (spec.md §6).
    pub fn sleep_ticks(&self, pid: u32, n: u32) -> KResult<()> {
        self.clock.sleep_ticks(&self.procs, pid, n)
    }

    /// Loads `path` as the calling process's new program image (spec.md
    /// `exec`). On success replaces the process's address space and size;
    /// on failure the process is left exactly as it was.
    pub fn exec(&self, pid: u32, path: &str, argv: &[&str]) -> KResult<()> {
        let cwd = self.procs.with_proc(pid, |p| p.cwd).ok_or(Error::NoSuchProc)?.ok_or(Error::NoSuchProc)?;
        let result = exec_impl(&self.fs, &self.kmem, self.root, cwd, path, argv).map_err(|e| {
            log::warn!("exec {path} failed for pid {pid}: {e}");
            e
        })?;
        self.procs.with_proc_mut(pid, |p| {
            let old = p.vmspace.take();
            if let Some(old) = old {
                old.free_vm(p.sz);
            }
            p.vmspace = Some(result.vmspace);
            p.sz = result.size;
        });
        Ok(())
    }

    /// Closes every open file, releases cwd, reparents children to pid 1,
    /// marks ZOMBIE, and wakes the parent (spec.md `exit`).
    pub fn exit(&self, pid: u32, status: i32) {
        log::debug!("pid {pid} exiting with status {status}");
        let (files, cwd, vmspace, sz) = self.procs.begin_exit(pid, 1, status);
        for slot in files.into_iter().flatten() {
            self.files.close(slot, &self.fs);
        }
        if let Some(cwd) = cwd {
            self.fs.log.begin_op();
            crate::fs::inode::iput(&self.fs.inodes, &self.fs, cwd);
            self.fs.log.end_op(&self.fs.bcache);
        }
        if let Some(vm) = vmspace {
            vm.free_vm(sz);
        }
        let parent = self.procs.with_proc(pid, |p| p.parent).flatten();
        if let Some(parent) = parent {
            self.procs.wakeup(parent as u64);
        }
    }

    pub fn wait(&self, pid: u32) -> KResult<(u32, i32)> {
        self.procs.wait(pid)
    }

    pub fn kill(&self, pid: u32) -> KResult<()> {
        log::info!("killing pid {pid}");
        self.procs.kill(pid)
    }

    pub fn sleep(&self, pid: u32, chan: u64) {
        self.procs.sleep(pid, chan);
    }

    pub fn wakeup(&self, chan: u64) {
        self.procs.wakeup(chan);
    }

    /// Opens `path` with the given readable/writable flags, creating a
    /// regular file if `create` is set and the path does not already
    /// exist (spec.md `open`).
    pub fn open(&self, pid: u32, path: &str, readable: bool, writable: bool, create: bool) -> KResult<i32> {
        let cwd = self.procs.with_proc(pid, |p| p.cwd).ok_or(Error::NoSuchProc)?.ok_or(Error::NoSuchProc)?;
        self.fs.log.begin_op();
        let result = self.open_locked(cwd, path, create);
        self.fs.log.end_op(&self.fs.bcache);
        let ip = result?;

        let handle = {
            let locked = self.fs.inodes.ilock(&self.fs, ip);
            let kind = locked.kind();
            let (major, minor) = (locked.major(), locked.minor());
            self.fs.inodes.iunlock(locked);
            if kind == DiskInodeType::Device {
                let _ = minor;
                self.files.open_device(major, readable, writable)
            } else {
                self.files.open_inode(ip, readable, writable)
            }
        };
        match handle {
            Ok(h) => self.install_fd(pid, h),
            Err(e) => {
                self.fs.log.begin_op();
                crate::fs::inode::iput(&self.fs.inodes, &self.fs, ip);
                self.fs.log.end_op(&self.fs.bcache);
                Err(e)
            }
        }
    }

    fn open_locked(&self, cwd: InodeRef, path: &str, create: bool) -> KResult<InodeRef> {
        match namex(&self.fs, &self.fs.inodes, self.root, cwd, path, false) {
            Ok((ip, _)) => Ok(ip),
            Err(Error::NotFound) if create => {
                let (parent, name) = namex(&self.fs, &self.fs.inodes, self.root, cwd, path, true)?;
                let name = name.ok_or(Error::InvalidArgument)?;
                let ip = self.fs.inodes.alloc(&self.fs, DiskInodeType::File)?;
                {
                    let mut locked = self.fs.inodes.ilock(&self.fs, ip);
                    locked.link_count_bump(&self.fs);
                    self.fs.inodes.iunlock(locked);
                }
                {
                    let mut dir = self.fs.inodes.ilock(&self.fs, parent);
                    dir.dir_link(&self.fs, &name, ip.inum())?;
                    self.fs.inodes.iunlock(dir);
                }
                crate::fs::inode::iput(&self.fs.inodes, &self.fs, parent);
                Ok(ip)
            }
            Err(e) => Err(e),
        }
    }

    fn install_fd(&self, pid: u32, handle: FileHandle) -> KResult<i32> {
        self.procs
            .with_proc_mut(pid, |p| {
                for (fd, slot) in p.files.iter_mut().enumerate() {
                    if slot.is_none() {
                        *slot = Some(handle);
                        return Ok(fd as i32);
                    }
                }
                Err(Error::NoFreeFds)
            })
            .ok_or(Error::NoSuchProc)?
    }

    fn fd_handle(&self, pid: u32, fd: i32) -> KResult<FileHandle> {
        if fd < 0 || fd as usize >= NOFILE {
            return Err(Error::BadFd);
        }
        self.procs
            .with_proc(pid, |p| p.files[fd as usize])
            .flatten()
            .ok_or(Error::BadFd)
    }

    pub fn read(&self, pid: u32, fd: i32, dst: &mut [u8]) -> KResult<usize> {
        let handle = self.fd_handle(pid, fd)?;
        self.files.read(handle, &self.fs, &self.devices, dst, self.killed_check(pid))
    }

    pub fn write(&self, pid: u32, fd: i32, src: &[u8]) -> KResult<usize> {
        let handle = self.fd_handle(pid, fd)?;
        self.files.write(handle, &self.fs, &self.devices, src, self.killed_check(pid))
    }

    pub fn close(&self, pid: u32, fd: i32) -> KResult<()> {
        let handle = self.fd_handle(pid, fd)?;
        self.procs.with_proc_mut(pid, |p| p.files[fd as usize] = None);
        self.files.close(handle, &self.fs);
        Ok(())
    }

    pub fn dup(&self, pid: u32, fd: i32) -> KResult<i32> {
        let handle = self.fd_handle(pid, fd)?;
        let dup = self.files.dup(handle);
        self.install_fd(pid, dup)
    }

    pub fn fstat(&self, pid: u32, fd: i32) -> KResult<Stat> {
        let handle = self.fd_handle(pid, fd)?;
        self.files.stat(handle, &self.fs)
    }

    /// Creates a pipe and installs its two ends as new fds in `pid`'s
    /// descriptor table (spec.md `pipe`).
    pub fn pipe(&self, pid: u32) -> KResult<(i32, i32)> {
        let pipe = Arc::new(Pipe::new());
        let read_handle = self.files.open_pipe(Arc::clone(&pipe), false)?;
        let write_handle = self.files.open_pipe(pipe, true)?;
        let rfd = self.install_fd(pid, read_handle)?;
        let wfd = self.install_fd(pid, write_handle)?;
        Ok((rfd, wfd))
    }

    pub fn mkdir(&self, pid: u32, path: &str) -> KResult<()> {
        let cwd = self.procs.with_proc(pid, |p| p.cwd).ok_or(Error::NoSuchProc)?.ok_or(Error::NoSuchProc)?;
        self.fs.log.begin_op();
        let result = (|| -> KResult<()> {
            let (parent, name) = namex(&self.fs, &self.fs.inodes, self.root, cwd, path, true)?;
            let name = name.ok_or(Error::InvalidArgument)?;
            let dir = self.fs.inodes.alloc(&self.fs, DiskInodeType::Dir)?;
            {
                let mut locked = self.fs.inodes.ilock(&self.fs, dir);
                locked.link_count_bump(&self.fs);
                locked.dir_init(&self.fs, parent.inum());
                self.fs.inodes.iunlock(locked);
            }
            let mut pdir = self.fs.inodes.ilock(&self.fs, parent);
            pdir.link_count_bump(&self.fs);
            let result = pdir.dir_link(&self.fs, &name, dir.inum());
            self.fs.inodes.iunlock(pdir);
            result
        })();
        self.fs.log.end_op(&self.fs.bcache);
        result
    }

    /// Creates a device-type inode bound to `(major, minor)` (spec.md
    /// `mknod`).
    pub fn mknod(&self, pid: u32, path: &str, major: u16, minor: u16) -> KResult<()> {
        let cwd = self.procs.with_proc(pid, |p| p.cwd).ok_or(Error::NoSuchProc)?.ok_or(Error::NoSuchProc)?;
        self.fs.log.begin_op();
        let result = (|| -> KResult<()> {
            let (parent, name) = namex(&self.fs, &self.fs.inodes, self.root, cwd, path, true)?;
            let name = name.ok_or(Error::InvalidArgument)?;
            let dev = self.fs.inodes.alloc(&self.fs, DiskInodeType::Device)?;
            {
                let mut locked = self.fs.inodes.ilock(&self.fs, dev);
                locked.set_kind_device(major, minor);
                locked.link_count_bump(&self.fs);
                self.fs.inodes.iunlock(locked);
            }
            let mut pdir = self.fs.inodes.ilock(&self.fs, parent);
            let link_result = pdir.dir_link(&self.fs, &name, dev.inum());
            self.fs.inodes.iunlock(pdir);
            link_result
        })();
        self.fs.log.end_op(&self.fs.bcache);
        result
    }

    pub fn chdir(&self, pid: u32, path: &str) -> KResult<()> {
        let cwd = self.procs.with_proc(pid, |p| p.cwd).ok_or(Error::NoSuchProc)?.ok_or(Error::NoSuchProc)?;
        let (ip, _) = namex(&self.fs, &self.fs.inodes, self.root, cwd, path, false)?;
        let locked = self.fs.inodes.ilock(&self.fs, ip);
        if locked.kind() != DiskInodeType::Dir {
            self.fs.inodes.iunlock(locked);
            crate::fs::inode::iput(&self.fs.inodes, &self.fs, ip);
            return Err(Error::NotADirectory);
        }
        self.fs.inodes.iunlock(locked);
        let old = self.procs.with_proc_mut(pid, |p| p.cwd.replace(ip)).flatten();
        if let Some(old) = old {
            self.fs.log.begin_op();
            crate::fs::inode::iput(&self.fs.inodes, &self.fs, old);
            self.fs.log.end_op(&self.fs.bcache);
        }
        Ok(())
    }

    /// Removes `name` from its parent directory, dropping one link from
    /// the target inode. If no other links or open references remain,
    /// `iput` truncates and frees it on the spot; if a process still has
    /// it open, truncation is deferred to that process's own `close`
    /// (spec.md end-to-end scenario 5).
    pub fn unlink(&self, pid: u32, path: &str) -> KResult<()> {
        let cwd = self.procs.with_proc(pid, |p| p.cwd).ok_or(Error::NoSuchProc)?.ok_or(Error::NoSuchProc)?;
        self.fs.log.begin_op();
        let result = (|| -> KResult<()> {
            let (parent, name) = namex(&self.fs, &self.fs.inodes, self.root, cwd, path, true)?;
            let name = name.ok_or(Error::InvalidArgument)?;
            let mut pdir = self.fs.inodes.ilock(&self.fs, parent);
            let (inum, off) = pdir.dir_lookup(&self.fs, &name).ok_or(Error::NotFound)?;
            let target = self.fs.inodes.iget(inum);
            {
                let mut target_locked = self.fs.inodes.ilock(&self.fs, target);
                if target_locked.kind() == DiskInodeType::Dir && !target_locked.dir_is_empty(&self.fs, ) {
                    self.fs.inodes.iunlock(target_locked);
                    self.fs.inodes.iunlock(pdir);
                    crate::fs::inode::iput(&self.fs.inodes, &self.fs, target);
                    return Err(Error::NotEmpty);
                }
                target_locked.link_count_drop(&self.fs);
                self.fs.inodes.iunlock(target_locked);
            }
            pdir.dir_unlink_at(&self.fs, off);
            self.fs.inodes.iunlock(pdir);
            crate::fs::inode::iput(&self.fs.inodes, &self.fs, target);
            Ok(())
        })();
        self.fs.log.end_op(&self.fs.bcache);
        result
    }

    pub fn link(&self, pid: u32, old: &str, new: &str) -> KResult<()> {
        let cwd = self.procs.with_proc(pid, |p| p.cwd).ok_or(Error::NoSuchProc)?.ok_or(Error::NoSuchProc)?;
        self.fs.log.begin_op();
        let result = (|| -> KResult<()> {
            let (target, _) = namex(&self.fs, &self.fs.inodes, self.root, cwd, old, false)?;
            {
                let mut locked = self.fs.inodes.ilock(&self.fs, target);
                locked.link_count_bump(&self.fs);
                self.fs.inodes.iunlock(locked);
            }
            let (parent, name) = namex(&self.fs, &self.fs.inodes, self.root, cwd, new, true)?;
            let name = name.ok_or(Error::InvalidArgument)?;
            let mut pdir = self.fs.inodes.ilock(&self.fs, parent);
            let link_result = pdir.dir_link(&self.fs, &name, target.inum());
            self.fs.inodes.iunlock(pdir);
            if link_result.is_err() {
                let mut locked = self.fs.inodes.ilock(&self.fs, target);
                locked.link_count_drop(&self.fs);
                self.fs.inodes.iunlock(locked);
            }
            crate::fs::inode::iput(&self.fs.inodes, &self.fs, target);
            link_result
        })();
        self.fs.log.end_op(&self.fs.bcache);
        result
    }

    pub fn occupied_process_count(&self) -> usize {
        self.procs.occupied_count()
    }

    pub fn process_state(&self, pid: u32) -> Option<ProcState> {
        self.procs.with_proc(pid, |p| p.state)
    }
}

#[cfg(test)]
mod tests {
    //! End-to-end scenarios from spec.md §8, driven through `Kernel`
    //! rather than any single subsystem. Every scenario spawns its driver
    //! as the boot ("init") process body and reports its assertions back
    //! over a channel, since a spawned process thread's own panics would
    //! otherwise go unobserved by the test harness (spec.md has no signal
    //! delivery; `exit`/`wait` are the only synchronization primitives a
    //! real kernel offers, so tests add a channel purely as an external
    //! probe).

    use super::*;
    use crate::block::MemBlockDevice;
    use std::sync::mpsc;
    use std::time::Duration;

    fn test_kernel(nblocks: u32, ninodes: u32) -> Arc<Kernel> {
        let _ = env_logger::try_init();
        let dev = Arc::new(MemBlockDevice::new(nblocks as usize));
        Kernel::new(dev, nblocks, ninodes)
    }

    /// Scenario: `fork` followed by `wait` reaps the child and leaves the
    /// process table with one fewer occupied slot than immediately after
    /// the fork.
    #[test]
    fn fork_then_wait_reaps_child_and_frees_slot() {
        let kernel = test_kernel(256, 64);
        let (tx, rx) = mpsc::channel();
        let k2 = Arc::clone(&kernel);
        kernel.userinit(b"\0", move |pid| {
            let k3 = Arc::clone(&k2);
            let child = k2.fork(pid, move |cpid| k3.exit(cpid, 0)).unwrap();
            let after_fork = k2.occupied_process_count();
            let (reaped, _status) = loop {
                match k2.wait(pid) {
                    Ok(r) => break r,
                    Err(_) => std::thread::yield_now(),
                }
            };
            let after_wait = k2.occupied_process_count();
            tx.send(reaped == child && after_wait + 1 == after_fork).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_secs(2)).expect("init timed out"));
    }

    /// Scenario: an open file survives `unlink` until the last fd closes;
    /// a reader opened before the unlink keeps seeing the file's content
    /// through its own fd, and the name is gone from the directory.
    #[test]
    fn unlink_of_open_file_stays_readable_until_close() {
        let kernel = test_kernel(256, 64);
        let (tx, rx) = mpsc::channel();
        let k2 = Arc::clone(&kernel);
        kernel.userinit(b"\0", move |pid| {
            let ok = (|| -> Option<bool> {
                let writer_fd = k2.open(pid, "foo", true, true, true).ok()?;
                if k2.write(pid, writer_fd, b"hello").ok() != Some(5) {
                    return Some(false);
                }
                // Opened before the unlink: pins the inode, own offset.
                let reader_fd = k2.open(pid, "foo", true, false, false).ok()?;
                k2.unlink(pid, "foo").ok()?;
                // The name is gone...
                if k2.open(pid, "foo", true, false, false).is_ok() {
                    return Some(false);
                }
                // ...but the already-open fd still reads the content.
                let mut buf = [0u8; 5];
                let n = k2.read(pid, reader_fd, &mut buf).ok()?;
                let content_ok = n == 5 && &buf == b"hello";
                k2.close(pid, writer_fd).ok()?;
                k2.close(pid, reader_fd).ok()?;
                Some(content_ok)
            })()
            .unwrap_or(false);
            tx.send(ok).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_secs(2)).expect("init timed out"));
    }

    /// Scenario: a process blocked reading an empty pipe observes
    /// `killed` after a concurrent `kill`, and its read fails rather than
    /// blocking forever.
    #[test]
    fn kill_unblocks_a_sleeping_pipe_reader() {
        let kernel = test_kernel(64, 16);
        let (tx, rx) = mpsc::channel();
        let k2 = Arc::clone(&kernel);
        let (pid_tx, pid_rx) = mpsc::channel();
        kernel.userinit(b"\0", move |pid| {
            let (rfd, _wfd) = k2.pipe(pid).unwrap();
            pid_tx.send(pid).unwrap();
            let mut buf = [0u8; 1];
            let result = k2.read(pid, rfd, &mut buf);
            tx.send(result.is_err()).unwrap();
        });
        let reader_pid = pid_rx.recv_timeout(Duration::from_secs(2)).expect("reader did not start");
        std::thread::sleep(Duration::from_millis(30));
        kernel.kill(reader_pid).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(2)).expect("reader never unblocked"));
    }

    /// Scenario: four processes each write 20*512 bytes of 'a' to distinct
    /// files and read them back; every file lands at the expected size and
    /// content, with no log/buffer-cache panic.
    #[test]
    fn concurrent_writers_each_see_their_own_bytes_back() {
        let kernel = test_kernel(512, 128);
        let mut receivers = Vec::new();
        for i in 0..4u32 {
            let (tx, rx) = mpsc::channel();
            receivers.push(rx);
            let k = Arc::clone(&kernel);
            kernel.userinit(b"\0", move |pid| {
                let name = format!("stressfs{}", i);
                let fd = k.open(pid, &name, true, true, true).unwrap();
                let chunk = [b'a'; 512];
                for _ in 0..20 {
                    k.write(pid, fd, &chunk).unwrap();
                }
                let stat = k.fstat(pid, fd).unwrap();
                let size_ok = stat.size == 20 * 512;
                k.close(pid, fd).unwrap();
                let fd2 = k.open(pid, &name, true, false, false).unwrap();
                let mut all_ok = size_ok;
                let mut buf = [0u8; 512];
                for _ in 0..20 {
                    let n = k.read(pid, fd2, &mut buf).unwrap();
                    all_ok &= n == 512 && buf.iter().all(|&b| b == b'a');
                }
                k.close(pid, fd2).unwrap();
                tx.send(all_ok).unwrap();
            });
        }
        for rx in receivers {
            assert!(rx.recv_timeout(Duration::from_secs(5)).expect("writer timed out"));
        }
    }
}
