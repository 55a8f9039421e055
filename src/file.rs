//! Open-file table and file-descriptor-level operations (spec.md §4.8).
//!
//! Open-file objects live in one global, reference-counted table; a
//! process's descriptor array (kept in `crate::proc`) holds indices into
//! it. `dup` and `fork` bump the reference count rather than copying the
//! object.

use std::sync::{Arc, Mutex};

use crate::device::DeviceTable;
use crate::error::{Error, KResult};
use crate::fs::inode::InodeRef;
use crate::fs::FileSystem;
use crate::lock::Spinlock;
use crate::param::NFILE;
use crate::pipe::Pipe;
use crate::stat::Stat;

enum Kind {
    Pipe { pipe: Arc<Pipe>, write_end: bool },
    Inode { ip: InodeRef, offset: Mutex<u32> },
    Device { major: u16 },
}

struct Slot {
    kind: Option<Kind>,
    readable: bool,
    writable: bool,
    refcnt: u32,
}

impl Slot {
    fn empty() -> Self {
        Self { kind: None, readable: false, writable: false, refcnt: 0 }
    }
}

/// An index into the global open-file table. Cheap to copy; `dup`/`fork`
/// just bump the referenced slot's count.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FileHandle(usize);

/// The system-wide open-file table (spec.md "Open file").
pub struct FileTable {
    slots: Spinlock<Vec<Slot>>,
}

impl FileTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(NFILE);
        slots.resize_with(NFILE, Slot::empty);
        Self { slots: Spinlock::new("filetable", slots) }
    }

    fn alloc(&self, kind: Kind, readable: bool, writable: bool) -> KResult<FileHandle> {
        let mut slots = self.slots.lock();
        let idx = slots.iter().position(|s| s.refcnt == 0).ok_or(Error::NoFreeFiles)?;
        slots[idx] = Slot { kind: Some(kind), readable, writable, refcnt: 1 };
        Ok(FileHandle(idx))
    }

    pub fn open_pipe(&self, pipe: Arc<Pipe>, write_end: bool) -> KResult<FileHandle> {
        self.alloc(Kind::Pipe { pipe, write_end }, !write_end, write_end)
    }

    pub fn open_inode(&self, ip: InodeRef, readable: bool, writable: bool) -> KResult<FileHandle> {
        self.alloc(Kind::Inode { ip, offset: Mutex::new(0) }, readable, writable)
    }

    pub fn open_device(&self, major: u16, readable: bool, writable: bool) -> KResult<FileHandle> {
        self.alloc(Kind::Device { major }, readable, writable)
    }

    /// Bumps the reference count (spec.md `dup`/`fork` fanning descriptors
    /// out over the same open-file object).
    pub fn dup(&self, handle: FileHandle) -> FileHandle {
        self.slots.lock()[handle.0].refcnt += 1;
        handle
    }

    /// Releases one reference. On the last release, tears down the
    /// underlying object: closes the pipe endpoint, or `iput`s the inode
    /// inside its own log transaction (spec.md `close`).
    pub fn close(&self, handle: FileHandle, fs: &FileSystem) {
        let kind = {
            let mut slots = self.slots.lock();
            let slot = &mut slots[handle.0];
            assert!(slot.refcnt > 0, "fileclose: double close");
            slot.refcnt -= 1;
            if slot.refcnt > 0 {
                return;
            }
            slot.kind.take()
        };
        match kind {
            Some(Kind::Pipe { pipe, write_end }) => {
                if write_end {
                    pipe.close_write();
                } else {
                    pipe.close_read();
                }
            }
            Some(Kind::Inode { ip, .. }) => {
                fs.log.begin_op();
                crate::fs::inode::iput(&fs.inodes, fs, ip);
                fs.log.end_op(&fs.bcache);
            }
            Some(Kind::Device { .. }) | None => {}
        }
    }

    fn with_slot<R>(&self, handle: FileHandle, f: impl FnOnce(&Slot) -> R) -> R {
        let slots = self.slots.lock();
        f(&slots[handle.0])
    }

    pub fn readable(&self, handle: FileHandle) -> bool {
        self.with_slot(handle, |s| s.readable)
    }

    pub fn writable(&self, handle: FileHandle) -> bool {
        self.with_slot(handle, |s| s.writable)
    }

    /// Reads via the handle's underlying object, dispatching to pipe,
    /// inode (through the inode sleeplock, advancing the stored offset),
    /// or a registered device major (spec.md `fileread`).
    pub fn read(&self, handle: FileHandle, fs: &FileSystem, devices: &DeviceTable, dst: &mut [u8], killed: impl Fn() -> bool) -> KResult<usize> {
        if !self.readable(handle) {
            return Err(Error::BadFd);
        }
        let ip_and_off = {
            let slots = self.slots.lock();
            match slots[handle.0].kind.as_ref().expect("read: closed handle") {
                Kind::Pipe { pipe, .. } => return pipe.read(dst, killed),
                Kind::Device { major } => Some((*major, None)),
                Kind::Inode { .. } => None,
            }
        };
        if let Some((major, _)) = ip_and_off {
            return devices.get(major)?.read(dst);
        }
        let slots = self.slots.lock();
        let (ip, off) = match slots[handle.0].kind.as_ref().unwrap() {
            Kind::Inode { ip, offset } => (*ip, *offset.lock().unwrap()),
            _ => unreachable!(),
        };
        drop(slots);
        let mut locked = fs.inodes.ilock(fs, ip);
        let n = locked.read(fs, dst, off, dst.len() as u32)?;
        fs.inodes.iunlock(locked);
        let slots = self.slots.lock();
        if let Kind::Inode { offset, .. } = slots[handle.0].kind.as_ref().unwrap() {
            *offset.lock().unwrap() = off + n;
        }
        Ok(n as usize)
    }

    /// Writes via the handle's underlying object. Inode writes are split
    /// by the caller into chunks that each fit inside one log
    /// transaction (spec.md §4.8): this method performs one `begin_op`/
    /// `end_op` pair per chunk so no single syscall can overrun the log
    /// budget.
    pub fn write(&self, handle: FileHandle, fs: &FileSystem, devices: &DeviceTable, src: &[u8], killed: impl Fn() -> bool) -> KResult<usize> {
        if !self.writable(handle) {
            return Err(Error::BadFd);
        }
        {
            let slots = self.slots.lock();
            match slots[handle.0].kind.as_ref().expect("write: closed handle") {
                Kind::Pipe { pipe, .. } => return pipe.write(src, killed),
                Kind::Device { major } => {
                    let major = *major;
                    drop(slots);
                    return devices.get(major)?.write(src);
                }
                Kind::Inode { .. } => {}
            }
        }
        let max_per_op = max_write_chunk();
        let mut written = 0usize;
        while written < src.len() {
            let chunk = (src.len() - written).min(max_per_op);
            let off = {
                let slots = self.slots.lock();
                match slots[handle.0].kind.as_ref().unwrap() {
                    Kind::Inode { offset, .. } => *offset.lock().unwrap(),
                    _ => unreachable!(),
                }
            };
            fs.log.begin_op();
            let ip = {
                let slots = self.slots.lock();
                match slots[handle.0].kind.as_ref().unwrap() {
                    Kind::Inode { ip, .. } => *ip,
                    _ => unreachable!(),
                }
            };
            let mut locked = fs.inodes.ilock(fs, ip);
            let n = locked.write(fs, &src[written..written + chunk], off, chunk as u32);
            fs.inodes.iunlock(locked);
            fs.log.end_op(&fs.bcache);
            let n = n?;
            let slots = self.slots.lock();
            if let Kind::Inode { offset, .. } = slots[handle.0].kind.as_ref().unwrap() {
                *offset.lock().unwrap() = off + n;
            }
            written += n as usize;
            if n == 0 {
                break;
            }
        }
        Ok(written)
    }

    pub fn stat(&self, handle: FileHandle, fs: &FileSystem) -> KResult<Stat> {
        let ip = {
            let slots = self.slots.lock();
            match slots[handle.0].kind.as_ref().ok_or(Error::BadFd)? {
                Kind::Inode { ip, .. } => *ip,
                _ => return Err(Error::InvalidArgument),
            }
        };
        let locked = fs.inodes.ilock(fs, ip);
        let stat = Stat::from_inode(fs.dev(), &locked);
        fs.inodes.iunlock(locked);
        Ok(stat)
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Largest single write any inode write chunk is split into, so that one
/// chunk (plus the inode and bitmap writes it may also touch) always fits
/// within `MAXOPBLOCKS` (spec.md §4.8).
fn max_write_chunk() -> usize {
    ((crate::param::MAXOPBLOCKS - 4) / 2) * crate::param::BSIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBlockDevice;
    use crate::fs::inode::DiskInodeType;
    use std::sync::Arc as StdArc;

    fn fs_and_file() -> (FileSystem, FileHandle, FileTable) {
        let dev = StdArc::new(MemBlockDevice::new(1024));
        let fs = FileSystem::format(dev, 1, 1024, 128);
        fs.log.begin_op();
        let ip = fs.inodes.alloc(&fs, DiskInodeType::File).unwrap();
        fs.log.end_op(&fs.bcache);
        let table = FileTable::new();
        let handle = table.open_inode(ip, true, true).unwrap();
        (fs, handle, table)
    }

    #[test]
    fn write_then_read_through_file_table() {
        let (fs, handle, table) = fs_and_file();
        let devices = DeviceTable::new();
        let n = table.write(handle, &fs, &devices, b"abc", || false).unwrap();
        assert_eq!(n, 3);
        let mut buf = [0u8; 3];
        let n = table.read(handle, &fs, &devices, &mut buf, || false).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn dup_keeps_object_alive_until_both_close() {
        let (fs, handle, table) = fs_and_file();
        let dup = table.dup(handle);
        table.close(handle, &fs);
        // Still open via the dup: writing should succeed.
        let devices = DeviceTable::new();
        assert!(table.write(dup, &fs, &devices, b"x", || false).is_ok());
        table.close(dup, &fs);
    }

    #[test]
    fn pipe_endpoints_route_through_pipe() {
        let pipe = StdArc::new(Pipe::new());
        let table = FileTable::new();
        let reader = table.open_pipe(StdArc::clone(&pipe), false).unwrap();
        let writer = table.open_pipe(pipe, true).unwrap();
        let dev = StdArc::new(MemBlockDevice::new(64));
        let fs = FileSystem::format(dev, 1, 64, 16);
        let devices = DeviceTable::new();
        table.write(writer, &fs, &devices, b"hi", || false).unwrap();
        let mut buf = [0u8; 2];
        let n = table.read(reader, &fs, &devices, &mut buf, || false).unwrap();
        assert_eq!(&buf[..n], b"hi");
    }
}
