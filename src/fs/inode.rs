//! In-memory inode cache, block mapping, directories, and path resolution
//! (spec.md §4.7).
//!
//! Mirrors the split [`crate::bio::Bcache`] uses: a spinlock-protected
//! identity/refcount table (`meta`) separate from a per-slot sleeplock
//! guarding the cached fields themselves, so `iget` can pin an inode for a
//! long-lived reference (an open file, a process's cwd) without holding a
//! lock, while `ilock` takes the lock only for the duration of one
//! operation.

use std::convert::TryFrom;

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{Error, KResult};
use crate::fs::FileSystem;
use crate::lock::sleeplock::SleeplockGuard;
use crate::lock::{Sleeplock, Spinlock};
use crate::param::{BSIZE, DIRSIZ, MAXFILE, NDIRECT, NINDIRECT, NINODE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DiskInodeType {
    None = 0,
    File = 1,
    Dir = 2,
    Device = 3,
}

impl DiskInodeType {
    fn from_u16(v: u16) -> Self {
        match v {
            0 => Self::None,
            1 => Self::File,
            2 => Self::Dir,
            3 => Self::Device,
            other => panic!("ilock: corrupted inode type {}", other),
        }
    }
}

/// On-disk inode record. `addrs` holds `NDIRECT` direct block numbers
/// followed by one singly-indirect block pointer.
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct DiskInode {
    kind: u16,
    major: u16,
    minor: u16,
    nlink: u16,
    size: u32,
    addrs: [u32; NDIRECT + 1],
}

impl DiskInode {
    fn zeroed() -> Self {
        Self { kind: 0, major: 0, minor: 0, nlink: 0, size: 0, addrs: [0; NDIRECT + 1] }
    }
}

pub const fn inodes_per_block() -> usize {
    BSIZE / std::mem::size_of::<DiskInode>()
}

/// A fixed-size directory entry: inode number (0 = free slot) and a name up
/// to `DIRSIZ` bytes.
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct DirEntry {
    pub inum: u16,
    pub name: [u8; DIRSIZ],
}

impl DirEntry {
    fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(DIRSIZ);
        std::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    fn named(inum: u16, name: &str) -> Self {
        let mut buf = [0u8; DIRSIZ];
        let bytes = name.as_bytes();
        let n = bytes.len().min(DIRSIZ);
        buf[..n].copy_from_slice(&bytes[..n]);
        Self { inum, name: buf }
    }
}

struct Slot {
    dev: u32,
    inum: u32,
    refcnt: u32,
    valid: bool,
}

impl Slot {
    fn empty() -> Self {
        Self { dev: 0, inum: 0, refcnt: 0, valid: false }
    }
}

/// A pinned but (possibly) unlocked reference to a cached inode, as
/// returned by `iget`/`dirlookup`. Carries no borrow of the lock; callers
/// must `ilock` before touching fields.
#[derive(Clone, Copy)]
pub struct InodeRef {
    idx: usize,
    dev: u32,
    inum: u32,
}

impl InodeRef {
    pub fn inum(&self) -> u32 {
        self.inum
    }
}

/// The in-memory inode table (spec.md "In-memory inode cache").
pub struct InodeCache {
    meta: Spinlock<Vec<Slot>>,
    content: Vec<Sleeplock<DiskInode>>,
}

impl InodeCache {
    pub fn new() -> Self {
        let mut meta = Vec::with_capacity(NINODE);
        let mut content = Vec::with_capacity(NINODE);
        for _ in 0..NINODE {
            meta.push(Slot::empty());
            content.push(Sleeplock::new("inode", DiskInode::zeroed()));
        }
        Self { meta: Spinlock::new("icache", meta), content }
    }

    /// Returns a cached, pinned, *unlocked* handle for `(dev, inum)`.
    /// Never touches disk (spec.md `iget`).
    pub fn iget_dev(&self, dev: u32, inum: u32) -> InodeRef {
        let mut meta = self.meta.lock();
        if let Some(idx) = meta.iter().position(|s| s.refcnt > 0 && s.dev == dev && s.inum == inum) {
            meta[idx].refcnt += 1;
            return InodeRef { idx, dev, inum };
        }
        let idx = meta
            .iter()
            .position(|s| s.refcnt == 0)
            .expect("iget: inode cache full");
        meta[idx] = Slot { dev, inum, refcnt: 1, valid: false };
        InodeRef { idx, dev, inum }
    }

    pub fn iget(&self, inum: u32) -> InodeRef {
        self.iget_dev(1, inum)
    }

    /// Increments the reference count of an already-pinned inode
    /// (spec.md §9 open question (a): `idup` returns the bumped handle).
    pub fn idup(&self, ip: InodeRef) -> InodeRef {
        self.meta.lock()[ip.idx].refcnt += 1;
        ip
    }

    /// Locks `ip`, reading it from disk on first touch (spec.md `ilock`).
    pub fn ilock<'a>(&'a self, fs: &FileSystem, ip: InodeRef) -> Inode<'a> {
        let mut content = self.content[ip.idx].lock();
        let needs_read = !self.meta.lock()[ip.idx].valid;
        if needs_read {
            let ipb = inodes_per_block() as u32;
            let blockno = fs.sb.inodestart + ip.inum / ipb;
            let off = (ip.inum % ipb) as usize * std::mem::size_of::<DiskInode>();
            let b = fs.bcache.read(ip.dev, blockno);
            *content = DiskInode::read_from_prefix(&b[off..off + std::mem::size_of::<DiskInode>()])
                .expect("ilock: short inode record");
            assert_ne!(content.kind, 0, "ilock: inode {} has type 0 on disk", ip.inum);
            self.meta.lock()[ip.idx].valid = true;
        }
        Inode { cache: self, ip, content }
    }

    pub fn iunlock(&self, inode: Inode<'_>) {
        drop(inode);
    }

    /// Allocates a free inode slot of the requested type (spec.md "Inode
    /// allocator"). Caller must already be inside a log operation.
    pub fn alloc(&self, fs: &FileSystem, kind: DiskInodeType) -> KResult<InodeRef> {
        let ipb = inodes_per_block() as u32;
        let blocks = fs.sb.ninodes.div_ceil(ipb);
        for blk in 0..blocks {
            let blockno = fs.sb.inodestart + blk;
            let mut b = fs.bcache.get(fs.dev(), blockno);
            for slot in 0..ipb {
                let inum = blk * ipb + slot;
                if inum == 0 || inum >= fs.sb.ninodes {
                    continue;
                }
                let off = slot as usize * std::mem::size_of::<DiskInode>();
                let existing =
                    DiskInode::read_from_prefix(&b[off..off + std::mem::size_of::<DiskInode>()]).unwrap();
                if existing.kind == 0 {
                    let fresh = DiskInode { kind: kind as u16, major: 0, minor: 0, nlink: 0, size: 0, addrs: [0; NDIRECT + 1] };
                    b[off..off + std::mem::size_of::<DiskInode>()].copy_from_slice(fresh.as_bytes());
                    fs.log.log_write(&fs.bcache, &b);
                    return Ok(self.iget_dev(fs.dev(), inum));
                }
            }
        }
        Err(Error::NoFreeInodes)
    }
}

impl Default for InodeCache {
    fn default() -> Self {
        Self::new()
    }
}

/// A locked, cache-backed inode (spec.md "In-memory inode"). Borrowed
/// reads/writes of the cached `DiskInode` go through the accessor methods
/// below; `iupdate` persists them.
pub struct Inode<'a> {
    cache: &'a InodeCache,
    ip: InodeRef,
    content: SleeplockGuard<'a, DiskInode>,
}

impl Inode<'_> {
    pub fn inum(&self) -> u32 {
        self.ip.inum
    }

    pub fn ip(&self) -> InodeRef {
        self.ip
    }

    pub fn kind(&self) -> DiskInodeType {
        DiskInodeType::from_u16(self.content.kind)
    }

    pub fn size(&self) -> u32 {
        self.content.size
    }

    pub fn nlink(&self) -> u16 {
        self.content.nlink
    }

    pub fn major(&self) -> u16 {
        self.content.major
    }

    pub fn minor(&self) -> u16 {
        self.content.minor
    }

    pub fn set_kind_device(&mut self, major: u16, minor: u16) {
        self.content.kind = DiskInodeType::Device as u16;
        self.content.major = major;
        self.content.minor = minor;
    }

    pub fn link_count_bump(&mut self, fs: &FileSystem) {
        self.content.nlink += 1;
        self.update(fs);
    }

    pub fn link_count_drop(&mut self, fs: &FileSystem) {
        assert!(self.content.nlink > 0, "link_count_drop: already zero");
        self.content.nlink -= 1;
        self.update(fs);
    }

    /// Writes the in-memory copy back to disk (spec.md `iupdate`). Caller
    /// must be inside a log operation.
    pub fn update(&self, fs: &FileSystem) {
        let ipb = inodes_per_block() as u32;
        let blockno = fs.sb.inodestart + self.ip.inum / ipb;
        let off = (self.ip.inum % ipb) as usize * std::mem::size_of::<DiskInode>();
        let mut b = fs.bcache.get(self.ip.dev, blockno);
        b[off..off + std::mem::size_of::<DiskInode>()].copy_from_slice(self.content.as_bytes());
        fs.log.log_write(&fs.bcache, &b);
    }

    /// Returns the device block holding the `n`-th block of this file's
    /// content, allocating direct/indirect blocks on demand (spec.md
    /// `bmap`). Aborts past `MAXFILE`.
    fn bmap(&mut self, fs: &FileSystem, n: usize) -> KResult<u32> {
        assert!(n < MAXFILE, "bmap: offset {} past MAXFILE", n);
        if n < NDIRECT {
            if self.content.addrs[n] == 0 {
                self.content.addrs[n] = fs.balloc()?;
            }
            return Ok(self.content.addrs[n]);
        }
        let n = n - NDIRECT;
        assert!(n < NINDIRECT, "bmap: offset past NINDIRECT");
        if self.content.addrs[NDIRECT] == 0 {
            self.content.addrs[NDIRECT] = fs.balloc()?;
        }
        let indirect_block = self.content.addrs[NDIRECT];
        let mut ib = fs.bcache.get(self.ip.dev, indirect_block);
        let off = n * 4;
        let mut target = u32::from_le_bytes(ib[off..off + 4].try_into().unwrap());
        if target == 0 {
            target = fs.balloc()?;
            ib[off..off + 4].copy_from_slice(&target.to_le_bytes());
            fs.log.log_write(&fs.bcache, &ib);
        }
        Ok(target)
    }

    /// Frees all direct and indirect data blocks, the indirect container
    /// block, and resets size/addrs to zero (spec.md "Truncation").
    pub fn truncate(&mut self, fs: &FileSystem) {
        for i in 0..NDIRECT {
            if self.content.addrs[i] != 0 {
                fs.bfree(self.content.addrs[i]);
                self.content.addrs[i] = 0;
            }
        }
        if self.content.addrs[NDIRECT] != 0 {
            let ib = fs.bcache.read(self.ip.dev, self.content.addrs[NDIRECT]);
            for i in 0..NINDIRECT {
                let off = i * 4;
                let target = u32::from_le_bytes(ib[off..off + 4].try_into().unwrap());
                if target != 0 {
                    fs.bfree(target);
                }
            }
            drop(ib);
            fs.bfree(self.content.addrs[NDIRECT]);
            self.content.addrs[NDIRECT] = 0;
        }
        self.content.size = 0;
        self.update(fs);
    }

    /// Reads up to `n` bytes starting at `off` into `dst`, clamped to the
    /// current size (spec.md `readi`). Device inodes are out of scope for
    /// this in-memory-backend-only layer; callers dispatch those through
    /// `crate::file` before reaching here.
    pub fn read(&mut self, fs: &FileSystem, dst: &mut [u8], off: u32, n: u32) -> KResult<u32> {
        if off > self.content.size {
            return Ok(0);
        }
        let n = n.min(self.content.size.saturating_sub(off));
        let mut read = 0u32;
        while read < n {
            let blockno = self.bmap(fs, ((off + read) / BSIZE as u32) as usize)?;
            let page_off = ((off + read) % BSIZE as u32) as usize;
            let chunk = (n - read).min(BSIZE as u32 - page_off as u32);
            let b = fs.bcache.read(self.ip.dev, blockno);
            let start = read as usize;
            dst[start..start + chunk as usize].copy_from_slice(&b[page_off..page_off + chunk as usize]);
            read += chunk;
        }
        Ok(read)
    }

    /// Writes `src` at `off`, extending the file (and `size`) as needed up
    /// to `MAXFILE` blocks (spec.md `writei`). Caller must be inside a log
    /// operation and must already have split large writes into chunks that
    /// fit one transaction (spec.md §4.8).
    pub fn write(&mut self, fs: &FileSystem, src: &[u8], off: u32, n: u32) -> KResult<u32> {
        if (off + n) as usize > MAXFILE * BSIZE {
            return Err(Error::FileTooLarge);
        }
        let mut written = 0u32;
        while written < n {
            let blockno = self.bmap(fs, ((off + written) / BSIZE as u32) as usize)?;
            let page_off = ((off + written) % BSIZE as u32) as usize;
            let chunk = (n - written).min(BSIZE as u32 - page_off as u32);
            let mut b = fs.bcache.get(self.ip.dev, blockno);
            let start = written as usize;
            b[page_off..page_off + chunk as usize].copy_from_slice(&src[start..start + chunk as usize]);
            fs.log.log_write(&fs.bcache, &b);
            written += chunk;
        }
        if off + written > self.content.size {
            self.content.size = off + written;
        }
        self.update(fs);
        Ok(written)
    }

    fn dir_entry_count(&self) -> u32 {
        self.content.size / std::mem::size_of::<DirEntry>() as u32
    }

    /// Initializes a freshly allocated directory inode with "." and ".."
    /// entries pointing at itself and `parent`.
    pub fn dir_init(&mut self, fs: &FileSystem, parent: u32) {
        let dot = DirEntry::named(self.ip.inum as u16, ".");
        let dotdot = DirEntry::named(parent as u16, "..");
        self.write(fs, dot.as_bytes(), 0, std::mem::size_of::<DirEntry>() as u32).expect("dir_init: write .");
        self.write(
            fs,
            dotdot.as_bytes(),
            std::mem::size_of::<DirEntry>() as u32,
            std::mem::size_of::<DirEntry>() as u32,
        )
        .expect("dir_init: write ..");
    }

    /// Scans directory content for `name`, returning the matching inode
    /// number and the byte offset of its entry (spec.md `dirlookup`).
    pub fn dir_lookup(&mut self, fs: &FileSystem, name: &str) -> Option<(u32, u32)> {
        assert_eq!(self.kind(), DiskInodeType::Dir, "dirlookup: not a directory");
        let entry_size = std::mem::size_of::<DirEntry>() as u32;
        for i in 0..self.dir_entry_count() {
            let mut buf = [0u8; std::mem::size_of::<DirEntry>()];
            self.read(fs, &mut buf, i * entry_size, entry_size).expect("dirlookup: read");
            let entry = DirEntry::read_from(&buf[..]).unwrap();
            if entry.inum != 0 && entry.name_str() == name {
                return Some((entry.inum as u32, i * entry_size));
            }
        }
        None
    }

    /// Links `name` to `inum` in this directory, appending a fresh entry
    /// or reusing a free one (spec.md `dirlink`). Fails if `name` already
    /// exists.
    pub fn dir_link(&mut self, fs: &FileSystem, name: &str, inum: u32) -> KResult<()> {
        if self.dir_lookup(fs, name).is_some() {
            return Err(Error::AlreadyExists);
        }
        let entry_size = std::mem::size_of::<DirEntry>() as u32;
        let mut off = 0u32;
        let mut free_off = None;
        while off < self.content.size {
            let mut buf = [0u8; std::mem::size_of::<DirEntry>()];
            self.read(fs, &mut buf, off, entry_size).expect("dirlink: read");
            let entry = DirEntry::read_from(&buf[..]).unwrap();
            if entry.inum == 0 {
                free_off = Some(off);
                break;
            }
            off += entry_size;
        }
        let target_off = free_off.unwrap_or(self.content.size);
        let entry = DirEntry::named(inum as u16, name);
        self.write(fs, entry.as_bytes(), target_off, entry_size)?;
        Ok(())
    }

    /// Clears the entry at `offset` (spec.md unlink support: the caller
    /// looked it up via `dir_lookup` first).
    pub fn dir_unlink_at(&mut self, fs: &FileSystem, offset: u32) {
        let entry = DirEntry { inum: 0, name: [0u8; DIRSIZ] };
        let entry_size = std::mem::size_of::<DirEntry>() as u32;
        self.write(fs, entry.as_bytes(), offset, entry_size).expect("dir_unlink_at: write");
    }

    /// True if this directory's content is only "." and "..".
    pub fn dir_is_empty(&mut self, fs: &FileSystem) -> bool {
        let entry_size = std::mem::size_of::<DirEntry>() as u32;
        for i in 2..self.dir_entry_count() {
            let mut buf = [0u8; std::mem::size_of::<DirEntry>()];
            self.read(fs, &mut buf, i * entry_size, entry_size).expect("dir_is_empty: read");
            let entry = DirEntry::read_from(&buf[..]).unwrap();
            if entry.inum != 0 {
                return false;
            }
        }
        true
    }
}

/// Decrements the reference count of `ip`. If it drops to zero while the
/// cached copy is valid with zero links, truncates the file, zeroes its
/// on-disk type, and invalidates the slot (spec.md `iput`). Caller must be
/// inside a log operation whenever the zero-link path can trigger (spec.md
/// §9 open question (d)).
pub fn iput(cache: &InodeCache, fs: &FileSystem, ip: InodeRef) {
    let should_free = {
        let meta = cache.meta.lock();
        meta[ip.idx].refcnt == 1 && meta[ip.idx].valid
    };
    if should_free {
        let mut locked = cache.ilock(fs, ip);
        if locked.content.nlink == 0 {
            locked.truncate(fs);
            locked.content.kind = 0;
            locked.update(fs);
            cache.meta.lock()[ip.idx].valid = false;
        }
        drop(locked);
    }
    let mut meta = cache.meta.lock();
    meta[ip.idx].refcnt -= 1;
}

/// Resolves `path` against `root` (used for absolute paths) or `cwd`
/// (relative), returning the leaf inode, or — if `want_parent` — the
/// parent inode plus the trailing element name (spec.md `namex`).
pub fn namex(
    fs: &FileSystem,
    cache: &InodeCache,
    root: InodeRef,
    cwd: InodeRef,
    path: &str,
    want_parent: bool,
) -> KResult<(InodeRef, Option<String>)> {
    let mut cur = if path.starts_with('/') { cache.idup(root) } else { cache.idup(cwd) };
    let elements: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if elements.is_empty() {
        return Ok((cur, None));
    }
    for (i, elem) in elements.iter().enumerate() {
        let is_last = i == elements.len() - 1;
        let mut locked = cache.ilock(fs, cur);
        if locked.kind() != DiskInodeType::Dir {
            cache.iunlock(locked);
            iput(cache, fs, cur);
            return Err(Error::NotADirectory);
        }
        if want_parent && is_last {
            cache.iunlock(locked);
            return Ok((cur, Some((*elem).to_string())));
        }
        let found = locked.dir_lookup(fs, elem);
        cache.iunlock(locked);
        match found {
            Some((inum, _)) => {
                let next = cache.iget_dev(cur.dev, inum);
                iput(cache, fs, cur);
                cur = next;
            }
            None => {
                iput(cache, fs, cur);
                return Err(Error::NotFound);
            }
        }
    }
    Ok((cur, None))
}

impl TryFrom<u16> for DiskInodeType {
    type Error = Error;
    fn try_from(v: u16) -> Result<Self, Error> {
        Ok(match v {
            0 => Self::None,
            1 => Self::File,
            2 => Self::Dir,
            3 => Self::Device,
            _ => return Err(Error::InvalidArgument),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBlockDevice;
    use crate::fs::FileSystem;
    use std::sync::Arc;

    fn fresh() -> FileSystem {
        let dev = Arc::new(MemBlockDevice::new(1024));
        FileSystem::format(dev, 1, 1024, 128)
    }

    #[test]
    fn write_then_read_matches() {
        let fs = fresh();
        fs.log.begin_op();
        let file = fs.inodes.alloc(&fs, DiskInodeType::File).unwrap();
        {
            let mut ip = fs.inodes.ilock(&fs, file);
            ip.write(&fs, b"hello, file", 0, 11).unwrap();
            fs.inodes.iunlock(ip);
        }
        fs.log.end_op(&fs.bcache);

        let mut ip = fs.inodes.ilock(&fs, file);
        let mut buf = [0u8; 11];
        let n = ip.read(&fs, &mut buf, 0, 11).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&buf, b"hello, file");
        assert_eq!(ip.size(), 11);
    }

    #[test]
    fn write_past_ndirect_allocates_indirect_block() {
        let fs = fresh();
        fs.log.begin_op();
        let file = fs.inodes.alloc(&fs, DiskInodeType::File).unwrap();
        let mut ip = fs.inodes.ilock(&fs, file);
        let chunk = [7u8; BSIZE];
        for i in 0..NDIRECT + 2 {
            ip.write(&fs, &chunk, (i * BSIZE) as u32, BSIZE as u32).unwrap();
        }
        fs.inodes.iunlock(ip);
        fs.log.end_op(&fs.bcache);
        let mut ip = fs.inodes.ilock(&fs, file);
        assert_eq!(ip.size() as usize, (NDIRECT + 2) * BSIZE);
        let mut buf = [0u8; BSIZE];
        ip.read(&fs, &mut buf, ((NDIRECT + 1) * BSIZE) as u32, BSIZE as u32).unwrap();
        assert_eq!(buf[0], 7);
    }

    #[test]
    fn write_past_maxfile_fails() {
        let fs = fresh();
        fs.log.begin_op();
        let file = fs.inodes.alloc(&fs, DiskInodeType::File).unwrap();
        let mut ip = fs.inodes.ilock(&fs, file);
        let err = ip.write(&fs, b"x", (MAXFILE * BSIZE) as u32, 1).unwrap_err();
        assert_eq!(err, Error::FileTooLarge);
        fs.inodes.iunlock(ip);
        fs.log.end_op(&fs.bcache);
    }

    #[test]
    fn dirlink_then_dirlookup_roundtrips() {
        let fs = fresh();
        fs.log.begin_op();
        let file = fs.inodes.alloc(&fs, DiskInodeType::File).unwrap();
        let root = fs.inodes.iget(1);
        {
            let mut dir = fs.inodes.ilock(&fs, root);
            dir.dir_link(&fs, "greeting.txt", file.inum()).unwrap();
            fs.inodes.iunlock(dir);
        }
        fs.log.end_op(&fs.bcache);
        let mut dir = fs.inodes.ilock(&fs, root);
        let (inum, _) = dir.dir_lookup(&fs, "greeting.txt").unwrap();
        assert_eq!(inum, file.inum());
        fs.inodes.iunlock(dir);
    }

    #[test]
    fn unlink_drops_links_and_frees_blocks_when_unreferenced() {
        let fs = fresh();
        fs.log.begin_op();
        let file = fs.inodes.alloc(&fs, DiskInodeType::File).unwrap();
        {
            let mut ip = fs.inodes.ilock(&fs, file);
            ip.link_count_bump(&fs);
            ip.write(&fs, b"x", 0, 1).unwrap();
            fs.inodes.iunlock(ip);
        }
        {
            let mut ip = fs.inodes.ilock(&fs, file);
            ip.link_count_drop(&fs);
            fs.inodes.iunlock(ip);
        }
        iput(&fs.inodes, &fs, file);
        fs.log.end_op(&fs.bcache);

        let again = fs.inodes.iget(file.inum());
        let ip = fs.inodes.ilock(&fs, again);
        assert_eq!(ip.kind(), DiskInodeType::None);
        fs.inodes.iunlock(ip);
    }

    #[test]
    fn namex_resolves_nested_path() {
        let fs = fresh();
        fs.log.begin_op();
        let root = fs.inodes.iget(1);
        let sub = fs.inodes.alloc(&fs, DiskInodeType::Dir).unwrap();
        {
            let mut subdir = fs.inodes.ilock(&fs, sub);
            subdir.link_count_bump(&fs);
            subdir.dir_init(&fs, root.inum());
            fs.inodes.iunlock(subdir);
        }
        {
            let mut dir = fs.inodes.ilock(&fs, root);
            dir.dir_link(&fs, "sub", sub.inum()).unwrap();
            fs.inodes.iunlock(dir);
        }
        let leaf = fs.inodes.alloc(&fs, DiskInodeType::File).unwrap();
        {
            let mut subdir = fs.inodes.ilock(&fs, sub);
            subdir.dir_link(&fs, "leaf.txt", leaf.inum()).unwrap();
            fs.inodes.iunlock(subdir);
        }
        fs.log.end_op(&fs.bcache);

        let (found, _) = namex(&fs, &fs.inodes, root, root, "/sub/leaf.txt", false).unwrap();
        assert_eq!(found.inum(), leaf.inum());
    }
}
