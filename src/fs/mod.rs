//! On-disk file system layer (spec.md §4.7, §6 "On-disk file system layout").
//!
//! Geometry is fixed by a superblock at block 1: total block count, data
//! block count, inode count, log region, inode table start, and bitmap
//! start. Block 0 is reserved for boot and untouched here.

pub mod inode;
pub mod log;

use std::sync::Arc;

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::bio::Bcache;
use crate::block::BlockDevice;
use crate::error::{Error, KResult};
use crate::param::BSIZE;

pub use inode::{DiskInodeType, DirEntry, Inode, InodeCache};
pub use log::Log;

/// On-disk superblock: size/nblocks/ninodes/nlog/logstart/inodestart/
/// bmapstart, all little-endian 32-bit words (spec.md §6).
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct SuperBlock {
    pub size: u32,
    pub nblocks: u32,
    pub ninodes: u32,
    pub nlog: u32,
    pub logstart: u32,
    pub inodestart: u32,
    pub bmapstart: u32,
}

impl SuperBlock {
    const BLOCKNO: u32 = 1;

    fn read(bcache: &Bcache, dev: u32) -> Self {
        let b = bcache.read(dev, Self::BLOCKNO);
        Self::read_from_prefix(&b[..]).expect("superblock: block too small")
    }

    fn write(&self, bcache: &Bcache, dev: u32) {
        let mut b = bcache.get(dev, Self::BLOCKNO);
        b[..std::mem::size_of::<Self>()].copy_from_slice(self.as_bytes());
        bcache.write(&mut b);
    }

    /// Lays out a fresh file system of `nblocks` total blocks (inode table
    /// sized by `ninodes`) and returns the superblock describing it. Used
    /// by tests and by a from-scratch `mkfs`-equivalent.
    pub fn layout(nblocks: u32, ninodes: u32, nlog: u32) -> Self {
        let ipb = inode::inodes_per_block() as u32;
        let inode_blocks = ninodes.div_ceil(ipb);
        let logstart = 2;
        let inodestart = logstart + nlog;
        let bmap_blocks = nblocks.div_ceil(BSIZE as u32 * 8);
        let bmapstart = inodestart + inode_blocks;
        Self {
            size: nblocks,
            nblocks: nblocks - bmapstart - bmap_blocks,
            ninodes,
            nlog,
            logstart,
            inodestart,
            bmapstart,
        }
    }

    fn data_start(&self) -> u32 {
        self.bmapstart + self.size.div_ceil(BSIZE as u32 * 8)
    }
}

/// Bundles the singletons spec.md §9 describes threading through one
/// "kernel" value: the buffer cache, the write-ahead log, the superblock,
/// and the in-memory inode cache.
pub struct FileSystem {
    pub bcache: Arc<Bcache>,
    pub log: Arc<Log>,
    pub sb: SuperBlock,
    pub inodes: InodeCache,
    dev: u32,
}

impl FileSystem {
    /// Formats a brand-new file system on `device` (zeroed bitmap, zeroed
    /// inode table, root directory inode #1) and opens it.
    pub fn format(device: Arc<dyn BlockDevice>, dev: u32, nblocks: u32, ninodes: u32) -> Self {
        let bcache = Arc::new(Bcache::new(Arc::clone(&device)));
        let sb = SuperBlock::layout(nblocks, ninodes, crate::param::LOGSIZE as u32);
        sb.write(&bcache, dev);
        let log = Arc::new(Log::recover(&bcache, dev, sb.logstart, sb.nlog));
        let fs = Self { bcache, log, sb, inodes: InodeCache::new(), dev };
        fs.zero_inode_table();
        fs.zero_bitmap();
        fs.log.begin_op();
        let root = fs.inodes.alloc(&fs, DiskInodeType::Dir).expect("format: alloc root");
        {
            let mut root = fs.inodes.ilock(&fs, root);
            root.link_count_bump(&fs);
            root.dir_init(&fs, root.inum());
            fs.inodes.iunlock(root);
        }
        fs.log.end_op(&fs.bcache);
        fs
    }

    /// Opens an existing file system image, running log recovery first.
    pub fn mount(device: Arc<dyn BlockDevice>, dev: u32) -> Self {
        let bcache = Arc::new(Bcache::new(Arc::clone(&device)));
        let sb = SuperBlock::read(&bcache, dev);
        let log = Arc::new(Log::recover(&bcache, dev, sb.logstart, sb.nlog));
        Self { bcache, log, sb, inodes: InodeCache::new(), dev }
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    fn zero_inode_table(&self) {
        let ipb = inode::inodes_per_block() as u32;
        let blocks = self.sb.ninodes.div_ceil(ipb);
        for i in 0..blocks {
            let mut b = self.bcache.get(self.dev, self.sb.inodestart + i);
            b.fill(0);
            self.bcache.write(&mut b);
        }
    }

    fn zero_bitmap(&self) {
        let bmap_blocks = self.sb.size.div_ceil(BSIZE as u32 * 8);
        for i in 0..bmap_blocks {
            let mut b = self.bcache.get(self.dev, self.sb.bmapstart + i);
            b.fill(0);
            self.bcache.write(&mut b);
        }
    }

    /// Finds the first clear bit in the allocation bitmap, sets it, zeroes
    /// the block, and returns its block number (spec.md `balloc`).
    pub fn balloc(&self) -> KResult<u32> {
        let total = self.sb.nblocks;
        for b in 0..total {
            let bi = b % (BSIZE as u32 * 8);
            let bitmap_block = self.sb.bmapstart + b / (BSIZE as u32 * 8);
            if bi != 0 {
                continue;
            }
            let mut buf = self.bcache.get(self.dev, bitmap_block);
            for bit in 0..(BSIZE as u32 * 8).min(total - b) {
                let byte = (bit / 8) as usize;
                let mask = 1u8 << (bit % 8);
                if buf[byte] & mask == 0 {
                    buf[byte] |= mask;
                    self.log.log_write(&self.bcache, &buf);
                    drop(buf);
                    let blockno = self.sb.data_start() + b + bit;
                    let mut data = self.bcache.get(self.dev, blockno);
                    data.fill(0);
                    self.log.log_write(&self.bcache, &data);
                    return Ok(blockno);
                }
            }
        }
        Err(Error::NoFreeBlocks)
    }

    /// Clears the allocation bit for `blockno`. A fatal assertion if the
    /// block was already free (spec.md §4.7).
    pub fn bfree(&self, blockno: u32) {
        let rel = blockno - self.sb.data_start();
        let bitmap_block = self.sb.bmapstart + rel / (BSIZE as u32 * 8);
        let bit = rel % (BSIZE as u32 * 8);
        let byte = (bit / 8) as usize;
        let mask = 1u8 << (bit % 8);
        let mut buf = self.bcache.get(self.dev, bitmap_block);
        assert!(buf[byte] & mask != 0, "bfree: freeing already-free block {}", blockno);
        buf[byte] &= !mask;
        self.log.log_write(&self.bcache, &buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBlockDevice;

    fn fresh() -> FileSystem {
        let dev = Arc::new(MemBlockDevice::new(512));
        FileSystem::format(dev, 1, 512, 64)
    }

    #[test]
    fn balloc_bfree_roundtrip() {
        let fs = fresh();
        fs.log.begin_op();
        let b = fs.balloc().unwrap();
        fs.log.end_op(&fs.bcache);
        fs.log.begin_op();
        fs.bfree(b);
        fs.log.end_op(&fs.bcache);
        fs.log.begin_op();
        let b2 = fs.balloc().unwrap();
        fs.log.end_op(&fs.bcache);
        assert_eq!(b, b2);
    }

    #[test]
    #[should_panic(expected = "already-free")]
    fn double_free_aborts() {
        let fs = fresh();
        fs.log.begin_op();
        let b = fs.balloc().unwrap();
        fs.bfree(b);
        fs.bfree(b);
        fs.log.end_op(&fs.bcache);
    }

    #[test]
    fn root_directory_exists_after_format() {
        let fs = fresh();
        let root = fs.inodes.iget(1);
        let mut root = fs.inodes.ilock(&fs, root);
        assert_eq!(root.kind(), DiskInodeType::Dir);
        let (inum, _) = root.dir_lookup(&fs, ".").unwrap();
        assert_eq!(inum, root.inum());
        fs.inodes.iunlock(root);
    }
}
