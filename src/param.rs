//! Compile-time kernel parameters.

/// Maximum number of processes.
pub const NPROC: usize = 64;

/// Maximum number of CPUs.
pub const NCPU: usize = 8;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Open files per system.
pub const NFILE: usize = 100;

/// Maximum number of active in-memory inodes.
pub const NINODE: usize = 50;

/// Maximum major device number.
pub const NDEV: usize = 10;

/// Device number of the file system root disk.
pub const ROOTDEV: u32 = 1;

/// Max exec arguments.
pub const MAXARG: usize = 32;

/// Block size, in bytes.
pub const BSIZE: usize = 512;

/// Max number of distinct blocks any single filesystem operation may log.
pub const MAXOPBLOCKS: usize = 10;

/// Max data blocks in the on-disk log.
pub const LOGSIZE: usize = MAXOPBLOCKS * 3;

/// Size of the disk block cache, in buffers.
pub const NBUF: usize = MAXOPBLOCKS * 3;

/// Maximum file path name length.
pub const MAXPATH: usize = 128;

/// Maximum length of a directory entry name.
pub const DIRSIZ: usize = 14;

/// Maximum length of a process name (for debugging).
pub const MAXPROCNAME: usize = 16;

/// Page size, in bytes. x86 4 KiB pages.
pub const PGSIZE: usize = 4096;

/// Number of direct block pointers in an inode.
pub const NDIRECT: usize = 12;

/// Number of block pointers reachable through the single indirect block.
pub const NINDIRECT: usize = BSIZE / core::mem::size_of::<u32>();

/// Largest file size expressible with direct + single-indirect pointers.
pub const MAXFILE: usize = NDIRECT + NINDIRECT;

/// Default pipe buffer capacity, in bytes.
pub const PIPESIZE: usize = 512;

/// Default total number of 4 KiB frames in the simulated physical memory
/// arena (tests may construct smaller arenas explicitly).
pub const DEFAULT_NPAGES: usize = 4096;
