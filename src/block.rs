//! Block device driver interface (spec.md §4.5).
//!
//! The PIO IDE driver itself is a peripheral collaborator excluded from
//! this spec (spec.md §1); what belongs here is the contract the buffer
//! cache drives it through, plus the in-memory backend spec.md calls out
//! as satisfying "the same contract for tests".

use crate::param::BSIZE;

/// A single disk block's worth of bytes.
pub type BlockData = [u8; BSIZE];

/// Whether an I/O request is a read or a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

/// A block storage device: read/write-sector semantics plus one
/// completion signal per request. Real drivers (PIO IDE, virtio, ...)
/// queue requests FIFO and deliver completion via an interrupt; this
/// trait models the same shape without assuming either.
pub trait BlockDevice: Send + Sync {
    /// Reads block `blockno` into `buf`.
    fn read_block(&self, blockno: u32, buf: &mut BlockData);

    /// Writes `buf` to block `blockno`.
    fn write_block(&self, blockno: u32, buf: &BlockData);

    /// Total number of blocks on the device, if known.
    fn num_blocks(&self) -> Option<u32> {
        None
    }
}

/// An in-memory block device: the "alternate in-memory backend" spec.md
/// §4.5 calls for test use.
pub struct MemBlockDevice {
    blocks: std::sync::Mutex<Vec<BlockData>>,
}

impl MemBlockDevice {
    pub fn new(nblocks: usize) -> Self {
        Self {
            blocks: std::sync::Mutex::new(vec![[0u8; BSIZE]; nblocks]),
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, blockno: u32, buf: &mut BlockData) {
        let blocks = self.blocks.lock().unwrap();
        buf.copy_from_slice(&blocks[blockno as usize]);
    }

    fn write_block(&self, blockno: u32, buf: &BlockData) {
        let mut blocks = self.blocks.lock().unwrap();
        blocks[blockno as usize].copy_from_slice(buf);
    }

    fn num_blocks(&self) -> Option<u32> {
        Some(self.blocks.lock().unwrap().len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_after_write_round_trips() {
        let dev = MemBlockDevice::new(4);
        let mut block = [0u8; BSIZE];
        block[0] = 7;
        dev.write_block(2, &block);
        let mut out = [0u8; BSIZE];
        dev.read_block(2, &mut out);
        assert_eq!(out[0], 7);
    }
}
