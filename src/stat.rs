//! `fstat` result (spec.md §6: "Stat holds {device, inode number, type,
//! nlink, size}").

use crate::fs::inode::{DiskInodeType, Inode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub dev: u32,
    pub ino: u32,
    pub kind: DiskInodeType,
    pub nlink: u16,
    pub size: u32,
}

impl Stat {
    pub fn from_inode(dev: u32, ip: &Inode<'_>) -> Self {
        Self {
            dev,
            ino: ip.inum(),
            kind: ip.kind(),
            nlink: ip.nlink(),
            size: ip.size(),
        }
    }

    /// Fixed little-endian wire layout copied to user memory by `fstat`
    /// (spec.md §6 "Stat holds {device, inode number, type, nlink,
    /// size}"): dev, ino, kind (as its on-disk discriminant), nlink, size.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.dev.to_le_bytes());
        out[4..8].copy_from_slice(&self.ino.to_le_bytes());
        out[8..10].copy_from_slice(&(self.kind as u16).to_le_bytes());
        out[10..12].copy_from_slice(&self.nlink.to_le_bytes());
        out[12..16].copy_from_slice(&self.size.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_bytes_is_little_endian_and_16_bytes_wide() {
        let st = Stat { dev: 1, ino: 2, kind: DiskInodeType::File, nlink: 1, size: 0x1000 };
        let bytes = st.to_bytes();
        assert_eq!(bytes.len(), 16);
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 2);
        assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), 0x1000);
    }
}
