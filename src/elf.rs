//! ELF32 header and program-header parsing (spec.md §6 "ELF loader").

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{Error, KResult};

const MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const PT_LOAD: u32 = 1;

#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct ElfHeader {
    pub magic: [u8; 4],
    pub ident: [u8; 12],
    pub kind: u16,
    pub machine: u16,
    pub version: u32,
    pub entry: u32,
    pub phoff: u32,
    pub shoff: u32,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct ProgramHeader {
    pub kind: u32,
    pub offset: u32,
    pub vaddr: u32,
    pub paddr: u32,
    pub filesz: u32,
    pub memsz: u32,
    pub flags: u32,
    pub align: u32,
}

impl ElfHeader {
    pub fn parse(bytes: &[u8]) -> KResult<Self> {
        let header = Self::read_from_prefix(bytes).ok_or(Error::BadElf)?;
        if header.magic != MAGIC {
            return Err(Error::BadElf);
        }
        Ok(header)
    }
}

impl ProgramHeader {
    pub fn is_load(&self) -> bool {
        self.kind == PT_LOAD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header(phnum: u16) -> Vec<u8> {
        let header = ElfHeader {
            magic: MAGIC,
            ident: [0; 12],
            kind: 2,
            machine: 3,
            version: 1,
            entry: 0x1000,
            phoff: std::mem::size_of::<ElfHeader>() as u32,
            shoff: 0,
            flags: 0,
            ehsize: std::mem::size_of::<ElfHeader>() as u16,
            phentsize: std::mem::size_of::<ProgramHeader>() as u16,
            phnum,
            shentsize: 0,
            shnum: 0,
            shstrndx: 0,
        };
        header.as_bytes().to_vec()
    }

    #[test]
    fn parses_valid_magic() {
        let bytes = sample_header(1);
        let header = ElfHeader::parse(&bytes).unwrap();
        assert_eq!(header.entry, 0x1000);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample_header(1);
        bytes[0] = 0;
        assert_eq!(ElfHeader::parse(&bytes).unwrap_err(), Error::BadElf);
    }
}
