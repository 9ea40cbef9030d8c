use bytes::{Buf, BufMut};

pub const SECTOR_SIZE: usize = 256;

/// One fixed-size block of the image, identified by its byte offset.
#[derive(Clone, PartialEq, Eq)]
pub struct Sector {
    offset: u32,
    data: Box<[u8; SECTOR_SIZE]>,
}

impl Sector {
    pub fn new(offset: u32) -> Self {
        Self {
            offset,
            data: Box::new([0; SECTOR_SIZE]),
        }
    }

    pub fn from_bytes(offset: u32, bytes: &[u8]) -> Self {
        let mut sector = Self::new(offset);
        let len = bytes.len().min(SECTOR_SIZE);
        sector.data[..len].copy_from_slice(&bytes[..len]);
        sector
    }

    pub const fn offset(&self) -> u32 {
        self.offset
    }

    pub fn data(&self) -> &[u8; SECTOR_SIZE] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8; SECTOR_SIZE] {
        &mut self.data
    }

    /// Big-endian word at byte `at`.
    pub fn read_u32(&self, at: usize) -> u32 {
        (&self.data[at..at + 4]).get_u32()
    }

    pub fn write_u32(&mut self, at: usize, value: u32) {
        (&mut self.data[at..at + 4]).put_u32(value);
    }
}

impl std::fmt::Debug for Sector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sector")
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("head", &&self.data[..8])
            .finish()
    }
}
