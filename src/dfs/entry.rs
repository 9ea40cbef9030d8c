use heapless::String;

use crate::dfs::sector::Sector;
use crate::error::{BrutzelError, Result};

pub const MAX_PATH_LEN: usize = 243;

pub const FLAG_FILE: u32 = 0x0000_0000;
pub const FLAG_DIR: u32 = 0x1000_0000;
pub const FLAG_EOF: u32 = 0x2000_0000;
pub const FLAG_MASK: u32 = 0xF000_0000;
/// Low bits of a file entry's flags hold its length.
pub const SIZE_MASK: u32 = !FLAG_MASK;

const FLAGS_AT: usize = 0;
const NEXT_ENTRY_AT: usize = 4;
const PATH_AT: usize = 8;
const FILE_POINTER_AT: usize = 252;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    EndOfFile,
    Unknown(u32),
}

impl EntryKind {
    pub const fn from_flags(flags: u32) -> Self {
        match flags & FLAG_MASK {
            FLAG_FILE => EntryKind::File,
            FLAG_DIR => EntryKind::Directory,
            FLAG_EOF => EntryKind::EndOfFile,
            other => EntryKind::Unknown(other),
        }
    }
}

/// Read view of a sector holding a directory entry.
///
/// ```text
/// 0   flags         u32 BE
/// 4   next_entry    u32 BE
/// 8   path          243 bytes + NUL
/// 252 file_pointer  u32 BE
/// ```
#[derive(Clone, Copy)]
pub struct DirEntry<'a> {
    sector: &'a Sector,
}

impl<'a> DirEntry<'a> {
    pub fn new(sector: &'a Sector) -> Self {
        Self { sector }
    }

    pub fn offset(&self) -> u32 {
        self.sector.offset()
    }

    pub fn flags(&self) -> u32 {
        self.sector.read_u32(FLAGS_AT)
    }

    pub fn kind(&self) -> EntryKind {
        EntryKind::from_flags(self.flags())
    }

    /// Length of a file entry.
    pub fn size(&self) -> u32 {
        self.flags() & SIZE_MASK
    }

    pub fn next_entry(&self) -> u32 {
        self.sector.read_u32(NEXT_ENTRY_AT)
    }

    pub fn file_pointer(&self) -> u32 {
        self.sector.read_u32(FILE_POINTER_AT)
    }

    /// Raw name bytes up to the terminating NUL.
    pub fn name_bytes(&self) -> &'a [u8] {
        let raw = &self.sector.data()[PATH_AT..PATH_AT + MAX_PATH_LEN];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(MAX_PATH_LEN);
        &raw[..end]
    }

    /// Name as text. Bytes outside ASCII show up as `?`.
    pub fn path(&self) -> String<MAX_PATH_LEN> {
        let mut path = String::new();
        for &b in self.name_bytes() {
            let c = if b.is_ascii() { b as char } else { '?' };
            // at most MAX_PATH_LEN single-byte chars
            let _ = path.push(c);
        }
        path
    }
}

/// Write view of a sector holding a directory entry.
pub struct DirEntryMut<'a> {
    sector: &'a mut Sector,
}

impl<'a> DirEntryMut<'a> {
    pub fn new(sector: &'a mut Sector) -> Self {
        Self { sector }
    }

    pub fn view(&self) -> DirEntry<'_> {
        DirEntry::new(&*self.sector)
    }

    pub fn set_flags(&mut self, flags: u32) {
        self.sector.write_u32(FLAGS_AT, flags);
    }

    pub fn set_next_entry(&mut self, offset: u32) {
        self.sector.write_u32(NEXT_ENTRY_AT, offset);
    }

    pub fn set_file_pointer(&mut self, offset: u32) {
        self.sector.write_u32(FILE_POINTER_AT, offset);
    }

    pub fn set_path(&mut self, path: &str) -> Result<()> {
        check_name(path)?;
        let data = self.sector.data_mut();
        data[PATH_AT..PATH_AT + path.len()].copy_from_slice(path.as_bytes());
        data[PATH_AT + path.len()] = 0;
        Ok(())
    }
}

/// A single path component as stored in an entry.
pub fn check_name(name: &str) -> Result<()> {
    if name.len() > MAX_PATH_LEN {
        return Err(BrutzelError::InvalidArgument(format!(
            "name longer than {MAX_PATH_LEN} bytes: {name}"
        )));
    }
    if !name.is_ascii() || name.bytes().any(|b| b == 0) {
        return Err(BrutzelError::InvalidArgument(format!(
            "name must be ASCII without NUL: {name:?}"
        )));
    }
    Ok(())
}
