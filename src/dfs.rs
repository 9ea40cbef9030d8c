//! DragonFS: a read-mostly filesystem image built from 256-byte sectors.
//!
//! Sector 0 is a sentinel entry identifying the image. Every other sector is
//! either a directory entry or part of a file's data run. Entries of one
//! directory are chained through `next_entry`; a directory's `file_pointer`
//! names its first child and a file's `file_pointer` names the first sector
//! of its content, which is stored contiguously. Sectors are only ever
//! appended, so the image can be sent to the cartridge page by page.
//!
//! The last 8 bytes of sector 0 carry the number of payload sectors and the
//! CRC32 over them, refreshed every time the image is written out.

use std::collections::BTreeSet;
use std::io::{Read, Write};

use log::{debug, info};

use crate::error::{BrutzelError, Result};

pub use self::entry::{
    DirEntry, DirEntryMut, EntryKind, FLAG_DIR, FLAG_EOF, FLAG_FILE, FLAG_MASK, MAX_PATH_LEN,
    SIZE_MASK,
};
pub use self::sector::{Sector, SECTOR_SIZE};
pub use self::stream::{FileReader, FileWriter};

mod crc32;
mod entry;
mod sector;
mod stream;

pub const ROOT_FLAGS: u32 = 0xFFFF_FFFF;
pub const ROOT_NEXT_ENTRY: u32 = 0xDEAD_BEEF;
/// Format stamp: contiguous file data, length in the low 28 flag bits.
pub const ROOT_PATH: &str = "DragonFS 2.0";

const FOOTER_COUNT_AT: usize = SECTOR_SIZE - 8;
const FOOTER_CRC_AT: usize = SECTOR_SIZE - 4;

/// Something a path walk can stand on: the in-memory root or an entry sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryRef {
    Root,
    Sector(u32),
}

/// What `stat` and `list_directory` report about an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub offset: u32,
    pub name: String,
    pub kind: EntryKind,
    /// Content length for files, 0 otherwise.
    pub size: u32,
    pub file_pointer: u32,
}

impl EntryInfo {
    fn from_entry(entry: DirEntry<'_>) -> Self {
        let kind = entry.kind();
        Self {
            offset: entry.offset(),
            name: entry.path().as_str().to_string(),
            kind,
            size: if kind == EntryKind::File { entry.size() } else { 0 },
            file_pointer: entry.file_pointer(),
        }
    }
}

pub struct Dfs {
    sectors: Vec<Sector>,
    /// Virtual root directory, never part of the image.
    root: Sector,
    current: EntryRef,
}

impl Default for Dfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Dfs {
    pub fn new() -> Self {
        let mut fs = Self {
            sectors: Vec::new(),
            root: Sector::new(0),
            current: EntryRef::Root,
        };
        let sentinel = fs.new_sector();
        let mut entry = DirEntryMut::new(fs.sector_at_mut(sentinel));
        entry.set_flags(ROOT_FLAGS);
        entry.set_next_entry(ROOT_NEXT_ENTRY);
        // constant, always a valid name
        let _ = entry.set_path(ROOT_PATH);
        DirEntryMut::new(&mut fs.root).set_flags(FLAG_DIR);
        fs
    }

    /// Number of payload sectors, sector 0 excluded.
    pub fn sector_count(&self) -> usize {
        self.sectors.len() - 1
    }

    pub fn sectors(&self) -> &[Sector] {
        &self.sectors
    }

    /// Image size in bytes.
    pub fn image_len(&self) -> usize {
        self.sectors.len() * SECTOR_SIZE
    }

    fn new_sector(&mut self) -> usize {
        let index = self.sectors.len();
        self.sectors
            .push(Sector::new((index * SECTOR_SIZE) as u32));
        index
    }

    fn sector_at_mut(&mut self, index: usize) -> &mut Sector {
        &mut self.sectors[index]
    }

    /// Sector at byte offset `offset`.
    pub fn find_sector(&self, offset: u32) -> Result<&Sector> {
        let index = offset as usize / SECTOR_SIZE;
        match self.sectors.get(index) {
            Some(sector) if sector.offset() == offset => Ok(sector),
            _ => Err(BrutzelError::InvalidImage(format!(
                "no sector at offset {offset:#x}"
            ))),
        }
    }

    fn find_sector_mut(&mut self, offset: u32) -> Result<&mut Sector> {
        let index = offset as usize / SECTOR_SIZE;
        match self.sectors.get_mut(index) {
            Some(sector) if sector.offset() == offset => Ok(sector),
            _ => Err(BrutzelError::InvalidImage(format!(
                "no sector at offset {offset:#x}"
            ))),
        }
    }

    fn entry(&self, at: EntryRef) -> Result<DirEntry<'_>> {
        match at {
            EntryRef::Root => Ok(DirEntry::new(&self.root)),
            EntryRef::Sector(offset) => self.find_sector(offset).map(DirEntry::new),
        }
    }

    fn entry_mut(&mut self, at: EntryRef) -> Result<DirEntryMut<'_>> {
        match at {
            EntryRef::Root => Ok(DirEntryMut::new(&mut self.root)),
            EntryRef::Sector(offset) => self.find_sector_mut(offset).map(DirEntryMut::new),
        }
    }

    /// Search the children of `parent` for `name` with the given type flag.
    fn find_child(&self, parent: EntryRef, name: &str, flags: u32) -> Result<Option<EntryRef>> {
        let mut next = self.entry(parent)?.file_pointer();
        let mut steps = 0;
        while next != 0 {
            steps = self.chain_step(steps, next)?;
            let entry = self.entry(EntryRef::Sector(next))?;
            if entry.flags() & FLAG_MASK == flags && entry.name_bytes() == name.as_bytes() {
                return Ok(Some(EntryRef::Sector(next)));
            }
            next = entry.next_entry();
        }
        Ok(None)
    }

    /// A chain can't be longer than the image; a longer walk is a cycle.
    fn chain_step(&self, steps: usize, at: u32) -> Result<usize> {
        if steps >= self.sectors.len() {
            return Err(BrutzelError::InvalidImage(format!(
                "entry chain loops at {at:#x}"
            )));
        }
        Ok(steps + 1)
    }

    fn start_of(&self, path: &str) -> EntryRef {
        if path.starts_with('/') {
            EntryRef::Root
        } else {
            self.current
        }
    }

    /// Walk `path`; every component but the last must be a directory, the
    /// last one is matched against `flags`.
    fn resolve(&self, path: &str, flags: u32) -> Result<Option<EntryRef>> {
        let components = split_path(path);
        let mut current = self.start_of(path);
        if components.is_empty() {
            return Ok((flags == FLAG_DIR).then_some(current));
        }
        for (i, name) in components.iter().enumerate() {
            let wanted = if i == components.len() - 1 { flags } else { FLAG_DIR };
            match self.find_child(current, name, wanted)? {
                Some(found) => current = found,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Link `child` at the end of `parent`'s entry chain.
    fn append_child(&mut self, parent: EntryRef, child: u32) -> Result<()> {
        let first = self.entry(parent)?.file_pointer();
        if first == 0 {
            self.entry_mut(parent)?.set_file_pointer(child);
            return Ok(());
        }
        let mut tail = first;
        let mut steps = 0;
        loop {
            steps = self.chain_step(steps, tail)?;
            let next = self.entry(EntryRef::Sector(tail))?.next_entry();
            if next == 0 {
                break;
            }
            tail = next;
        }
        self.entry_mut(EntryRef::Sector(tail))?.set_next_entry(child);
        Ok(())
    }

    fn new_entry(&mut self, parent: EntryRef, name: &str, flags: u32) -> Result<EntryRef> {
        let index = self.new_sector();
        let mut entry = DirEntryMut::new(self.sector_at_mut(index));
        entry.set_flags(flags);
        entry.set_path(name)?;
        let offset = entry.view().offset();
        self.append_child(parent, offset)?;
        debug!("new entry {name} at {offset:#x}");
        Ok(EntryRef::Sector(offset))
    }

    /// Walk `path`, creating missing entries. The last component gets `last_flags`.
    fn create_path(&mut self, path: &str, last_flags: u32) -> Result<EntryRef> {
        let components = split_path(path);
        if components.is_empty() {
            return Err(BrutzelError::InvalidArgument(format!("empty path: {path:?}")));
        }
        for name in &components {
            entry::check_name(name)?;
        }
        let mut current = self.start_of(path);
        for (i, name) in components.iter().enumerate() {
            let flags = if i == components.len() - 1 { last_flags } else { FLAG_DIR };
            current = match self.find_child(current, name, flags)? {
                Some(found) => found,
                None => self.new_entry(current, name, flags)?,
            };
        }
        Ok(current)
    }

    pub fn create_directory(&mut self, path: &str) -> Result<()> {
        self.create_path(path, FLAG_DIR).map(|_| ())
    }

    pub fn directory_exists(&self, path: &str) -> Result<bool> {
        Ok(self.resolve(path, FLAG_DIR)?.is_some())
    }

    pub fn file_exists(&self, path: &str) -> Result<bool> {
        Ok(self.resolve(path, FLAG_FILE)?.is_some())
    }

    /// Change the directory relative paths start from.
    pub fn set_current_directory(&mut self, path: &str) -> Result<()> {
        self.current = self
            .resolve(path, FLAG_DIR)?
            .ok_or_else(|| BrutzelError::NotFound(path.to_string()))?;
        Ok(())
    }

    /// Open `path` for writing, creating it and its parents as needed.
    pub fn create(&mut self, path: &str) -> Result<FileWriter<'_>> {
        let entry = match self.create_path(path, FLAG_FILE)? {
            EntryRef::Sector(offset) => offset,
            EntryRef::Root => {
                return Err(BrutzelError::InvalidArgument(format!(
                    "{path} is the root directory"
                )))
            }
        };
        Ok(FileWriter::new(self, entry))
    }

    pub fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let mut writer = self.create(path)?;
        writer.write_all(data)?;
        writer.close()
    }

    pub fn open(&self, path: &str) -> Result<FileReader<'_>> {
        let Some(found) = self.resolve(path, FLAG_FILE)? else {
            return Err(BrutzelError::NotFound(path.to_string()));
        };
        let entry = self.entry(found)?;
        Ok(FileReader::new(self, entry.file_pointer(), entry.size()))
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let mut reader = self.open(path)?;
        let mut data = Vec::with_capacity(reader.len() as usize);
        reader.read_to_end(&mut data)?;
        Ok(data)
    }

    pub fn stat(&self, path: &str) -> Result<EntryInfo> {
        let found = match self.resolve(path, FLAG_FILE)? {
            Some(found) => found,
            None => self
                .resolve(path, FLAG_DIR)?
                .ok_or_else(|| BrutzelError::NotFound(path.to_string()))?,
        };
        Ok(EntryInfo::from_entry(self.entry(found)?))
    }

    /// Children of a directory in creation order.
    pub fn list_directory(&self, path: &str) -> Result<Vec<EntryInfo>> {
        let dir = self
            .resolve(path, FLAG_DIR)?
            .ok_or_else(|| BrutzelError::NotFound(path.to_string()))?;
        let mut entries = Vec::new();
        let mut next = self.entry(dir)?.file_pointer();
        let mut steps = 0;
        while next != 0 {
            steps = self.chain_step(steps, next)?;
            let entry = self.entry(EntryRef::Sector(next))?;
            entries.push(EntryInfo::from_entry(entry));
            next = entry.next_entry();
        }
        Ok(entries)
    }

    /// Called when a file stream is closed. Content goes into a fresh
    /// contiguous run, or over the existing run when it needs exactly as many
    /// sectors. The declared size is what keeps a run reachable, so a rewrite
    /// can neither drop nor add sectors.
    pub(crate) fn store_file_data(&mut self, entry_offset: u32, data: &[u8]) -> Result<()> {
        if data.len() > SIZE_MASK as usize {
            return Err(BrutzelError::FileTooLarge(data.len()));
        }
        let at = EntryRef::Sector(entry_offset);
        let (old_pointer, old_size) = {
            let entry = self.entry(at)?;
            (entry.file_pointer(), entry.size())
        };
        let needed = data.len().div_ceil(SECTOR_SIZE);
        let old_run = (old_size as usize).div_ceil(SECTOR_SIZE);

        let first = if needed == 0 {
            if old_pointer != 0 {
                return Err(BrutzelError::InvalidArgument(format!(
                    "cannot truncate file at {entry_offset:#x} to zero"
                )));
            }
            0
        } else if old_pointer != 0 {
            if needed != old_run {
                return Err(BrutzelError::InvalidArgument(format!(
                    "file at {entry_offset:#x} occupies {old_run} sectors, new content needs {needed}"
                )));
            }
            for i in 0..old_run {
                let offset = old_pointer + (i * SECTOR_SIZE) as u32;
                self.find_sector_mut(offset)?.data_mut().fill(0);
            }
            old_pointer
        } else {
            let first = self.new_sector();
            for _ in 1..needed {
                self.new_sector();
            }
            self.sectors[first].offset()
        };

        for (i, chunk) in data.chunks(SECTOR_SIZE).enumerate() {
            let offset = first + (i * SECTOR_SIZE) as u32;
            self.find_sector_mut(offset)?.data_mut()[..chunk.len()].copy_from_slice(chunk);
        }
        let mut entry = self.entry_mut(at)?;
        entry.set_flags(FLAG_FILE | data.len() as u32);
        entry.set_file_pointer(first);
        debug!(
            "stored {} bytes for entry {entry_offset:#x} at {first:#x}",
            data.len()
        );
        Ok(())
    }

    fn payload_crc(&self) -> u32 {
        crc32::crc32(self.sectors[1..].iter().map(|s| &s.data()[..]))
    }

    /// Refresh sector count and CRC in sector 0.
    pub fn update_footer(&mut self) {
        let count = self.sector_count() as u32;
        let crc = self.payload_crc();
        let sentinel = &mut self.sectors[0];
        sentinel.write_u32(FOOTER_COUNT_AT, count);
        sentinel.write_u32(FOOTER_CRC_AT, crc);
    }

    /// Write the complete image, sentinel first.
    pub fn write_image<W: Write>(&mut self, mut out: W) -> Result<()> {
        self.update_footer();
        for sector in &self.sectors {
            out.write_all(sector.data())?;
        }
        info!(
            "wrote DragonFS image: {} sectors, {} bytes",
            self.sectors.len(),
            self.image_len()
        );
        Ok(())
    }

    pub fn to_bytes(&mut self) -> Vec<u8> {
        self.update_footer();
        let mut image = Vec::with_capacity(self.image_len());
        for sector in &self.sectors {
            image.extend_from_slice(sector.data());
        }
        image
    }

    pub fn read_image<R: Read>(mut source: R) -> Result<Self> {
        let mut image = Vec::new();
        source.read_to_end(&mut image)?;
        Self::from_bytes(&image)
    }

    pub fn from_bytes(image: &[u8]) -> Result<Self> {
        if image.len() < SECTOR_SIZE || image.len() % SECTOR_SIZE != 0 {
            return Err(BrutzelError::InvalidImage(format!(
                "length {} is not a positive multiple of {SECTOR_SIZE}",
                image.len()
            )));
        }
        let sentinel = Sector::from_bytes(0, &image[..SECTOR_SIZE]);
        let root = DirEntry::new(&sentinel);
        if root.flags() != ROOT_FLAGS
            || root.next_entry() != ROOT_NEXT_ENTRY
            || root.name_bytes() != ROOT_PATH.as_bytes()
        {
            return Err(BrutzelError::InvalidImage(
                "root sentinel does not match".to_string(),
            ));
        }

        let mut fs = Self::new();
        fs.sectors.clear();
        for (i, chunk) in image.chunks(SECTOR_SIZE).enumerate() {
            fs.sectors
                .push(Sector::from_bytes((i * SECTOR_SIZE) as u32, chunk));
        }
        if fs.sectors.len() > 1 {
            // the first entry ever created is a child of the root
            DirEntryMut::new(&mut fs.root).set_file_pointer(SECTOR_SIZE as u32);
        }
        info!("loaded DragonFS image: {} sectors", fs.sectors.len());
        Ok(fs)
    }

    /// Compare the footer against the payload sectors.
    pub fn verify_checksum(&self) -> Result<()> {
        let sentinel = &self.sectors[0];
        let count = sentinel.read_u32(FOOTER_COUNT_AT) as usize;
        if count != self.sector_count() {
            return Err(BrutzelError::InvalidImage(format!(
                "footer counts {count} sectors, image has {}",
                self.sector_count()
            )));
        }
        let stored = sentinel.read_u32(FOOTER_CRC_AT);
        let actual = self.payload_crc();
        if stored != actual {
            return Err(BrutzelError::InvalidImage(format!(
                "CRC mismatch: footer {stored:#010x}, payload {actual:#010x}"
            )));
        }
        Ok(())
    }

    /// Every payload sector must be reachable from the root, either as an
    /// entry or as part of a file's data run.
    pub fn verify_no_orphans(&self) -> Result<()> {
        let mut unvisited: BTreeSet<u32> = self.sectors[1..].iter().map(|s| s.offset()).collect();
        let mut pending = Vec::new();
        let first = self.root_entry().file_pointer();
        if first != 0 {
            pending.push(first);
        }
        while let Some(offset) = pending.pop() {
            let entry = self.entry(EntryRef::Sector(offset))?;
            if !unvisited.remove(&offset) {
                return Err(BrutzelError::InvalidImage(format!(
                    "entry {offset:#x} is referenced twice"
                )));
            }
            let pointer = entry.file_pointer();
            match entry.kind() {
                EntryKind::Directory if pointer != 0 => pending.push(pointer),
                EntryKind::File if pointer != 0 => {
                    let run = (entry.size() as usize).div_ceil(SECTOR_SIZE);
                    for i in 0..run {
                        let data = pointer + (i * SECTOR_SIZE) as u32;
                        self.find_sector(data)?;
                        unvisited.remove(&data);
                    }
                }
                _ => {}
            }
            if entry.next_entry() != 0 {
                pending.push(entry.next_entry());
            }
        }
        if unvisited.is_empty() {
            Ok(())
        } else {
            Err(BrutzelError::OrphanSectors(unvisited.into_iter().collect()))
        }
    }

    /// Footer check followed by the reachability audit.
    pub fn audit(&self) -> Result<()> {
        self.verify_checksum()?;
        self.verify_no_orphans()
    }

    fn root_entry(&self) -> DirEntry<'_> {
        DirEntry::new(&self.root)
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}
