use std::io::{self, Read, Seek, SeekFrom, Write};

use log::warn;

use crate::dfs::sector::SECTOR_SIZE;
use crate::dfs::Dfs;
use crate::error::Result;

/// Buffers file content in memory. Sectors are only allocated when the
/// writer is closed, once the final length is known.
pub struct FileWriter<'a> {
    fs: &'a mut Dfs,
    entry: u32,
    buffer: Vec<u8>,
    closed: bool,
}

impl<'a> FileWriter<'a> {
    pub(crate) fn new(fs: &'a mut Dfs, entry: u32) -> Self {
        Self {
            fs,
            entry,
            buffer: Vec::new(),
            closed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Place the content in the image and update the directory entry.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        let data = std::mem::take(&mut self.buffer);
        self.fs.store_file_data(self.entry, &data)
    }
}

impl Write for FileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for FileWriter<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let data = std::mem::take(&mut self.buffer);
        if let Err(err) = self.fs.store_file_data(self.entry, &data) {
            warn!("dropping file data at entry {:#x}: {err}", self.entry);
        }
    }
}

/// Reads a file's contiguous sector run.
pub struct FileReader<'a> {
    fs: &'a Dfs,
    first_sector: u32,
    len: u32,
    position: u64,
}

impl<'a> FileReader<'a> {
    pub(crate) fn new(fs: &'a Dfs, first_sector: u32, len: u32) -> Self {
        Self {
            fs,
            first_sector,
            len,
            position: 0,
        }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Read for FileReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = u64::from(self.len);
        let mut done = 0;
        while done < buf.len() && self.position < len {
            let index = (self.position / SECTOR_SIZE as u64) as u32;
            let within = (self.position % SECTOR_SIZE as u64) as usize;
            let offset = self.first_sector + index * SECTOR_SIZE as u32;
            let sector = self
                .fs
                .find_sector(offset)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let count = (buf.len() - done)
                .min(SECTOR_SIZE - within)
                .min((len - self.position) as usize);
            buf[done..done + count].copy_from_slice(&sector.data()[within..within + count]);
            done += count;
            self.position += count as u64;
        }
        Ok(done)
    }
}

impl Seek for FileReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(d) => u64::from(self.len).checked_add_signed(d),
            SeekFrom::Current(d) => self.position.checked_add_signed(d),
        };
        let Some(target) = target else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            ));
        };
        self.position = target;
        Ok(target)
    }
}
