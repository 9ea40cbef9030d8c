//! ROM file handling before it goes to flash.
//!
//! The cartridge expects data in byte-swapped order (each 16-bit word's two
//! bytes exchanged). Dumps in native big-endian order are converted page by
//! page; the DragonFS image goes through the same swap before flashing.

use crate::device::PAGE_SIZE;
use crate::error::{BrutzelError, Result};

pub type Page = [u8; PAGE_SIZE];

/// First word of a big-endian ROM.
pub const BIG_ENDIAN_MAGIC: u32 = 0x8037_1240;
/// First word of a byte-swapped ROM.
pub const BYTE_SWAPPED_MAGIC: u32 = 0x3780_4012;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    BigEndian,
    ByteSwapped,
    Unknown,
}

impl ByteOrder {
    pub fn detect(data: &[u8]) -> Self {
        match header(data) {
            Some(BIG_ENDIAN_MAGIC) => ByteOrder::BigEndian,
            Some(BYTE_SWAPPED_MAGIC) => ByteOrder::ByteSwapped,
            _ => ByteOrder::Unknown,
        }
    }
}

fn header(data: &[u8]) -> Option<u32> {
    let word: [u8; 4] = data.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(word))
}

pub fn is_big_endian(data: &[u8]) -> bool {
    ByteOrder::detect(data) == ByteOrder::BigEndian
}

/// Exchange the bytes of every 16-bit word. A trailing odd byte stays.
pub fn byteswap(data: &mut [u8]) {
    for pair in data.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
}

/// Split `data` into zero-padded pages, at most `max_bytes` worth.
pub fn pages(data: &[u8], max_bytes: usize) -> Vec<Page> {
    let data = &data[..data.len().min(max_bytes)];
    data.chunks(PAGE_SIZE)
        .map(|chunk| {
            let mut page = [0u8; PAGE_SIZE];
            page[..chunk.len()].copy_from_slice(chunk);
            page
        })
        .collect()
}

/// Pages of a game ROM in the order the cartridge reads them.
pub fn cartridge_pages(data: &[u8], max_bytes: usize) -> Vec<Page> {
    let mut pages = pages(data, max_bytes);
    if is_big_endian(data) {
        for page in &mut pages {
            byteswap(page);
        }
    }
    pages
}

/// A boot ROM must carry one of the two known headers.
pub fn boot_pages(data: &[u8], max_bytes: usize) -> Result<Vec<Page>> {
    match ByteOrder::detect(data) {
        ByteOrder::Unknown => Err(BrutzelError::InvalidImage(format!(
            "not a ROM, header {:x?}",
            header(data)
        ))),
        _ => Ok(cartridge_pages(data, max_bytes)),
    }
}

/// Pages of a DragonFS image, byte-swapped for the boot flash.
pub fn image_pages(image: &[u8]) -> Vec<Page> {
    let mut pages = pages(image, image.len());
    for page in &mut pages {
        byteswap(page);
    }
    pages
}
