use std::collections::BTreeMap;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::round_up;
use crate::error::{BrutzelError, Result};

/// A save game's slice of save RAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveItem {
    pub offset: u32,
    /// Bytes requested.
    pub size: u32,
    /// Bytes reserved, `size` rounded up to the fragment size.
    pub size_in_memory: u32,
}

impl SaveItem {
    pub fn end(&self) -> u32 {
        self.offset + self.size_in_memory
    }
}

/// First-fit allocator over save RAM with explicit compaction.
#[derive(Debug, Clone)]
pub struct SaveRamAllocator {
    ram_size: u32,
    fragment_size: u32,
    bytes_free: u32,
    items: BTreeMap<u32, SaveItem>,
}

impl SaveRamAllocator {
    pub fn new(ram_size: u32, fragment_size: u32) -> Result<Self> {
        if fragment_size == 0 || ram_size % fragment_size != 0 {
            return Err(BrutzelError::InvalidArgument(format!(
                "save RAM of {ram_size} bytes cannot be split into {fragment_size} byte fragments"
            )));
        }
        Ok(Self {
            ram_size,
            fragment_size,
            bytes_free: ram_size,
            items: BTreeMap::new(),
        })
    }

    pub fn ram_size(&self) -> u32 {
        self.ram_size
    }

    pub fn fragment_size(&self) -> u32 {
        self.fragment_size
    }

    pub fn free_bytes(&self) -> u32 {
        self.bytes_free
    }

    /// Items in offset order.
    pub fn items(&self) -> impl Iterator<Item = &SaveItem> + '_ {
        self.items.values()
    }

    pub fn get(&self, offset: u32) -> Option<&SaveItem> {
        self.items.get(&offset)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Size of the biggest free range.
    pub fn largest_gap(&self) -> u32 {
        let mut cursor = 0;
        let mut largest = 0;
        for item in self.items.values() {
            largest = largest.max(item.offset - cursor);
            cursor = item.end();
        }
        largest.max(self.ram_size - cursor)
    }

    fn item_for(&self, size: u32) -> Result<u32> {
        if size == 0 {
            return Err(BrutzelError::InvalidArgument(
                "zero sized save item".to_string(),
            ));
        }
        match round_up(size, self.fragment_size) {
            Some(size_in_memory) if size_in_memory <= self.bytes_free => Ok(size_in_memory),
            _ => Err(BrutzelError::OutOfMemory {
                requested: size,
                available: self.bytes_free,
            }),
        }
    }

    fn insert(&mut self, item: SaveItem) -> SaveItem {
        self.bytes_free -= item.size_in_memory;
        self.items.insert(item.offset, item);
        debug!(
            "save item {:#x}: {} bytes ({} reserved)",
            item.offset, item.size, item.size_in_memory
        );
        item
    }

    /// Place `size` bytes in the first gap that fits.
    ///
    /// Fails with [`BrutzelError::Fragmented`] when enough memory is free in
    /// total but scattered; [`defragment`](Self::defragment) and retry.
    pub fn alloc(&mut self, size: u32) -> Result<SaveItem> {
        let size_in_memory = self.item_for(size)?;
        let mut candidate = 0;
        for item in self.items.values() {
            if item.offset - candidate >= size_in_memory {
                break;
            }
            candidate = item.end();
        }
        if candidate + size_in_memory > self.ram_size {
            return Err(BrutzelError::Fragmented { requested: size });
        }
        Ok(self.insert(SaveItem {
            offset: candidate,
            size,
            size_in_memory,
        }))
    }

    /// Place an item at a known offset, as recorded in an existing image.
    pub fn alloc_at(&mut self, offset: u32, size: u32) -> Result<SaveItem> {
        let size_in_memory = self.item_for(size)?;
        if offset % self.fragment_size != 0 {
            return Err(BrutzelError::Misaligned {
                offset,
                alignment: self.fragment_size,
            });
        }
        if u64::from(offset) + u64::from(size_in_memory) > u64::from(self.ram_size) {
            return Err(BrutzelError::OutOfBounds {
                offset,
                size: size_in_memory,
                limit: self.ram_size,
            });
        }
        let end = offset + size_in_memory;
        let before = self.items.range(..end).next_back();
        if let Some((_, item)) = before {
            if item.end() > offset {
                return Err(BrutzelError::AlreadyReserved(item.offset));
            }
        }
        Ok(self.insert(SaveItem {
            offset,
            size,
            size_in_memory,
        }))
    }

    pub fn release(&mut self, offset: u32) -> Result<SaveItem> {
        let item = self
            .items
            .remove(&offset)
            .ok_or(BrutzelError::NoSuchItem(offset))?;
        self.bytes_free += item.size_in_memory;
        debug!("released save item {offset:#x}");
        Ok(item)
    }

    /// Pack all items towards offset 0, preserving their order.
    ///
    /// `relocate` is called with each item that moves and its new offset
    /// before the item is updated, so the caller can copy the save data. If
    /// it fails, items moved so far keep their new offsets and the rest
    /// stay where they were.
    pub fn defragment<F>(&mut self, mut relocate: F) -> Result<()>
    where
        F: FnMut(&SaveItem, u32) -> Result<()>,
    {
        let snapshot: Vec<SaveItem> = self.items.values().copied().collect();
        let mut next_free = 0;
        let mut moved = 0;
        for item in snapshot {
            if item.offset > next_free {
                relocate(&item, next_free)?;
                self.items.remove(&item.offset);
                let packed = SaveItem {
                    offset: next_free,
                    ..item
                };
                self.items.insert(next_free, packed);
                moved += 1;
            }
            next_free += item.size_in_memory;
        }
        info!(
            "defragmented save RAM: {moved} items moved, {} bytes free",
            self.bytes_free
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> SaveRamAllocator {
        SaveRamAllocator::new(2048, 256).unwrap()
    }

    #[test]
    fn fragmented_then_defragmented() {
        let mut ram = allocator();
        let a = ram.alloc(300).unwrap();
        assert_eq!((a.offset, a.size_in_memory), (0, 512));
        let b = ram.alloc(100).unwrap();
        assert_eq!((b.offset, b.size_in_memory), (512, 256));
        ram.release(0).unwrap();
        assert_eq!(ram.free_bytes(), 1792);

        assert!(matches!(
            ram.alloc(2000),
            Err(BrutzelError::OutOfMemory { .. })
        ));
        let err = ram.alloc(1536).unwrap_err();
        assert!(matches!(err, BrutzelError::Fragmented { requested: 1536 }));
        assert!(err.is_recoverable());
        assert_eq!(ram.free_bytes(), 1792);

        let mut moves = Vec::new();
        ram.defragment(|item, to| {
            moves.push((item.offset, to));
            Ok(())
        })
        .unwrap();
        assert_eq!(moves, [(512, 0)]);
        let c = ram.alloc(1536).unwrap();
        assert_eq!(c.offset, 256);
        assert_eq!(ram.free_bytes(), 256);
    }

    #[test]
    fn first_fit_uses_earliest_gap() {
        let mut ram = allocator();
        for _ in 0..4 {
            ram.alloc(256).unwrap();
        }
        ram.release(256).unwrap();
        ram.release(512).unwrap();
        assert_eq!(ram.alloc(10).unwrap().offset, 256);
        assert_eq!(ram.alloc(10).unwrap().offset, 512);
        assert_eq!(ram.alloc(10).unwrap().offset, 1024);
    }

    #[test]
    fn items_never_overlap() {
        let mut ram = SaveRamAllocator::new(64 * 1024, 1024).unwrap();
        let sizes = [512, 4096, 1, 2048, 1500, 8192, 700];
        let mut live = Vec::new();
        for (i, &size) in sizes.iter().enumerate() {
            live.push(ram.alloc(size).unwrap());
            if i % 3 == 2 {
                ram.release(live.remove(0).offset).unwrap();
            }
        }
        let items: Vec<SaveItem> = ram.items().copied().collect();
        for pair in items.windows(2) {
            assert!(pair[0].end() <= pair[1].offset);
        }
        for item in &items {
            assert_eq!(item.offset % 1024, 0);
            assert!(item.size_in_memory >= item.size);
            assert!(item.end() <= ram.ram_size());
        }
        let used: u32 = items.iter().map(|i| i.size_in_memory).sum();
        assert_eq!(used + ram.free_bytes(), ram.ram_size());
    }

    #[test]
    fn defragment_packs_everything() {
        let mut ram = SaveRamAllocator::new(16 * 1024, 1024).unwrap();
        for _ in 0..8 {
            ram.alloc(1024).unwrap();
        }
        for offset in [0, 3 * 1024, 4 * 1024, 6 * 1024] {
            ram.release(offset).unwrap();
        }
        let sizes: Vec<u32> = ram.items().map(|i| i.size).collect();
        ram.defragment(|_, _| Ok(())).unwrap();
        let mut cursor = 0;
        for item in ram.items() {
            assert_eq!(item.offset, cursor);
            cursor = item.end();
        }
        assert_eq!(ram.items().map(|i| i.size).collect::<Vec<_>>(), sizes);
        assert_eq!(ram.largest_gap(), ram.free_bytes());
        assert!(ram.alloc(ram.free_bytes()).is_ok());
    }

    #[test]
    fn failed_relocation_stops_compaction() {
        let mut ram = allocator();
        ram.alloc(256).unwrap();
        ram.alloc(256).unwrap();
        ram.alloc(256).unwrap();
        ram.release(0).unwrap();
        let mut calls = 0;
        let result = ram.defragment(|_, _| {
            calls += 1;
            if calls == 2 {
                Err(BrutzelError::Timeout)
            } else {
                Ok(())
            }
        });
        assert!(matches!(result, Err(BrutzelError::Timeout)));
        let offsets: Vec<u32> = ram.items().map(|i| i.offset).collect();
        assert_eq!(offsets, [0, 512]);
        assert_eq!(ram.free_bytes(), 1536);
    }

    #[test]
    fn explicit_placement() {
        let mut ram = allocator();
        ram.alloc_at(512, 300).unwrap();
        assert!(matches!(
            ram.alloc_at(100, 10),
            Err(BrutzelError::Misaligned {
                offset: 100,
                alignment: 256
            })
        ));
        assert!(matches!(
            ram.alloc_at(1792, 300),
            Err(BrutzelError::OutOfBounds { .. })
        ));
        assert!(matches!(
            ram.alloc_at(768, 10),
            Err(BrutzelError::AlreadyReserved(512))
        ));
        assert!(matches!(
            ram.alloc_at(256, 300),
            Err(BrutzelError::AlreadyReserved(512))
        ));
        ram.alloc_at(256, 256).unwrap();
        ram.alloc_at(1024, 256).unwrap();
        assert_eq!(ram.alloc(1).unwrap().offset, 0);
        assert_eq!(ram.alloc(1).unwrap().offset, 1280);
    }

    #[test]
    fn release_unknown_offset() {
        let mut ram = allocator();
        ram.alloc(10).unwrap();
        assert!(matches!(ram.release(256), Err(BrutzelError::NoSuchItem(256))));
        assert!(ram.alloc(0).is_err());
        assert!(SaveRamAllocator::new(1000, 256).is_err());
    }

    #[test]
    fn largest_gap() {
        let mut ram = allocator();
        assert_eq!(ram.largest_gap(), 2048);
        ram.alloc_at(256, 10).unwrap();
        ram.alloc_at(1536, 10).unwrap();
        assert_eq!(ram.largest_gap(), 1024);
    }

    #[test]
    fn huge_requests_are_out_of_memory() {
        let mut ram = allocator();
        ram.alloc(10).unwrap();
        for size in [u32::MAX, u32::MAX - 200] {
            assert!(matches!(
                ram.alloc(size),
                Err(BrutzelError::OutOfMemory { requested, available: 1792 }) if requested == size
            ));
            assert!(matches!(
                ram.alloc_at(256, size),
                Err(BrutzelError::OutOfMemory { .. })
            ));
        }
        assert_eq!(ram.free_bytes(), 1792);
        assert_eq!(ram.items().count(), 1);
    }
}
