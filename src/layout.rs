//! Memory map of the cartridge and the record of what is stored where.
//!
//! The ROM flash is split into partitions handed to games, save RAM is split
//! between the games' save files. Which game owns what is kept in
//! [`CartridgeLayout`], stored inside the DragonFS image so a later session
//! can restore both allocators from the image read back from the cartridge.

use std::str::FromStr;

use heapless::{String, Vec as BoundedVec};
use log::info;
use serde::{Deserialize, Serialize};

use crate::dfs::Dfs;
use crate::error::{BrutzelError, Result};
use crate::memory::{PartitionAllocator, SaveItem, SaveRamAllocator};

pub const ROM_OFFSET: u32 = 0;
pub const ROM_SIZE: u32 = 64 * 1024 * 1024;
pub const ROM_SECTOR_SIZE: u32 = 256 * 1024;
pub const BOOT_OFFSET: u32 = ROM_OFFSET + ROM_SIZE;
pub const BOOT_SIZE: u32 = 8 * 1024 * 1024;
pub const BOOT_SECTOR_SIZE: u32 = 4 * 1024;
pub const PAGE_SIZE: u32 = 256;
/// Where the DragonFS image lives in boot flash.
pub const DFS_OFFSET: u32 = BOOT_OFFSET + 0x20_0000;
/// Space reserved for the image, up to the end of boot flash.
pub const DFS_MAX_SIZE: u32 = BOOT_OFFSET + BOOT_SIZE - DFS_OFFSET;

pub const SAVE_RAM_SIZE: u32 = 256 * 1024;
pub const SAVE_FRAGMENT_SIZE: u32 = 1024;
pub const ROM_PARTITION_SIZE: u32 = 1024 * 1024;
pub const ROM_PARTITIONS: usize = (ROM_SIZE / ROM_PARTITION_SIZE) as usize;

pub const CONFIG_PATH: &str = "/brutzelkarte/config.ini";
pub const LAYOUT_PATH: &str = "/brutzelkarte/layout";

pub const MAX_ROM_NAME: usize = 32;
/// Fixed length of the stored layout, zero padded. Enough for one slot per
/// partition with full-length names, and keeps every rewrite on the same
/// sectors of the image.
pub const LAYOUT_FILE_SIZE: usize = 4096;

/// Erase granularity of the flash chip holding `addr`.
pub const fn erase_size(addr: u32) -> u32 {
    if addr < BOOT_OFFSET {
        ROM_SECTOR_SIZE
    } else {
        BOOT_SECTOR_SIZE
    }
}

pub fn rom_allocator() -> Result<PartitionAllocator> {
    PartitionAllocator::new(ROM_PARTITIONS, ROM_PARTITION_SIZE)
}

pub fn save_ram_allocator() -> Result<SaveRamAllocator> {
    SaveRamAllocator::new(SAVE_RAM_SIZE, SAVE_FRAGMENT_SIZE)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RomSlot {
    pub name: String<MAX_ROM_NAME>,
    /// Partition indices in the order the ROM is mapped.
    pub partitions: BoundedVec<u8, ROM_PARTITIONS>,
    pub save: Option<SaveItem>,
}

impl RomSlot {
    pub fn new(name: &str, partitions: &[u8], save: Option<SaveItem>) -> Result<Self> {
        let name = String::from_str(name).map_err(|_| {
            BrutzelError::InvalidArgument(format!(
                "ROM name longer than {MAX_ROM_NAME} bytes: {name}"
            ))
        })?;
        let partitions = BoundedVec::from_slice(partitions).map_err(|_| {
            BrutzelError::InvalidArgument(format!(
                "{} partitions for one ROM, at most {ROM_PARTITIONS}",
                partitions.len()
            ))
        })?;
        Ok(Self {
            name,
            partitions,
            save,
        })
    }

    /// Bytes of ROM flash mapped to this slot.
    pub fn capacity(&self) -> u32 {
        self.partitions.len() as u32 * ROM_PARTITION_SIZE
    }
}

/// Persisted assignment of ROM partitions and save items.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartridgeLayout {
    pub roms: Vec<RomSlot>,
}

impl CartridgeLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, slot: RomSlot) {
        self.roms.push(slot);
    }

    pub fn find(&self, name: &str) -> Option<&RomSlot> {
        self.roms.iter().find(|slot| slot.name.as_str() == name)
    }

    pub fn remove(&mut self, name: &str) -> Option<RomSlot> {
        let index = self.roms.iter().position(|slot| slot.name.as_str() == name)?;
        Some(self.roms.remove(index))
    }

    /// Follow a save item moved by [`SaveRamAllocator::defragment`].
    pub fn update_save_offset(&mut self, old: u32, new: u32) -> Result<()> {
        let save = self
            .roms
            .iter_mut()
            .filter_map(|slot| slot.save.as_mut())
            .find(|save| save.offset == old)
            .ok_or(BrutzelError::NoSuchItem(old))?;
        save.offset = new;
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn store(&self, fs: &mut Dfs) -> Result<()> {
        let mut bytes = self.encode()?;
        if bytes.len() > LAYOUT_FILE_SIZE {
            return Err(BrutzelError::CapacityExceeded {
                requested: bytes.len(),
                available: LAYOUT_FILE_SIZE,
            });
        }
        bytes.resize(LAYOUT_FILE_SIZE, 0);
        fs.write_file(LAYOUT_PATH, &bytes)?;
        info!("stored layout of {} ROMs", self.roms.len());
        Ok(())
    }

    pub fn load(fs: &Dfs) -> Result<Self> {
        Self::decode(&fs.read_file(LAYOUT_PATH)?)
    }

    /// Rebuild both allocators with every recorded reservation in place.
    pub fn restore(&self) -> Result<(PartitionAllocator, SaveRamAllocator)> {
        let mut partitions = rom_allocator()?;
        let mut save_ram = save_ram_allocator()?;
        for slot in &self.roms {
            for &index in &slot.partitions {
                partitions.acquire_at(index)?;
            }
            if let Some(save) = &slot.save {
                let placed = save_ram.alloc_at(save.offset, save.size)?;
                if placed.size_in_memory != save.size_in_memory {
                    return Err(BrutzelError::InvalidImage(format!(
                        "save item {:#x} of {} recorded with {} bytes reserved",
                        save.offset, slot.name, save.size_in_memory
                    )));
                }
            }
        }
        info!(
            "restored layout: {} partitions used, {} save bytes free",
            partitions.used_count(),
            save_ram.free_bytes()
        );
        Ok((partitions, save_ram))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_map() {
        assert_eq!(BOOT_OFFSET, 0x0400_0000);
        assert_eq!(DFS_OFFSET, 0x0420_0000);
        assert_eq!(DFS_MAX_SIZE, 6 * 1024 * 1024);
        assert_eq!(ROM_PARTITIONS, 64);
        assert_eq!(erase_size(0), ROM_SECTOR_SIZE);
        assert_eq!(erase_size(BOOT_OFFSET - 1), ROM_SECTOR_SIZE);
        assert_eq!(erase_size(DFS_OFFSET), BOOT_SECTOR_SIZE);
    }

    fn sample() -> CartridgeLayout {
        let mut partitions = rom_allocator().unwrap();
        let mut ram = save_ram_allocator().unwrap();
        let mut layout = CartridgeLayout::new();
        let first: Vec<u8> = partitions
            .acquire(8)
            .unwrap()
            .iter()
            .map(|p| p.offset)
            .collect();
        let save = ram.alloc(32 * 1024).unwrap();
        layout.add(RomSlot::new("ZELDA MAJORA", &first, Some(save)).unwrap());
        let second: Vec<u8> = partitions
            .acquire(4)
            .unwrap()
            .iter()
            .map(|p| p.offset)
            .collect();
        layout.add(RomSlot::new("MARIOKART64", &second, None).unwrap());
        layout
    }

    #[test]
    fn stored_in_image() {
        let layout = sample();
        let mut fs = Dfs::new();
        layout.store(&mut fs).unwrap();
        let image = fs.to_bytes();
        let loaded = CartridgeLayout::load(&Dfs::from_bytes(&image).unwrap()).unwrap();
        assert_eq!(loaded, layout);
        assert_eq!(loaded.find("MARIOKART64").unwrap().capacity(), 4 * ROM_PARTITION_SIZE);
    }

    #[test]
    fn shrinking_layout_keeps_image_consistent() {
        let mut layout = sample();
        let mut fs = Dfs::new();
        layout.store(&mut fs).unwrap();
        let count = fs.sector_count();
        layout.remove("ZELDA MAJORA").unwrap();
        layout.store(&mut fs).unwrap();
        assert_eq!(fs.sector_count(), count);
        layout.add(RomSlot::new("ZELDA OCARINA", &[20, 21], None).unwrap());
        layout.store(&mut fs).unwrap();

        let image = fs.to_bytes();
        let loaded = Dfs::from_bytes(&image).unwrap();
        loaded.audit().unwrap();
        assert_eq!(CartridgeLayout::load(&loaded).unwrap(), layout);
    }

    #[test]
    fn full_layout_fits() {
        let mut layout = CartridgeLayout::new();
        let save = save_ram_allocator().unwrap().alloc(1).unwrap();
        for index in 0..ROM_PARTITIONS as u8 {
            let name = format!("{index:0>width$}", width = MAX_ROM_NAME);
            layout.add(RomSlot::new(&name, &[index], Some(save)).unwrap());
        }
        assert!(layout.encode().unwrap().len() <= LAYOUT_FILE_SIZE);
        let mut fs = Dfs::new();
        layout.store(&mut fs).unwrap();
        assert_eq!(CartridgeLayout::load(&fs).unwrap(), layout);

        for _ in 0..2 {
            let name = "X".repeat(MAX_ROM_NAME);
            layout.add(RomSlot::new(&name, &[0], Some(save)).unwrap());
        }
        assert!(matches!(
            layout.store(&mut fs),
            Err(BrutzelError::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn restore_reserves_everything() {
        let layout = sample();
        let (mut partitions, mut ram) = layout.restore().unwrap();
        assert_eq!(partitions.used_count(), 12);
        assert_eq!(ram.free_bytes(), SAVE_RAM_SIZE - 32 * 1024);
        assert_eq!(partitions.acquire(1).unwrap()[0].offset, 12);
        assert_eq!(ram.alloc(1).unwrap().offset, 32 * 1024);
    }

    #[test]
    fn restore_rejects_conflicts() {
        let mut layout = sample();
        let taken = layout.roms[0].partitions[0];
        layout.add(RomSlot::new("DUPLICATE", &[taken], None).unwrap());
        assert!(matches!(
            layout.restore(),
            Err(BrutzelError::PartitionInUse(0))
        ));
    }

    #[test]
    fn follows_defragmentation() {
        let mut ram = save_ram_allocator().unwrap();
        let first = ram.alloc(4096).unwrap();
        let second = ram.alloc(2048).unwrap();
        let mut layout = CartridgeLayout::new();
        layout.add(RomSlot::new("A", &[0], Some(first)).unwrap());
        layout.add(RomSlot::new("B", &[1], Some(second)).unwrap());
        ram.release(first.offset).unwrap();
        layout.remove("A").unwrap();
        ram.defragment(|item, to| layout.update_save_offset(item.offset, to))
            .unwrap();
        assert_eq!(layout.find("B").unwrap().save.unwrap().offset, 0);
        assert!(matches!(
            layout.update_save_offset(4096, 0),
            Err(BrutzelError::NoSuchItem(4096))
        ));
    }

    #[test]
    fn slot_limits() {
        assert!(RomSlot::new(&"N".repeat(MAX_ROM_NAME + 1), &[0], None).is_err());
        let all: Vec<u8> = (0..=64).collect();
        assert!(RomSlot::new("BIG", &all, None).is_err());
    }
}
