use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{BrutzelError, Result};

/// One fixed-size slice of ROM flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashPartition {
    pub offset: u8,
    pub used: bool,
}

/// Used/free state of `N` equally sized partitions. Partitions handed to
/// one ROM need not be adjacent: the cartridge maps them through a table.
#[derive(Debug, Clone)]
pub struct PartitionAllocator {
    partitions: Vec<FlashPartition>,
    partition_size: u32,
}

impl PartitionAllocator {
    /// At most 256 partitions, indices are a byte on the cartridge.
    pub fn new(count: usize, partition_size: u32) -> Result<Self> {
        if count == 0 || count > 256 || partition_size == 0 {
            return Err(BrutzelError::InvalidArgument(format!(
                "{count} partitions of {partition_size} bytes"
            )));
        }
        let partitions = (0..count)
            .map(|i| FlashPartition {
                offset: i as u8,
                used: false,
            })
            .collect();
        Ok(Self {
            partitions,
            partition_size,
        })
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn partition_size(&self) -> u32 {
        self.partition_size
    }

    pub fn partitions(&self) -> &[FlashPartition] {
        &self.partitions
    }

    pub fn free_count(&self) -> usize {
        self.partitions.iter().filter(|p| !p.used).count()
    }

    pub fn used_count(&self) -> usize {
        self.len() - self.free_count()
    }

    /// Byte offset of a partition within the ROM region.
    pub fn address(&self, index: u8) -> Result<u32> {
        self.get(index)?;
        Ok(u32::from(index) * self.partition_size)
    }

    fn get(&self, index: u8) -> Result<&FlashPartition> {
        self.partitions
            .get(index as usize)
            .ok_or(BrutzelError::UnknownPartition(index))
    }

    /// Take the first `count` free partitions in index order.
    pub fn acquire(&mut self, count: usize) -> Result<Vec<FlashPartition>> {
        let available = self.free_count();
        if count > available {
            return Err(BrutzelError::CapacityExceeded {
                requested: count,
                available,
            });
        }
        let mut taken = Vec::with_capacity(count);
        for partition in self.partitions.iter_mut().filter(|p| !p.used).take(count) {
            partition.used = true;
            taken.push(*partition);
        }
        debug!(
            "acquired partitions {:?}",
            taken.iter().map(|p| p.offset).collect::<Vec<_>>()
        );
        Ok(taken)
    }

    pub fn acquire_at(&mut self, index: u8) -> Result<FlashPartition> {
        if self.get(index)?.used {
            return Err(BrutzelError::PartitionInUse(index));
        }
        let partition = &mut self.partitions[index as usize];
        partition.used = true;
        Ok(*partition)
    }

    pub fn release(&mut self, index: u8) -> Result<()> {
        if !self.get(index)?.used {
            return Err(BrutzelError::PartitionNotInUse(index));
        }
        self.partitions[index as usize].used = false;
        Ok(())
    }

    /// Release several partitions. Nothing changes unless all of them are
    /// currently in use.
    pub fn release_all<I>(&mut self, indices: I) -> Result<()>
    where
        I: IntoIterator<Item = u8>,
    {
        let indices: Vec<u8> = indices.into_iter().collect();
        for (i, &index) in indices.iter().enumerate() {
            if !self.get(index)?.used || indices[..i].contains(&index) {
                return Err(BrutzelError::PartitionNotInUse(index));
            }
        }
        for index in indices {
            self.partitions[index as usize].used = false;
        }
        Ok(())
    }
}
