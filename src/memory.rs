//! Bookkeeping for the two writable regions of the cartridge: ROM flash,
//! handed out in fixed-size partitions, and save RAM, handed out in
//! fragment-aligned byte ranges that can be compacted.

pub use self::partition::{FlashPartition, PartitionAllocator};
pub use self::save_ram::{SaveItem, SaveRamAllocator};

mod partition;
mod save_ram;

/// Round `size` up to a multiple of `granularity`, `None` past `u32::MAX`.
pub(crate) const fn round_up(size: u32, granularity: u32) -> Option<u32> {
    size.div_ceil(granularity).checked_mul(granularity)
}
