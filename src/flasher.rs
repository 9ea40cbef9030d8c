//! Programming sequences built on the command protocol.
//!
//! Erase and write commands are pipelined: acknowledgments are only
//! collected once more than [`FlashOptions::max_pending_ack`] commands are in
//! flight, and all of them are collected before a sequence returns. Every
//! sequence checks its [`CancelToken`] between two commands; a cancelled
//! sequence leaves the flash as far as it got.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::device::{Cartridge, PAGE_SIZE};
use crate::error::{BrutzelError, Result};
use crate::layout::{self, ROM_OFFSET, ROM_PARTITION_SIZE};
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub struct FlashOptions {
    /// Commands in flight before the flasher waits for an acknowledgment.
    pub max_pending_ack: usize,
    /// Erase granularity of the target flash.
    pub sector_size: u32,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            max_pending_ack: 6,
            sector_size: layout::ROM_SECTOR_SIZE,
        }
    }
}

impl FlashOptions {
    /// Options for the flash chip holding `addr`.
    pub fn for_address(addr: u32) -> Self {
        Self {
            sector_size: layout::erase_size(addr),
            ..Self::default()
        }
    }
}

/// Shared flag to stop a running sequence from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Erase,
    Write,
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub stage: Stage,
    /// Units done so far: sectors for erasing, bytes otherwise.
    pub done: usize,
    pub total: usize,
}

impl Progress {
    pub fn percent(&self) -> usize {
        if self.total == 0 {
            100
        } else {
            self.done * 100 / self.total
        }
    }
}

pub struct Flasher<'a, T> {
    cart: &'a mut Cartridge<T>,
    options: FlashOptions,
    cancel: CancelToken,
    progress: Option<Box<dyn FnMut(Progress) + 'a>>,
}

impl<'a, T: Transport> Flasher<'a, T> {
    pub fn new(cart: &'a mut Cartridge<T>) -> Self {
        Self {
            cart,
            options: FlashOptions::default(),
            cancel: CancelToken::new(),
            progress: None,
        }
    }

    pub fn with_options(mut self, options: FlashOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn on_progress<F>(mut self, progress: F) -> Self
    where
        F: FnMut(Progress) + 'a,
    {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn options(&self) -> &FlashOptions {
        &self.options
    }

    fn report(&mut self, stage: Stage, done: usize, total: usize) {
        if let Some(progress) = self.progress.as_mut() {
            progress(Progress { stage, done, total });
        }
    }

    fn check_cancel(&mut self) -> Result<()> {
        if !self.cancel.is_cancelled() {
            return Ok(());
        }
        warn!(
            "cancelled with {} commands in flight",
            self.cart.pending_ack()
        );
        self.drain()?;
        Err(BrutzelError::Cancelled)
    }

    /// Collect one acknowledgment, a NAK is an error.
    fn collect(&mut self) -> Result<()> {
        if self.cart.wait_ack()? {
            Ok(())
        } else {
            Err(BrutzelError::UnexpectedResponse(
                "device rejected the command".to_string(),
            ))
        }
    }

    fn throttle(&mut self) -> Result<()> {
        if self.cart.pending_ack() > self.options.max_pending_ack {
            self.collect()?;
        }
        Ok(())
    }

    /// Wait until every command sent has been acknowledged.
    pub fn drain(&mut self) -> Result<()> {
        while self.cart.pending_ack() > 0 {
            self.collect()?;
        }
        Ok(())
    }

    /// Erase all sectors covering `len` bytes from `addr`.
    pub fn erase_range(&mut self, addr: u32, len: usize) -> Result<()> {
        let sector_size = self.options.sector_size;
        let sectors = len.div_ceil(sector_size as usize);
        for i in 0..sectors {
            self.check_cancel()?;
            self.cart.erase_sector(addr + i as u32 * sector_size)?;
            self.throttle()?;
            self.report(Stage::Erase, i + 1, sectors);
        }
        self.drain()?;
        info!(target: "brutzel::flasher::erase", "erased {sectors} sectors at {addr:#010x}");
        Ok(())
    }

    fn write_with<P, F>(&mut self, addr: u32, pages: &[P], mut write: F) -> Result<usize>
    where
        P: AsRef<[u8]>,
        F: FnMut(&mut Cartridge<T>, u32, &[u8]) -> Result<()>,
    {
        let total: usize = pages.iter().map(|p| p.as_ref().len()).sum();
        let mut written = 0;
        for page in pages {
            self.check_cancel()?;
            let page = page.as_ref();
            write(&mut *self.cart, addr + written as u32, page)?;
            self.throttle()?;
            written += page.len();
            self.report(Stage::Write, written, total);
        }
        self.drain()?;
        Ok(written)
    }

    /// Program consecutive flash pages starting at `addr`. The range must
    /// have been erased.
    pub fn write_pages<P: AsRef<[u8]>>(&mut self, addr: u32, pages: &[P]) -> Result<()> {
        let written = self.write_with(addr, pages, |cart, at, page| cart.write_flash_page(at, page))?;
        info!(target: "brutzel::flasher::write", "wrote {} KiB at {addr:#010x}", written / 1024);
        Ok(())
    }

    pub fn erase_and_write<P: AsRef<[u8]>>(&mut self, addr: u32, pages: &[P]) -> Result<()> {
        let len = pages.iter().map(|p| p.as_ref().len()).sum();
        self.erase_range(addr, len)?;
        self.write_pages(addr, pages)
    }

    /// Program a ROM into its partitions, in mapping order.
    pub fn write_rom<P: AsRef<[u8]>>(&mut self, partitions: &[u8], pages: &[P]) -> Result<()> {
        let per_partition = ROM_PARTITION_SIZE as usize / PAGE_SIZE;
        let needed = pages.len().div_ceil(per_partition);
        if needed > partitions.len() {
            return Err(BrutzelError::CapacityExceeded {
                requested: needed,
                available: partitions.len(),
            });
        }
        for (&partition, chunk) in partitions.iter().zip(pages.chunks(per_partition)) {
            let addr = ROM_OFFSET + u32::from(partition) * ROM_PARTITION_SIZE;
            debug!("partition {partition} at {addr:#010x}");
            self.erase_and_write(addr, chunk)?;
        }
        Ok(())
    }

    /// Flash a DragonFS image to its place in boot flash.
    pub fn write_image(&mut self, image: &[u8]) -> Result<()> {
        if image.len() > layout::DFS_MAX_SIZE as usize {
            return Err(BrutzelError::OutOfBounds {
                offset: layout::DFS_OFFSET,
                size: image.len() as u32,
                limit: layout::DFS_MAX_SIZE,
            });
        }
        let saved = std::mem::replace(
            &mut self.options.sector_size,
            layout::BOOT_SECTOR_SIZE,
        );
        let result = self.erase_and_write(layout::DFS_OFFSET, &crate::rom::image_pages(image));
        self.options.sector_size = saved;
        result?;
        info!(target: "brutzel::flasher::image", "flashed {} byte image", image.len());
        Ok(())
    }

    /// Write save data to save RAM from `addr`.
    pub fn write_sram<P: AsRef<[u8]>>(&mut self, addr: u32, pages: &[P]) -> Result<()> {
        let written = self.write_with(addr, pages, |cart, at, page| cart.write_sram_page(at, page))?;
        info!(target: "brutzel::flasher::write", "wrote {written} bytes of save RAM at {addr:#x}");
        Ok(())
    }

    fn read_with<F>(&mut self, addr: u32, len: usize, mut read: F) -> Result<Vec<u8>>
    where
        F: FnMut(&mut Cartridge<T>, u32) -> Result<bytes::Bytes>,
    {
        self.drain()?;
        let mut data = Vec::with_capacity(len);
        while data.len() < len {
            self.check_cancel()?;
            let page = read(&mut *self.cart, addr + data.len() as u32)?;
            if page.is_empty() {
                return Err(BrutzelError::UnexpectedResponse(
                    "empty read response".to_string(),
                ));
            }
            let take = page.len().min(len - data.len());
            data.extend_from_slice(&page[..take]);
            self.report(Stage::Read, data.len(), len);
        }
        Ok(data)
    }

    pub fn read_flash(&mut self, addr: u32, len: usize) -> Result<Vec<u8>> {
        let data = self.read_with(addr, len, |cart, at| cart.read_flash_page(at))?;
        info!(target: "brutzel::flasher::read", "read {len} bytes of flash at {addr:#010x}");
        Ok(data)
    }

    pub fn read_sram(&mut self, addr: u32, len: usize) -> Result<Vec<u8>> {
        let data = self.read_with(addr, len, |cart, at| cart.read_sram_page(at))?;
        info!(target: "brutzel::flasher::read", "read {len} bytes of save RAM at {addr:#x}");
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimulatedCartridge;
    use crate::rom::Page;

    fn pattern(pages: usize) -> Vec<Page> {
        (0..pages)
            .map(|p| {
                let mut page = [0u8; PAGE_SIZE];
                for (i, b) in page.iter_mut().enumerate() {
                    *b = (p * 7 + i) as u8;
                }
                page
            })
            .collect()
    }

    #[test]
    fn erase_write_read_back() {
        let mut cart = Cartridge::new(SimulatedCartridge::new());
        let pages = pattern(20);
        let mut flasher = Flasher::new(&mut cart);
        flasher.erase_and_write(0x0080_0000, &pages).unwrap();
        let data = flasher.read_flash(0x0080_0000, 20 * PAGE_SIZE).unwrap();
        assert_eq!(data, pages.concat());
        drop(flasher);
        assert_eq!(cart.pending_ack(), 0);
    }

    #[test]
    fn pipelining_bounded_by_watermark() {
        let mut cart = Cartridge::new(SimulatedCartridge::new());
        let mut flasher = Flasher::new(&mut cart).with_options(FlashOptions {
            max_pending_ack: 2,
            sector_size: layout::ROM_SECTOR_SIZE,
        });
        let page = [0u8; PAGE_SIZE];
        for (i, expected) in [1, 2, 2, 2].into_iter().enumerate() {
            flasher.cart.write_flash_page(i as u32 * 256, &page).unwrap();
            flasher.throttle().unwrap();
            assert_eq!(flasher.cart.pending_ack(), expected);
        }
        flasher.drain().unwrap();
        drop(flasher);
        assert_eq!(cart.pending_ack(), 0);
    }

    #[test]
    fn progress_reports_each_step() {
        let mut cart = Cartridge::new(SimulatedCartridge::new());
        let mut seen = Vec::new();
        Flasher::new(&mut cart)
            .on_progress(|p| seen.push(p))
            .erase_range(0, 3 * layout::ROM_SECTOR_SIZE as usize)
            .unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2].stage, Stage::Erase);
        assert_eq!(seen[2].percent(), 100);
        assert_eq!(seen[0].done, 1);
    }

    #[test]
    fn cancel_stops_between_commands() {
        let mut cart = Cartridge::new(SimulatedCartridge::new());
        let token = CancelToken::new();
        let remote = token.clone();
        let mut writes = 0;
        let result = Flasher::new(&mut cart)
            .with_cancel(token)
            .on_progress(|p| {
                writes = p.done / PAGE_SIZE;
                if writes == 3 {
                    remote.cancel();
                }
            })
            .write_pages(0, &pattern(8));
        assert!(matches!(result, Err(BrutzelError::Cancelled)));
        assert_eq!(writes, 3);
        assert_eq!(cart.pending_ack(), 0);
        let sim = cart.into_inner();
        assert_eq!(sim.flash_page(2 * 256), pattern(8)[2]);
        assert_eq!(sim.flash_page(3 * 256), [0xFF; PAGE_SIZE]);
    }

    #[test]
    fn options_follow_the_chip() {
        assert_eq!(FlashOptions::for_address(0).sector_size, layout::ROM_SECTOR_SIZE);
        let boot = FlashOptions::for_address(layout::DFS_OFFSET);
        assert_eq!(boot.sector_size, layout::BOOT_SECTOR_SIZE);
        assert_eq!(boot.max_pending_ack, 6);
    }

    #[test]
    fn nak_is_an_error() {
        let mut sim = SimulatedCartridge::new();
        sim.fail_next(1);
        let mut cart = Cartridge::new(sim);
        let result = Flasher::new(&mut cart).erase_range(0, 1);
        assert!(matches!(result, Err(BrutzelError::UnexpectedResponse(_))));
    }

    #[test]
    fn rom_follows_partition_map() {
        let mut cart = Cartridge::new(SimulatedCartridge::new());
        let per_partition = ROM_PARTITION_SIZE as usize / PAGE_SIZE;
        let pages = pattern(per_partition + 2);
        Flasher::new(&mut cart).write_rom(&[5, 2], &pages).unwrap();
        let sim = cart.transport();
        assert_eq!(sim.flash_page(5 * ROM_PARTITION_SIZE), pages[0]);
        assert_eq!(sim.flash_page(2 * ROM_PARTITION_SIZE), pages[per_partition]);
        assert_eq!(
            sim.flash_page(2 * ROM_PARTITION_SIZE + 256),
            pages[per_partition + 1]
        );
        assert!(matches!(
            Flasher::new(&mut cart).write_rom(&[1], &pages),
            Err(BrutzelError::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn image_goes_to_boot_flash_swapped() {
        let mut cart = Cartridge::new(SimulatedCartridge::new());
        let mut flasher = Flasher::new(&mut cart);
        flasher.write_image(&[1, 2, 3, 4]).unwrap();
        assert_eq!(flasher.options().sector_size, layout::ROM_SECTOR_SIZE);
        drop(flasher);
        let page = cart.transport().flash_page(layout::DFS_OFFSET);
        assert_eq!(&page[..4], &[2, 1, 4, 3]);
    }

    #[test]
    fn save_ram_round_trip() {
        let mut cart = Cartridge::new(SimulatedCartridge::new());
        let mut flasher = Flasher::new(&mut cart);
        flasher.write_sram(0x400, &pattern(2)).unwrap();
        let data = flasher.read_sram(0x400, 300).unwrap();
        assert_eq!(data, pattern(2).concat()[..300]);
    }
}
