//! In-memory cartridge speaking the firmware protocol.
//!
//! Used for dry runs and tests. Flash behaves like NOR flash: erased bytes
//! read `0xFF` and programming can only clear bits.

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::time::Duration;

use log::{trace, warn};

use super::command::{Command, FlashChip, ACK_OK};
use super::PAGE_SIZE;
use crate::frame::{encode, FrameDecoder};
use crate::layout;
use crate::transport::Transport;

const IDENTITY: &[u8] = b"Brutzelkarte (simulated)";

pub struct SimulatedCartridge {
    decoder: FrameDecoder,
    output: VecDeque<u8>,
    address: u32,
    flash: BTreeMap<u32, [u8; PAGE_SIZE]>,
    sram: Vec<u8>,
    efb: [u8; 256],
    rtc: Option<[u8; 7]>,
    chip: FlashChip,
    version: u32,
    nak_next: usize,
}

impl Default for SimulatedCartridge {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCartridge {
    pub fn new() -> Self {
        Self {
            decoder: FrameDecoder::new(),
            output: VecDeque::new(),
            address: 0,
            flash: BTreeMap::new(),
            sram: vec![0; layout::SAVE_RAM_SIZE as usize],
            efb: [0; 256],
            rtc: None,
            chip: FlashChip::Rom,
            version: 0x0001_0200,
            nak_next: 0,
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Answer the next `count` acknowledged commands with a failure.
    pub fn fail_next(&mut self, count: usize) {
        self.nak_next = count;
    }

    /// Content of the flash page at byte address `addr`.
    pub fn flash_page(&self, addr: u32) -> [u8; PAGE_SIZE] {
        let base = addr - addr % PAGE_SIZE as u32;
        let page = self.flash.get(&base).copied().unwrap_or([0xFF; PAGE_SIZE]);
        let mut out = [0xFF; PAGE_SIZE];
        let skip = (addr - base) as usize;
        out[..PAGE_SIZE - skip].copy_from_slice(&page[skip..]);
        out
    }

    /// Bytes of flash starting at `addr`.
    pub fn flash(&self, addr: u32, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let mut cursor = addr;
        while out.len() < len {
            let page = self.flash_page(cursor);
            let take = (len - out.len()).min(PAGE_SIZE - (cursor as usize % PAGE_SIZE));
            out.extend_from_slice(&page[..take]);
            cursor += take as u32;
        }
        out
    }

    pub fn sram(&self) -> &[u8] {
        &self.sram
    }

    pub fn efb(&self) -> &[u8; 256] {
        &self.efb
    }

    /// Raw bytes of the last `SetRtc` command.
    pub fn rtc(&self) -> Option<[u8; 7]> {
        self.rtc
    }

    pub fn selected_chip(&self) -> FlashChip {
        self.chip
    }

    fn respond(&mut self, payload: &[u8]) {
        self.output.extend(encode(payload).iter().copied());
    }

    fn ack(&mut self, ok: bool) {
        let ok = ok && self.nak_next == 0;
        self.nak_next = self.nak_next.saturating_sub(1);
        self.respond(&[if ok { ACK_OK } else { 0x00 }]);
    }

    fn execute(&mut self, packet: &[u8]) {
        let Some((&id, args)) = packet.split_first() else {
            warn!("sim: empty frame");
            return;
        };
        let Some(command) = Command::from_id(id) else {
            warn!("sim: unknown command {id:#04x}");
            return;
        };
        trace!("sim: {command:?} at {:#010x}", self.address);
        match command {
            Command::SetAddr => {
                if let Ok(bytes) = <[u8; 4]>::try_from(args) {
                    self.address = u32::from_be_bytes(bytes);
                }
            }
            Command::EraseSector => {
                let byte_addr = self.address * 4;
                let size = layout::erase_size(byte_addr);
                let start = byte_addr - byte_addr % size;
                let end = start.saturating_add(size);
                let erased: Vec<u32> = self.flash.range(start..end).map(|(k, _)| *k).collect();
                for key in erased {
                    self.flash.remove(&key);
                }
                self.ack(true);
            }
            Command::WriteFlash => {
                let byte_addr = self.address * 4;
                let ok = byte_addr % PAGE_SIZE as u32 == 0 && args.len() <= PAGE_SIZE;
                if ok {
                    let page = self.flash.entry(byte_addr).or_insert([0xFF; PAGE_SIZE]);
                    for (cell, &b) in page.iter_mut().zip(args) {
                        *cell &= b;
                    }
                }
                self.ack(ok);
            }
            Command::ReadFlash => {
                let page = self.flash_page(self.address * 4);
                self.respond(&page);
            }
            Command::WriteSram => {
                let start = (self.address * 2) as usize;
                let ok = start + args.len() <= self.sram.len();
                if ok {
                    self.sram[start..start + args.len()].copy_from_slice(args);
                }
                self.ack(ok);
            }
            Command::ReadSram => {
                let start = ((self.address * 2) as usize).min(self.sram.len());
                let end = (start + PAGE_SIZE).min(self.sram.len());
                let mut page = [0u8; PAGE_SIZE];
                page[..end - start].copy_from_slice(&self.sram[start..end]);
                self.respond(&page);
            }
            Command::WriteEfb => {
                if let Some((&len, data)) = args.split_first() {
                    let start = self.address as usize & 0xFF;
                    let count = (len as usize + 1).min(data.len()).min(256 - start);
                    self.efb[start..start + count].copy_from_slice(&data[..count]);
                }
            }
            Command::ReadEfb => {
                let start = self.address as usize & 0xFF;
                let count = args.first().map_or(1, |&len| len as usize + 1);
                let end = (start + count).min(256);
                let data = self.efb[start..end].to_vec();
                self.respond(&data);
            }
            Command::ReadVersion => {
                let version = self.version.to_be_bytes();
                self.respond(&version);
            }
            Command::SetRtc => {
                if let Ok(bytes) = <[u8; 7]>::try_from(args) {
                    self.rtc = Some(bytes);
                }
            }
            Command::SelectFlash => {
                self.chip = match args.first() {
                    Some(1) => FlashChip::Boot,
                    _ => FlashChip::Rom,
                };
            }
            Command::FlashAddrWidth => {
                let size = match self.chip {
                    FlashChip::Rom => layout::ROM_SIZE,
                    FlashChip::Boot => layout::BOOT_SIZE,
                };
                self.respond(&[address_bits(size)]);
            }
            Command::SramAddrWidth => {
                self.respond(&[address_bits(layout::SAVE_RAM_SIZE)]);
            }
            Command::ReadIdentity => self.respond(IDENTITY),
        }
    }
}

fn address_bits(size: u32) -> u8 {
    (32 - (size - 1).leading_zeros()) as u8
}

impl Transport for SimulatedCartridge {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        for packet in self.decoder.decode_stream(data) {
            self.execute(&packet);
        }
        Ok(data.len())
    }

    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        let n = buffer.len().min(self.output.len());
        for (slot, b) in buffer.iter_mut().zip(self.output.drain(..n)) {
            *slot = b;
        }
        Ok(n)
    }

    fn wait_readable(&mut self, _timeout: Duration) -> io::Result<bool> {
        Ok(!self.output.is_empty())
    }
}
