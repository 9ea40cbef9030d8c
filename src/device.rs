//! Command protocol of the cartridge firmware.
//!
//! Every address-bearing command is sent as two frames, `SetAddr` followed by
//! the command itself, in a single transport write. Flash addresses are
//! 32-bit word indices and SRAM addresses 16-bit word indices on the wire;
//! the API takes byte addresses and converts them.
//!
//! Erase and write commands are acknowledged asynchronously. They bump
//! [`Cartridge::pending_ack`] and the caller decides when to collect the
//! acknowledgments with [`Cartridge::wait_ack`], which allows several commands
//! to be in flight on a slow link. Commands expecting a response collect the
//! outstanding acknowledgments first, so a response is never mistaken for one.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, warn};

use crate::error::{BrutzelError, Result};
use crate::frame::{FrameBuilder, FrameDecoder};
use crate::transport::Transport;

pub use self::command::{Command, FlashChip, RtcTime, ACK_OK};
pub use self::sim::SimulatedCartridge;

mod command;
mod sim;

/// Size of one flash or SRAM page transfer.
pub const PAGE_SIZE: usize = 256;
/// Largest EFB transfer.
pub const MAX_EFB_LEN: usize = 0xFF;

const FLASH_WORD: u32 = 4;
const SRAM_WORD: u32 = 2;

#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// How long a read waits for its response.
    pub read_timeout: Duration,
    /// How long [`Cartridge::wait_ack`] waits. Sector erases take seconds.
    pub ack_timeout: Duration,
    /// Size of a single transport read.
    pub read_chunk: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(1),
            ack_timeout: Duration::from_secs(30),
            read_chunk: 512,
        }
    }
}

pub struct Cartridge<T> {
    transport: T,
    config: ProtocolConfig,
    decoder: FrameDecoder,
    received: VecDeque<Bytes>,
    pending_ack: usize,
}

impl<T: Transport> Cartridge<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, ProtocolConfig::default())
    }

    pub fn with_config(transport: T, config: ProtocolConfig) -> Self {
        Self {
            transport,
            config,
            decoder: FrameDecoder::new(),
            received: VecDeque::new(),
            pending_ack: 0,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Number of commands sent whose acknowledgment has not been collected.
    pub const fn pending_ack(&self) -> usize {
        self.pending_ack
    }

    pub fn set_address(&mut self, addr: u32) -> Result<()> {
        debug!("Set Addr: {addr:#010x}");
        let mut frames = FrameBuilder::new();
        frames.command(Command::SetAddr.id(), &addr.to_be_bytes());
        self.send(frames)
    }

    /// Erase the flash sector starting at byte address `sector_addr`.
    pub fn erase_sector(&mut self, sector_addr: u32) -> Result<()> {
        debug!("Erase sector: {sector_addr:#010x}");
        let addr = word_address(sector_addr, FLASH_WORD)?;
        let mut frames = addressed(addr);
        frames.command(Command::EraseSector.id(), &[]);
        self.send(frames)?;
        self.pending_ack += 1;
        Ok(())
    }

    pub fn write_flash_page(&mut self, page_addr: u32, data: &[u8]) -> Result<()> {
        debug!("Write page: {page_addr:#010x}");
        check_page(data)?;
        let addr = word_address(page_addr, FLASH_WORD)?;
        let mut frames = addressed(addr);
        frames.command(Command::WriteFlash.id(), data);
        self.send(frames)?;
        self.pending_ack += 1;
        Ok(())
    }

    pub fn read_flash_page(&mut self, page_addr: u32) -> Result<Bytes> {
        debug!("Read page: {page_addr:#010x}");
        let addr = word_address(page_addr, FLASH_WORD)?;
        self.settle()?;
        let mut frames = addressed(addr);
        frames.command(Command::ReadFlash.id(), &[]);
        self.send(frames)?;
        self.read_response()
    }

    pub fn write_sram_page(&mut self, page_addr: u32, data: &[u8]) -> Result<()> {
        debug!("Write SRAM: {page_addr:#010x}");
        check_page(data)?;
        let addr = word_address(page_addr, SRAM_WORD)?;
        let mut frames = addressed(addr);
        frames.command(Command::WriteSram.id(), data);
        self.send(frames)?;
        self.pending_ack += 1;
        Ok(())
    }

    pub fn read_sram_page(&mut self, page_addr: u32) -> Result<Bytes> {
        debug!("Read SRAM: {page_addr:#010x}");
        let addr = word_address(page_addr, SRAM_WORD)?;
        self.settle()?;
        let mut frames = addressed(addr);
        frames.command(Command::ReadSram.id(), &[]);
        self.send(frames)?;
        self.read_response()
    }

    /// Write 1..=255 bytes to the EFB register window at `addr`.
    pub fn write_efb(&mut self, addr: u8, data: &[u8]) -> Result<()> {
        let len = efb_len(data.len())?;
        debug!("Write EFB: {addr:#04x} ({} bytes)", data.len());
        let mut args = Vec::with_capacity(data.len() + 1);
        args.push(len);
        args.extend_from_slice(data);
        let mut frames = addressed(u32::from(addr));
        frames.command(Command::WriteEfb.id(), &args);
        self.send(frames)
    }

    pub fn read_efb(&mut self, addr: u8, count: usize) -> Result<Vec<u8>> {
        let len = efb_len(count)?;
        debug!("Read EFB: {addr:#04x} ({count} bytes)");
        self.settle()?;
        let mut frames = addressed(u32::from(addr));
        frames.command(Command::ReadEfb.id(), &[len]);
        self.send(frames)?;
        let response = self.read_response()?;
        if response.len() < count {
            return Err(BrutzelError::UnexpectedResponse(format!(
                "EFB read returned {} of {count} bytes",
                response.len()
            )));
        }
        Ok(response[..count].to_vec())
    }

    pub fn write_efb_u32(&mut self, addr: u8, value: u32) -> Result<()> {
        self.write_efb(addr, &value.to_be_bytes())
    }

    pub fn write_efb_u8(&mut self, addr: u8, value: u8) -> Result<()> {
        self.write_efb(addr, &[value])
    }

    pub fn read_efb_u32(&mut self, addr: u8) -> Result<u32> {
        let data = self.read_efb(addr, 4)?;
        Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
    }

    pub fn read_version(&mut self) -> Result<u32> {
        let response = self.request(Command::ReadVersion, &[])?;
        if response.len() < 4 {
            return Err(BrutzelError::UnexpectedResponse(format!(
                "version response has {} bytes",
                response.len()
            )));
        }
        Ok(u32::from_be_bytes([
            response[0],
            response[1],
            response[2],
            response[3],
        ]))
    }

    /// Identification string of the firmware, NUL padding stripped.
    pub fn read_identity(&mut self) -> Result<String> {
        let response = self.request(Command::ReadIdentity, &[])?;
        let end = response
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(response.len());
        Ok(String::from_utf8_lossy(&response[..end]).into_owned())
    }

    pub fn set_rtc(&mut self, time: &RtcTime) -> Result<()> {
        debug!("Set RTC: {time:?}");
        let args = time.encode()?;
        let mut frames = FrameBuilder::new();
        frames.command(Command::SetRtc.id(), &args);
        self.send(frames)
    }

    pub fn select_flash(&mut self, chip: FlashChip) -> Result<()> {
        debug!("Select flash: {chip:?}");
        let mut frames = FrameBuilder::new();
        frames.command(Command::SelectFlash.id(), &[chip as u8]);
        self.send(frames)
    }

    /// Number of address bits of the selected flash chip.
    pub fn flash_address_width(&mut self) -> Result<u8> {
        self.request_byte(Command::FlashAddrWidth)
    }

    /// Number of address bits of the save RAM.
    pub fn sram_address_width(&mut self) -> Result<u8> {
        self.request_byte(Command::SramAddrWidth)
    }

    /// Block until one acknowledgment arrives. Returns whether the device
    /// reported success.
    pub fn wait_ack(&mut self) -> Result<bool> {
        let packet = self.receive(self.config.ack_timeout)?;
        self.pending_ack = self.pending_ack.saturating_sub(1);
        let ok = packet.first() == Some(&ACK_OK);
        if !ok {
            warn!("device answered NAK {:02x?}", &packet[..]);
        }
        Ok(ok)
    }

    fn request(&mut self, command: Command, args: &[u8]) -> Result<Bytes> {
        debug!("Request {command:?}");
        self.settle()?;
        let mut frames = FrameBuilder::new();
        frames.command(command.id(), args);
        self.send(frames)?;
        self.read_response()
    }

    fn request_byte(&mut self, command: Command) -> Result<u8> {
        let response = self.request(command, &[])?;
        response.first().copied().ok_or_else(|| {
            BrutzelError::UnexpectedResponse(format!("empty response to {command:?}"))
        })
    }

    /// Collect every outstanding acknowledgment; a NAK is an error.
    fn settle(&mut self) -> Result<()> {
        while self.pending_ack > 0 {
            if !self.wait_ack()? {
                return Err(BrutzelError::UnexpectedResponse(
                    "device rejected an earlier command".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn read_response(&mut self) -> Result<Bytes> {
        self.receive(self.config.read_timeout)
    }

    fn send(&mut self, frames: FrameBuilder) -> Result<()> {
        let bytes = frames.finish();
        self.transport.write_all(&bytes)?;
        Ok(())
    }

    /// Next decoded packet, reading from the transport until one is complete.
    fn receive(&mut self, timeout: Duration) -> Result<Bytes> {
        let deadline = Instant::now() + timeout;
        let mut buffer = vec![0u8; self.config.read_chunk.max(1)];
        loop {
            if let Some(packet) = self.received.pop_front() {
                return Ok(packet);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !self.transport.wait_readable(remaining)? {
                return Err(BrutzelError::Timeout);
            }
            let read = self.transport.read(&mut buffer)?;
            if read == 0 {
                return Err(BrutzelError::ConnectionClosed);
            }
            let packets = self.decoder.decode_stream(&buffer[..read]);
            self.received.extend(packets);
        }
    }
}

fn addressed(addr: u32) -> FrameBuilder {
    let mut frames = FrameBuilder::with_capacity(PAGE_SIZE + 16);
    frames.command(Command::SetAddr.id(), &addr.to_be_bytes());
    frames
}

/// Flash and SRAM take even byte addresses only.
fn word_address(byte_addr: u32, word: u32) -> Result<u32> {
    if byte_addr % 2 != 0 {
        return Err(BrutzelError::InvalidArgument(format!(
            "address {byte_addr:#010x} is not word aligned"
        )));
    }
    Ok(byte_addr / word)
}

fn check_page(data: &[u8]) -> Result<()> {
    if data.is_empty() || data.len() > PAGE_SIZE {
        return Err(BrutzelError::InvalidArgument(format!(
            "page data must be 1..={PAGE_SIZE} bytes, got {}",
            data.len()
        )));
    }
    Ok(())
}

/// Length byte of an EFB transfer, the count minus one.
fn efb_len(count: usize) -> Result<u8> {
    if count == 0 || count > MAX_EFB_LEN {
        return Err(BrutzelError::InvalidArgument(format!(
            "EFB transfer must be 1..={MAX_EFB_LEN} bytes, got {count}"
        )));
    }
    Ok((count - 1) as u8)
}
