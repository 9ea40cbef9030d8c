//! Command identifiers and argument encodings of the cartridge firmware.

use time::PrimitiveDateTime;

use crate::error::{BrutzelError, Result};

/// First byte of every request frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SetAddr = 0x01,
    EraseSector = 0x02,
    WriteFlash = 0x03,
    ReadFlash = 0x04,
    WriteSram = 0x05,
    ReadSram = 0x06,
    WriteEfb = 0x07,
    ReadEfb = 0x08,
    ReadVersion = 0x09,
    SetRtc = 0x0A,
    SelectFlash = 0x0B,
    FlashAddrWidth = 0x0C,
    SramAddrWidth = 0x0D,
    ReadIdentity = 0x0E,
}

impl Command {
    pub const fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        let command = match id {
            0x01 => Command::SetAddr,
            0x02 => Command::EraseSector,
            0x03 => Command::WriteFlash,
            0x04 => Command::ReadFlash,
            0x05 => Command::WriteSram,
            0x06 => Command::ReadSram,
            0x07 => Command::WriteEfb,
            0x08 => Command::ReadEfb,
            0x09 => Command::ReadVersion,
            0x0A => Command::SetRtc,
            0x0B => Command::SelectFlash,
            0x0C => Command::FlashAddrWidth,
            0x0D => Command::SramAddrWidth,
            0x0E => Command::ReadIdentity,
            _ => return None,
        };
        Some(command)
    }
}

/// Flash chips behind the cartridge bus.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashChip {
    Rom = 0,
    Boot = 1,
}

/// Payload byte of an acknowledgment frame reporting success.
pub const ACK_OK: u8 = 0x01;

pub fn to_bcd(value: u8) -> Result<u8> {
    if value > 99 {
        return Err(BrutzelError::InvalidArgument(format!(
            "{value} does not fit in two BCD digits"
        )));
    }
    Ok(value / 10 * 16 + value % 10)
}

pub fn from_bcd(value: u8) -> u8 {
    (value >> 4) * 10 + (value & 0x0F)
}

/// Wall clock time as understood by the cartridge RTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcTime {
    pub second: u8,
    pub minute: u8,
    pub hour: u8,
    /// 1 = Monday .. 7 = Sunday.
    pub weekday: u8,
    pub day: u8,
    pub month: u8,
    pub year: u16,
}

impl RtcTime {
    /// Argument bytes of the `SetRtc` command:
    /// sec, min, hour, weekday, day, month, year % 100. All but the weekday are BCD.
    pub fn encode(&self) -> Result<[u8; 7]> {
        if !(1..=7).contains(&self.weekday) {
            return Err(BrutzelError::InvalidArgument(format!(
                "weekday {} outside 1..=7",
                self.weekday
            )));
        }
        Ok([
            to_bcd(self.second)?,
            to_bcd(self.minute)?,
            to_bcd(self.hour)?,
            self.weekday,
            to_bcd(self.day)?,
            to_bcd(self.month)?,
            to_bcd((self.year % 100) as u8)?,
        ])
    }
}

impl From<PrimitiveDateTime> for RtcTime {
    fn from(dt: PrimitiveDateTime) -> Self {
        Self {
            second: dt.second(),
            minute: dt.minute(),
            hour: dt.hour(),
            weekday: dt.weekday().number_from_monday(),
            day: dt.day(),
            month: dt.month() as u8,
            year: dt.year().rem_euclid(10_000) as u16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn bcd() {
        assert_eq!(to_bcd(0).unwrap(), 0x00);
        assert_eq!(to_bcd(9).unwrap(), 0x09);
        assert_eq!(to_bcd(10).unwrap(), 0x10);
        assert_eq!(to_bcd(59).unwrap(), 0x59);
        assert_eq!(to_bcd(99).unwrap(), 0x99);
        assert!(to_bcd(100).is_err());
        assert_eq!(from_bcd(0x47), 47);
    }

    #[test]
    fn sunday_is_seven() {
        // 2024-03-17 was a Sunday
        let rtc = RtcTime::from(datetime!(2024-03-17 23:59:58));
        assert_eq!(rtc.weekday, 7);
        assert_eq!(
            rtc.encode().unwrap(),
            [0x58, 0x59, 0x23, 7, 0x17, 0x03, 0x24]
        );
    }

    #[test]
    fn monday_is_one() {
        let rtc = RtcTime::from(datetime!(2024-03-18 08:05:00));
        assert_eq!(rtc.weekday, 1);
        assert_eq!(rtc.encode().unwrap()[6], 0x24);
    }

    #[test]
    fn invalid_weekday() {
        let mut rtc = RtcTime::from(datetime!(2024-03-18 08:05:00));
        rtc.weekday = 0;
        assert!(matches!(rtc.encode(), Err(BrutzelError::InvalidArgument(_))));
    }

    #[test]
    fn command_ids_round_trip() {
        for id in 0x01..=0x0E {
            assert_eq!(Command::from_id(id).map(Command::id), Some(id));
        }
        assert_eq!(Command::from_id(0x00), None);
        assert_eq!(Command::from_id(0x0F), None);
    }
}
