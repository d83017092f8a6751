//! Meter register map
//!
//! Fixed addresses, control-word packing and the historic log slot table.
//! All addresses are 0-based, exactly as sent on the wire.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::codec::{decode, DecodedValue, FormatTag};
use crate::error::{BusyHolder, MeterError, MeterResult};
use crate::WINDOW_BYTE_BUDGET;

pub const IDENTITY_NAME_ADDRESS: u16 = 0;
pub const IDENTITY_SERIAL_ADDRESS: u16 = 8;
pub const IDENTITY_TEXT_WORDS: u16 = 8;
pub const IDENTITY_MODEL_ADDRESS: u16 = 26;
pub const IDENTITY_MODEL_WORDS: u16 = 4;

/// Global busy lock shared by every channel of the meter
pub const BUSY_LOCK_ADDRESS: u16 = 0xC34B;
/// Value written to request the lock
pub const LOCK_REQUEST: u16 = 0x000B;
/// Value the meter reports once the lock is ours (also reads as free)
pub const LOCK_ENGAGED: u16 = 0x0B00;
pub const LOCK_FREE: u16 = 0x0000;

/// Log engagement control register
pub const ENGAGE_ADDRESS: u16 = 0xC34F;
pub const ENGAGE_ENABLE_BIT: u16 = 1 << 7;

/// Window configuration triplet
pub const WINDOW_CONFIG_ADDRESS: u16 = 0xC350;
/// Window offset / status pair
pub const WINDOW_OFFSET_ADDRESS: u16 = 0xC351;
/// First register of the staged window
pub const WINDOW_DATA_ADDRESS: u16 = 0xC353;

pub const WINDOW_READY_MASK: u16 = 0xFF00;
pub const WINDOW_INDEX_MASK: u32 = 0x00FF_FFFF;

pub const STATUS_BLOCK_WORDS: u16 = 16;

/// Availability values that let this client engage a slot: free, or already
/// held by the network channel this client talks through
pub const SLOT_FREE: u16 = 0;
pub const NETWORK_CHANNEL: u16 = 4;

/// One of the six historic log slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HistoricLog {
    Historic1,
    Historic2,
    Historic3,
    Historic4,
    Historic5,
    Historic6,
}

/// Static addressing for a log slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSlotDescriptor {
    pub status_block_address: u16,
    pub availability_address: u16,
    pub setup_address: u16,
    pub log_number: u8,
}

const SLOT_TABLE: [LogSlotDescriptor; 6] = [
    LogSlotDescriptor { status_block_address: 0xC757, availability_address: 0xC75C, setup_address: 0x84CF, log_number: 2 },
    LogSlotDescriptor { status_block_address: 0xC767, availability_address: 0xC76C, setup_address: 0x854F, log_number: 3 },
    LogSlotDescriptor { status_block_address: 0xC777, availability_address: 0xC77C, setup_address: 0x85CF, log_number: 4 },
    LogSlotDescriptor { status_block_address: 0xC787, availability_address: 0xC78C, setup_address: 0x864F, log_number: 5 },
    LogSlotDescriptor { status_block_address: 0xC797, availability_address: 0xC79C, setup_address: 0x86CF, log_number: 6 },
    LogSlotDescriptor { status_block_address: 0xC7A7, availability_address: 0xC7AC, setup_address: 0x874F, log_number: 7 },
];

impl HistoricLog {
    pub const ALL: [HistoricLog; 6] = [
        HistoricLog::Historic1,
        HistoricLog::Historic2,
        HistoricLog::Historic3,
        HistoricLog::Historic4,
        HistoricLog::Historic5,
        HistoricLog::Historic6,
    ];

    /// Slot from its 1-based number
    pub fn from_number(number: u8) -> MeterResult<Self> {
        match number {
            1..=6 => Ok(Self::ALL[number as usize - 1]),
            _ => Err(MeterError::invalid_data(format!(
                "Historic log must be 1-6, got {}",
                number
            ))),
        }
    }

    pub fn number(self) -> u8 {
        self as u8 + 1
    }

    pub fn descriptor(self) -> LogSlotDescriptor {
        SLOT_TABLE[self as usize]
    }
}

impl fmt::Display for HistoricLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Historic {}", self.number())
    }
}

impl FromStr for HistoricLog {
    type Err = MeterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let number = s
            .trim()
            .parse::<u8>()
            .map_err(|_| MeterError::invalid_data(format!("Invalid historic log '{}'", s)))?;
        Self::from_number(number)
    }
}

/// Decoded 16-word status block of a log slot
#[derive(Debug, Clone, PartialEq)]
pub struct LogStatusBlock {
    /// Log capacity in records
    pub capacity: u32,
    pub records_used: u32,
    pub record_size_bytes: u16,
    pub availability: u16,
    pub first_timestamp: DecodedValue,
    pub last_timestamp: DecodedValue,
}

impl LogStatusBlock {
    pub fn decode(words: &[u16]) -> MeterResult<Self> {
        if words.len() < 12 {
            return Err(MeterError::frame(format!(
                "Status block needs {} words, got {}",
                STATUS_BLOCK_WORDS,
                words.len()
            )));
        }

        Ok(Self {
            capacity: word_pair(&words[0..2]),
            records_used: word_pair(&words[2..4]),
            record_size_bytes: words[4],
            availability: words[5],
            first_timestamp: decode(&words[6..9], FormatTag::Tstamp),
            last_timestamp: decode(&words[9..12], FormatTag::Tstamp),
        })
    }

    /// Owner of the slot when this client cannot engage it
    pub fn holder(&self) -> Option<BusyHolder> {
        match self.availability {
            SLOT_FREE | NETWORK_CHANNEL => None,
            channel => Some(BusyHolder::Channel(channel)),
        }
    }

    /// Records staged per window
    pub fn records_per_window(&self) -> MeterResult<u16> {
        records_per_window(self.record_size_bytes)
    }

    /// Words per record in the window data
    pub fn record_stride_words(&self) -> usize {
        self.record_size_bytes as usize / 2
    }
}

fn word_pair(words: &[u16]) -> u32 {
    (words[0] as u32) << 16 | words[1] as u32
}

/// `floor(246 / record_size_bytes)`, rejecting sizes that cannot fit a window
pub fn records_per_window(record_size_bytes: u16) -> MeterResult<u16> {
    if record_size_bytes == 0 || record_size_bytes > WINDOW_BYTE_BUDGET {
        return Err(MeterError::invalid_data(format!(
            "Record size {} bytes does not fit the {}-byte window",
            record_size_bytes, WINDOW_BYTE_BUDGET
        )));
    }
    Ok(WINDOW_BYTE_BUDGET / record_size_bytes)
}

/// Engagement control word: `log_number<<8 | enable<<7 | scope`
pub fn engage_control_word(log_number: u8, enable: bool, scope: u8) -> u16 {
    let enable = if enable { ENGAGE_ENABLE_BIT } else { 0 };
    (log_number as u16) << 8 | enable | (scope as u16 & 0x7F)
}

/// Window configuration triplet: `[records<<8 | repeats, 0, 0]`
pub fn window_config_words(records_per_window: u16, repeats: u8) -> [u16; 3] {
    [records_per_window << 8 | repeats as u16, 0, 0]
}

/// Decoded window offset pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStatus {
    pub index: u32,
    /// The meter is still staging the window
    pub preparing: bool,
}

impl WindowStatus {
    pub fn decode(high: u16, low: u16) -> Self {
        Self {
            index: word_pair(&[high, low]) & WINDOW_INDEX_MASK,
            preparing: high & WINDOW_READY_MASK == WINDOW_READY_MASK,
        }
    }

    /// Apply a re-polled high word, keeping the previous low word
    pub fn refresh(self, high: u16) -> Self {
        Self::decode(high, self.index as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_table() {
        let first = HistoricLog::Historic1.descriptor();
        assert_eq!(first.status_block_address, 0xC757);
        assert_eq!(first.availability_address, 0xC75C);
        assert_eq!(first.setup_address, 0x84CF);
        assert_eq!(first.log_number, 2);

        for (i, log) in HistoricLog::ALL.iter().enumerate() {
            let slot = log.descriptor();
            assert_eq!(slot.log_number as usize, i + 2);
            assert_eq!(slot.availability_address, slot.status_block_address + 5);
            assert_eq!(log.number() as usize, i + 1);
        }

        assert_eq!("3".parse::<HistoricLog>().unwrap(), HistoricLog::Historic3);
        assert!(HistoricLog::from_number(7).is_err());
    }

    #[test]
    fn test_records_per_window_floor() {
        for (size, expected) in [(6, 41), (12, 20), (22, 11), (44, 5), (246, 1)] {
            assert_eq!(records_per_window(size).unwrap(), expected, "size {}", size);
        }
        assert!(records_per_window(0).is_err());
        assert!(records_per_window(247).is_err());
    }

    #[test]
    fn test_control_words() {
        assert_eq!(engage_control_word(2, true, 0), 0x0280);
        assert_eq!(engage_control_word(2, false, 0), 0x0200);
        assert_eq!(window_config_words(20, 1), [0x1401, 0, 0]);
    }

    #[test]
    fn test_window_status() {
        let status = WindowStatus::decode(0xFF00, 0x0014);
        assert!(status.preparing);
        assert_eq!(status.index, 0x14);

        let status = status.refresh(0x0001);
        assert!(!status.preparing);
        assert_eq!(status.index, 0x0001_0014);
    }

    #[test]
    fn test_status_block_decode() {
        let words = [0, 1000, 0, 10, 12, 4, 0x1702, 0x160E, 0, 0x1702, 0x160E, 0x0100, 0, 0, 0, 0];
        let block = LogStatusBlock::decode(&words).unwrap();
        assert_eq!(block.capacity, 1000);
        assert_eq!(block.records_used, 10);
        assert_eq!(block.records_per_window().unwrap(), 20);
        assert_eq!(block.record_stride_words(), 6);
        assert_eq!(block.holder(), None);
        assert_eq!(block.first_timestamp.to_string(), "22/02/2023 14:00:00");

        let busy = LogStatusBlock { availability: 2, ..block };
        assert_eq!(busy.holder(), Some(BusyHolder::Channel(2)));
    }
}
