//! Register value codec
//!
//! Pure conversions from raw holding-register words to typed values. The meter
//! mixes byte orders between formats, so every rule is spelled out per
//! [`FormatTag`]. Supplying fewer words than a format needs yields
//! [`DecodedValue::Incomplete`] instead of an error.

use std::fmt;
use std::str::FromStr;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::error::MeterError;

/// Mask stripping the padding bits of the packed timestamp layout
const TIMESTAMP_MASK: u64 = 0x7F0F_1F1F_3F3F;

/// Register format tags as used by the meter's register map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FormatTag {
    Tstamp,
    Uint32,
    Sint32,
    Uint16,
    Sint16,
    Float,
    Ascii,
}

impl FormatTag {
    /// Number of words a single value occupies; `None` for ASCII, whose
    /// length comes from the register map
    pub fn word_count(self) -> Option<usize> {
        match self {
            FormatTag::Tstamp => Some(3),
            FormatTag::Uint32 | FormatTag::Sint32 | FormatTag::Float => Some(2),
            FormatTag::Uint16 | FormatTag::Sint16 => Some(1),
            FormatTag::Ascii => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FormatTag::Tstamp => "TSTAMP",
            FormatTag::Uint32 => "UINT32",
            FormatTag::Sint32 => "SINT32",
            FormatTag::Uint16 => "UINT16",
            FormatTag::Sint16 => "SINT16",
            FormatTag::Float => "FLOAT",
            FormatTag::Ascii => "ASCII",
        }
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FormatTag {
    type Err = MeterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TSTAMP" => Ok(FormatTag::Tstamp),
            "UINT32" => Ok(FormatTag::Uint32),
            "SINT32" => Ok(FormatTag::Sint32),
            "UINT16" => Ok(FormatTag::Uint16),
            "SINT16" => Ok(FormatTag::Sint16),
            "FLOAT" => Ok(FormatTag::Float),
            "ASCII" => Ok(FormatTag::Ascii),
            other => Err(MeterError::invalid_data(format!("Unknown register format '{}'", other))),
        }
    }
}

/// A decoded register value
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedValue {
    /// Rendered as `DD/MM/YYYY HH:MM:SS`
    Timestamp(String),
    UInt32(u32),
    Int32(i32),
    UInt16(u16),
    Int16(i16),
    Float32(f32),
    Text(String),
    /// Fewer words were available than the format requires
    Incomplete,
}

impl DecodedValue {
    /// Numeric view of the value, if it has one
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            DecodedValue::UInt32(v) => Some(v as f64),
            DecodedValue::Int32(v) => Some(v as f64),
            DecodedValue::UInt16(v) => Some(v as f64),
            DecodedValue::Int16(v) => Some(v as f64),
            DecodedValue::Float32(v) => Some(v as f64),
            _ => None,
        }
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self, DecodedValue::Incomplete)
    }

    /// Value rendered as missing in exports
    pub fn is_missing(&self) -> bool {
        match self {
            DecodedValue::Incomplete => true,
            DecodedValue::Float32(v) => v.is_nan(),
            _ => false,
        }
    }

    /// Multiply a numeric value by `factor`; non-numeric values pass through
    pub fn scaled(self, factor: f64) -> Self {
        match self.as_f64() {
            Some(v) => DecodedValue::Float32((v * factor) as f32),
            None => self,
        }
    }
}

impl fmt::Display for DecodedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodedValue::Timestamp(s) | DecodedValue::Text(s) => f.write_str(s),
            DecodedValue::UInt32(v) => write!(f, "{}", v),
            DecodedValue::Int32(v) => write!(f, "{}", v),
            DecodedValue::UInt16(v) => write!(f, "{}", v),
            DecodedValue::Int16(v) => write!(f, "{}", v),
            DecodedValue::Float32(v) if v.is_nan() => f.write_str("NaN"),
            DecodedValue::Float32(v) => write!(f, "{}", v),
            DecodedValue::Incomplete => f.write_str("NaN"),
        }
    }
}

/// Decode `words` according to `format`
pub fn decode(words: &[u16], format: FormatTag) -> DecodedValue {
    if let Some(needed) = format.word_count() {
        if words.len() < needed {
            return DecodedValue::Incomplete;
        }
    }

    match format {
        FormatTag::Tstamp => DecodedValue::Timestamp(decode_timestamp(words[0], words[1], words[2])),
        FormatTag::Uint32 => DecodedValue::UInt32(combine(words[0], words[1])),
        FormatTag::Sint32 => DecodedValue::Int32(combine(words[0], words[1]) as i32),
        FormatTag::Uint16 => DecodedValue::UInt16(words[0]),
        FormatTag::Sint16 => DecodedValue::Int16(words[0] as i16),
        FormatTag::Float => {
            let mut bytes = [0u8; 4];
            LittleEndian::write_u32(&mut bytes, combine(words[0], words[1]));
            DecodedValue::Float32(LittleEndian::read_f32(&bytes))
        }
        FormatTag::Ascii => {
            if words.is_empty() {
                return DecodedValue::Incomplete;
            }
            DecodedValue::Text(decode_latin1(words))
        }
    }
}

/// Decode a run of consecutive registers that all share one format
///
/// One cell per word: the first word of each value carries the decoded value,
/// the remaining words of that value are `None`. ASCII decodes the whole run
/// into its first cell. A trailing group that is cut short decodes to
/// `Incomplete`.
pub fn decode_run(words: &[u16], format: FormatTag) -> Vec<Option<DecodedValue>> {
    let mut cells = Vec::with_capacity(words.len());
    let step = match format.word_count() {
        Some(step) => step,
        None => {
            if !words.is_empty() {
                cells.push(Some(decode(words, format)));
                cells.resize(words.len(), None);
            }
            return cells;
        }
    };

    for group in words.chunks(step) {
        cells.push(Some(decode(group, format)));
        cells.extend(std::iter::repeat(None).take(group.len() - 1));
    }
    cells
}

/// Inverse of the FLOAT rule
pub fn float_to_words(value: f32) -> [u16; 2] {
    let mut bytes = [0u8; 4];
    LittleEndian::write_f32(&mut bytes, value);
    let combined = LittleEndian::read_u32(&bytes);
    [(combined >> 16) as u16, combined as u16]
}

/// Pack text into `words` registers, high byte first, NUL padded
pub fn text_to_words(text: &str, words: usize) -> Vec<u16> {
    let mut bytes: Vec<u8> = text
        .chars()
        .map(|c| if (c as u32) < 0x100 { c as u8 } else { b'?' })
        .take(words * 2)
        .collect();
    bytes.resize(words * 2, 0);
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

/// Pack a calendar time into the 3-word timestamp layout (year since 2000)
pub fn timestamp_to_words(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> [u16; 3] {
    let yy = (year.saturating_sub(2000) % 100) as u8;
    [
        u16::from_be_bytes([yy, month]),
        u16::from_be_bytes([day, hour]),
        u16::from_be_bytes([minute, second]),
    ]
}

fn combine(high: u16, low: u16) -> u32 {
    (high as u32) << 16 | low as u32
}

fn decode_timestamp(w0: u16, w1: u16, w2: u16) -> String {
    let packed = ((w0 as u64) << 32 | (w1 as u64) << 16 | w2 as u64) & TIMESTAMP_MASK;
    let field = |shift: u32| ((packed >> shift) & 0xFF) as u8;

    format!(
        "{:02}/{:02}/{:04} {:02}:{:02}:{:02}",
        field(24),
        field(32),
        2000 + field(40) as u32,
        field(16),
        field(8),
        field(0)
    )
}

fn decode_latin1(words: &[u16]) -> String {
    words
        .iter()
        .flat_map(|w| w.to_be_bytes())
        .map(char::from)
        .collect()
}
