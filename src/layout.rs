//! Record layout resolution
//!
//! A historic log's setup block lists the register numbers recorded in each
//! record. Resolving those numbers against the catalog yields the ordered
//! field list used to split window data into rows.

use std::fmt;

use serde::Serialize;

use crate::catalog::{is_array_register, RegisterCatalog};
use crate::codec::{decode, DecodedValue, FormatTag};
use crate::error::{MeterError, MeterResult};
use crate::WINDOW_BYTE_BUDGET;

pub const TIMESTAMP_TITLE: &str = "Timestamp";

/// Scale applied to percentage and phase-angle fields
pub const PERCENT_SCALE: f64 = 0.01;

/// One column of a log record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSpec {
    pub title: String,
    pub word_count: u16,
    pub format: FormatTag,
}

impl FieldSpec {
    pub fn new(title: impl Into<String>, word_count: u16, format: FormatTag) -> Self {
        Self {
            title: title.into(),
            word_count,
            format,
        }
    }

    pub fn timestamp() -> Self {
        Self::new(TIMESTAMP_TITLE, 3, FormatTag::Tstamp)
    }

    /// Scale factor for the decoded value, if the title marks a percentage or phase
    pub fn scale(&self) -> Option<f64> {
        let title = self.title.to_ascii_lowercase();
        if title.contains('%') || title.contains("angle") {
            Some(PERCENT_SCALE)
        } else {
            None
        }
    }

    /// Decode this field's words, applying any scale
    pub fn decode(&self, words: &[u16]) -> DecodedValue {
        let value = decode(words, self.format);
        match self.scale() {
            Some(factor) => value.scaled(factor),
            None => value,
        }
    }
}

/// A register number that could not be turned into a field
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayoutWarning {
    pub register: u16,
    pub message: String,
}

impl fmt::Display for LayoutWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "register {}: {}", self.register, self.message)
    }
}

/// Ordered fields of one record; the timestamp always comes first
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordLayout {
    fields: Vec<FieldSpec>,
}

impl Default for RecordLayout {
    fn default() -> Self {
        Self {
            fields: vec![FieldSpec::timestamp()],
        }
    }
}

impl RecordLayout {
    /// Resolve setup register numbers against the catalog
    ///
    /// Unknown registers are skipped and reported as warnings.
    pub fn resolve(registers: &[u16], catalog: &dyn RegisterCatalog) -> (Self, Vec<LayoutWarning>) {
        let mut layout = Self::default();
        let mut warnings = Vec::new();

        for &register in registers {
            let info = match catalog.lookup(register) {
                Some(info) => info,
                None => {
                    warnings.push(LayoutWarning {
                        register,
                        message: "not found in register catalog".to_string(),
                    });
                    continue;
                }
            };

            if is_array_register(register) {
                let format = match info.format.word_count() {
                    Some(1) => info.format,
                    _ => FormatTag::Uint16,
                };
                for k in 1..=info.size {
                    layout.fields.push(FieldSpec::new(format!("{} ({})", info.name, k), 1, format));
                }
                continue;
            }

            if let Some(needed) = info.format.word_count() {
                if (info.size as usize) < needed {
                    warnings.push(LayoutWarning {
                        register,
                        message: format!("{} words is too small for {}", info.size, info.format),
                    });
                    continue;
                }
            }

            layout.fields.push(FieldSpec::new(info.name, info.size, info.format));
        }

        (layout, warnings)
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn titles(&self) -> Vec<String> {
        self.fields.iter().map(|field| field.title.clone()).collect()
    }

    pub fn total_words(&self) -> usize {
        self.fields.iter().map(|field| field.word_count as usize).sum()
    }

    /// Check the layout against the log's record stride and the window budget
    pub fn check_fits(&self, stride_words: usize, records_per_window: u16) -> MeterResult<()> {
        let words = self.total_words();
        if words > stride_words {
            return Err(MeterError::layout_mismatch(format!(
                "layout needs {} words but records are {} words",
                words, stride_words
            )));
        }
        if words * records_per_window as usize * 2 > WINDOW_BYTE_BUDGET as usize {
            return Err(MeterError::layout_mismatch(format!(
                "{} records of {} words exceed the {}-byte window",
                records_per_window, words, WINDOW_BYTE_BUDGET
            )));
        }
        Ok(())
    }

    /// Decode one record; `None` when fewer words than the layout needs
    pub fn decode_record(&self, words: &[u16]) -> Option<Vec<DecodedValue>> {
        if words.len() < self.total_words() {
            return None;
        }

        let mut offset = 0;
        let row = self
            .fields
            .iter()
            .map(|field| {
                let end = offset + field.word_count as usize;
                let value = field.decode(&words[offset..end]);
                offset = end;
                value
            })
            .collect();
        Some(row)
    }
}

/// Field count carried in the low byte of the setup word
pub fn setup_field_count(setup_word: u16) -> u16 {
    setup_word & 0x00FF
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{InMemoryCatalog, RegisterInfo};

    fn catalog() -> InMemoryCatalog {
        let mut catalog = InMemoryCatalog::new();
        let entries = [
            (1000, "Volts A-N", 2, FormatTag::Float),
            (1022, "Power Factor (%)", 1, FormatTag::Uint16),
            (1030, "Phase Angle A", 1, FormatTag::Sint16),
            (0x1001, "Va Harmonic", 4, FormatTag::Uint16),
            (1100, "Bad", 1, FormatTag::Uint32),
        ];
        for (register, name, size, format) in entries {
            catalog
                .insert(register, RegisterInfo { name: name.into(), size, format })
                .unwrap();
        }
        catalog
    }

    #[test]
    fn test_resolve_layout() {
        let (layout, warnings) = RecordLayout::resolve(&[1000, 1022, 4242], &catalog());

        assert_eq!(layout.titles(), vec!["Timestamp", "Volts A-N", "Power Factor (%)"]);
        assert_eq!(layout.total_words(), 6);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].register, 4242);
    }

    #[test]
    fn test_array_expansion() {
        let (layout, warnings) = RecordLayout::resolve(&[0x1001], &catalog());
        assert!(warnings.is_empty());
        assert_eq!(
            layout.titles(),
            vec!["Timestamp", "Va Harmonic (1)", "Va Harmonic (2)", "Va Harmonic (3)", "Va Harmonic (4)"]
        );
        assert!(layout.fields()[1..].iter().all(|f| f.word_count == 1));
    }

    #[test]
    fn test_undersized_entry_warns() {
        let (layout, warnings) = RecordLayout::resolve(&[1100], &catalog());
        assert_eq!(layout.fields().len(), 1);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_scaled_fields() {
        let (layout, _) = RecordLayout::resolve(&[1022, 1030], &catalog());
        let row = layout
            .decode_record(&[0x1702, 0x160E, 0x0000, 9950, (-1200i16) as u16])
            .unwrap();

        assert_eq!(row[1], DecodedValue::Float32(99.5));
        assert_eq!(row[2].to_string(), "-12");
    }

    #[test]
    fn test_short_record_is_dropped() {
        let (layout, _) = RecordLayout::resolve(&[1000], &catalog());
        assert!(layout.decode_record(&[0x1702, 0x160E, 0x0000, 0x42C8]).is_none());
    }

    #[test]
    fn test_check_fits() {
        let (layout, _) = RecordLayout::resolve(&[1000, 1022], &catalog());
        assert!(layout.check_fits(6, 20).is_ok());
        assert!(layout.check_fits(5, 20).is_err());
        assert!(matches!(layout.check_fits(6, 21), Err(MeterError::LayoutMismatch { .. })));
    }

    #[test]
    fn test_setup_field_count() {
        assert_eq!(setup_field_count(0x0203), 3);
    }
}
