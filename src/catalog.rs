//! Register metadata catalog
//!
//! Maps a 1-based register number to its name, size in words and format.
//! The catalog is loaded once (JSON or YAML) and only consulted through
//! [`RegisterCatalog::lookup`] during layout resolution.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::codec::FormatTag;
use crate::error::{MeterError, MeterResult};

/// Registers whose catalog entry describes a block of single-word samples
/// (harmonic magnitude and waveform sample blocks). A log field referencing
/// one of these expands into one column per word.
pub const ARRAY_REGISTERS: &[u16] = &[
    0x1001, // Va harmonic magnitudes
    0x1101, // Vb harmonic magnitudes
    0x1201, // Vc harmonic magnitudes
    0x1301, // Ia harmonic magnitudes
    0x1401, // Ib harmonic magnitudes
    0x1501, // Ic harmonic magnitudes
    0x1801, // Va waveform samples
    0x1881, // Ia waveform samples
];

/// Check whether a register is in the compiled array set
pub fn is_array_register(register: u16) -> bool {
    ARRAY_REGISTERS.contains(&register)
}

/// Metadata for one register entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterInfo {
    pub name: String,
    /// Size in 16-bit words
    pub size: u16,
    pub format: FormatTag,
}

/// Lookup interface consumed by layout resolution
pub trait RegisterCatalog: Send + Sync {
    /// Look up a 1-based register number
    fn lookup(&self, register: u16) -> Option<RegisterInfo>;
}

/// Serialized catalog row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub register: u16,
    pub name: String,
    pub size: u16,
    pub format: FormatTag,
}

/// Catalog held entirely in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    entries: HashMap<u16, RegisterInfo>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry; a zero size is rejected
    pub fn insert(&mut self, register: u16, info: RegisterInfo) -> MeterResult<()> {
        if info.size == 0 {
            return Err(MeterError::invalid_data(format!(
                "Register {} ({}) has zero size",
                register, info.name
            )));
        }
        self.entries.insert(register, info);
        Ok(())
    }

    pub fn from_entries<I>(entries: I) -> MeterResult<Self>
    where
        I: IntoIterator<Item = CatalogEntry>,
    {
        let mut catalog = Self::new();
        for entry in entries {
            catalog.insert(
                entry.register,
                RegisterInfo {
                    name: entry.name,
                    size: entry.size,
                    format: entry.format,
                },
            )?;
        }
        Ok(catalog)
    }

    pub fn from_json_str(json: &str) -> MeterResult<Self> {
        let entries: Vec<CatalogEntry> = serde_json::from_str(json)?;
        Self::from_entries(entries)
    }

    pub fn from_yaml_str(yaml: &str) -> MeterResult<Self> {
        let entries: Vec<CatalogEntry> = serde_yaml::from_str(yaml)?;
        Self::from_entries(entries)
    }

    /// Load a catalog file; `.json` is parsed as JSON, anything else as YAML
    pub fn from_path(path: impl AsRef<Path>) -> MeterResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| MeterError::configuration(format!("Cannot read catalog {}: {}", path.display(), e)))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::from_json_str(&content),
            _ => Self::from_yaml_str(&content),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl RegisterCatalog for InMemoryCatalog {
    fn lookup(&self, register: u16) -> Option<RegisterInfo> {
        self.entries.get(&register).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_catalog() {
        let catalog = InMemoryCatalog::from_json_str(
            r#"[
                {"register": 1000, "name": "Volts A-N", "size": 2, "format": "FLOAT"},
                {"register": 1022, "name": "Power Factor (%)", "size": 1, "format": "SINT16"}
            ]"#,
        )
        .unwrap();

        assert_eq!(catalog.len(), 2);
        let info = catalog.lookup(1022).unwrap();
        assert_eq!(info.format, FormatTag::Sint16);
        assert!(catalog.lookup(999).is_none());
    }

    #[test]
    fn test_yaml_catalog() {
        let yaml = "- register: 1000\n  name: Volts A-N\n  size: 2\n  format: FLOAT\n";
        let catalog = InMemoryCatalog::from_yaml_str(yaml).unwrap();
        assert_eq!(catalog.lookup(1000).unwrap().name, "Volts A-N");
    }

    #[test]
    fn test_zero_size_rejected() {
        let result = InMemoryCatalog::from_json_str(
            r#"[{"register": 5, "name": "Broken", "size": 0, "format": "UINT16"}]"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_array_registers() {
        assert!(is_array_register(0x1001));
        assert!(!is_array_register(1000));
    }
}
