//! Retrieved log tables and their delimited rendering

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::codec::DecodedValue;
use crate::error::MeterResult;

/// Header plus decoded rows of a retrieved log
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<DecodedValue>>,
}

impl ExportTable {
    pub fn new(header: Vec<String>) -> Self {
        Self {
            header,
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<DecodedValue>) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Write header and rows; missing values render as `NaN`
    pub fn write_delimited<W: Write>(&self, writer: W, delimiter: u8) -> MeterResult<()> {
        let mut csv_writer = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .from_writer(writer);

        csv_writer.write_record(&self.header)?;
        for row in &self.rows {
            csv_writer.write_record(row.iter().map(|value| value.to_string()))?;
        }
        csv_writer.flush()?;
        Ok(())
    }

    pub fn to_delimited_string(&self, delimiter: u8) -> MeterResult<String> {
        let mut buffer = Vec::new();
        self.write_delimited(&mut buffer, delimiter)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// First free path `dir/stem.ext`, `dir/stem_1.ext`, `dir/stem_2.ext`, ...
pub fn unique_path(dir: impl AsRef<Path>, stem: &str, extension: &str) -> PathBuf {
    let dir = dir.as_ref();
    let candidate = dir.join(format!("{}.{}", stem, extension));
    if !candidate.exists() {
        return candidate;
    }

    (1u32..)
        .map(|n| dir.join(format!("{}_{}.{}", stem, n, extension)))
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}
