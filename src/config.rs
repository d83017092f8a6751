use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MeterError, MeterResult};
use crate::logging::LoggingMode;
use crate::protocol::SlaveId;
use crate::{DEFAULT_TCP_PORT, DEFAULT_TIMEOUT_MS};

/// Bounds for the retrieval engine's waits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalOptions {
    /// Maximum re-polls of the window offset while the meter stages a window
    pub window_poll_limit: u32,
    /// First delay between window polls in milliseconds
    pub poll_interval_ms: u64,
    /// Backoff ceiling between window polls in milliseconds
    pub max_poll_interval_ms: u64,
    /// Total time allowed for one window to become ready in milliseconds
    pub window_ready_timeout_ms: u64,
    /// Availability reads after an engage request before giving up
    pub engage_confirm_attempts: u32,
    /// Consecutive windows without cursor progress before giving up
    pub max_stalled_windows: u32,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            window_poll_limit: 200,
            poll_interval_ms: 10,
            max_poll_interval_ms: 250,
            window_ready_timeout_ms: 30_000,
            engage_confirm_attempts: 5,
            max_stalled_windows: 3,
        }
    }
}

impl RetrievalOptions {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms.max(self.poll_interval_ms))
    }

    pub fn window_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.window_ready_timeout_ms)
    }

    pub fn validate(&self) -> MeterResult<()> {
        if self.window_poll_limit == 0 {
            return Err(MeterError::configuration("window_poll_limit must be at least 1"));
        }
        if self.window_ready_timeout_ms == 0 {
            return Err(MeterError::configuration("window_ready_timeout_ms must be positive"));
        }
        if self.engage_confirm_attempts == 0 {
            return Err(MeterError::configuration("engage_confirm_attempts must be at least 1"));
        }
        Ok(())
    }
}

/// Connection and export settings for one meter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    /// Meter hostname or IP address
    #[serde(alias = "hostname")]
    pub host: String,
    pub port: u16,
    /// Modbus unit identifier
    #[serde(alias = "device_address")]
    pub slave_id: SlaveId,
    /// Per-request timeout in milliseconds
    pub timeout_ms: u64,
    /// Hex dump every frame at info level
    pub packet_logging: bool,
    /// Print every request and response on the console in this form
    pub frame_log: Option<LoggingMode>,
    /// Register catalog file (JSON or YAML)
    pub catalog: Option<PathBuf>,
    /// Directory for exported logs
    pub output_dir: PathBuf,
    /// Field delimiter for exported logs
    pub delimiter: char,
    pub retrieval: RetrievalOptions,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            host: "192.168.0.90".to_string(),
            port: DEFAULT_TCP_PORT,
            slave_id: 1,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            packet_logging: false,
            frame_log: None,
            catalog: None,
            output_dir: PathBuf::from("."),
            delimiter: ',',
            retrieval: RetrievalOptions::default(),
        }
    }
}

impl MeterConfig {
    /// Load a YAML configuration file
    pub fn from_file(path: &Path) -> MeterResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MeterError::configuration(format!("Cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(yaml: &str) -> MeterResult<Self> {
        let config: MeterConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delimiter as the single byte the exporter writes
    pub fn delimiter_byte(&self) -> MeterResult<u8> {
        if self.delimiter.is_ascii() {
            Ok(self.delimiter as u8)
        } else {
            Err(MeterError::configuration(format!(
                "Delimiter '{}' must be a single ASCII character",
                self.delimiter
            )))
        }
    }

    pub fn validate(&self) -> MeterResult<()> {
        if self.host.trim().is_empty() {
            return Err(MeterError::configuration("Meter host is empty"));
        }
        if self.slave_id == 0 || self.slave_id > 247 {
            return Err(MeterError::configuration(format!("Invalid slave ID: {}", self.slave_id)));
        }
        if self.timeout_ms == 0 {
            return Err(MeterError::configuration("timeout_ms must be positive"));
        }
        self.delimiter_byte()?;
        self.retrieval.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MeterConfig::default();
        assert_eq!(config.port, 502);
        assert_eq!(config.timeout(), Duration::from_secs(5));
        assert_eq!(config.retrieval.window_poll_limit, 200);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml() {
        let config = MeterConfig::from_yaml_str(
            "host: 10.0.0.5\nslave_id: 3\ndelimiter: ';'\nretrieval:\n  max_stalled_windows: 5\n",
        )
        .unwrap();

        assert_eq!(config.host, "10.0.0.5");
        assert_eq!(config.slave_id, 3);
        assert_eq!(config.delimiter_byte().unwrap(), b';');
        assert_eq!(config.retrieval.max_stalled_windows, 5);
        assert_eq!(config.retrieval.poll_interval_ms, 10);
        assert_eq!(config.frame_log, None);
    }

    #[test]
    fn test_frame_log_mode() {
        let config = MeterConfig::from_yaml_str("frame_log: both
").unwrap();
        assert_eq!(config.frame_log, Some(LoggingMode::Both));
        assert!(MeterConfig::from_yaml_str("frame_log: hex
").is_err());
    }

    #[test]
    fn test_invalid_values() {
        assert!(MeterConfig::from_yaml_str("slave_id: 0\n").is_err());
        assert!(MeterConfig::from_yaml_str("delimiter: 'é'\n").is_err());
        assert!(MeterConfig::from_yaml_str("retrieval:\n  window_poll_limit: 0\n").is_err());
    }
}
