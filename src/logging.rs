use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::MeterError;
use crate::protocol::{ModbusFunction, ModbusRequest, ModbusResponse};

/// Log levels for the callback logging system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Error messages
    Error,
    /// Warning messages
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
}

/// Logging mode for packet display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingMode {
    /// Show raw PDU bytes only
    Raw,
    /// Show interpreted request/response fields
    Interpreted,
    /// Show both raw and interpreted data
    Both,
}

impl fmt::Display for LoggingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoggingMode::Raw => "raw",
            LoggingMode::Interpreted => "interpreted",
            LoggingMode::Both => "both",
        })
    }
}

impl FromStr for LoggingMode {
    type Err = MeterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" => Ok(LoggingMode::Raw),
            "interpreted" => Ok(LoggingMode::Interpreted),
            "both" => Ok(LoggingMode::Both),
            _ => Err(MeterError::configuration(format!(
                "Unknown frame logging mode '{}' (raw, interpreted or both)",
                s
            ))),
        }
    }
}

impl LogLevel {
    /// Convert log level to string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Type alias for log callback functions
///
/// The callback receives a log level and message string
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Logger that uses callbacks for flexible logging
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
    mode: LoggingMode,
}

impl CallbackLogger {
    /// Create a new callback logger
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self::with_mode(callback, min_level, LoggingMode::Interpreted)
    }

    /// Create a new callback logger with specific mode
    pub fn with_mode(callback: Option<LogCallback>, min_level: LogLevel, mode: LoggingMode) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode,
        }
    }

    /// Create a logger that prints every level to the console
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            match level {
                LogLevel::Error | LogLevel::Warn => eprintln!("[{}] {}: {}", timestamp, level.as_str(), message),
                LogLevel::Info | LogLevel::Debug => println!("[{}] {}: {}", timestamp, level.as_str(), message),
            }
        });
        Self::new(Some(callback), LogLevel::Debug)
    }

    /// Create a logger that outputs nothing (disabled)
    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    /// Set logging mode
    pub fn set_mode(&mut self, mode: LoggingMode) {
        self.mode = mode;
    }

    /// Get current logging mode
    pub fn get_mode(&self) -> LoggingMode {
        self.mode
    }

    /// Log a message at the specified level
    pub fn log(&self, level: LogLevel, message: &str) {
        if self.should_log(level) {
            if let Some(ref callback) = self.callback {
                callback(level, message);
            }
        }
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    fn should_log(&self, level: LogLevel) -> bool {
        self.callback.is_some() && level as u8 <= self.min_level as u8
    }

    /// Log an outgoing request
    pub fn log_request(&self, request: &ModbusRequest) {
        let interpreted = || {
            format!(
                "Modbus Request -> Slave: {}, Function: {}, Address: 0x{:04X}, Quantity: {}",
                request.slave_id, request.function, request.address, request.quantity
            )
        };
        let raw = || {
            let mut pdu = vec![request.slave_id, request.function.to_u8()];
            pdu.extend_from_slice(&request.address.to_be_bytes());
            pdu.extend_from_slice(&request.quantity.to_be_bytes());
            pdu.extend_from_slice(&request.data);
            format!("Modbus Request -> Raw: {}", hex::encode_upper(pdu))
        };
        self.emit(interpreted, raw);
    }

    /// Log an incoming response
    pub fn log_response(&self, response: &ModbusResponse) {
        let interpreted = || {
            format!(
                "Modbus Response <- Slave: {}, Function: {}, {}",
                response.slave_id,
                response.function,
                interpret_response(response)
            )
        };
        let raw = || {
            let mut pdu = vec![response.slave_id, response.function.to_u8()];
            pdu.extend_from_slice(&response.data);
            format!("Modbus Response <- Raw: {}", hex::encode_upper(pdu))
        };
        self.emit(interpreted, raw);
    }

    fn emit(&self, interpreted: impl Fn() -> String, raw: impl Fn() -> String) {
        match self.mode {
            LoggingMode::Raw => self.info(&raw()),
            LoggingMode::Interpreted => self.info(&interpreted()),
            LoggingMode::Both => {
                self.info(&interpreted());
                self.debug(&raw());
            }
        }
    }
}

/// Interpret response data based on function code
fn interpret_response(response: &ModbusResponse) -> String {
    if let Some(code) = response.exception {
        return format!("Exception: 0x{:02X}", code);
    }

    let data = &response.data;
    match response.function {
        ModbusFunction::ReadHoldingRegisters if data.len() >= 3 => {
            let registers: Vec<u16> = data[1..]
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            format!(
                "Byte count: {}, Registers: {:04X?}",
                data[0],
                &registers[..registers.len().min(8)]
            )
        }
        ModbusFunction::WriteSingleRegister if data.len() >= 4 => {
            let address = u16::from_be_bytes([data[0], data[1]]);
            let value = u16::from_be_bytes([data[2], data[3]]);
            format!("Address: 0x{:04X}, Value: 0x{:04X}", address, value)
        }
        ModbusFunction::WriteMultipleRegisters if data.len() >= 4 => {
            let address = u16::from_be_bytes([data[0], data[1]]);
            let quantity = u16::from_be_bytes([data[2], data[3]]);
            format!("Address: 0x{:04X}, Quantity: {}", address, quantity)
        }
        _ if data.is_empty() => "No data".to_string(),
        _ => format!("Data: {}", hex::encode(data)),
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn capture(mode: LoggingMode, level: LogLevel) -> (CallbackLogger, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let callback: LogCallback = Box::new(move |_, message| sink.lock().unwrap().push(message.to_string()));
        (CallbackLogger::with_mode(Some(callback), level, mode), lines)
    }

    #[test]
    fn test_interpreted_request() {
        let (logger, lines) = capture(LoggingMode::Interpreted, LogLevel::Info);
        logger.log_request(&ModbusRequest::new_write_single(1, 0xC34B, 0x000B));

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("Write Single Register"));
        assert!(lines[0].contains("0xC34B"));
    }

    #[test]
    fn test_raw_response() {
        let (logger, lines) = capture(LoggingMode::Raw, LogLevel::Info);
        let response = ModbusResponse::new_success(1, ModbusFunction::ReadHoldingRegisters, vec![2, 0x0B, 0x00]);
        logger.log_response(&response);

        assert_eq!(lines.lock().unwrap()[0], "Modbus Response <- Raw: 0103020B00");
    }

    #[test]
    fn test_both_mode_respects_level() {
        let (logger, lines) = capture(LoggingMode::Both, LogLevel::Info);
        logger.log_request(&ModbusRequest::new_read(1, 0, 16));
        // Raw line goes out at debug and is filtered
        assert_eq!(lines.lock().unwrap().len(), 1);

        let (logger, lines) = capture(LoggingMode::Both, LogLevel::Debug);
        logger.log_request(&ModbusRequest::new_read(1, 0, 16));
        assert_eq!(lines.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("Raw".parse::<LoggingMode>().unwrap(), LoggingMode::Raw);
        assert_eq!(" both ".parse::<LoggingMode>().unwrap(), LoggingMode::Both);
        assert!("hex".parse::<LoggingMode>().is_err());
        assert_eq!(LoggingMode::Interpreted.to_string(), "interpreted");
    }

    #[test]
    fn test_disabled_logger_is_silent() {
        let logger = CallbackLogger::default();
        logger.log_request(&ModbusRequest::new_read(1, 0, 1));
        assert_eq!(logger.get_mode(), LoggingMode::Interpreted);
    }
}
