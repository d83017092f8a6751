//! # Shark Modbus Error Handling
//!
//! Error types for every layer of the crate: the Modbus TCP transport, the
//! register-level session, and the historic log retrieval engine.
//!
//! ## Error Categories
//!
//! ### Transport Errors
//! - **I/O Errors**: socket failures
//! - **Connection Errors**: unreachable meter, operations on a closed session
//! - **Timeout Errors**: a request or a bounded wait exceeded its budget
//!
//! ### Protocol Errors
//! - **Protocol / Frame Errors**: malformed MBAP frames or PDUs
//! - **Exception Responses**: standard Modbus exception codes from the meter
//!
//! ### Retrieval Errors
//! - **Device Busy**: the global lock or a log slot is held by someone else
//! - **Engagement Failure**: the meter did not reflect an engage request
//! - **Window Timeout / Stream Stalled**: the windowed cursor stopped making progress
//! - **Layout Mismatch**: the resolved record layout does not fit the log's records
//!
//! Contention is an expected condition on a shared meter, so it has its own
//! classifier:
//!
//! ```rust
//! use shark_modbus::{BusyHolder, MeterError};
//!
//! let err = MeterError::device_busy(BusyHolder::Channel(2));
//! assert!(err.is_contention());
//! assert!(!err.is_transport_error());
//! ```

use std::fmt;
use thiserror::Error;

/// Result type alias for meter operations
pub type MeterResult<T> = Result<T, MeterError>;

/// Who currently owns a contended meter resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyHolder {
    /// This session already holds the lock
    ThisSession,
    /// Another communication channel of the meter (reported as `COMn`)
    Channel(u16),
    /// The resource is held, but the register value does not name an owner
    Unknown(u16),
}

impl fmt::Display for BusyHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusyHolder::ThisSession => write!(f, "this session"),
            BusyHolder::Channel(channel) => write!(f, "COM{}", channel),
            BusyHolder::Unknown(raw) => write!(f, "another session (0x{:04X})", raw),
        }
    }
}

/// Error types for meter communication and log retrieval
///
/// Each variant carries enough context to report the failure to an operator
/// without re-reading the meter.
#[derive(Error, Debug, Clone)]
pub enum MeterError {
    /// I/O related errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection errors
    ///
    /// Raised when the meter cannot be reached, when the stream drops, and
    /// when an operation is issued on a disconnected session. Never retried
    /// automatically.
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Timeout errors
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Protocol-level errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Invalid function code
    #[error("Invalid function code: {code}")]
    InvalidFunction { code: u8 },

    /// Invalid address range
    #[error("Invalid address: start={start}, count={count}")]
    InvalidAddress { start: u16, count: u16 },

    /// Invalid data value
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Modbus exception response
    ///
    /// # Standard Exception Codes
    /// - 0x01: Illegal Function
    /// - 0x02: Illegal Data Address
    /// - 0x03: Illegal Data Value
    /// - 0x04: Slave Device Failure
    /// - 0x05: Acknowledge
    /// - 0x06: Slave Device Busy
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// Frame parsing errors
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The meter's global lock or the requested log slot is in use
    #[error("Meter busy: held by {holder}")]
    DeviceBusy { holder: BusyHolder },

    /// An engage request was not reflected by the meter
    #[error("Log {log_number} failed to engage: {message}")]
    EngagementFailed { log_number: u8, message: String },

    /// The window ready flag never cleared within the poll budget
    #[error("Window not ready after {polls} polls ({elapsed_ms}ms)")]
    WindowTimeout { polls: u32, elapsed_ms: u64 },

    /// The device cursor stopped advancing between windows
    #[error("Log stream stalled at record {index} for {windows} windows")]
    StreamStalled { index: u32, windows: u32 },

    /// The resolved record layout does not fit the log's record size
    #[error("Record layout mismatch: {message}")]
    LayoutMismatch { message: String },

    /// Another retrieval is already running on this session
    #[error("A log retrieval is already in progress on this session")]
    RetrievalInProgress,

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl MeterError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Connection error for operations issued while disconnected
    pub fn not_connected() -> Self {
        Self::connection("session is not connected")
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create an invalid address error
    pub fn invalid_address(start: u16, count: u16) -> Self {
        Self::InvalidAddress { start, count }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    /// Create a Modbus exception error
    ///
    /// Maps standard exception codes to human-readable messages.
    pub fn exception(function: u8, code: u8) -> Self {
        let message = match code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Slave Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Slave Device Busy",
            0x08 => "Memory Parity Error",
            0x0A => "Gateway Path Unavailable",
            0x0B => "Gateway Target Device Failed to Respond",
            _ => "Unknown Exception",
        }
        .to_string();

        Self::Exception { function, code, message }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create a device busy error
    pub fn device_busy(holder: BusyHolder) -> Self {
        Self::DeviceBusy { holder }
    }

    /// Create an engagement failure
    pub fn engagement_failed<S: Into<String>>(log_number: u8, message: S) -> Self {
        Self::EngagementFailed {
            log_number,
            message: message.into(),
        }
    }

    /// Create a window timeout error
    pub fn window_timeout(polls: u32, elapsed_ms: u64) -> Self {
        Self::WindowTimeout { polls, elapsed_ms }
    }

    /// Create a layout mismatch error
    pub fn layout_mismatch<S: Into<String>>(message: S) -> Self {
        Self::LayoutMismatch { message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error is recoverable (a later attempt may succeed)
    ///
    /// Connection errors are excluded: the session fails fast and only
    /// releasing a held log re-opens a dropped link on its own.
    ///
    /// ```rust
    /// use shark_modbus::MeterError;
    ///
    /// assert!(MeterError::window_timeout(200, 30_000).is_recoverable());
    /// assert!(!MeterError::connection("refused").is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Timeout { .. } => true,
            Self::DeviceBusy { .. } => true,
            Self::RetrievalInProgress => true,
            Self::WindowTimeout { .. } => true,
            Self::StreamStalled { .. } => true,
            Self::Exception { code, .. } => matches!(code, 0x05 | 0x06),
            _ => false,
        }
    }

    /// Check if the error is a network/transport issue
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Check if the error is a Modbus protocol issue
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. } | Self::InvalidFunction { .. } | Self::Exception { .. } | Self::Frame { .. }
        )
    }

    /// Check if the error reports contention for a shared meter resource
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::DeviceBusy { .. } | Self::RetrievalInProgress)
    }
}

impl From<std::io::Error> for MeterError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Tokio's elapsed error carries no duration; callers that know the budget
/// build `MeterError::timeout` themselves.
impl From<tokio::time::error::Elapsed> for MeterError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

impl From<serde_json::Error> for MeterError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_data(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for MeterError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}

impl From<csv::Error> for MeterError {
    fn from(err: csv::Error) -> Self {
        Self::io(format!("CSV error: {}", err))
    }
}
