//! # Shark Modbus - Power Meter Register Decoding and Historic Log Retrieval
//!
//! Async Modbus TCP access to a power meter: typed decoding of packed register
//! formats and streaming retrieval of the meter's historic logs.
//!
//! ## Features
//!
//! - **Register codec**: TSTAMP, UINT32/SINT32, UINT16/SINT16, FLOAT and ASCII
//!   decoding with an explicit `Incomplete` sentinel for short reads
//! - **Meter session**: connect, identity, chunked register reads/writes and
//!   register polling
//! - **Historic logs**: lock handshake, log engagement, catalog-driven record
//!   layouts and windowed streaming, with guaranteed release on every exit
//! - **Background retrieval**: progress events, cancellation and
//!   one-retrieval-per-session enforcement
//! - **Simulator**: an in-process meter for tests and dry runs
//!
//! ## Supported Function Codes
//!
//! | Code | Function |
//! |------|----------|
//! | 0x03 | Read Holding Registers |
//! | 0x06 | Write Single Register |
//! | 0x10 | Write Multiple Registers |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use shark_modbus::{FormatTag, MeterResult, MeterSession};
//!
//! #[tokio::main]
//! async fn main() -> MeterResult<()> {
//!     let mut session: MeterSession = MeterSession::new();
//!     let identity = session.connect(1, "192.168.0.90", 502).await?;
//!     println!("{} ({})", identity.name, identity.serial);
//!
//!     for polled in session.poll_registers(9, 8, FormatTag::Ascii).await? {
//!         println!("{}: {:04X}", polled.register, polled.raw);
//!     }
//!
//!     session.disconnect().await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │  LogRetrievalEngine  │──► RecordLayout ◄── RegisterCatalog
//! └──────────────────────┘         │
//!            │                     ▼
//! ┌──────────────────────┐   RegisterCodec
//! │     MeterSession     │
//! └──────────────────────┘
//!            │
//! ┌──────────────────────┐    ┌────────────────┐
//! │     ModbusClient     │◄───│ SimulatedMeter │
//! └──────────────────────┘    └────────────────┘
//!            │
//! ┌──────────────────────┐
//! │  TcpTransport (MBAP) │
//! └──────────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// Modbus protocol definitions and message handling
pub mod protocol;

/// Modbus TCP transport
pub mod transport;

/// Modbus client implementations
pub mod client;

/// Callback logging for requests and responses
pub mod logging;

/// Register value decoding
pub mod codec;

/// Register metadata catalog
pub mod catalog;

/// Meter register map and historic log slots
pub mod registers;

/// Connection to one meter
pub mod session;

/// Historic log record layouts
pub mod layout;

/// Retrieved tables and delimited output
pub mod export;

/// Retrieval progress events
pub mod progress;

/// Historic log retrieval engine
pub mod retrieval;

/// Configuration file support
pub mod config;

/// In-process meter simulator
pub mod simulator;

// Re-export main types for convenience
pub use error::{BusyHolder, MeterError, MeterResult};
pub use protocol::{ModbusFunction, ModbusRequest, ModbusResponse, SlaveId};
pub use transport::{ModbusTransport, TcpTransport, TransportStats};
pub use client::{GenericModbusClient, ModbusClient, ModbusTcpClient};
pub use logging::{CallbackLogger, LogCallback, LogLevel, LoggingMode};
pub use codec::{decode, decode_run, DecodedValue, FormatTag};
pub use catalog::{InMemoryCatalog, RegisterCatalog, RegisterInfo};
pub use registers::{HistoricLog, LogSlotDescriptor, LogStatusBlock};
pub use session::{MeterIdentity, MeterSession, PolledRegister};
pub use layout::{FieldSpec, LayoutWarning, RecordLayout};
pub use export::{unique_path, ExportTable};
pub use progress::{progress_channel, ProgressCallback, RetrievalEvent, RetrievalState, RetrievalStatus};
pub use retrieval::{spawn_retrieval, LogExport, LogRetrievalEngine};
pub use config::{MeterConfig, RetrievalOptions};
pub use simulator::{SimulatedLog, SimulatedMeter, SimulatorFaults};

/// Default timeout for operations (5 seconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Maximum number of registers that can be read in a single request
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Maximum number of registers that can be written in a single request
pub const MAX_WRITE_REGISTERS_PER_REQUEST: u16 = 123;

/// Maximum Modbus TCP frame size (MBAP header + PDU)
pub const MAX_TCP_FRAME_SIZE: usize = 260;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Bytes the meter stages per historic log window
pub const WINDOW_BYTE_BUDGET: u16 = 246;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Shark Modbus v{} - power meter register decoding and historic log retrieval", VERSION)
}
