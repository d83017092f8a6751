//! # Modbus TCP Transport
//!
//! Transport layer for talking to the meter over Modbus TCP.
//!
//! - MBAP header handling with transaction ID management
//! - Per-request timeouts
//! - Optional hex packet logging through `tracing`
//! - Request/response statistics
//!
//! A broken stream is never re-opened behind the caller's back: once a send or
//! receive fails the transport reports itself disconnected and every further
//! request fails with a connection error until [`ModbusTransport::reconnect`]
//! is called.
//!
//! ```rust,no_run
//! use shark_modbus::transport::{TcpTransport, ModbusTransport};
//! use shark_modbus::protocol::ModbusRequest;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut transport = TcpTransport::new("192.168.0.90:502".parse()?, Duration::from_secs(5)).await?;
//!
//!     let request = ModbusRequest::new_read(1, 0, 16);
//!     let response = transport.request(&request).await?;
//!     println!("Identity block: {:?}", response.parse_registers()?);
//!
//!     transport.close().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::time::Duration;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{MeterError, MeterResult};
use crate::protocol::{ModbusFunction, ModbusRequest, ModbusResponse};
use crate::MAX_TCP_FRAME_SIZE;

/// Modbus TCP Application Protocol header size
const MBAP_HEADER_SIZE: usize = 6;

/// Log packet with direction
fn log_packet(direction: &str, data: &[u8], slave_id: u8) {
    info!("[MODBUS-TCP] {} slave:{} {}", direction, slave_id, hex::encode_upper(data));
}

/// Transport layer abstraction for Modbus communication
///
/// Implementations must be `Send + Sync` so a session can be moved onto a
/// background task for long retrievals.
#[async_trait]
pub trait ModbusTransport: Send + Sync {
    /// Send a Modbus request and wait for its response
    ///
    /// # Errors
    ///
    /// - `MeterError::Timeout` - Request timed out
    /// - `MeterError::Connection` - Connection lost or never established
    /// - `MeterError::Frame` - Malformed response frame
    /// - `MeterError::Exception` - Meter returned a Modbus exception
    async fn request(&mut self, request: &ModbusRequest) -> MeterResult<ModbusResponse>;

    /// Check if the transport connection is active
    fn is_connected(&self) -> bool;

    /// Close the transport connection gracefully
    async fn close(&mut self) -> MeterResult<()>;

    /// Drop any current connection and open a fresh one to the same peer
    async fn reconnect(&mut self) -> MeterResult<()>;

    /// Get communication statistics
    fn get_stats(&self) -> TransportStats;
}

/// Transport layer statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Modbus TCP transport implementation
pub struct TcpTransport {
    stream: Option<TcpStream>,
    pub address: SocketAddr,
    timeout: Duration,
    transaction_id: u16,
    stats: TransportStats,
    /// Enable packet logging for debugging
    packet_logging: bool,
}

impl TcpTransport {
    /// Connect to a meter; the same timeout bounds the connect and every request
    pub async fn new(address: SocketAddr, timeout: Duration) -> MeterResult<Self> {
        Self::with_packet_logging(address, timeout, false).await
    }

    /// Connect with packet logging enabled or disabled
    pub async fn with_packet_logging(
        address: SocketAddr,
        request_timeout: Duration,
        enable_logging: bool,
    ) -> MeterResult<Self> {
        let stream = open_stream(address, request_timeout).await?;
        debug!(%address, "Modbus TCP connection established");

        Ok(Self {
            stream: Some(stream),
            address,
            timeout: request_timeout,
            transaction_id: 0,
            stats: TransportStats::default(),
            packet_logging: enable_logging,
        })
    }

    /// Enable or disable packet logging
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    /// Get next transaction ID
    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        if self.transaction_id == 0 {
            self.transaction_id = 1;
        }
        self.transaction_id
    }

    /// Encode request to TCP frame
    fn encode_request(&mut self, request: &ModbusRequest) -> Vec<u8> {
        let transaction_id = self.next_transaction_id();
        encode_frame(transaction_id, request)
    }

    /// Fail the current request and drop the broken stream
    fn fail_stream(&mut self, operation: &str) -> MeterError {
        self.stats.timeouts += 1;
        self.stats.errors += 1;
        self.stream = None;
        MeterError::timeout(operation, self.timeout.as_millis() as u64)
    }
}

/// Open a TCP stream, bounding the connect by the request timeout
async fn open_stream(address: SocketAddr, connect_timeout: Duration) -> MeterResult<TcpStream> {
    let stream = match timeout(connect_timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(MeterError::connection(format!("Failed to connect to {}: {}", address, e))),
        Err(_) => {
            return Err(MeterError::connection(format!(
                "Failed to connect to {}: no answer within {}ms",
                address,
                connect_timeout.as_millis()
            )))
        }
    };
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Build an MBAP frame for a request
pub(crate) fn encode_frame(transaction_id: u16, request: &ModbusRequest) -> Vec<u8> {
    let protocol_id = 0u16;

    // unit id + function code + address + (quantity | value) [+ byte count + data]
    let pdu_length = 1 + 1 + 4 + match request.function {
        ModbusFunction::ReadHoldingRegisters | ModbusFunction::WriteSingleRegister => 0,
        ModbusFunction::WriteMultipleRegisters => 1 + request.data.len(),
    };

    let mut frame = Vec::with_capacity(MBAP_HEADER_SIZE + pdu_length);
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&protocol_id.to_be_bytes());
    frame.extend_from_slice(&(pdu_length as u16).to_be_bytes());

    frame.push(request.slave_id);
    frame.push(request.function.to_u8());
    frame.extend_from_slice(&request.address.to_be_bytes());

    match request.function {
        ModbusFunction::ReadHoldingRegisters => {
            frame.extend_from_slice(&request.quantity.to_be_bytes());
        }
        ModbusFunction::WriteSingleRegister => {
            frame.extend_from_slice(&request.data[..2]);
        }
        ModbusFunction::WriteMultipleRegisters => {
            frame.extend_from_slice(&request.quantity.to_be_bytes());
            frame.push(request.data.len() as u8);
            frame.extend_from_slice(&request.data);
        }
    }

    frame
}

/// Decode a complete MBAP response frame
pub(crate) fn decode_frame(frame: &[u8]) -> MeterResult<(u16, ModbusResponse)> {
    if frame.len() < MBAP_HEADER_SIZE + 2 {
        return Err(MeterError::frame("Frame too short"));
    }

    let transaction_id = u16::from_be_bytes([frame[0], frame[1]]);
    let protocol_id = u16::from_be_bytes([frame[2], frame[3]]);
    let length = u16::from_be_bytes([frame[4], frame[5]]) as usize;
    let slave_id = frame[6];

    if protocol_id != 0 {
        return Err(MeterError::frame(format!("Unexpected protocol id {}", protocol_id)));
    }

    if length < 2 || frame.len() < MBAP_HEADER_SIZE + length {
        return Err(MeterError::frame("Incomplete frame"));
    }

    let function_code = frame[7];

    if function_code & 0x80 != 0 {
        if length < 3 {
            return Err(MeterError::frame("Invalid exception response"));
        }

        let original_function = ModbusFunction::from_u8(function_code & 0x7F)?;
        let exception_code = frame[8];

        return Ok((
            transaction_id,
            ModbusResponse::new_exception(slave_id, original_function, exception_code),
        ));
    }

    let function = ModbusFunction::from_u8(function_code)?;
    let data = frame[MBAP_HEADER_SIZE + 2..MBAP_HEADER_SIZE + length].to_vec();

    Ok((transaction_id, ModbusResponse::new_success(slave_id, function, data)))
}

#[async_trait]
impl ModbusTransport for TcpTransport {
    async fn request(&mut self, request: &ModbusRequest) -> MeterResult<ModbusResponse> {
        request.validate()?;

        if self.stream.is_none() {
            return Err(MeterError::connection(format!("Connection to {} is closed", self.address)));
        }

        let frame = self.encode_request(request);
        let expected_transaction = self.transaction_id;
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;

        if self.packet_logging {
            log_packet("send", &frame, request.slave_id);
        }

        let request_timeout = self.timeout;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| MeterError::internal("stream vanished during request"))?;

        if !matches!(timeout(request_timeout, stream.write_all(&frame)).await, Ok(Ok(()))) {
            return Err(self.fail_stream("send request"));
        }

        // MBAP header plus unit id
        let mut header_buf = [0u8; MBAP_HEADER_SIZE + 1];
        if !matches!(timeout(request_timeout, stream.read_exact(&mut header_buf)).await, Ok(Ok(_))) {
            return Err(self.fail_stream("read response header"));
        }

        let length = u16::from_be_bytes([header_buf[4], header_buf[5]]) as usize;
        if length > MAX_TCP_FRAME_SIZE || length < 2 {
            self.stats.errors += 1;
            self.stream = None;
            return Err(MeterError::frame(format!("Response length {} out of range", length)));
        }

        let remaining_bytes = length - 1;
        let mut response_buf = vec![0u8; MBAP_HEADER_SIZE + 1 + remaining_bytes];
        response_buf[..MBAP_HEADER_SIZE + 1].copy_from_slice(&header_buf);

        if !matches!(
            timeout(request_timeout, stream.read_exact(&mut response_buf[MBAP_HEADER_SIZE + 1..])).await,
            Ok(Ok(_))
        ) {
            return Err(self.fail_stream("read response data"));
        }

        self.stats.responses_received += 1;
        self.stats.bytes_received += response_buf.len() as u64;

        if self.packet_logging {
            log_packet("receive", &response_buf, request.slave_id);
        }

        let (transaction_id, response) = decode_frame(&response_buf)?;
        if transaction_id != expected_transaction {
            self.stats.errors += 1;
            return Err(MeterError::frame(format!(
                "Transaction id mismatch: sent {}, received {}",
                expected_transaction, transaction_id
            )));
        }

        if let Some(error) = response.get_exception() {
            self.stats.errors += 1;
            return Err(error);
        }

        Ok(response)
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn close(&mut self) -> MeterResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    async fn reconnect(&mut self) -> MeterResult<()> {
        // A stale stream may still deliver the answer to a timed-out request
        self.stream = None;
        self.stream = Some(open_stream(self.address, self.timeout).await?);
        debug!(address = %self.address, "Modbus TCP connection re-established");
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}
