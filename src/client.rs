/// High-level Modbus client implementations
///
/// The client layer turns register-level calls into Modbus PDUs and hands
/// them to a transport. The meter session only ever talks to a
/// `ModbusClient`, so an in-process simulator can stand in for a real TCP
/// connection.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{MeterError, MeterResult};
use crate::logging::CallbackLogger;
use crate::protocol::{ModbusRequest, ModbusResponse, SlaveId};
use crate::transport::{ModbusTransport, TcpTransport, TransportStats};

/// Trait defining the holding-register operations used against the meter
#[async_trait::async_trait]
pub trait ModbusClient: Send + Sync {
    /// Read holding registers (function code 0x03)
    async fn read_03(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> MeterResult<Vec<u16>>;

    /// Write single register (function code 0x06)
    async fn write_06(&mut self, slave_id: SlaveId, address: u16, value: u16) -> MeterResult<()>;

    /// Write multiple registers (function code 0x10)
    async fn write_10(&mut self, slave_id: SlaveId, address: u16, values: &[u16]) -> MeterResult<()>;

    /// Check if client is connected
    fn is_connected(&self) -> bool;

    /// Close the client connection
    async fn close(&mut self) -> MeterResult<()>;

    /// Re-open the link after a transport failure
    async fn reconnect(&mut self) -> MeterResult<()>;

    /// Get transport statistics
    fn get_stats(&self) -> TransportStats;
}

/// Generic Modbus client that works with any transport
pub struct GenericModbusClient<T: ModbusTransport> {
    transport: T,
    logger: Option<CallbackLogger>,
}

impl<T: ModbusTransport> GenericModbusClient<T> {
    /// Create a new generic client with the specified transport
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            logger: None,
        }
    }

    /// Create a new generic client with logging
    pub fn with_logger(transport: T, logger: CallbackLogger) -> Self {
        Self {
            transport,
            logger: Some(logger),
        }
    }

    /// Get a mutable reference to the underlying transport
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Execute a raw request
    pub async fn execute_request(&mut self, request: ModbusRequest) -> MeterResult<ModbusResponse> {
        if let Some(ref logger) = self.logger {
            logger.log_request(&request);
        }

        let response = self.transport.request(&request).await?;

        if let Some(ref logger) = self.logger {
            logger.log_response(&response);
        }

        Ok(response)
    }
}

#[async_trait::async_trait]
impl<T: ModbusTransport + Send + Sync> ModbusClient for GenericModbusClient<T> {
    async fn read_03(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> MeterResult<Vec<u16>> {
        if quantity == 0 || quantity > crate::MAX_REGISTERS_PER_REQUEST {
            return Err(MeterError::invalid_address(address, quantity));
        }

        let response = self
            .execute_request(ModbusRequest::new_read(slave_id, address, quantity))
            .await?;
        let registers = response.parse_registers()?;

        if registers.len() != quantity as usize {
            return Err(MeterError::frame(format!(
                "Expected {} registers, received {}",
                quantity,
                registers.len()
            )));
        }

        Ok(registers)
    }

    async fn write_06(&mut self, slave_id: SlaveId, address: u16, value: u16) -> MeterResult<()> {
        self.execute_request(ModbusRequest::new_write_single(slave_id, address, value))
            .await?;
        Ok(())
    }

    async fn write_10(&mut self, slave_id: SlaveId, address: u16, values: &[u16]) -> MeterResult<()> {
        if values.is_empty() || values.len() > crate::MAX_WRITE_REGISTERS_PER_REQUEST as usize {
            return Err(MeterError::invalid_address(address, values.len() as u16));
        }

        self.execute_request(ModbusRequest::new_write_multiple(slave_id, address, values))
            .await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    async fn close(&mut self) -> MeterResult<()> {
        self.transport.close().await
    }

    async fn reconnect(&mut self) -> MeterResult<()> {
        self.transport.reconnect().await
    }

    fn get_stats(&self) -> TransportStats {
        self.transport.get_stats()
    }
}

/// Modbus TCP client implementation using the generic client
pub struct ModbusTcpClient {
    inner: GenericModbusClient<TcpTransport>,
}

impl ModbusTcpClient {
    /// Create a new TCP client with an optional request/response logger
    pub async fn with_logging(addr: SocketAddr, timeout: Duration, logger: Option<CallbackLogger>) -> MeterResult<Self> {
        let transport = TcpTransport::new(addr, timeout).await?;
        let inner = match logger {
            Some(logger) => GenericModbusClient::with_logger(transport, logger),
            None => GenericModbusClient::new(transport),
        };
        Ok(Self { inner })
    }

    /// Enable or disable packet logging on existing client
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.inner.transport_mut().set_packet_logging(enabled);
    }
}

#[async_trait::async_trait]
impl ModbusClient for ModbusTcpClient {
    async fn read_03(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> MeterResult<Vec<u16>> {
        self.inner.read_03(slave_id, address, quantity).await
    }

    async fn write_06(&mut self, slave_id: SlaveId, address: u16, value: u16) -> MeterResult<()> {
        self.inner.write_06(slave_id, address, value).await
    }

    async fn write_10(&mut self, slave_id: SlaveId, address: u16, values: &[u16]) -> MeterResult<()> {
        self.inner.write_10(slave_id, address, values).await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn close(&mut self) -> MeterResult<()> {
        self.inner.close().await
    }

    async fn reconnect(&mut self) -> MeterResult<()> {
        self.inner.reconnect().await
    }

    fn get_stats(&self) -> TransportStats {
        self.inner.get_stats()
    }
}
