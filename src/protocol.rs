/// Modbus protocol definitions and data structures
///
/// The meter is only ever addressed through holding registers, so this module
/// models the three function codes the crate issues: read holding registers,
/// write single register, and write multiple registers.

use serde::{Deserialize, Serialize};
use std::fmt;
use crate::error::{MeterError, MeterResult};

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus slave/unit identifier (1-247)
pub type SlaveId = u8;

/// Modbus function codes used against the meter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> MeterResult<Self> {
        match value {
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            _ => Err(MeterError::invalid_function(value)),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Check if this is a read function
    pub fn is_read_function(self) -> bool {
        matches!(self, ModbusFunction::ReadHoldingRegisters)
    }

    /// Human-readable name
    pub fn name(self) -> &'static str {
        match self {
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
        }
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), *self as u8)
    }
}

/// Modbus request structure
///
/// `data` holds the register values of a write, already serialized big-endian.
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusRequest {
    pub slave_id: SlaveId,
    pub function: ModbusFunction,
    pub address: ModbusAddress,
    pub quantity: u16,
    pub data: Vec<u8>,
}

impl ModbusRequest {
    /// Create a read holding registers request
    pub fn new_read(slave_id: SlaveId, address: ModbusAddress, quantity: u16) -> Self {
        Self {
            slave_id,
            function: ModbusFunction::ReadHoldingRegisters,
            address,
            quantity,
            data: Vec::new(),
        }
    }

    /// Create a write single register request
    pub fn new_write_single(slave_id: SlaveId, address: ModbusAddress, value: u16) -> Self {
        Self {
            slave_id,
            function: ModbusFunction::WriteSingleRegister,
            address,
            quantity: 1,
            data: value.to_be_bytes().to_vec(),
        }
    }

    /// Create a write multiple registers request
    pub fn new_write_multiple(slave_id: SlaveId, address: ModbusAddress, values: &[u16]) -> Self {
        Self {
            slave_id,
            function: ModbusFunction::WriteMultipleRegisters,
            address,
            quantity: values.len() as u16,
            data: data_utils::registers_to_bytes(values),
        }
    }

    /// Validate the request
    pub fn validate(&self) -> MeterResult<()> {
        if self.slave_id == 0 || self.slave_id > 247 {
            return Err(MeterError::invalid_data(format!("Invalid slave ID: {}", self.slave_id)));
        }

        match self.function {
            ModbusFunction::ReadHoldingRegisters => {
                if self.quantity == 0 || self.quantity > crate::MAX_REGISTERS_PER_REQUEST {
                    return Err(MeterError::invalid_data(format!(
                        "Invalid register count: {}",
                        self.quantity
                    )));
                }
            }
            ModbusFunction::WriteSingleRegister => {
                if self.data.len() != 2 {
                    return Err(MeterError::invalid_data("Single register write needs exactly 2 bytes"));
                }
            }
            ModbusFunction::WriteMultipleRegisters => {
                if self.quantity == 0 || self.quantity > crate::MAX_WRITE_REGISTERS_PER_REQUEST {
                    return Err(MeterError::invalid_data(format!(
                        "Invalid register count: {}",
                        self.quantity
                    )));
                }
                if self.data.len() != self.quantity as usize * 2 {
                    return Err(MeterError::invalid_data("Register data length does not match quantity"));
                }
            }
        }

        if (self.address as u32 + self.quantity as u32) > 0x1_0000 {
            return Err(MeterError::invalid_address(self.address, self.quantity));
        }

        Ok(())
    }
}

/// Modbus response structure
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusResponse {
    pub slave_id: SlaveId,
    pub function: ModbusFunction,
    pub data: Vec<u8>,
    pub exception: Option<u8>,
}

impl ModbusResponse {
    /// Create a successful response
    pub fn new_success(slave_id: SlaveId, function: ModbusFunction, data: Vec<u8>) -> Self {
        Self {
            slave_id,
            function,
            data,
            exception: None,
        }
    }

    /// Create an exception response
    pub fn new_exception(slave_id: SlaveId, function: ModbusFunction, exception_code: u8) -> Self {
        Self {
            slave_id,
            function,
            data: Vec::new(),
            exception: Some(exception_code),
        }
    }

    /// Check if this is an exception response
    pub fn is_exception(&self) -> bool {
        self.exception.is_some()
    }

    /// Get exception error if present
    pub fn get_exception(&self) -> Option<MeterError> {
        self.exception
            .map(|code| MeterError::exception(self.function.to_u8(), code))
    }

    /// Parse response data as registers (byte count followed by big-endian words)
    pub fn parse_registers(&self) -> MeterResult<Vec<u16>> {
        if let Some(error) = self.get_exception() {
            return Err(error);
        }

        let (&byte_count, payload) = self
            .data
            .split_first()
            .ok_or_else(|| MeterError::frame("Empty response data"))?;
        let byte_count = byte_count as usize;

        if payload.len() < byte_count {
            return Err(MeterError::frame("Incomplete register data"));
        }

        if byte_count % 2 != 0 {
            return Err(MeterError::frame("Invalid register data length"));
        }

        data_utils::bytes_to_registers(&payload[..byte_count])
    }
}

/// Data conversion utilities
pub mod data_utils {
    use super::*;

    /// Convert register values to bytes (big-endian)
    pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(registers.len() * 2);
        for &register in registers {
            bytes.extend_from_slice(&register.to_be_bytes());
        }
        bytes
    }

    /// Convert bytes to register values (big-endian)
    pub fn bytes_to_registers(bytes: &[u8]) -> MeterResult<Vec<u16>> {
        if bytes.len() % 2 != 0 {
            return Err(MeterError::invalid_data("Byte array length must be even"));
        }

        Ok(bytes
            .chunks_exact(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_conversion() {
        assert_eq!(ModbusFunction::from_u8(0x03).unwrap(), ModbusFunction::ReadHoldingRegisters);
        assert_eq!(ModbusFunction::WriteMultipleRegisters.to_u8(), 0x10);

        // Coils are never used against the meter
        assert!(ModbusFunction::from_u8(0x01).is_err());
        assert!(ModbusFunction::from_u8(0xFF).is_err());
    }

    #[test]
    fn test_request_validation() {
        let valid_request = ModbusRequest::new_read(1, 0xC353, 123);
        assert!(valid_request.validate().is_ok());

        let invalid_slave = ModbusRequest::new_read(0, 100, 10);
        assert!(invalid_slave.validate().is_err());

        let too_many_registers = ModbusRequest::new_read(1, 100, 126);
        assert!(too_many_registers.validate().is_err());

        let past_end = ModbusRequest::new_read(1, 0xFFFF, 2);
        assert!(past_end.validate().is_err());

        let window_config = ModbusRequest::new_write_multiple(1, 0xC350, &[0x1401, 0, 0]);
        assert_eq!(window_config.quantity, 3);
        assert!(window_config.validate().is_ok());
    }

    #[test]
    fn test_response_parsing() {
        let register_data = vec![4, 0x12, 0x34, 0x56, 0x78];
        let response = ModbusResponse::new_success(1, ModbusFunction::ReadHoldingRegisters, register_data);
        assert_eq!(response.parse_registers().unwrap(), vec![0x1234, 0x5678]);

        let truncated = ModbusResponse::new_success(1, ModbusFunction::ReadHoldingRegisters, vec![4, 0x12]);
        assert!(truncated.parse_registers().is_err());

        let exception = ModbusResponse::new_exception(1, ModbusFunction::ReadHoldingRegisters, 0x02);
        match exception.parse_registers() {
            Err(MeterError::Exception { function, code, .. }) => {
                assert_eq!(function, 0x03);
                assert_eq!(code, 0x02);
            }
            other => panic!("expected exception, got {:?}", other),
        }
    }
}
