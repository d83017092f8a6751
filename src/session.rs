//! Meter session
//!
//! Owns the bus client, the slave address and the identity read at connect
//! time. Every register operation goes through the session, and all of them
//! fail with a connection error while the session is disconnected. Only an
//! explicit [`MeterSession::reconnect`] re-opens a link the transport gave up.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::client::{ModbusClient, ModbusTcpClient};
use crate::codec::{decode, decode_run, DecodedValue, FormatTag};
use crate::error::{MeterError, MeterResult};
use crate::logging::CallbackLogger;
use crate::protocol::SlaveId;
use crate::registers::{
    HistoricLog, LogStatusBlock, IDENTITY_MODEL_ADDRESS, IDENTITY_MODEL_WORDS, IDENTITY_NAME_ADDRESS,
    IDENTITY_SERIAL_ADDRESS, IDENTITY_TEXT_WORDS, STATUS_BLOCK_WORDS,
};
use crate::transport::TransportStats;
use crate::{DEFAULT_TIMEOUT_MS, MAX_REGISTERS_PER_REQUEST, MAX_WRITE_REGISTERS_PER_REQUEST};

/// Identity strings reported by the meter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MeterIdentity {
    pub name: String,
    pub serial: String,
    pub model: String,
}

impl MeterIdentity {
    /// Decode the identity from registers 0-15 and 26-29
    pub fn decode(name_serial: &[u16], model: &[u16]) -> Self {
        let text = |words: &[u16]| match decode(words, FormatTag::Ascii) {
            DecodedValue::Text(text) => text.trim_matches(|c: char| c == '\0' || c.is_whitespace()).to_string(),
            _ => String::new(),
        };
        let split = (IDENTITY_TEXT_WORDS as usize).min(name_serial.len());

        Self {
            name: text(&name_serial[..split]),
            serial: text(&name_serial[split..]),
            model: text(model),
        }
    }
}

/// One register of a polling read
#[derive(Debug, Clone, PartialEq)]
pub struct PolledRegister {
    /// 1-based register number
    pub register: u32,
    pub raw: u16,
    /// Decoded value at the head of each value, `None` for continuation words
    pub cell: Option<DecodedValue>,
}

/// A connection to one meter
pub struct MeterSession<C: ModbusClient = ModbusTcpClient> {
    client: Option<C>,
    slave_id: SlaveId,
    identity: Option<MeterIdentity>,
    timeout: Duration,
    packet_logging: bool,
    frame_logger: Option<CallbackLogger>,
    lock_held: bool,
    engaged_log: Option<HistoricLog>,
}

impl<C: ModbusClient> Default for MeterSession<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ModbusClient> MeterSession<C> {
    /// Create a disconnected session
    pub fn new() -> Self {
        Self {
            client: None,
            slave_id: 1,
            identity: None,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            packet_logging: false,
            frame_logger: None,
            lock_held: false,
            engaged_log: None,
        }
    }

    /// Request timeout used by `connect`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.packet_logging = enabled;
        self
    }

    /// Report every request and response of `connect`ed links through `logger`
    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.frame_logger = Some(logger);
        self
    }

    /// Bind an already-connected client and read the meter identity
    pub async fn attach(&mut self, client: C, slave_id: SlaveId) -> MeterResult<MeterIdentity> {
        if self.is_connected() {
            self.disconnect().await?;
        }

        self.client = Some(client);
        self.slave_id = slave_id;

        match self.read_identity().await {
            Ok(identity) => {
                info!(
                    slave_id,
                    name = %identity.name,
                    serial = %identity.serial,
                    model = %identity.model,
                    "Connected to meter"
                );
                self.identity = Some(identity.clone());
                Ok(identity)
            }
            Err(e) => {
                let _ = self.disconnect().await;
                Err(e)
            }
        }
    }

    /// Close the connection and forget all per-connection state
    pub async fn disconnect(&mut self) -> MeterResult<()> {
        self.identity = None;
        self.lock_held = false;
        self.engaged_log = None;

        if let Some(mut client) = self.client.take() {
            client.close().await?;
            debug!(slave_id = self.slave_id, "Disconnected from meter");
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.client.as_ref().map_or(false, |client| client.is_connected())
    }

    /// Re-open the link of an attached client after a transport failure
    ///
    /// Identity and lock bookkeeping are kept; the meter still holds
    /// whatever this session engaged before the link dropped.
    pub async fn reconnect(&mut self) -> MeterResult<()> {
        let slave_id = self.slave_id;
        let client = self.client.as_mut().ok_or_else(MeterError::not_connected)?;
        if client.is_connected() {
            return Ok(());
        }

        warn!(slave_id, "Link to meter lost, reconnecting");
        client.reconnect().await?;
        info!(slave_id, "Reconnected to meter");
        Ok(())
    }

    pub fn slave_id(&self) -> SlaveId {
        self.slave_id
    }

    /// Identity read at connect time
    pub fn identity(&self) -> Option<&MeterIdentity> {
        self.identity.as_ref()
    }

    pub fn stats(&self) -> Option<TransportStats> {
        self.client.as_ref().map(|client| client.get_stats())
    }

    /// The connected client, or a connection error
    fn client_mut(&mut self) -> MeterResult<&mut C> {
        match self.client.as_mut() {
            Some(client) if client.is_connected() => Ok(client),
            _ => Err(MeterError::not_connected()),
        }
    }

    /// Read `count` holding registers, split into protocol-sized requests
    pub async fn read_holding_registers(&mut self, address: u16, count: u16) -> MeterResult<Vec<u16>> {
        if count == 0 || address as u32 + count as u32 > 0x1_0000 {
            return Err(MeterError::invalid_address(address, count));
        }

        let slave_id = self.slave_id;
        let client = self.client_mut()?;
        let mut words = Vec::with_capacity(count as usize);
        let mut offset = 0u16;

        while offset < count {
            let chunk = (count - offset).min(MAX_REGISTERS_PER_REQUEST);
            let part = client.read_03(slave_id, address + offset, chunk).await?;
            words.extend_from_slice(&part);
            offset += chunk;
        }

        Ok(words)
    }

    pub async fn write_register(&mut self, address: u16, value: u16) -> MeterResult<()> {
        let slave_id = self.slave_id;
        self.client_mut()?.write_06(slave_id, address, value).await
    }

    /// Write a contiguous block, split into protocol-sized requests
    pub async fn write_registers(&mut self, address: u16, values: &[u16]) -> MeterResult<()> {
        if values.is_empty() || address as usize + values.len() > 0x1_0000 {
            return Err(MeterError::invalid_address(address, values.len() as u16));
        }

        let slave_id = self.slave_id;
        let client = self.client_mut()?;
        for (i, chunk) in values.chunks(MAX_WRITE_REGISTERS_PER_REQUEST as usize).enumerate() {
            let chunk_address = address + (i * MAX_WRITE_REGISTERS_PER_REQUEST as usize) as u16;
            client.write_10(slave_id, chunk_address, chunk).await?;
        }
        Ok(())
    }

    /// Read and decode a run of registers starting at a 1-based register number
    pub async fn poll_registers(
        &mut self,
        start_register: u32,
        count: u16,
        format: FormatTag,
    ) -> MeterResult<Vec<PolledRegister>> {
        if start_register == 0 || start_register > 0x1_0000 {
            return Err(MeterError::invalid_data(format!(
                "Register numbers start at 1, got {}",
                start_register
            )));
        }

        let words = self.read_holding_registers((start_register - 1) as u16, count).await?;
        let cells = decode_run(&words, format);

        Ok(words
            .iter()
            .zip(cells)
            .enumerate()
            .map(|(i, (&raw, cell))| PolledRegister {
                register: start_register + i as u32,
                raw,
                cell,
            })
            .collect())
    }

    /// Read the identity registers
    pub async fn read_identity(&mut self) -> MeterResult<MeterIdentity> {
        let name_serial = self
            .read_holding_registers(IDENTITY_NAME_ADDRESS, IDENTITY_SERIAL_ADDRESS + IDENTITY_TEXT_WORDS)
            .await?;
        let model = self
            .read_holding_registers(IDENTITY_MODEL_ADDRESS, IDENTITY_MODEL_WORDS)
            .await?;
        Ok(MeterIdentity::decode(&name_serial, &model))
    }

    /// Read a historic log's status block without engaging the log
    pub async fn read_log_status(&mut self, log: HistoricLog) -> MeterResult<LogStatusBlock> {
        let words = self
            .read_holding_registers(log.descriptor().status_block_address, STATUS_BLOCK_WORDS)
            .await?;
        LogStatusBlock::decode(&words)
    }

    pub fn lock_held(&self) -> bool {
        self.lock_held
    }

    pub(crate) fn set_lock_held(&mut self, held: bool) {
        self.lock_held = held;
    }

    pub fn engaged_log(&self) -> Option<HistoricLog> {
        self.engaged_log
    }

    pub(crate) fn set_engaged_log(&mut self, log: Option<HistoricLog>) {
        self.engaged_log = log;
    }
}

impl MeterSession<ModbusTcpClient> {
    /// Connect over Modbus TCP and read the meter identity
    pub async fn connect(&mut self, slave_id: SlaveId, host: &str, port: u16) -> MeterResult<MeterIdentity> {
        let address = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| MeterError::connection(format!("Cannot resolve {}:{}: {}", host, port, e)))?
            .next()
            .ok_or_else(|| MeterError::connection(format!("No address found for {}:{}", host, port)))?;

        let mut client = ModbusTcpClient::with_logging(address, self.timeout, self.frame_logger.clone()).await?;
        client.set_packet_logging(self.packet_logging);

        self.attach(client, slave_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::text_to_words;
    use crate::simulator::SimulatedMeter;

    #[test]
    fn test_identity_decode() {
        let mut name_serial = text_to_words("Shark 270", 8);
        name_serial.extend(text_to_words("0012345678  ", 8));
        let identity = MeterIdentity::decode(&name_serial, &text_to_words("S270", 4));

        assert_eq!(identity.name, "Shark 270");
        assert_eq!(identity.serial, "0012345678");
        assert_eq!(identity.model, "S270");
    }

    #[tokio::test]
    async fn test_disconnected_session_fails() {
        let mut session: MeterSession<SimulatedMeter> = MeterSession::new();
        assert!(!session.is_connected());

        let err = session.read_holding_registers(0, 1).await.unwrap_err();
        assert!(matches!(err, MeterError::Connection { .. }));
        assert!(session.write_register(0xC34B, 0).await.is_err());
    }

    #[tokio::test]
    async fn test_attach_reads_identity() {
        let meter = SimulatedMeter::new();
        let mut session = MeterSession::new();
        let identity = session.attach(meter, 1).await.unwrap();

        assert_eq!(identity.name, "Shark 270");
        assert_eq!(session.identity(), Some(&identity));

        session.disconnect().await.unwrap();
        assert!(session.identity().is_none());
        assert!(session.read_holding_registers(0, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_chunked_read() {
        let meter = SimulatedMeter::new();
        let handle = meter.clone();
        let mut session = MeterSession::new();
        session.attach(meter, 1).await.unwrap();

        let before = handle.request_count();
        let words = session.read_holding_registers(0x2000, 300).await.unwrap();
        assert_eq!(words.len(), 300);
        assert_eq!(handle.request_count() - before, 3);
    }

    #[tokio::test]
    async fn test_poll_registers() {
        let meter = SimulatedMeter::new();
        let mut session = MeterSession::new();
        session.attach(meter, 1).await.unwrap();

        let polled = session.poll_registers(1, 8, FormatTag::Ascii).await.unwrap();
        assert_eq!(polled.len(), 8);
        assert_eq!(polled[0].register, 1);
        assert_eq!(polled[0].cell, Some(DecodedValue::Text("Shark 270\0\0\0\0\0\0\0".into())));
        assert!(polled[1..].iter().all(|p| p.cell.is_none()));

        assert!(session.poll_registers(0, 1, FormatTag::Uint16).await.is_err());
    }

    #[tokio::test]
    async fn test_reconnect_after_dropped_link() {
        let meter = SimulatedMeter::new();
        let handle = meter.clone();
        let mut session = MeterSession::new();
        assert!(matches!(session.reconnect().await, Err(MeterError::Connection { .. })));

        session.attach(meter, 1).await.unwrap();
        session.set_lock_held(true);
        handle.drop_connection();

        assert!(!session.is_connected());
        assert!(matches!(
            session.read_holding_registers(0, 1).await,
            Err(MeterError::Connection { .. })
        ));

        session.reconnect().await.unwrap();
        assert!(session.is_connected());
        assert!(session.lock_held());
        assert_eq!(session.identity().map(|identity| identity.model.as_str()), Some("S270"));
        session.read_holding_registers(0, 1).await.unwrap();

        // Already connected: nothing to do
        session.reconnect().await.unwrap();
        assert_eq!(handle.reconnect_count(), 1);
    }
}
