/// In-process meter simulator
///
/// `SimulatedMeter` implements [`ModbusClient`] directly, so a
/// `MeterSession<SimulatedMeter>` exercises the full retrieval handshake
/// without a network. It models the busy lock, slot status blocks, setup
/// blocks, engagement and the windowed cursor, and can inject the faults a
/// shared meter shows in the field. Every write is recorded.
///
/// Clones share state, so a test can keep a handle while the session owns
/// the client.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{Datelike, NaiveDate, Timelike};

use crate::catalog::{InMemoryCatalog, RegisterInfo};
use crate::client::ModbusClient;
use crate::codec::{float_to_words, text_to_words, timestamp_to_words, FormatTag};
use crate::error::{MeterError, MeterResult};
use crate::protocol::SlaveId;
use crate::registers::{
    HistoricLog, BUSY_LOCK_ADDRESS, ENGAGE_ADDRESS, ENGAGE_ENABLE_BIT, IDENTITY_MODEL_ADDRESS,
    IDENTITY_NAME_ADDRESS, IDENTITY_SERIAL_ADDRESS, IDENTITY_TEXT_WORDS, IDENTITY_MODEL_WORDS,
    LOCK_ENGAGED, LOCK_REQUEST, NETWORK_CHANNEL, STATUS_BLOCK_WORDS, WINDOW_CONFIG_ADDRESS,
    WINDOW_DATA_ADDRESS, WINDOW_OFFSET_ADDRESS, WINDOW_READY_MASK,
};
use crate::transport::TransportStats;

/// Contents of one simulated historic log
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedLog {
    pub capacity: u32,
    pub record_size_bytes: u16,
    /// Availability reported while the log is not engaged by us
    pub availability: u16,
    /// Register numbers listed in the setup block
    pub field_registers: Vec<u16>,
    /// Raw record words, one entry per record
    pub records: Vec<Vec<u16>>,
}

impl SimulatedLog {
    pub fn new(record_size_bytes: u16, field_registers: Vec<u16>) -> Self {
        Self {
            capacity: 10_000,
            record_size_bytes,
            availability: 0,
            field_registers,
            records: Vec::new(),
        }
    }

    pub fn with_records(mut self, records: Vec<Vec<u16>>) -> Self {
        self.records = records;
        self
    }

    pub fn held_by(mut self, channel: u16) -> Self {
        self.availability = channel;
        self
    }

    /// A voltage / power-factor log with `count` records fifteen minutes apart
    pub fn demo(count: usize) -> Self {
        let Some(base) = NaiveDate::from_ymd_opt(2023, 2, 22).and_then(|date| date.and_hms_opt(14, 0, 0)) else {
            return Self::new(12, vec![DEMO_VOLTS_REGISTER, DEMO_POWER_FACTOR_REGISTER]);
        };

        let records = (0..count)
            .map(|i| {
                let at = base + chrono::Duration::minutes(15 * i as i64);
                let mut record = timestamp_to_words(
                    at.year() as u16,
                    at.month() as u8,
                    at.day() as u8,
                    at.hour() as u8,
                    at.minute() as u8,
                    at.second() as u8,
                )
                .to_vec();
                record.extend(float_to_words(120.0 + (i % 10) as f32 * 0.5));
                record.push(9900 + (i % 100) as u16);
                record
            })
            .collect();

        Self::new(12, vec![DEMO_VOLTS_REGISTER, DEMO_POWER_FACTOR_REGISTER]).with_records(records)
    }

    fn status_words(&self, availability: u16) -> Vec<u16> {
        let used = self.records.len() as u32;
        let timestamp = |record: Option<&Vec<u16>>| {
            record
                .filter(|words| words.len() >= 3)
                .map(|words| [words[0], words[1], words[2]])
                .unwrap_or([0; 3])
        };

        let mut words = vec![
            (self.capacity >> 16) as u16,
            self.capacity as u16,
            (used >> 16) as u16,
            used as u16,
            self.record_size_bytes,
            availability,
        ];
        words.extend(timestamp(self.records.first()));
        words.extend(timestamp(self.records.last()));
        words.resize(STATUS_BLOCK_WORDS as usize, 0);
        words
    }
}

pub const DEMO_VOLTS_REGISTER: u16 = 1000;
pub const DEMO_POWER_FACTOR_REGISTER: u16 = 1022;

/// Catalog matching [`SimulatedLog::demo`]
pub fn demo_catalog() -> InMemoryCatalog {
    let mut catalog = InMemoryCatalog::new();
    for (register, name, size, format) in [
        (DEMO_VOLTS_REGISTER, "Volts A-N", 2, FormatTag::Float),
        (DEMO_POWER_FACTOR_REGISTER, "Power Factor (%)", 1, FormatTag::Uint16),
    ] {
        // Sizes are non-zero, so inserting cannot fail
        let _ = catalog.insert(
            register,
            RegisterInfo {
                name: name.to_string(),
                size,
                format,
            },
        );
    }
    catalog
}

/// Faults the simulator can inject
#[derive(Debug, Clone, Default)]
pub struct SimulatorFaults {
    /// Value another client writes into the busy register right after ours
    pub lock_race: Option<u16>,
    /// Ignore engage requests
    pub refuse_engage: bool,
    /// Offset reads that report "preparing" after each window is armed
    pub ready_delay_polls: u32,
    /// Window data reads, after the first, that leave the cursor in place
    pub stalled_reads: u32,
    /// Fail window data reads once this many have succeeded
    pub fail_data_reads_after: Option<u32>,
    /// Time out and drop the link on the window data read after this many succeeded
    pub drop_link_after_data_reads: Option<u32>,
    /// Answer the read confirming a lock request with an exception
    pub lock_confirm_error: bool,
}

#[derive(Debug)]
struct MeterState {
    slave_id: SlaveId,
    connected: bool,
    registers: HashMap<u16, u16>,
    logs: HashMap<HistoricLog, SimulatedLog>,
    engaged: Option<HistoricLog>,
    records_per_window: u16,
    cursor: u32,
    preparing_left: u32,
    stalled_left: u32,
    data_reads: u32,
    faults: SimulatorFaults,
    lock_unconfirmed: bool,
    reconnects: u32,
    writes: Vec<(u16, u16)>,
    stats: TransportStats,
}

impl MeterState {
    fn read_word(&mut self, address: u16) -> u16 {
        for log in HistoricLog::ALL {
            let slot = log.descriptor();
            let Some(sim) = self.logs.get(&log) else { continue };

            let status_end = slot.status_block_address + STATUS_BLOCK_WORDS;
            if (slot.status_block_address..status_end).contains(&address) {
                let availability = if self.engaged == Some(log) { NETWORK_CHANNEL } else { sim.availability };
                return sim.status_words(availability)[(address - slot.status_block_address) as usize];
            }

            if address == slot.setup_address {
                return sim.field_registers.len() as u16 & 0x00FF;
            }
            let fields_start = slot.setup_address + 2;
            if (fields_start..fields_start + sim.field_registers.len() as u16).contains(&address) {
                return sim.field_registers[(address - fields_start) as usize];
            }
        }

        match address {
            WINDOW_OFFSET_ADDRESS => {
                let high = ((self.cursor >> 16) & 0xFF) as u16;
                if self.preparing_left > 0 {
                    self.preparing_left -= 1;
                    high | WINDOW_READY_MASK
                } else {
                    high
                }
            }
            a if a == WINDOW_OFFSET_ADDRESS + 1 => self.cursor as u16,
            a if (WINDOW_DATA_ADDRESS..WINDOW_DATA_ADDRESS + crate::MAX_REGISTERS_PER_REQUEST).contains(&a) => {
                self.window_word((a - WINDOW_DATA_ADDRESS) as usize)
            }
            _ => self.registers.get(&address).copied().unwrap_or(0),
        }
    }

    fn window_word(&self, offset: usize) -> u16 {
        let Some(sim) = self.engaged.and_then(|log| self.logs.get(&log)) else {
            return 0;
        };
        let stride = (sim.record_size_bytes / 2).max(1) as usize;
        let record = self.cursor as usize + offset / stride;
        sim.records
            .get(record)
            .and_then(|words| words.get(offset % stride))
            .copied()
            .unwrap_or(0)
    }

    fn after_data_read(&mut self) {
        let stall = self.data_reads > 0 && self.stalled_left > 0;
        self.data_reads += 1;
        if stall {
            self.stalled_left -= 1;
        } else {
            self.cursor += self.records_per_window as u32;
        }
        self.preparing_left = self.faults.ready_delay_polls;
    }

    fn write_word(&mut self, address: u16, value: u16) {
        self.writes.push((address, value));

        match address {
            BUSY_LOCK_ADDRESS if value == LOCK_REQUEST => {
                self.lock_unconfirmed = true;
                let granted = self.faults.lock_race.unwrap_or(LOCK_ENGAGED);
                self.registers.insert(address, granted);
            }
            ENGAGE_ADDRESS => {
                self.registers.insert(address, value);
                if value & ENGAGE_ENABLE_BIT == 0 {
                    self.engaged = None;
                    return;
                }
                let log_number = (value >> 8) as u8;
                let target = HistoricLog::ALL
                    .into_iter()
                    .find(|log| log.descriptor().log_number == log_number);
                if let Some(log) = target {
                    let available = self
                        .logs
                        .get(&log)
                        .map_or(false, |sim| sim.availability == 0 || sim.availability == NETWORK_CHANNEL);
                    if available && !self.faults.refuse_engage {
                        self.engaged = Some(log);
                        self.cursor = 0;
                    }
                }
            }
            _ => {
                self.registers.insert(address, value);
            }
        }
    }
}

/// Simulated meter reachable through [`ModbusClient`]
#[derive(Debug, Clone)]
pub struct SimulatedMeter {
    state: Arc<RwLock<MeterState>>,
}

impl Default for SimulatedMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedMeter {
    /// A connected meter at slave 1 with identity registers filled in
    pub fn new() -> Self {
        let meter = Self {
            state: Arc::new(RwLock::new(MeterState {
                slave_id: 1,
                connected: true,
                registers: HashMap::new(),
                logs: HashMap::new(),
                engaged: None,
                records_per_window: 0,
                cursor: 0,
                preparing_left: 0,
                stalled_left: 0,
                data_reads: 0,
                faults: SimulatorFaults::default(),
                lock_unconfirmed: false,
                reconnects: 0,
                writes: Vec::new(),
                stats: TransportStats::default(),
            })),
        };
        meter.set_identity("Shark 270", "0012345678", "S270");
        meter
    }

    /// A meter with [`SimulatedLog::demo`] loaded into Historic 1
    pub fn demo(records: usize) -> Self {
        let meter = Self::new();
        meter.set_log(HistoricLog::Historic1, SimulatedLog::demo(records));
        meter
    }

    fn state(&self) -> MeterResult<RwLockWriteGuard<'_, MeterState>> {
        self.state
            .write()
            .map_err(|_| MeterError::internal("Simulator state poisoned"))
    }

    fn snapshot(&self) -> MeterResult<RwLockReadGuard<'_, MeterState>> {
        self.state
            .read()
            .map_err(|_| MeterError::internal("Simulator state poisoned"))
    }

    pub fn set_identity(&self, name: &str, serial: &str, model: &str) {
        self.set_registers(IDENTITY_NAME_ADDRESS, &text_to_words(name, IDENTITY_TEXT_WORDS as usize));
        self.set_registers(IDENTITY_SERIAL_ADDRESS, &text_to_words(serial, IDENTITY_TEXT_WORDS as usize));
        self.set_registers(IDENTITY_MODEL_ADDRESS, &text_to_words(model, IDENTITY_MODEL_WORDS as usize));
    }

    pub fn set_log(&self, log: HistoricLog, sim: SimulatedLog) {
        if let Ok(mut state) = self.state() {
            state.logs.insert(log, sim);
        }
    }

    pub fn set_faults(&self, faults: SimulatorFaults) {
        if let Ok(mut state) = self.state() {
            state.stalled_left = faults.stalled_reads;
            state.faults = faults;
        }
    }

    pub fn set_slave_id(&self, slave_id: SlaveId) {
        if let Ok(mut state) = self.state() {
            state.slave_id = slave_id;
        }
    }

    /// Set a plain register without recording a write
    pub fn set_register(&self, address: u16, value: u16) {
        if let Ok(mut state) = self.state() {
            state.registers.insert(address, value);
        }
    }

    pub fn set_registers(&self, address: u16, values: &[u16]) {
        if let Ok(mut state) = self.state() {
            for (i, &value) in values.iter().enumerate() {
                state.registers.insert(address.wrapping_add(i as u16), value);
            }
        }
    }

    /// Plain register value (0 when never written)
    pub fn register(&self, address: u16) -> u16 {
        self.snapshot()
            .map(|state| state.registers.get(&address).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Every write in order as `(address, value)`
    pub fn writes(&self) -> Vec<(u16, u16)> {
        self.snapshot().map(|state| state.writes.clone()).unwrap_or_default()
    }

    /// Values written to one address, in order
    pub fn writes_to(&self, address: u16) -> Vec<u16> {
        self.writes()
            .into_iter()
            .filter(|&(a, _)| a == address)
            .map(|(_, value)| value)
            .collect()
    }

    /// Writes to the engagement register with the enable bit cleared
    pub fn disengage_count(&self) -> usize {
        self.writes_to(ENGAGE_ADDRESS)
            .into_iter()
            .filter(|value| value & ENGAGE_ENABLE_BIT == 0)
            .count()
    }

    pub fn engaged_log(&self) -> Option<HistoricLog> {
        self.snapshot().ok().and_then(|state| state.engaged)
    }

    pub fn request_count(&self) -> u64 {
        self.snapshot().map(|state| state.stats.requests_sent).unwrap_or(0)
    }

    /// Number of window data reads served
    pub fn data_reads(&self) -> u32 {
        self.snapshot().map(|state| state.data_reads).unwrap_or(0)
    }

    /// Successful [`ModbusClient::reconnect`] calls
    pub fn reconnect_count(&self) -> u32 {
        self.snapshot().map(|state| state.reconnects).unwrap_or(0)
    }

    /// Drop the simulated link; later requests fail with a connection error
    pub fn drop_connection(&self) {
        if let Ok(mut state) = self.state() {
            state.connected = false;
        }
    }

    fn begin_request(&self, slave_id: SlaveId) -> MeterResult<RwLockWriteGuard<'_, MeterState>> {
        let mut state = self.state()?;
        if !state.connected {
            return Err(MeterError::not_connected());
        }
        state.stats.requests_sent += 1;
        if slave_id != state.slave_id {
            state.stats.timeouts += 1;
            return Err(MeterError::timeout(format!("no answer from slave {}", slave_id), 0));
        }
        state.stats.responses_received += 1;
        Ok(state)
    }
}

#[async_trait::async_trait]
impl ModbusClient for SimulatedMeter {
    async fn read_03(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> MeterResult<Vec<u16>> {
        if quantity == 0 || quantity > crate::MAX_REGISTERS_PER_REQUEST {
            return Err(MeterError::invalid_address(address, quantity));
        }

        let mut state = self.begin_request(slave_id)?;

        if address == BUSY_LOCK_ADDRESS {
            let unconfirmed = std::mem::take(&mut state.lock_unconfirmed);
            if unconfirmed && state.faults.lock_confirm_error {
                return Err(MeterError::exception(0x03, 0x06));
            }
        }

        let is_data_read = address == WINDOW_DATA_ADDRESS;
        if is_data_read {
            if let Some(limit) = state.faults.fail_data_reads_after {
                if state.data_reads >= limit {
                    return Err(MeterError::exception(0x03, 0x04));
                }
            }
            if state.faults.drop_link_after_data_reads.map_or(false, |limit| state.data_reads >= limit) {
                state.faults.drop_link_after_data_reads = None;
                state.connected = false;
                state.stats.timeouts += 1;
                return Err(MeterError::timeout("window data read", 0));
            }
        }

        let words = (0..quantity)
            .map(|i| state.read_word(address.wrapping_add(i)))
            .collect();

        if is_data_read {
            state.after_data_read();
        }
        Ok(words)
    }

    async fn write_06(&mut self, slave_id: SlaveId, address: u16, value: u16) -> MeterResult<()> {
        let mut state = self.begin_request(slave_id)?;
        state.write_word(address, value);
        Ok(())
    }

    async fn write_10(&mut self, slave_id: SlaveId, address: u16, values: &[u16]) -> MeterResult<()> {
        if values.is_empty() || values.len() > crate::MAX_WRITE_REGISTERS_PER_REQUEST as usize {
            return Err(MeterError::invalid_address(address, values.len() as u16));
        }

        let mut state = self.begin_request(slave_id)?;
        for (i, &value) in values.iter().enumerate() {
            state.write_word(address.wrapping_add(i as u16), value);
        }

        if address == WINDOW_CONFIG_ADDRESS {
            state.records_per_window = values[0] >> 8;
            state.cursor = 0;
            state.preparing_left = state.faults.ready_delay_polls;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.snapshot().map(|state| state.connected).unwrap_or(false)
    }

    async fn close(&mut self) -> MeterResult<()> {
        self.state()?.connected = false;
        Ok(())
    }

    async fn reconnect(&mut self) -> MeterResult<()> {
        let mut state = self.state()?;
        state.connected = true;
        state.reconnects += 1;
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.snapshot().map(|state| state.stats.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, DecodedValue};
    use crate::registers::WindowStatus;

    #[tokio::test]
    async fn test_lock_handshake() {
        let mut meter = SimulatedMeter::new();
        meter.write_06(1, BUSY_LOCK_ADDRESS, LOCK_REQUEST).await.unwrap();
        assert_eq!(meter.read_03(1, BUSY_LOCK_ADDRESS, 1).await.unwrap(), vec![LOCK_ENGAGED]);

        let racing = SimulatedMeter::new();
        racing.set_faults(SimulatorFaults {
            lock_race: Some(0x0C00),
            ..Default::default()
        });
        let mut client = racing.clone();
        client.write_06(1, BUSY_LOCK_ADDRESS, LOCK_REQUEST).await.unwrap();
        assert_eq!(racing.register(BUSY_LOCK_ADDRESS), 0x0C00);
    }

    #[tokio::test]
    async fn test_status_block_and_engage() {
        let mut meter = SimulatedMeter::demo(3);
        let slot = HistoricLog::Historic1.descriptor();

        let words = meter.read_03(1, slot.status_block_address, 16).await.unwrap();
        assert_eq!(words[3], 3);
        assert_eq!(words[4], 12);
        assert_eq!(words[5], 0);
        assert_eq!(
            decode(&words[6..9], FormatTag::Tstamp),
            DecodedValue::Timestamp("22/02/2023 14:00:00".into())
        );

        meter.write_06(1, ENGAGE_ADDRESS, 0x0280).await.unwrap();
        assert_eq!(meter.engaged_log(), Some(HistoricLog::Historic1));
        assert_eq!(meter.read_03(1, slot.availability_address, 1).await.unwrap(), vec![NETWORK_CHANNEL]);

        let setup = meter.read_03(1, slot.setup_address, 4).await.unwrap();
        assert_eq!(setup, vec![2, 0, DEMO_VOLTS_REGISTER, DEMO_POWER_FACTOR_REGISTER]);
    }

    #[tokio::test]
    async fn test_window_cursor() {
        let mut meter = SimulatedMeter::demo(25);
        meter.set_faults(SimulatorFaults {
            ready_delay_polls: 1,
            ..Default::default()
        });
        meter.write_06(1, ENGAGE_ADDRESS, 0x0280).await.unwrap();
        meter.write_10(1, WINDOW_CONFIG_ADDRESS, &[0x1401, 0, 0]).await.unwrap();

        let offset = meter.read_03(1, WINDOW_OFFSET_ADDRESS, 2).await.unwrap();
        assert!(WindowStatus::decode(offset[0], offset[1]).preparing);
        let offset = meter.read_03(1, WINDOW_OFFSET_ADDRESS, 2).await.unwrap();
        assert_eq!(WindowStatus::decode(offset[0], offset[1]), WindowStatus { index: 0, preparing: false });

        let data = meter.read_03(1, WINDOW_DATA_ADDRESS, 120).await.unwrap();
        assert_eq!(&data[0..3], &[0x1702, 0x160E, 0x0000]);

        meter.read_03(1, WINDOW_OFFSET_ADDRESS, 2).await.unwrap();
        let offset = meter.read_03(1, WINDOW_OFFSET_ADDRESS, 2).await.unwrap();
        assert_eq!(WindowStatus::decode(offset[0], offset[1]).index, 20);
        assert_eq!(meter.data_reads(), 1);
    }

    #[tokio::test]
    async fn test_wrong_slave_and_closed_link() {
        let mut meter = SimulatedMeter::new();
        assert!(matches!(meter.read_03(9, 0, 1).await, Err(MeterError::Timeout { .. })));

        meter.close().await.unwrap();
        assert!(!meter.is_connected());
        assert!(matches!(meter.read_03(1, 0, 1).await, Err(MeterError::Connection { .. })));

        meter.reconnect().await.unwrap();
        assert!(meter.read_03(1, 0, 1).await.is_ok());
        assert_eq!(meter.reconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_link_on_data_read() {
        let mut meter = SimulatedMeter::demo(25);
        meter.set_faults(SimulatorFaults {
            drop_link_after_data_reads: Some(1),
            ..Default::default()
        });
        meter.write_06(1, ENGAGE_ADDRESS, 0x0280).await.unwrap();
        meter.write_10(1, WINDOW_CONFIG_ADDRESS, &[0x1401, 0, 0]).await.unwrap();

        meter.read_03(1, WINDOW_DATA_ADDRESS, 120).await.unwrap();
        let err = meter.read_03(1, WINDOW_DATA_ADDRESS, 120).await.unwrap_err();
        assert!(matches!(err, MeterError::Timeout { .. }));
        assert!(!meter.is_connected());

        // The fault fires once
        meter.reconnect().await.unwrap();
        assert!(meter.read_03(1, WINDOW_DATA_ADDRESS, 120).await.is_ok());
    }
}
