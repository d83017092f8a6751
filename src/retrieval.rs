//! # Historic Log Retrieval
//!
//! Streams a historic log out of the meter through its windowed cursor.
//!
//! ## Sequence
//!
//! 1. **Lock**: claim the meter's global busy register (`0xC34B`).
//! 2. **Engage**: read the slot's status block, check slot availability and
//!    write the engagement control word, then confirm through the slot's
//!    availability register.
//! 3. **Layout**: read the slot's setup block and resolve each field register
//!    through the [`RegisterCatalog`].
//! 4. **Stream**: configure the window size, then repeatedly read the window
//!    offset, wait for the meter to finish staging, and read the window data.
//!    The meter advances its cursor on every data read.
//! 5. **Release**: clear the engagement enable bit and free the busy register.
//!
//! Once the lock is held, step 5 runs on every exit: completion, cancellation
//! and failure alike. A lock that was never acquired is never released.
//!
//! ```rust,no_run
//! use shark_modbus::{InMemoryCatalog, HistoricLog, LogRetrievalEngine, MeterSession};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let catalog = InMemoryCatalog::from_path("registers.yaml")?;
//!     let mut session: MeterSession = MeterSession::new();
//!     session.connect(1, "192.168.0.90", 502).await?;
//!
//!     let mut engine = LogRetrievalEngine::new(&mut session, &catalog);
//!     let export = engine.retrieve(HistoricLog::Historic1).await?;
//!     println!("{} records", export.table.len());
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::RegisterCatalog;
use crate::client::ModbusClient;
use crate::config::RetrievalOptions;
use crate::error::{BusyHolder, MeterError, MeterResult};
use crate::export::ExportTable;
use crate::layout::{setup_field_count, LayoutWarning, RecordLayout};
use crate::progress::{percent_complete, ProgressCallback, RetrievalEvent, RetrievalState};
use crate::registers::{
    engage_control_word, window_config_words, HistoricLog, LogSlotDescriptor, LogStatusBlock, WindowStatus,
    BUSY_LOCK_ADDRESS, ENGAGE_ADDRESS, ENGAGE_ENABLE_BIT, LOCK_ENGAGED, LOCK_FREE, LOCK_REQUEST,
    WINDOW_CONFIG_ADDRESS, WINDOW_DATA_ADDRESS, WINDOW_OFFSET_ADDRESS,
};
use crate::session::MeterSession;

pub use crate::progress::RetrievalStatus;

/// Result of a retrieval that reached the streaming stage or finished early
#[derive(Debug, Clone)]
pub struct LogExport {
    pub log: HistoricLog,
    pub status: RetrievalStatus,
    pub status_block: LogStatusBlock,
    pub layout: RecordLayout,
    pub table: ExportTable,
    pub warnings: Vec<LayoutWarning>,
}

/// Drives one retrieval at a time against a borrowed session
pub struct LogRetrievalEngine<'a, C: ModbusClient> {
    session: &'a mut MeterSession<C>,
    catalog: &'a dyn RegisterCatalog,
    options: RetrievalOptions,
    progress: Option<ProgressCallback>,
    cancel: CancellationToken,
}

impl<'a, C: ModbusClient> LogRetrievalEngine<'a, C> {
    pub fn new(session: &'a mut MeterSession<C>, catalog: &'a dyn RegisterCatalog) -> Self {
        Self {
            session,
            catalog,
            options: RetrievalOptions::default(),
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_options(mut self, options: RetrievalOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Token observed between windows and while waiting for a window
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn emit(&self, event: RetrievalEvent) {
        if let Some(ref progress) = self.progress {
            progress(&event);
        }
    }

    fn set_state(&self, state: RetrievalState) {
        debug!(%state, "Retrieval state");
        self.emit(RetrievalEvent::StateChanged(state));
    }

    /// Retrieve one historic log
    pub async fn retrieve(&mut self, log: HistoricLog) -> MeterResult<LogExport> {
        self.set_state(RetrievalState::AcquiringLock);
        if let Err(e) = self.acquire_lock().await {
            warn!(%log, error = %e, "Could not lock meter");
            self.fail(&e);
            return Err(e);
        }
        self.emit(RetrievalEvent::LockAcquired);

        let result = self.run_engaged(log).await;

        if result.is_err() {
            self.set_state(RetrievalState::Error);
        }
        self.set_state(RetrievalState::Disengaging);
        let released = self.release().await;

        match (result, released) {
            (Ok(export), Ok(())) => {
                info!(%log, rows = export.table.len(), status = ?export.status, "Log retrieval finished");
                self.emit(RetrievalEvent::Finished {
                    status: export.status,
                    rows: export.table.len(),
                });
                self.set_state(RetrievalState::Idle);
                Ok(export)
            }
            (Ok(_), Err(e)) | (Err(e), _) => {
                warn!(%log, error = %e, "Log retrieval failed");
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn fail(&self, error: &MeterError) {
        self.emit(RetrievalEvent::Failed {
            message: error.to_string(),
        });
        self.set_state(RetrievalState::Idle);
    }

    /// Claim the meter's global busy register
    ///
    /// Fails with `DeviceBusy` when this session already holds it or another
    /// client owns it. Nothing needs releasing after a failure; a request
    /// whose confirmation could not be read is withdrawn here.
    pub async fn acquire_lock(&mut self) -> MeterResult<()> {
        if self.session.lock_held() {
            return Err(MeterError::device_busy(BusyHolder::ThisSession));
        }

        let current = self.read_word(BUSY_LOCK_ADDRESS).await?;
        if current != LOCK_FREE && current != LOCK_ENGAGED {
            return Err(MeterError::device_busy(BusyHolder::Unknown(current)));
        }

        self.session.write_register(BUSY_LOCK_ADDRESS, LOCK_REQUEST).await?;

        let confirmed = match self.read_word(BUSY_LOCK_ADDRESS).await {
            Ok(confirmed) => confirmed,
            Err(e) => {
                self.withdraw_lock_request().await;
                return Err(e);
            }
        };
        if confirmed != LOCK_ENGAGED {
            return Err(MeterError::device_busy(BusyHolder::Unknown(confirmed)));
        }

        self.session.set_lock_held(true);
        debug!(slave_id = self.session.slave_id(), "Meter lock acquired");
        Ok(())
    }

    /// Free the busy register after a lock request of unknown outcome
    async fn withdraw_lock_request(&mut self) {
        if let Err(e) = self.session.reconnect().await {
            warn!(error = %e, "Cannot reach meter to withdraw lock request");
            return;
        }
        if let Err(e) = self.session.write_register(BUSY_LOCK_ADDRESS, LOCK_FREE).await {
            warn!(error = %e, "Could not withdraw lock request");
        }
    }

    /// Disengage the log and free the busy register
    ///
    /// A link the transport dropped mid-retrieval is re-opened first. Both
    /// writes are attempted even if the first fails; the first error is
    /// returned. Session lock state is cleared regardless.
    pub async fn release(&mut self) -> MeterResult<()> {
        let mut first_error = None;

        if let Err(e) = self.session.reconnect().await {
            first_error.get_or_insert(e);
        }

        let disengage = match self.read_word(ENGAGE_ADDRESS).await {
            Ok(control) => control & !ENGAGE_ENABLE_BIT,
            Err(e) => {
                first_error.get_or_insert(e);
                0
            }
        };
        if let Err(e) = self.session.write_register(ENGAGE_ADDRESS, disengage).await {
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.session.write_register(BUSY_LOCK_ADDRESS, LOCK_FREE).await {
            first_error.get_or_insert(e);
        }

        self.session.set_engaged_log(None);
        self.session.set_lock_held(false);

        match first_error {
            Some(e) => {
                warn!(error = %e, "Meter release incomplete");
                Err(e)
            }
            None => {
                debug!("Meter released");
                Ok(())
            }
        }
    }

    async fn read_word(&mut self, address: u16) -> MeterResult<u16> {
        let words = self.session.read_holding_registers(address, 1).await?;
        words
            .first()
            .copied()
            .ok_or_else(|| MeterError::frame(format!("Empty read at 0x{:04X}", address)))
    }

    async fn run_engaged(&mut self, log: HistoricLog) -> MeterResult<LogExport> {
        self.set_state(RetrievalState::Engaging);
        let slot = log.descriptor();
        let status_block = self.engage(log, &slot).await?;

        self.set_state(RetrievalState::ResolvingLayout);
        let records_per_window = status_block.records_per_window()?;
        let (layout, warnings) = self.resolve_layout(&slot).await?;
        layout.check_fits(status_block.record_stride_words(), records_per_window)?;

        for warning in &warnings {
            warn!(%log, register = warning.register, "Skipping log field: {}", warning.message);
        }
        self.emit(RetrievalEvent::LayoutResolved {
            fields: layout.fields().len(),
            warnings: warnings.clone(),
        });

        let mut table = ExportTable::new(layout.titles());
        let status = if status_block.records_used == 0 {
            info!(%log, "Log is empty");
            RetrievalStatus::Completed
        } else {
            self.set_state(RetrievalState::Streaming);
            let status = self
                .stream(&status_block, &layout, records_per_window, &mut table)
                .await?;
            if status == RetrievalStatus::Cancelled {
                self.set_state(RetrievalState::Cancelled);
            }
            status
        };

        Ok(LogExport {
            log,
            status,
            status_block,
            layout,
            table,
            warnings,
        })
    }

    async fn engage(&mut self, log: HistoricLog, slot: &LogSlotDescriptor) -> MeterResult<LogStatusBlock> {
        let status_block = self.session.read_log_status(log).await?;
        if let Some(holder) = status_block.holder() {
            return Err(MeterError::device_busy(holder));
        }

        let control = engage_control_word(slot.log_number, true, 0);
        self.session.write_register(ENGAGE_ADDRESS, control).await?;
        self.session.set_engaged_log(Some(log));

        let attempts = self.options.engage_confirm_attempts.max(1);
        let mut engaged = false;
        for attempt in 1..=attempts {
            if self.read_word(slot.availability_address).await? != 0 {
                engaged = true;
                break;
            }
            if attempt < attempts {
                tokio::time::sleep(self.options.poll_interval()).await;
            }
        }
        if !engaged {
            return Err(MeterError::engagement_failed(
                slot.log_number,
                format!("availability still zero after {} reads", attempts),
            ));
        }

        info!(
            %log,
            records_used = status_block.records_used,
            capacity = status_block.capacity,
            record_size = status_block.record_size_bytes,
            "Log engaged"
        );
        self.emit(RetrievalEvent::LogEngaged {
            log,
            status: status_block.clone(),
        });
        Ok(status_block)
    }

    async fn resolve_layout(&mut self, slot: &LogSlotDescriptor) -> MeterResult<(RecordLayout, Vec<LayoutWarning>)> {
        let field_count = setup_field_count(self.read_word(slot.setup_address).await?);
        let registers = if field_count == 0 {
            Vec::new()
        } else {
            self.session
                .read_holding_registers(slot.setup_address + 2, field_count)
                .await?
        };
        Ok(RecordLayout::resolve(&registers, self.catalog))
    }

    async fn stream(
        &mut self,
        status_block: &LogStatusBlock,
        layout: &RecordLayout,
        records_per_window: u16,
        table: &mut ExportTable,
    ) -> MeterResult<RetrievalStatus> {
        let used = status_block.records_used;
        let stride = status_block.record_stride_words();
        let window_words = records_per_window * stride as u16;

        self.session
            .write_registers(WINDOW_CONFIG_ADDRESS, &window_config_words(records_per_window, 1))
            .await?;

        let mut last_index = None;
        let mut stalled = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                info!(rows = table.len(), "Log retrieval cancelled");
                return Ok(RetrievalStatus::Cancelled);
            }

            let offset = self
                .session
                .read_holding_registers(WINDOW_OFFSET_ADDRESS, 2)
                .await?;
            let mut window = WindowStatus::decode(offset[0], offset[1]);
            if window.preparing {
                window = match self.wait_for_window(window).await? {
                    Some(window) => window,
                    None => {
                        info!(rows = table.len(), "Log retrieval cancelled");
                        return Ok(RetrievalStatus::Cancelled);
                    }
                };
            }

            let data = self
                .session
                .read_holding_registers(WINDOW_DATA_ADDRESS, window_words)
                .await?;

            if last_index == Some(window.index) {
                stalled += 1;
                if stalled > self.options.max_stalled_windows {
                    return Err(MeterError::StreamStalled {
                        index: window.index,
                        windows: stalled,
                    });
                }
                warn!(index = window.index, stalled, "Window cursor did not advance");
                continue;
            }
            stalled = 0;
            last_index = Some(window.index);

            let remaining = used.saturating_sub(window.index);
            let rows = remaining.min(records_per_window as u32) as usize;
            for record in data.chunks(stride).take(rows) {
                if let Some(row) = layout.decode_record(record) {
                    table.push_row(row);
                }
            }

            self.emit(RetrievalEvent::WindowRead {
                index: window.index,
                rows,
                total_rows: table.len(),
                percent: percent_complete(table.len(), used),
            });
            debug!(index = window.index, rows, total = table.len(), "Window read");

            if remaining <= records_per_window as u32 {
                return Ok(RetrievalStatus::Completed);
            }
        }
    }

    /// Re-poll the window offset until the meter clears its preparing flag
    ///
    /// Returns `None` if cancelled while waiting.
    async fn wait_for_window(&mut self, mut window: WindowStatus) -> MeterResult<Option<WindowStatus>> {
        let started = Instant::now();
        let timeout = self.options.window_ready_timeout();
        let max_delay = self.options.max_poll_interval();
        let mut delay = self.options.poll_interval();
        let mut polls = 0u32;

        while window.preparing {
            if polls >= self.options.window_poll_limit || started.elapsed() >= timeout {
                return Err(MeterError::window_timeout(polls, started.elapsed().as_millis() as u64));
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(delay) => {}
            }

            let high = self.read_word(WINDOW_OFFSET_ADDRESS).await?;
            window = window.refresh(high);
            polls += 1;
            delay = (delay * 2).min(max_delay);
        }

        if polls > 0 {
            debug!(polls, index = window.index, "Window ready");
        }
        Ok(Some(window))
    }
}

/// Run a retrieval on its own task against a shared session
///
/// Fails immediately with `RetrievalInProgress` when another retrieval holds
/// the session.
pub fn spawn_retrieval<C>(
    session: Arc<Mutex<MeterSession<C>>>,
    catalog: Arc<dyn RegisterCatalog>,
    log: HistoricLog,
    options: RetrievalOptions,
    progress: Option<ProgressCallback>,
    cancel: CancellationToken,
) -> MeterResult<JoinHandle<MeterResult<LogExport>>>
where
    C: ModbusClient + 'static,
{
    let mut guard = session
        .try_lock_owned()
        .map_err(|_| MeterError::RetrievalInProgress)?;

    Ok(tokio::spawn(async move {
        let mut engine = LogRetrievalEngine::new(&mut *guard, catalog.as_ref())
            .with_options(options)
            .with_cancellation(cancel);
        if let Some(progress) = progress {
            engine = engine.with_progress(progress);
        }
        engine.retrieve(log).await
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::simulator::SimulatedMeter;

    async fn session_for(meter: &SimulatedMeter) -> MeterSession<SimulatedMeter> {
        let mut session = MeterSession::new();
        session.attach(meter.clone(), 1).await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_lock_accepts_free_values() {
        for initial in [LOCK_FREE, LOCK_ENGAGED] {
            let meter = SimulatedMeter::new();
            meter.set_register(BUSY_LOCK_ADDRESS, initial);
            let mut session = session_for(&meter).await;
            let catalog = InMemoryCatalog::new();

            let mut engine = LogRetrievalEngine::new(&mut session, &catalog);
            engine.acquire_lock().await.unwrap();
            assert_eq!(meter.register(BUSY_LOCK_ADDRESS), LOCK_ENGAGED);
        }
    }

    #[tokio::test]
    async fn test_lock_rejects_foreign_owner() {
        let meter = SimulatedMeter::new();
        meter.set_register(BUSY_LOCK_ADDRESS, 0x0C00);
        let mut session = session_for(&meter).await;
        let catalog = InMemoryCatalog::new();

        let mut engine = LogRetrievalEngine::new(&mut session, &catalog);
        let err = engine.acquire_lock().await.unwrap_err();
        assert!(matches!(err, MeterError::DeviceBusy { holder: BusyHolder::Unknown(0x0C00) }));
        assert_eq!(meter.writes_to(BUSY_LOCK_ADDRESS).len(), 0);
    }

    #[tokio::test]
    async fn test_release_clears_enable_bit() {
        let meter = SimulatedMeter::new();
        let mut session = session_for(&meter).await;
        let catalog = InMemoryCatalog::new();

        let mut engine = LogRetrievalEngine::new(&mut session, &catalog);
        engine.acquire_lock().await.unwrap();
        meter.set_register(ENGAGE_ADDRESS, 0x0280);
        engine.release().await.unwrap();

        assert_eq!(meter.register(ENGAGE_ADDRESS), 0x0200);
        assert_eq!(meter.register(BUSY_LOCK_ADDRESS), LOCK_FREE);
        assert!(!session.lock_held());
    }
}
