//! Retrieval progress reporting
//!
//! The engine never touches presentation state. It emits [`RetrievalEvent`]s
//! through a callback; [`progress_channel`] turns that callback into a tokio
//! channel for consumers running on another task.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::layout::LayoutWarning;
use crate::registers::{HistoricLog, LogStatusBlock};

/// Engine state as seen from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalState {
    Idle,
    AcquiringLock,
    Engaging,
    ResolvingLayout,
    Streaming,
    Disengaging,
    Cancelled,
    Error,
}

impl fmt::Display for RetrievalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RetrievalState::Idle => "idle",
            RetrievalState::AcquiringLock => "acquiring lock",
            RetrievalState::Engaging => "engaging",
            RetrievalState::ResolvingLayout => "resolving layout",
            RetrievalState::Streaming => "streaming",
            RetrievalState::Disengaging => "disengaging",
            RetrievalState::Cancelled => "cancelled",
            RetrievalState::Error => "error",
        };
        f.write_str(name)
    }
}

/// How a retrieval that returned a table ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalStatus {
    Completed,
    /// Stopped on request; the table holds the rows read before the stop
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetrievalEvent {
    StateChanged(RetrievalState),
    LockAcquired,
    LogEngaged {
        log: HistoricLog,
        status: LogStatusBlock,
    },
    LayoutResolved {
        fields: usize,
        warnings: Vec<LayoutWarning>,
    },
    WindowRead {
        index: u32,
        rows: usize,
        total_rows: usize,
        percent: f32,
    },
    Finished {
        status: RetrievalStatus,
        rows: usize,
    },
    Failed {
        message: String,
    },
}

/// Progress sink shared with the engine
pub type ProgressCallback = Arc<dyn Fn(&RetrievalEvent) + Send + Sync>;

/// Callback that forwards every event into an unbounded channel
pub fn progress_channel() -> (ProgressCallback, mpsc::UnboundedReceiver<RetrievalEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: ProgressCallback = Arc::new(move |event: &RetrievalEvent| {
        // A dropped receiver only means nobody is watching
        let _ = tx.send(event.clone());
    });
    (callback, rx)
}

/// Percentage of used records covered so far
pub(crate) fn percent_complete(rows: usize, records_used: u32) -> f32 {
    if records_used == 0 {
        return 100.0;
    }
    ((rows as f64 / records_used as f64) * 100.0).min(100.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_channel() {
        let (callback, mut rx) = progress_channel();
        callback(&RetrievalEvent::StateChanged(RetrievalState::Streaming));
        callback(&RetrievalEvent::LockAcquired);

        assert_eq!(rx.recv().await, Some(RetrievalEvent::StateChanged(RetrievalState::Streaming)));
        assert_eq!(rx.recv().await, Some(RetrievalEvent::LockAcquired));
    }

    #[test]
    fn test_dropped_receiver_is_ignored() {
        let (callback, rx) = progress_channel();
        drop(rx);
        callback(&RetrievalEvent::LockAcquired);

        let (callback, mut rx) = progress_channel();
        drop(callback);
        assert_eq!(tokio_test::block_on(rx.recv()), None);
    }

    #[test]
    fn test_percent_complete() {
        assert_eq!(percent_complete(5, 10), 50.0);
        assert_eq!(percent_complete(0, 0), 100.0);
        assert_eq!(percent_complete(30, 10), 100.0);
    }
}
