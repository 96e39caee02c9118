//! Cooperative cancellation and advisory progress events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;

use crate::error::SimError;
use crate::SimResult;

/// Shared cancellation flag. Checked by the orchestrator between modules
/// and by long-running loops inside the price, exit, and cashflow modules.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        CancelFlag(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Error out of the current module when the flag is set.
    pub fn check(&self, module: &str) -> SimResult<()> {
        if self.is_cancelled() {
            return Err(SimError::Cancelled {
                module: module.to_string(),
            });
        }
        Ok(())
    }
}

/// Advisory progress event. Delivery is best-effort: a full channel drops
/// the event rather than back-pressuring the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub simulation_id: String,
    pub module: String,
    /// 0..100.
    pub progress: f64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ProgressSink {
    simulation_id: String,
    sender: Option<SyncSender<ProgressEvent>>,
}

impl ProgressSink {
    pub fn new(simulation_id: &str, sender: Option<SyncSender<ProgressEvent>>) -> Self {
        ProgressSink {
            simulation_id: simulation_id.to_string(),
            sender,
        }
    }

    /// Disconnected sink for tests and library callers without observers.
    pub fn disabled() -> Self {
        ProgressSink {
            simulation_id: String::new(),
            sender: None,
        }
    }

    pub fn emit(&self, module: &str, progress: f64, message: &str) {
        if let Some(sender) = &self.sender {
            let event = ProgressEvent {
                simulation_id: self.simulation_id.clone(),
                module: module.to_string(),
                progress: progress.clamp(0.0, 100.0),
                message: message.to_string(),
                timestamp: Utc::now(),
            };
            // try_send: dropped on a full or closed channel.
            let _ = sender.try_send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::sync_channel;

    #[test]
    fn test_cancel_flag_roundtrip() {
        let flag = CancelFlag::new();
        assert!(flag.check("price_path").is_ok());
        flag.cancel();
        assert!(flag.is_cancelled());
        let err = flag.check("price_path").unwrap_err();
        assert!(matches!(err, SimError::Cancelled { module } if module == "price_path"));
    }

    #[test]
    fn test_progress_events_delivered() {
        let (tx, rx) = sync_channel(4);
        let sink = ProgressSink::new("run-1", Some(tx));
        sink.emit("loan_generator", 50.0, "halfway");
        let event = rx.try_recv().unwrap();
        assert_eq!(event.module, "loan_generator");
        assert_eq!(event.progress, 50.0);
        assert_eq!(event.simulation_id, "run-1");
    }

    #[test]
    fn test_full_channel_drops_events() {
        let (tx, _rx) = sync_channel(1);
        let sink = ProgressSink::new("run-1", Some(tx));
        sink.emit("a", 1.0, "first fills the buffer");
        // Second emit must not block or panic.
        sink.emit("b", 2.0, "dropped");
    }

    #[test]
    fn test_disabled_sink_is_noop() {
        let sink = ProgressSink::disabled();
        sink.emit("anything", 10.0, "no observer");
    }
}
