//! Audit sinks for call transition records.
//!
//! Recording is fire-and-forget: a sink that cannot persist a record logs
//! the failure itself and never fails the transition.

use crate::call::{CallId, TransitionRecord};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Receives every call transition, in commit order per call.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &TransitionRecord);
}

/// Logs transitions through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &TransitionRecord) {
        info!(
            target: "ringline::audit",
            call_id = %record.call_id,
            from = record.from_state.map(|s| s.as_str()).unwrap_or("-"),
            to = %record.to_state,
            reason = record.reason.map(|r| r.as_str()).unwrap_or("-"),
            timestamp = record.timestamp,
            "Call transition"
        );
    }
}

/// Keeps records in memory. Used by tests and diagnostics.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<TransitionRecord>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record so far.
    #[must_use]
    pub fn records(&self) -> Vec<TransitionRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Records for one call.
    #[must_use]
    pub fn for_call(&self, call_id: &CallId) -> Vec<TransitionRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| &r.call_id == call_id)
            .cloned()
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: &TransitionRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
    }
}

/// Forwards records to an async consumer such as a file writer.
#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    tx: mpsc::UnboundedSender<TransitionRecord>,
}

impl ChannelAuditSink {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransitionRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AuditSink for ChannelAuditSink {
    fn record(&self, record: &TransitionRecord) {
        if self.tx.send(record.clone()).is_err() {
            warn!(call_id = %record.call_id, "Audit consumer gone, dropping record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{CallState, EndReason};

    fn record(call_id: &str, to: CallState) -> TransitionRecord {
        TransitionRecord {
            call_id: CallId::from(call_id),
            from_state: Some(CallState::Ringing),
            to_state: to,
            reason: Some(EndReason::Hangup),
            timestamp: 1,
        }
    }

    #[test]
    fn test_memory_sink_filters_by_call() {
        let sink = MemoryAuditSink::new();
        sink.record(&record("call_1", CallState::Connected));
        sink.record(&record("call_2", CallState::Ended));

        assert_eq!(sink.records().len(), 2);
        assert_eq!(sink.for_call(&CallId::from("call_2")).len(), 1);
    }

    #[test]
    fn test_channel_sink_forwards() {
        let (sink, mut rx) = ChannelAuditSink::new();
        sink.record(&record("call_1", CallState::Ended));
        assert_eq!(rx.try_recv().unwrap().to_state, CallState::Ended);

        drop(rx);
        // Must not panic once the consumer is gone.
        sink.record(&record("call_1", CallState::Ended));
    }
}
