//! The outgoing batch: a persisted unit of replication work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Batch status state machine.
///
/// `New → Queued → Sent → {Ok | Error → (Loading retried) → Ok}`.
/// Everything short of `Ok` remains eligible for resend: a batch that was
/// sent but never acknowledged must go out again (at-least-once delivery).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    New,
    Queued,
    Sent,
    /// An errored batch handed back to the transport for replay.
    Loading,
    Ok,
    Error,
}

impl BatchStatus {
    pub fn is_resendable(self) -> bool {
        self != BatchStatus::Ok
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::New => "new",
            BatchStatus::Queued => "queued",
            BatchStatus::Sent => "sent",
            BatchStatus::Loading => "loading",
            BatchStatus::Ok => "ok",
            BatchStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchType {
    /// Ordinary change-data batch assembled by the builder.
    Events,
    /// Full-table snapshot batch, inserted directly (exempt from channel
    /// grouping) but subject to the same status state machine.
    InitialLoad,
}

/// A bounded, ordered set of change events shipped and applied as one unit.
///
/// The batch owns event references (ids), never copies; membership is
/// append-only until the batch leaves `New`, and sealed membership preserves
/// capture-sequence order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingBatch {
    /// Unique and monotonically increasing within the node scope; never
    /// reused.
    pub batch_id: i64,
    /// Target node.
    pub node_id: String,
    pub channel_id: String,
    pub batch_type: BatchType,
    pub status: BatchStatus,
    pub create_time: DateTime<Utc>,
    pub event_count: u64,
    pub byte_count: u64,
    /// Capture sequence number of the event that failed the last load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_event_id: Option<i64>,
    /// Times this batch has been handed to the transport.
    pub sent_count: u32,
}

impl OutgoingBatch {
    pub fn new(
        batch_id: i64,
        node_id: impl Into<String>,
        channel_id: impl Into<String>,
        batch_type: BatchType,
    ) -> Self {
        OutgoingBatch {
            batch_id,
            node_id: node_id.into(),
            channel_id: channel_id.into(),
            batch_type,
            status: BatchStatus::New,
            create_time: Utc::now(),
            event_count: 0,
            byte_count: 0,
            failed_event_id: None,
            sent_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_ok_leaves_the_resend_pool() {
        for status in [
            BatchStatus::New,
            BatchStatus::Queued,
            BatchStatus::Sent,
            BatchStatus::Loading,
            BatchStatus::Error,
        ] {
            assert!(status.is_resendable(), "{status:?} should be resendable");
        }
        assert!(!BatchStatus::Ok.is_resendable());
    }

    #[test]
    fn new_batch_starts_empty_in_status_new() {
        let batch = OutgoingBatch::new(10, "client1", "default", BatchType::Events);
        assert_eq!(batch.status, BatchStatus::New);
        assert_eq!(batch.event_count, 0);
        assert_eq!(batch.sent_count, 0);
    }
}
