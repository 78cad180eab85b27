//! Persistence boundary for the batching engine.

use anyhow::Result;
use async_trait::async_trait;
use sync_model::ChangeEvent;

use crate::batch::{BatchStatus, OutgoingBatch};

/// Storage contract shared by the batch builder and the acknowledgment path.
///
/// Implementations must provide two atomicity guarantees:
///
/// - `next_batch_id` allocates from an atomically incrementing sequence; no
///   two concurrent callers may receive the same id for the same node scope.
/// - `create_batch` persists the batch row and its event assignments in one
///   transaction. A crash leaves either no batch (events still pending) or
///   the complete batch; partial assignment is forbidden.
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Allocate the next batch id for a node. Monotonic, never reused.
    async fn next_batch_id(&self, node_id: &str) -> Result<i64>;

    /// Append capture-side events (also used for engine-generated reload
    /// events). Event ids must be unique and monotonic per source.
    async fn insert_events(&self, events: Vec<ChangeEvent>) -> Result<()>;

    /// Cursor-paged read of events not yet assigned to any batch, in
    /// capture-sequence order. `after_event_id` is the resume cursor so a
    /// large backlog is never materialized in one call.
    async fn pending_events(
        &self,
        node_id: &str,
        channel_id: &str,
        after_event_id: i64,
        limit: usize,
    ) -> Result<Vec<ChangeEvent>>;

    /// Atomically persist `batch` and assign `event_ids` to it. Assigning an
    /// event that already belongs to a batch is an invariant violation.
    async fn create_batch(&self, batch: &OutgoingBatch, event_ids: &[i64]) -> Result<()>;

    /// Batches still eligible for (re)send for a node, ascending batch id.
    async fn resendable_batches(&self, node_id: &str) -> Result<Vec<OutgoingBatch>>;

    async fn batch(&self, batch_id: i64) -> Result<Option<OutgoingBatch>>;

    /// Events of one batch in capture-sequence order.
    async fn batch_events(&self, batch_id: i64) -> Result<Vec<ChangeEvent>>;

    async fn update_status(&self, batch_id: i64, status: BatchStatus) -> Result<()>;
}
