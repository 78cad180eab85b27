//! Typed error taxonomy shared by the batching and loading engines.

use thiserror::Error;

/// Failure kinds the engine distinguishes beyond plain collaborator errors.
///
/// `MissingTable` (schema drift) and `DataIntegrity` (fallback repair
/// exhausted) abort the current batch and surface as a batch-level ERROR.
/// `Invariant` indicates a concurrency-control or programming defect and is
/// never retried.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("target table {table} does not exist (batch {batch_id})")]
    MissingTable { table: String, batch_id: i64 },

    #[error("data integrity anomaly on {table} (batch {batch_id}): {detail}")]
    DataIntegrity {
        table: String,
        batch_id: i64,
        detail: String,
    },

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("malformed batch stream: {0}")]
    Protocol(String),
}

impl SyncError {
    /// Whether re-running the pipeline can succeed without intervention.
    /// Invariant violations must abort loudly instead.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SyncError::Invariant(_))
    }
}
