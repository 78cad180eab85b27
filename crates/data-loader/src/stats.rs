//! Per-batch load statistics.

use serde::Serialize;

/// Batch-scoped counters returned to the caller at finish/abort. Fallback
/// outcomes are counted separately from their plain counterparts so
/// divergence between replicas is visible in the numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadStatistics {
    /// Stream records consumed (rows and control lines).
    pub line_count: u64,
    pub byte_count: u64,
    /// Row statements attempted (insert + update + delete + sql).
    pub statement_count: u64,
    pub insert_count: u64,
    pub update_count: u64,
    pub delete_count: u64,
    /// Updates that became inserts because the target row was missing.
    pub fallback_insert_count: u64,
    /// Inserts that became updates because the target row already existed.
    pub fallback_update_count: u64,
    /// Updates keyed on the old key values because the key itself changed.
    pub fallback_update_keys_count: u64,
    /// Deletes that matched no row (tolerated as idempotent success).
    pub missing_delete_count: u64,
    pub sql_count: u64,
    pub sql_row_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_statistics_are_zeroed() {
        let stats = LoadStatistics::default();
        assert_eq!(stats.statement_count, 0);
        assert_eq!(stats.fallback_update_count, 0);
    }
}
