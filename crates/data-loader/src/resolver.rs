//! Conflict resolution policy.
//!
//! Classifies an apply-time mismatch and decides the recovery action,
//! decoupled from the writer so deployments can choose strict-integrity or
//! best-effort-sync behavior per operation kind through configuration.

use serde::{Deserialize, Serialize};

use crate::dialect::ConflictKind;

/// Per-operation switch: repair with the fallback statement or stop the
/// batch with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictAction {
    Fallback,
    ErrorStop,
}

/// What to do when the target table does not exist at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MissingTableAction {
    /// Surface schema drift as a batch error (default).
    Abort,
    /// Skip every row for the missing table and keep loading.
    SkipTable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ConflictPolicy {
    pub on_insert_conflict: ConflictAction,
    pub on_missing_update: ConflictAction,
    pub on_missing_delete: ConflictAction,
    pub on_missing_table: MissingTableAction,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        ConflictPolicy {
            on_insert_conflict: ConflictAction::Fallback,
            on_missing_update: ConflictAction::Fallback,
            on_missing_delete: ConflictAction::Fallback,
            on_missing_table: MissingTableAction::Abort,
        }
    }
}

impl ConflictPolicy {
    /// Strict mode: every mismatch stops the batch.
    pub fn error_stop() -> Self {
        ConflictPolicy {
            on_insert_conflict: ConflictAction::ErrorStop,
            on_missing_update: ConflictAction::ErrorStop,
            on_missing_delete: ConflictAction::ErrorStop,
            on_missing_table: MissingTableAction::Abort,
        }
    }
}

/// Typed apply-time failure offered to the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyFailure {
    InsertConflict(ConflictKind),
    UpdateZeroRows,
    /// An update whose own key values changed between old and new data.
    UpdateKeysChanged,
    DeleteZeroRows,
    MissingTable,
}

/// Recovery action for the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    RetryAsUpdate,
    RetryAsInsert,
    RetryWithOldKeys,
    /// Treat the mismatch as success (idempotent outcome).
    Success,
    SkipTable,
    Abort,
}

#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    policy: ConflictPolicy,
}

impl ConflictResolver {
    pub fn new(policy: ConflictPolicy) -> Self {
        ConflictResolver { policy }
    }

    pub fn policy(&self) -> &ConflictPolicy {
        &self.policy
    }

    pub fn resolve(&self, failure: &ApplyFailure) -> Resolution {
        match failure {
            ApplyFailure::InsertConflict(ConflictKind::UniqueViolation) => {
                match self.policy.on_insert_conflict {
                    ConflictAction::Fallback => Resolution::RetryAsUpdate,
                    ConflictAction::ErrorStop => Resolution::Abort,
                }
            }
            ApplyFailure::InsertConflict(ConflictKind::ConstraintViolation(_)) => Resolution::Abort,
            ApplyFailure::UpdateZeroRows => match self.policy.on_missing_update {
                ConflictAction::Fallback => Resolution::RetryAsInsert,
                ConflictAction::ErrorStop => Resolution::Abort,
            },
            ApplyFailure::UpdateKeysChanged => Resolution::RetryWithOldKeys,
            ApplyFailure::DeleteZeroRows => match self.policy.on_missing_delete {
                ConflictAction::Fallback => Resolution::Success,
                ConflictAction::ErrorStop => Resolution::Abort,
            },
            ApplyFailure::MissingTable => match self.policy.on_missing_table {
                MissingTableAction::Abort => Resolution::Abort,
                MissingTableAction::SkipTable => Resolution::SkipTable,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_follows_the_decision_table() {
        let resolver = ConflictResolver::default();
        assert_eq!(
            resolver.resolve(&ApplyFailure::InsertConflict(ConflictKind::UniqueViolation)),
            Resolution::RetryAsUpdate
        );
        assert_eq!(
            resolver.resolve(&ApplyFailure::UpdateZeroRows),
            Resolution::RetryAsInsert
        );
        assert_eq!(
            resolver.resolve(&ApplyFailure::UpdateKeysChanged),
            Resolution::RetryWithOldKeys
        );
        assert_eq!(
            resolver.resolve(&ApplyFailure::DeleteZeroRows),
            Resolution::Success
        );
        assert_eq!(
            resolver.resolve(&ApplyFailure::MissingTable),
            Resolution::Abort
        );
    }

    #[test]
    fn generic_constraint_violations_always_abort() {
        let resolver = ConflictResolver::default();
        assert_eq!(
            resolver.resolve(&ApplyFailure::InsertConflict(
                ConflictKind::ConstraintViolation("fk_order_customer".into())
            )),
            Resolution::Abort
        );
    }

    #[test]
    fn error_stop_policy_aborts_instead_of_repairing() {
        let resolver = ConflictResolver::new(ConflictPolicy::error_stop());
        assert_eq!(
            resolver.resolve(&ApplyFailure::InsertConflict(ConflictKind::UniqueViolation)),
            Resolution::Abort
        );
        assert_eq!(resolver.resolve(&ApplyFailure::UpdateZeroRows), Resolution::Abort);
        assert_eq!(resolver.resolve(&ApplyFailure::DeleteZeroRows), Resolution::Abort);
    }

    #[test]
    fn policy_is_loadable_from_configuration() {
        let yaml = r#"
on-insert-conflict: error-stop
on-missing-table: skip-table
"#;
        let policy: ConflictPolicy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(policy.on_insert_conflict, ConflictAction::ErrorStop);
        assert_eq!(policy.on_missing_update, ConflictAction::Fallback);
        assert_eq!(policy.on_missing_table, MissingTableAction::SkipTable);
    }
}
