//! Row filters applied before each statement.

use sync_model::RowValue;

use crate::context::LoadContext;

/// Hook invoked per row before the statement is shaped. Returning `false`
/// drops the row from the load without failing the batch. Filters may
/// rewrite values in place; the context exposes the cached old row for
/// additive/merge behavior.
pub trait LoadFilter: Send + Sync {
    fn filter_insert(&self, _ctx: &LoadContext, _row: &mut Vec<RowValue>) -> bool {
        true
    }

    fn filter_update(
        &self,
        _ctx: &LoadContext,
        _row: &mut Vec<RowValue>,
        _keys: &mut Vec<RowValue>,
    ) -> bool {
        true
    }

    fn filter_delete(&self, _ctx: &LoadContext, _keys: &mut Vec<RowValue>) -> bool {
        true
    }
}
