//! Row value semantics.
//!
//! A captured row travels as a vector of [`RowValue`]s aligned with the
//! event's column list. `None` is SQL NULL and `Some("")` is an empty
//! string; the two are never collapsed into each other, on the wire or in
//! the loader.

/// One serialized column value. `None` means SQL NULL.
pub type RowValue = Option<String>;

/// Substitute written to a required (NOT NULL) character column when the
/// source delivered an empty string that the target would reject. A single
/// space survives round trips through engines that treat '' as NULL.
pub const REQUIRED_EMPTY_SENTINEL: &str = " ";

/// Project `indexes` out of a row, cloning the selected values.
///
/// Returns `None` if any index is out of bounds, which indicates a
/// malformed event (column/value arity mismatch).
pub fn project(values: &[RowValue], indexes: &[usize]) -> Option<Vec<RowValue>> {
    indexes
        .iter()
        .map(|&i| values.get(i).cloned())
        .collect::<Option<Vec<_>>>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_selects_in_order() {
        let row = vec![Some("a".into()), None, Some("c".into())];
        assert_eq!(
            project(&row, &[2, 0]),
            Some(vec![Some("c".into()), Some("a".into())])
        );
    }

    #[test]
    fn project_rejects_out_of_bounds() {
        let row = vec![Some("a".into())];
        assert_eq!(project(&row, &[1]), None);
    }

    #[test]
    fn null_and_empty_are_distinct() {
        let null: RowValue = None;
        let empty: RowValue = Some(String::new());
        assert_ne!(null, empty);
    }
}
