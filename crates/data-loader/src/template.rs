//! Table templates: resolved target-table layout plus statement shaping.

use anyhow::Result;
use sync_model::{
    project, ColumnKind, RowValue, SyncError, TableSchema, REQUIRED_EMPTY_SENTINEL,
};

use crate::dialect::{DmlOp, DmlStatement};

/// Parsed layout of the active target table. Owned by one load session's
/// context, never shared across concurrent loads.
#[derive(Debug, Clone)]
pub struct TableTemplate {
    schema: TableSchema,
}

impl TableTemplate {
    pub fn new(schema: TableSchema) -> Result<Self> {
        if schema.key_indexes().is_none() {
            return Err(SyncError::Protocol(format!(
                "table {} declares key columns missing from its column list",
                schema.table
            ))
            .into());
        }
        Ok(TableTemplate { schema })
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Key values projected out of a row shaped by `columns`.
    pub fn key_values_from(&self, columns: &[String], row: &[RowValue]) -> Result<Vec<RowValue>> {
        let indexes = self
            .schema
            .key_columns
            .iter()
            .map(|k| columns.iter().position(|c| c == k))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                SyncError::Protocol(format!(
                    "stream columns for {} are missing a key column",
                    self.schema.table
                ))
            })?;
        project(row, &indexes).ok_or_else(|| {
            SyncError::Protocol(format!(
                "row for {} is shorter than its column list",
                self.schema.table
            ))
            .into()
        })
    }

    pub fn insert_statement(&self, columns: &[String], row: Vec<RowValue>) -> Result<DmlStatement> {
        let values = self.scrub(columns, row)?;
        Ok(DmlStatement {
            op: DmlOp::Insert,
            table: self.schema.table.clone(),
            columns: columns.to_vec(),
            values,
            key_columns: Vec::new(),
            key_values: Vec::new(),
        })
    }

    pub fn update_statement(
        &self,
        columns: &[String],
        row: Vec<RowValue>,
        key_values: Vec<RowValue>,
    ) -> Result<DmlStatement> {
        let values = self.scrub(columns, row)?;
        Ok(DmlStatement {
            op: DmlOp::Update,
            table: self.schema.table.clone(),
            columns: columns.to_vec(),
            values,
            key_columns: self.schema.key_columns.clone(),
            key_values,
        })
    }

    pub fn delete_statement(&self, key_values: Vec<RowValue>) -> DmlStatement {
        DmlStatement {
            op: DmlOp::Delete,
            table: self.schema.table.clone(),
            columns: Vec::new(),
            values: Vec::new(),
            key_columns: self.schema.key_columns.clone(),
            key_values,
        }
    }

    /// Apply value substitutions the target schema demands. An empty string
    /// bound for a required character column becomes the single-space
    /// sentinel; a NULL write there would violate the NOT NULL constraint
    /// (and some engines silently coerce '' to NULL).
    fn scrub(&self, columns: &[String], mut row: Vec<RowValue>) -> Result<Vec<RowValue>> {
        if row.len() != columns.len() {
            return Err(SyncError::Protocol(format!(
                "row for {} has {} values but {} columns",
                self.schema.table,
                row.len(),
                columns.len()
            ))
            .into());
        }
        for (name, value) in columns.iter().zip(row.iter_mut()) {
            if let Some(column) = self.schema.column(name) {
                if column.required
                    && column.kind == ColumnKind::Character
                    && value.as_deref() == Some("")
                {
                    *value = Some(REQUIRED_EMPTY_SENTINEL.to_string());
                }
            }
        }
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_model::{ColumnDef, TableRef};

    fn schema() -> TableSchema {
        TableSchema::new(
            TableRef::new("customer"),
            vec![
                ColumnDef::numeric("id").required(),
                ColumnDef::character("name").required(),
                ColumnDef::character("note"),
            ],
            vec!["id".into()],
        )
    }

    fn columns() -> Vec<String> {
        vec!["id".into(), "name".into(), "note".into()]
    }

    #[test]
    fn required_character_empty_string_gets_the_sentinel() {
        let template = TableTemplate::new(schema()).unwrap();
        let stmt = template
            .insert_statement(
                &columns(),
                vec![Some("1".into()), Some("".into()), Some("".into())],
            )
            .unwrap();
        assert_eq!(stmt.values[1], Some(REQUIRED_EMPTY_SENTINEL.to_string()));
        // Optional character column keeps its empty string.
        assert_eq!(stmt.values[2], Some("".into()));
    }

    #[test]
    fn nulls_pass_through_untouched() {
        let template = TableTemplate::new(schema()).unwrap();
        let stmt = template
            .insert_statement(&columns(), vec![Some("1".into()), Some("x".into()), None])
            .unwrap();
        assert_eq!(stmt.values[2], None);
    }

    #[test]
    fn arity_mismatch_is_a_protocol_error() {
        let template = TableTemplate::new(schema()).unwrap();
        assert!(template
            .insert_statement(&columns(), vec![Some("1".into())])
            .is_err());
    }

    #[test]
    fn key_projection_follows_stream_column_order() {
        let template = TableTemplate::new(schema()).unwrap();
        let shuffled = vec!["note".to_string(), "id".to_string(), "name".to_string()];
        let keys = template
            .key_values_from(&shuffled, &[None, Some("42".into()), Some("n".into())])
            .unwrap();
        assert_eq!(keys, vec![Some("42".into())]);
    }

    #[test]
    fn bad_key_declaration_is_rejected() {
        let bad = TableSchema::new(
            TableRef::new("t"),
            vec![ColumnDef::numeric("a")],
            vec!["missing".into()],
        );
        assert!(TableTemplate::new(bad).is_err());
    }
}
