//! Target-table schema as supplied by the dialect collaborator.

use serde::{Deserialize, Serialize};

use crate::event::{TableHeader, TableRef};

/// Broad column type category. The loader only needs enough shape to make
/// value-handling decisions (e.g. the empty-string sentinel applies to
/// character columns only); exact vendor types stay with the dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Character,
    Numeric,
    Temporal,
    Binary,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnKind,
    /// NOT NULL on the target.
    #[serde(default)]
    pub required: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        ColumnDef {
            name: name.into(),
            kind,
            required: false,
        }
    }

    pub fn character(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Character)
    }

    pub fn numeric(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Numeric)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Column/key layout of one target table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table: TableRef,
    pub columns: Vec<ColumnDef>,
    pub key_columns: Vec<String>,
}

impl TableSchema {
    pub fn new(table: TableRef, columns: Vec<ColumnDef>, key_columns: Vec<String>) -> Self {
        TableSchema {
            table,
            columns,
            key_columns,
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Positions of the key columns within the schema column list.
    pub fn key_indexes(&self) -> Option<Vec<usize>> {
        self.key_columns
            .iter()
            .map(|k| self.column_index(k))
            .collect()
    }

    /// Header describing the full column list of this table, for
    /// engine-generated events (initial load, reload).
    pub fn header(&self) -> TableHeader {
        TableHeader::new(
            self.table.clone(),
            self.column_names(),
            self.key_columns.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_indexes_follow_key_order() {
        let schema = TableSchema::new(
            TableRef::new("t"),
            vec![
                ColumnDef::character("a"),
                ColumnDef::numeric("b"),
                ColumnDef::numeric("c"),
            ],
            vec!["c".into(), "a".into()],
        );
        assert_eq!(schema.key_indexes(), Some(vec![2, 0]));
    }

    #[test]
    fn missing_key_column_is_detected() {
        let schema = TableSchema::new(
            TableRef::new("t"),
            vec![ColumnDef::numeric("a")],
            vec!["zz".into()],
        );
        assert_eq!(schema.key_indexes(), None);
    }
}
