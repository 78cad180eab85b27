//! Change events captured from source-database triggers.
//!
//! A [`ChangeEvent`] is the immutable record of one row mutation. Events are
//! created by the capture collaborator at source-commit time, consumed
//! exactly once into an outgoing batch, and replayed in capture-sequence
//! order by the data loader on the target.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::values::{project, RowValue};

/// Kind of mutation an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
    /// Literal SQL statement to run verbatim on the target.
    Sql,
    /// Initial-load snapshot row; replayed through the insert path.
    Reload,
    /// DDL to create or alter the target table.
    Create,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Insert => "insert",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
            EventKind::Sql => "sql",
            EventKind::Reload => "reload",
            EventKind::Create => "create",
        }
    }
}

/// Fully qualified table identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub name: String,
}

impl TableRef {
    pub fn new(name: impl Into<String>) -> Self {
        TableRef {
            catalog: None,
            schema: None,
            name: name.into(),
        }
    }

    pub fn with_schema(schema: impl Into<String>, name: impl Into<String>) -> Self {
        TableRef {
            catalog: None,
            schema: Some(schema.into()),
            name: name.into(),
        }
    }

    /// `catalog.schema.name`, omitting absent qualifiers.
    pub fn qualified_name(&self) -> String {
        let mut out = String::new();
        if let Some(catalog) = &self.catalog {
            out.push_str(catalog);
            out.push('.');
        }
        if let Some(schema) = &self.schema {
            out.push_str(schema);
            out.push('.');
        }
        out.push_str(&self.name);
        out
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.qualified_name())
    }
}

/// Table layout as seen by the capture trigger: ordered column names and the
/// primary-key subset. Travels ahead of row records in the batch stream and
/// rides on each event for the batching side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableHeader {
    pub table: TableRef,
    pub columns: Vec<String>,
    pub key_columns: Vec<String>,
}

impl TableHeader {
    pub fn new(table: TableRef, columns: Vec<String>, key_columns: Vec<String>) -> Self {
        TableHeader {
            table,
            columns,
            key_columns,
        }
    }

    /// Positions of the key columns within `columns`, or `None` when a key
    /// column is not part of the captured column list.
    pub fn key_indexes(&self) -> Option<Vec<usize>> {
        self.key_columns
            .iter()
            .map(|k| self.columns.iter().position(|c| c == k))
            .collect()
    }
}

/// One captured row mutation.
///
/// `row_data` holds the new values aligned with `columns`; `old_data` holds
/// the pre-image for updates (absent when old-data capture is disabled on
/// the channel); `pk_data` holds the key values aligned with `key_columns`
/// for deletes and updates. Delete events never carry `row_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Capture sequence number, monotonic across the source node.
    pub event_id: i64,
    pub kind: EventKind,
    pub table: TableRef,
    pub columns: Vec<String>,
    pub key_columns: Vec<String>,
    pub row_data: Option<Vec<RowValue>>,
    pub old_data: Option<Vec<RowValue>>,
    pub pk_data: Option<Vec<RowValue>>,
    pub channel_id: String,
    pub source_node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_data: Option<String>,
    pub create_time: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn insert(
        event_id: i64,
        header: &TableHeader,
        channel_id: impl Into<String>,
        source_node_id: impl Into<String>,
        row_data: Vec<RowValue>,
    ) -> Self {
        Self::build(
            event_id,
            EventKind::Insert,
            header,
            channel_id,
            source_node_id,
            Some(row_data),
            None,
            None,
        )
    }

    pub fn update(
        event_id: i64,
        header: &TableHeader,
        channel_id: impl Into<String>,
        source_node_id: impl Into<String>,
        row_data: Vec<RowValue>,
        old_data: Option<Vec<RowValue>>,
        pk_data: Vec<RowValue>,
    ) -> Self {
        Self::build(
            event_id,
            EventKind::Update,
            header,
            channel_id,
            source_node_id,
            Some(row_data),
            old_data,
            Some(pk_data),
        )
    }

    pub fn delete(
        event_id: i64,
        header: &TableHeader,
        channel_id: impl Into<String>,
        source_node_id: impl Into<String>,
        pk_data: Vec<RowValue>,
    ) -> Self {
        Self::build(
            event_id,
            EventKind::Delete,
            header,
            channel_id,
            source_node_id,
            None,
            None,
            Some(pk_data),
        )
    }

    /// A literal SQL statement event. The statement travels as the single
    /// element of `row_data`.
    pub fn sql(
        event_id: i64,
        header: &TableHeader,
        channel_id: impl Into<String>,
        source_node_id: impl Into<String>,
        statement: impl Into<String>,
    ) -> Self {
        Self::build(
            event_id,
            EventKind::Sql,
            header,
            channel_id,
            source_node_id,
            Some(vec![Some(statement.into())]),
            None,
            None,
        )
    }

    pub fn reload(
        event_id: i64,
        header: &TableHeader,
        channel_id: impl Into<String>,
        source_node_id: impl Into<String>,
        row_data: Vec<RowValue>,
    ) -> Self {
        Self::build(
            event_id,
            EventKind::Reload,
            header,
            channel_id,
            source_node_id,
            Some(row_data),
            None,
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        event_id: i64,
        kind: EventKind,
        header: &TableHeader,
        channel_id: impl Into<String>,
        source_node_id: impl Into<String>,
        row_data: Option<Vec<RowValue>>,
        old_data: Option<Vec<RowValue>>,
        pk_data: Option<Vec<RowValue>>,
    ) -> Self {
        ChangeEvent {
            event_id,
            kind,
            table: header.table.clone(),
            columns: header.columns.clone(),
            key_columns: header.key_columns.clone(),
            row_data,
            old_data,
            pk_data,
            channel_id: channel_id.into(),
            source_node_id: source_node_id.into(),
            transaction_id: None,
            external_data: None,
            create_time: Utc::now(),
        }
    }

    /// Tag the event with its source transaction. The batch builder never
    /// splits events sharing a transaction id across two batches.
    pub fn with_transaction(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    /// The header this event was captured under.
    pub fn header(&self) -> TableHeader {
        TableHeader {
            table: self.table.clone(),
            columns: self.columns.clone(),
            key_columns: self.key_columns.clone(),
        }
    }

    /// Key values identifying the target row: the captured pre-image keys
    /// when available, otherwise the keys projected out of the new row.
    pub fn key_values(&self) -> Option<Vec<RowValue>> {
        if let Some(old) = &self.old_data {
            let indexes = self.header().key_indexes()?;
            return project(old, &indexes);
        }
        if let Some(pk) = &self.pk_data {
            return Some(pk.clone());
        }
        self.new_key_values()
    }

    /// Key values projected from the new row data.
    pub fn new_key_values(&self) -> Option<Vec<RowValue>> {
        let row = self.row_data.as_ref()?;
        let indexes = self.header().key_indexes()?;
        project(row, &indexes)
    }

    /// Whether an update changed its own primary-key values. Always false
    /// when old-data capture is disabled (no pre-image to compare against).
    pub fn keys_changed(&self) -> bool {
        if self.kind != EventKind::Update || self.old_data.is_none() {
            return false;
        }
        match (self.key_values(), self.new_key_values()) {
            (Some(old), Some(new)) => old != new,
            _ => false,
        }
    }

    /// Statement text of a SQL/CREATE event.
    pub fn statement(&self) -> Option<&str> {
        match self.kind {
            EventKind::Sql | EventKind::Create => self
                .row_data
                .as_ref()
                .and_then(|r| r.first())
                .and_then(|v| v.as_deref()),
            _ => None,
        }
    }

    /// Rough on-the-wire size, used for batch byte statistics.
    pub fn approx_size(&self) -> u64 {
        let values = |data: &Option<Vec<RowValue>>| -> u64 {
            data.iter()
                .flatten()
                .map(|v| v.as_ref().map(|s| s.len() as u64 + 1).unwrap_or(1))
                .sum()
        };
        self.table.name.len() as u64
            + values(&self.row_data)
            + values(&self.old_data)
            + values(&self.pk_data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> TableHeader {
        TableHeader::new(
            TableRef::new("foo"),
            vec!["id".into(), "name".into()],
            vec!["id".into()],
        )
    }

    #[test]
    fn delete_carries_no_row_data() {
        let ev = ChangeEvent::delete(1, &header(), "default", "server", vec![Some("7".into())]);
        assert!(ev.row_data.is_none());
        assert_eq!(ev.key_values(), Some(vec![Some("7".into())]));
    }

    #[test]
    fn update_keys_come_from_old_data() {
        let ev = ChangeEvent::update(
            2,
            &header(),
            "default",
            "server",
            vec![Some("2".into()), Some("new".into())],
            Some(vec![Some("1".into()), Some("old".into())]),
            vec![Some("1".into())],
        );
        assert_eq!(ev.key_values(), Some(vec![Some("1".into())]));
        assert_eq!(ev.new_key_values(), Some(vec![Some("2".into())]));
        assert!(ev.keys_changed());
    }

    #[test]
    fn update_without_old_data_degrades_to_new_keys() {
        let ev = ChangeEvent::update(
            3,
            &header(),
            "default",
            "server",
            vec![Some("5".into()), Some("x".into())],
            None,
            vec![Some("5".into())],
        );
        assert!(!ev.keys_changed());
        assert_eq!(ev.key_values(), Some(vec![Some("5".into())]));
    }

    #[test]
    fn sql_event_exposes_statement() {
        let ev = ChangeEvent::sql(4, &header(), "default", "server", "truncate table foo");
        assert_eq!(ev.statement(), Some("truncate table foo"));
    }

    #[test]
    fn insert_projects_keys_from_row() {
        let ev = ChangeEvent::insert(
            5,
            &header(),
            "default",
            "server",
            vec![Some("9".into()), None],
        );
        assert_eq!(ev.key_values(), Some(vec![Some("9".into())]));
    }
}
