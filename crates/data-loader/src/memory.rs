//! In-memory [`Dialect`] implementation.
//!
//! Stands in for a real target database in tests and the offline CLI:
//! in-memory tables with primary-key uniqueness, batch-scoped snapshot
//! rollback, and a log of verbatim SQL statements.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use sync_model::{RowValue, SyncError, TableRef, TableSchema};

use crate::dialect::{ConflictKind, Dialect, DialectFlavor, DmlOp, DmlOutcome, DmlStatement};

#[derive(Clone)]
struct MemoryTable {
    schema: TableSchema,
    /// Rows keyed by their key values in schema key order; values aligned
    /// with the schema column list.
    rows: BTreeMap<Vec<RowValue>, Vec<RowValue>>,
}

#[derive(Default)]
struct Inner {
    tables: HashMap<String, MemoryTable>,
    /// Pre-batch snapshot for rollback.
    snapshot: Option<HashMap<String, MemoryTable>>,
    sql_log: Vec<String>,
    sql_rows_affected: u64,
}

pub struct MemoryDialect {
    flavor: DialectFlavor,
    inner: Mutex<Inner>,
}

impl Default for MemoryDialect {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDialect {
    pub fn new() -> Self {
        Self::with_flavor(DialectFlavor::Ansi)
    }

    pub fn with_flavor(flavor: DialectFlavor) -> Self {
        MemoryDialect {
            flavor,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn create_table(&self, schema: TableSchema) {
        let mut inner = self.lock();
        inner.tables.insert(
            schema.table.qualified_name(),
            MemoryTable {
                schema,
                rows: BTreeMap::new(),
            },
        );
    }

    pub fn row(&self, table: &TableRef, key: &[RowValue]) -> Option<Vec<RowValue>> {
        self.lock()
            .tables
            .get(&table.qualified_name())?
            .rows
            .get(key)
            .cloned()
    }

    pub fn row_count(&self, table: &TableRef) -> usize {
        self.lock()
            .tables
            .get(&table.qualified_name())
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    pub fn executed_sql(&self) -> Vec<String> {
        self.lock().sql_log.clone()
    }

    /// Rows every verbatim SQL statement reports as affected.
    pub fn set_sql_rows_affected(&self, rows: u64) {
        self.lock().sql_rows_affected = rows;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory dialect poisoned")
    }
}

/// Shape a statement's column/value pairs into a full row aligned with the
/// schema, starting from `base` (all NULL for inserts, the existing row for
/// updates).
fn shape_row(
    schema: &TableSchema,
    columns: &[String],
    values: &[RowValue],
    mut base: Vec<RowValue>,
) -> Result<Vec<RowValue>> {
    for (column, value) in columns.iter().zip(values.iter()) {
        let Some(index) = schema.column_index(column) else {
            bail!(SyncError::Protocol(format!(
                "unknown column {column} on {}",
                schema.table
            )));
        };
        base[index] = value.clone();
    }
    Ok(base)
}

fn storage_key(schema: &TableSchema, row: &[RowValue]) -> Result<Vec<RowValue>> {
    let indexes = schema
        .key_indexes()
        .ok_or_else(|| SyncError::Protocol(format!("{} has no usable key", schema.table)))?;
    Ok(indexes.iter().map(|&i| row[i].clone()).collect())
}

#[async_trait]
impl Dialect for MemoryDialect {
    fn flavor(&self) -> DialectFlavor {
        self.flavor
    }

    async fn table_schema(&self, table: &TableRef) -> Result<Option<TableSchema>> {
        Ok(self
            .lock()
            .tables
            .get(&table.qualified_name())
            .map(|t| t.schema.clone()))
    }

    async fn begin_batch(&self) -> Result<()> {
        let mut inner = self.lock();
        let snapshot = inner.tables.clone();
        inner.snapshot = Some(snapshot);
        Ok(())
    }

    async fn commit_batch(&self) -> Result<()> {
        self.lock().snapshot = None;
        Ok(())
    }

    async fn rollback_batch(&self) -> Result<()> {
        let mut inner = self.lock();
        let Some(snapshot) = inner.snapshot.take() else {
            bail!("rollback without an open batch");
        };
        inner.tables = snapshot;
        Ok(())
    }

    async fn execute(&self, statement: &DmlStatement) -> Result<DmlOutcome> {
        let mut inner = self.lock();
        let qualified = statement.table.qualified_name();
        let Some(table) = inner.tables.get_mut(&qualified) else {
            bail!(SyncError::Protocol(format!(
                "statement against unknown table {qualified}"
            )));
        };

        match statement.op {
            DmlOp::Insert => {
                let row = shape_row(
                    &table.schema,
                    &statement.columns,
                    &statement.values,
                    vec![None; table.schema.columns.len()],
                )?;
                let key = storage_key(&table.schema, &row)?;
                if table.rows.contains_key(&key) {
                    return Ok(DmlOutcome::Conflict(ConflictKind::UniqueViolation));
                }
                table.rows.insert(key, row);
                Ok(DmlOutcome::Applied { rows: 1 })
            }
            DmlOp::Update => {
                let Some(existing) = table.rows.get(&statement.key_values).cloned() else {
                    return Ok(DmlOutcome::Applied { rows: 0 });
                };
                let updated =
                    shape_row(&table.schema, &statement.columns, &statement.values, existing)?;
                let new_key = storage_key(&table.schema, &updated)?;
                if new_key != statement.key_values {
                    if table.rows.contains_key(&new_key) {
                        return Ok(DmlOutcome::Conflict(ConflictKind::UniqueViolation));
                    }
                    table.rows.remove(&statement.key_values);
                }
                table.rows.insert(new_key, updated);
                Ok(DmlOutcome::Applied { rows: 1 })
            }
            DmlOp::Delete => {
                let removed = table.rows.remove(&statement.key_values).is_some();
                Ok(DmlOutcome::Applied {
                    rows: u64::from(removed),
                })
            }
        }
    }

    async fn execute_sql(&self, sql: &str) -> Result<u64> {
        let mut inner = self.lock();
        inner.sql_log.push(sql.to_string());
        Ok(inner.sql_rows_affected)
    }
}
