//! The dialect seam: everything vendor-specific lives behind this trait.
//!
//! The writer never builds SQL strings for row operations. It hands the
//! dialect a logical [`DmlStatement`] and receives a typed [`DmlOutcome`];
//! mapping vendor error codes onto [`ConflictKind`]s is the dialect's
//! single responsibility, so conflict handling upstream is ordinary control
//! flow instead of exception parsing.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sync_model::{RowValue, TableRef, TableSchema};

/// Coarse vendor family, selected by configuration at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DialectFlavor {
    OracleLike,
    MysqlLike,
    PostgresLike,
    Ansi,
}

impl std::str::FromStr for DialectFlavor {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "oracle" | "oracle-like" => Ok(DialectFlavor::OracleLike),
            "mysql" | "mysql-like" => Ok(DialectFlavor::MysqlLike),
            "postgres" | "postgres-like" => Ok(DialectFlavor::PostgresLike),
            "ansi" => Ok(DialectFlavor::Ansi),
            other => anyhow::bail!("unknown dialect flavor: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmlOp {
    Insert,
    Update,
    Delete,
}

/// Logical description of one row operation. `columns`/`values` are the
/// written columns; `key_columns`/`key_values` identify the target row for
/// updates and deletes (empty for inserts).
#[derive(Debug, Clone, PartialEq)]
pub struct DmlStatement {
    pub op: DmlOp,
    pub table: TableRef,
    pub columns: Vec<String>,
    pub values: Vec<RowValue>,
    pub key_columns: Vec<String>,
    pub key_values: Vec<RowValue>,
}

/// Why the target rejected a statement, as classified by the dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    /// Primary-key or unique-index violation.
    UniqueViolation,
    /// Any other constraint the decision table does not cover; aborts the
    /// batch.
    ConstraintViolation(String),
}

/// Result of attempting one statement. Zero affected rows is `Applied`
/// with `rows: 0`, not a conflict; the writer decides what that means per
/// operation kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DmlOutcome {
    Applied { rows: u64 },
    Conflict(ConflictKind),
}

/// Target-database capability set consumed by the data writer.
///
/// `begin_batch`/`commit_batch`/`rollback_batch` scope one incoming batch;
/// an aborted batch must leave no partial writes behind.
#[async_trait]
pub trait Dialect: Send + Sync {
    fn flavor(&self) -> DialectFlavor;

    /// Column/key metadata for a target table; `None` means the table does
    /// not exist (schema drift).
    async fn table_schema(&self, table: &TableRef) -> Result<Option<TableSchema>>;

    async fn begin_batch(&self) -> Result<()>;
    async fn commit_batch(&self) -> Result<()>;
    async fn rollback_batch(&self) -> Result<()>;

    async fn execute(&self, statement: &DmlStatement) -> Result<DmlOutcome>;

    /// Run an embedded SQL event verbatim; returns affected rows.
    async fn execute_sql(&self, sql: &str) -> Result<u64>;
}
