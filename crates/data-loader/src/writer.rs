//! The data writer: replays one incoming batch against the target.

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use sync_model::{ChangeEvent, EventKind, SyncError, TableHeader};
use tracing::{debug, info, warn};

use crate::context::{BinaryEncoding, LoadContext};
use crate::dialect::{Dialect, DmlOutcome};
use crate::filter::LoadFilter;
use crate::resolver::{ApplyFailure, ConflictResolver, Resolution};
use crate::stats::LoadStatistics;
use crate::template::TableTemplate;

/// Where a failed batch stopped, reported back to the source so the row can
/// be found in the resend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedPosition {
    pub table: String,
    /// 1-based stream line of the failing record.
    pub line: u64,
    pub event_id: i64,
}

/// Terminal result of one batch replay.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub batch_id: i64,
    pub ok: bool,
    pub stats: LoadStatistics,
    pub failed_position: Option<FailedPosition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Closed,
    Open,
    InBatch,
}

/// Applies an ordered stream of table headers and change events to the
/// target database for one batch at a time.
///
/// Lifecycle: `open → start_batch → (write_table → write_data*)* →
/// finish_batch → close`, with `abort_batch` replacing `finish_batch` after
/// a failure. The writer owns no transaction machinery itself; batch
/// atomicity is delegated to the dialect's begin/commit/rollback.
pub struct DataWriter {
    dialect: Arc<dyn Dialect>,
    resolver: ConflictResolver,
    filters: Vec<Arc<dyn LoadFilter>>,
    state: WriterState,
    context: Option<LoadContext>,
    /// Set when the active table is missing and policy says skip: every row
    /// until the next table header is dropped.
    skip_active_table: bool,
    failed: Option<FailedPosition>,
}

impl DataWriter {
    pub fn new(dialect: Arc<dyn Dialect>, resolver: ConflictResolver) -> Self {
        DataWriter {
            dialect,
            resolver,
            filters: Vec::new(),
            state: WriterState::Closed,
            context: None,
            skip_active_table: false,
            failed: None,
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn LoadFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn open(&mut self) -> Result<()> {
        self.expect(WriterState::Closed, "open")?;
        self.state = WriterState::Open;
        Ok(())
    }

    pub async fn start_batch(
        &mut self,
        batch_id: i64,
        source_node_id: impl Into<String>,
    ) -> Result<()> {
        self.expect(WriterState::Open, "start_batch")?;
        self.dialect.begin_batch().await?;
        let source_node_id = source_node_id.into();
        info!(batch_id, source_node = %source_node_id, "starting batch load");
        self.context = Some(LoadContext::new(batch_id, source_node_id));
        self.skip_active_table = false;
        self.failed = None;
        self.state = WriterState::InBatch;
        Ok(())
    }

    /// Binary-encoding announcement from the stream preamble.
    pub fn set_binary_encoding(&mut self, encoding: BinaryEncoding) -> Result<()> {
        self.ctx()?.encoding = encoding;
        Ok(())
    }

    /// Switch the active target table. A table the target does not have is
    /// schema drift: either the batch aborts or every row until the next
    /// header is skipped, per policy.
    pub async fn write_table(&mut self, header: &TableHeader) -> Result<()> {
        self.expect(WriterState::InBatch, "write_table")?;
        self.skip_active_table = false;
        self.ctx()?.stats.line_count += 1;

        let qualified = header.table.qualified_name();
        match self.dialect.table_schema(&header.table).await? {
            Some(schema) => {
                let template = TableTemplate::new(schema)?;
                self.ctx()?.activate(header.clone(), template);
                Ok(())
            }
            None => match self.resolver.resolve(&ApplyFailure::MissingTable) {
                Resolution::SkipTable => {
                    warn!(table = %qualified, "target table missing, skipping its rows");
                    let ctx = self.ctx()?;
                    ctx.deactivate();
                    self.skip_active_table = true;
                    Ok(())
                }
                _ => {
                    let (batch_id, line) = {
                        let ctx = self.ctx()?;
                        (ctx.batch_id, ctx.stats.line_count)
                    };
                    self.failed = Some(FailedPosition {
                        table: qualified.clone(),
                        line,
                        event_id: 0,
                    });
                    Err(SyncError::MissingTable {
                        table: qualified,
                        batch_id,
                    }
                    .into())
                }
            },
        }
    }

    /// Apply one change event. Errors leave the batch poisoned; the caller
    /// is expected to `abort_batch`.
    pub async fn write_data(&mut self, event: &ChangeEvent) -> Result<()> {
        self.expect(WriterState::InBatch, "write_data")?;
        {
            let size = event.approx_size();
            let ctx = self.ctx()?;
            ctx.stats.line_count += 1;
            ctx.stats.byte_count += size;
        }

        if self.skip_active_table {
            debug!(event_id = event.event_id, "row for skipped table dropped");
            return Ok(());
        }

        let result = match event.kind {
            EventKind::Insert | EventKind::Reload => self.apply_insert(event).await,
            EventKind::Update => self.apply_update(event).await,
            EventKind::Delete => self.apply_delete(event).await,
            EventKind::Sql | EventKind::Create => self.apply_sql(event).await,
        };

        if result.is_err() {
            let line = self.ctx()?.stats.line_count;
            self.failed = Some(FailedPosition {
                table: event.table.qualified_name(),
                line,
                event_id: event.event_id,
            });
        }
        result
    }

    /// Commit the open batch and hand back its statistics.
    pub async fn finish_batch(&mut self) -> Result<BatchOutcome> {
        self.expect(WriterState::InBatch, "finish_batch")?;
        self.dialect.commit_batch().await?;
        let ctx = self.take_ctx()?;
        self.state = WriterState::Open;
        info!(
            batch_id = ctx.batch_id,
            statements = ctx.stats.statement_count,
            fallback_inserts = ctx.stats.fallback_insert_count,
            fallback_updates = ctx.stats.fallback_update_count,
            "batch committed"
        );
        Ok(BatchOutcome {
            batch_id: ctx.batch_id,
            ok: true,
            stats: ctx.stats,
            failed_position: None,
        })
    }

    /// Roll the open batch back; the target must show none of its writes.
    pub async fn abort_batch(&mut self) -> Result<BatchOutcome> {
        self.expect(WriterState::InBatch, "abort_batch")?;
        self.dialect.rollback_batch().await?;
        let ctx = self.take_ctx()?;
        self.state = WriterState::Open;
        let failed_position = self.failed.take();
        warn!(
            batch_id = ctx.batch_id,
            failed_table = failed_position.as_ref().map(|f| f.table.as_str()),
            "batch rolled back"
        );
        Ok(BatchOutcome {
            batch_id: ctx.batch_id,
            ok: false,
            stats: ctx.stats,
            failed_position,
        })
    }

    pub fn close(&mut self) -> Result<()> {
        if self.state == WriterState::InBatch {
            bail!("close with a batch still open; finish or abort it first");
        }
        self.state = WriterState::Closed;
        Ok(())
    }

    async fn apply_insert(&mut self, event: &ChangeEvent) -> Result<()> {
        let (columns, template) = self.active_table(event)?;
        let mut row = event
            .row_data
            .clone()
            .ok_or_else(|| SyncError::Protocol(format!("{} event without row data", event.kind.as_str())))?;

        {
            let ctx = self
                .context
                .as_mut()
                .ok_or_else(|| anyhow!("no batch in progress"))?;
            for filter in &self.filters {
                if !filter.filter_insert(ctx, &mut row) {
                    debug!(event_id = event.event_id, "insert dropped by filter");
                    return Ok(());
                }
            }
            ctx.stats.statement_count += 1;
        }

        let stmt = template.insert_statement(&columns, row.clone())?;
        match self.dialect.execute(&stmt).await? {
            DmlOutcome::Applied { .. } => {
                self.ctx()?.stats.insert_count += 1;
                Ok(())
            }
            DmlOutcome::Conflict(kind) => {
                match self.resolver.resolve(&ApplyFailure::InsertConflict(kind.clone())) {
                    Resolution::RetryAsUpdate => {
                        debug!(table = %event.table, "row already exists, updating instead");
                        let keys = template.key_values_from(&columns, &row)?;
                        let update = template.update_statement(&columns, row, keys)?;
                        match self.dialect.execute(&update).await? {
                            DmlOutcome::Applied { rows } if rows > 0 => {
                                self.ctx()?.stats.fallback_update_count += 1;
                                Ok(())
                            }
                            outcome => Err(self.integrity(
                                event,
                                format!("fallback update did not repair insert conflict: {outcome:?}"),
                            )?),
                        }
                    }
                    _ => Err(anyhow!(
                        "insert conflict on {}: {kind:?}",
                        event.table.qualified_name()
                    )),
                }
            }
        }
    }

    async fn apply_update(&mut self, event: &ChangeEvent) -> Result<()> {
        let (columns, template) = self.active_table(event)?;
        let mut row = event
            .row_data
            .clone()
            .ok_or_else(|| SyncError::Protocol("update event without row data".into()))?;
        let mut keys = event
            .key_values()
            .ok_or_else(|| SyncError::Protocol("update event without key values".into()))?;

        {
            let qualified = event.table.qualified_name();
            let old = event.old_data.clone();
            let ctx = self
                .context
                .as_mut()
                .ok_or_else(|| anyhow!("no batch in progress"))?;
            if let Some(old) = old {
                ctx.cache_old_row(&qualified, old);
            }
            for filter in &self.filters {
                if !filter.filter_update(ctx, &mut row, &mut keys) {
                    debug!(event_id = event.event_id, "update dropped by filter");
                    return Ok(());
                }
            }
            ctx.stats.statement_count += 1;
        }

        // keys already hold the pre-image values when the event changed its
        // own key, so the statement targets the row under its old identity.
        let keys_changed = event.keys_changed()
            && self.resolver.resolve(&ApplyFailure::UpdateKeysChanged)
                == Resolution::RetryWithOldKeys;

        let stmt = template.update_statement(&columns, row.clone(), keys)?;
        match self.dialect.execute(&stmt).await? {
            DmlOutcome::Applied { rows } if rows > 0 => {
                if rows > 1 {
                    warn!(table = %event.table, rows, "update matched more than one row");
                }
                let ctx = self.ctx()?;
                if keys_changed {
                    ctx.stats.fallback_update_keys_count += 1;
                } else {
                    ctx.stats.update_count += 1;
                }
                Ok(())
            }
            DmlOutcome::Applied { .. } => {
                match self.resolver.resolve(&ApplyFailure::UpdateZeroRows) {
                    Resolution::RetryAsInsert => {
                        debug!(table = %event.table, "row to update is missing, inserting instead");
                        let insert = template.insert_statement(&columns, row)?;
                        match self.dialect.execute(&insert).await? {
                            DmlOutcome::Applied { .. } => {
                                self.ctx()?.stats.fallback_insert_count += 1;
                                Ok(())
                            }
                            DmlOutcome::Conflict(kind) => Err(self.integrity(
                                event,
                                format!("fallback insert conflicted after zero-row update: {kind:?}"),
                            )?),
                        }
                    }
                    _ => Err(anyhow!(
                        "update of {} matched no rows",
                        event.table.qualified_name()
                    )),
                }
            }
            DmlOutcome::Conflict(kind) => Err(anyhow!(
                "update conflict on {}: {kind:?}",
                event.table.qualified_name()
            )),
        }
    }

    async fn apply_delete(&mut self, event: &ChangeEvent) -> Result<()> {
        let (_, template) = self.active_table(event)?;
        let mut keys = event
            .key_values()
            .ok_or_else(|| SyncError::Protocol("delete event without key values".into()))?;

        {
            let ctx = self
                .context
                .as_mut()
                .ok_or_else(|| anyhow!("no batch in progress"))?;
            for filter in &self.filters {
                if !filter.filter_delete(ctx, &mut keys) {
                    debug!(event_id = event.event_id, "delete dropped by filter");
                    return Ok(());
                }
            }
            ctx.stats.statement_count += 1;
        }

        let stmt = template.delete_statement(keys);
        match self.dialect.execute(&stmt).await? {
            DmlOutcome::Applied { rows } if rows > 0 => {
                self.ctx()?.stats.delete_count += 1;
                Ok(())
            }
            DmlOutcome::Applied { .. } => {
                match self.resolver.resolve(&ApplyFailure::DeleteZeroRows) {
                    Resolution::Success => {
                        warn!(table = %event.table, "row to delete was already gone");
                        self.ctx()?.stats.missing_delete_count += 1;
                        Ok(())
                    }
                    _ => Err(anyhow!(
                        "delete from {} matched no rows",
                        event.table.qualified_name()
                    )),
                }
            }
            DmlOutcome::Conflict(kind) => Err(anyhow!(
                "delete conflict on {}: {kind:?}",
                event.table.qualified_name()
            )),
        }
    }

    async fn apply_sql(&mut self, event: &ChangeEvent) -> Result<()> {
        let sql = event
            .statement()
            .ok_or_else(|| SyncError::Protocol("sql event without a statement".into()))?
            .to_string();
        self.ctx()?.stats.statement_count += 1;
        let rows = self.dialect.execute_sql(&sql).await?;
        let ctx = self.ctx()?;
        ctx.stats.sql_count += 1;
        ctx.stats.sql_row_count += rows;
        Ok(())
    }

    /// Column order and template for the table the stream has activated.
    fn active_table(&self, event: &ChangeEvent) -> Result<(Vec<String>, TableTemplate)> {
        let ctx = self
            .context
            .as_ref()
            .ok_or_else(|| anyhow!("no batch in progress"))?;
        let header = ctx.active_header().ok_or_else(|| {
            SyncError::Protocol(format!(
                "row for {} arrived before any table header",
                event.table.qualified_name()
            ))
        })?;
        let template = ctx
            .active_template()
            .ok_or_else(|| anyhow!("active table {} has no template", header.table))?;
        Ok((header.columns.clone(), template.clone()))
    }

    /// A fallback that touched zero rows (or re-conflicted) means source and
    /// target disagree beyond repair for this row.
    fn integrity(&mut self, event: &ChangeEvent, detail: String) -> Result<anyhow::Error> {
        let ctx = self.ctx()?;
        Ok(SyncError::DataIntegrity {
            table: event.table.qualified_name(),
            batch_id: ctx.batch_id,
            detail,
        }
        .into())
    }

    fn ctx(&mut self) -> Result<&mut LoadContext> {
        self.context
            .as_mut()
            .ok_or_else(|| anyhow!("no batch in progress"))
    }

    fn take_ctx(&mut self) -> Result<LoadContext> {
        self.context
            .take()
            .ok_or_else(|| anyhow!("no batch in progress"))
    }

    fn expect(&self, state: WriterState, op: &str) -> Result<()> {
        if self.state != state {
            bail!("{op} called in {:?} state", self.state);
        }
        Ok(())
    }
}
