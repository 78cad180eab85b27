//! Per-batch load session state.

use std::collections::HashMap;

use sync_model::{RowValue, TableHeader};

use crate::stats::LoadStatistics;
use crate::template::TableTemplate;

/// How binary column values are encoded on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BinaryEncoding {
    #[default]
    None,
    Base64,
    Hex,
}

impl std::str::FromStr for BinaryEncoding {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(BinaryEncoding::None),
            "base64" => Ok(BinaryEncoding::Base64),
            "hex" => Ok(BinaryEncoding::Hex),
            other => anyhow::bail!("unsupported binary encoding: {other}"),
        }
    }
}

/// Session state for one incoming batch: the active table, the per-session
/// template cache (never shared across concurrent loads, so no locking in
/// the hot path), batch counters, and the old-row cache consumed by
/// additive/merge filters.
pub struct LoadContext {
    pub batch_id: i64,
    pub source_node_id: String,
    pub encoding: BinaryEncoding,
    pub stats: LoadStatistics,
    templates: HashMap<String, TableTemplate>,
    active: Option<TableHeader>,
    old_rows: HashMap<String, Vec<RowValue>>,
}

impl LoadContext {
    pub fn new(batch_id: i64, source_node_id: impl Into<String>) -> Self {
        LoadContext {
            batch_id,
            source_node_id: source_node_id.into(),
            encoding: BinaryEncoding::None,
            stats: LoadStatistics::default(),
            templates: HashMap::new(),
            active: None,
            old_rows: HashMap::new(),
        }
    }

    /// Switch the active table. The template is cached per session; the
    /// header is replaced every time because the stream may re-announce the
    /// same table with a different column subset.
    pub fn activate(&mut self, header: TableHeader, template: TableTemplate) {
        self.templates
            .insert(header.table.qualified_name(), template);
        self.active = Some(header);
    }

    pub fn deactivate(&mut self) {
        self.active = None;
    }

    pub fn active_header(&self) -> Option<&TableHeader> {
        self.active.as_ref()
    }

    pub fn active_template(&self) -> Option<&TableTemplate> {
        let header = self.active.as_ref()?;
        self.templates.get(&header.table.qualified_name())
    }

    pub fn cached_template(&self, qualified_name: &str) -> Option<&TableTemplate> {
        self.templates.get(qualified_name)
    }

    /// Remember the pre-image of the row being applied, for filters that
    /// merge old and new values.
    pub fn cache_old_row(&mut self, qualified_name: &str, row: Vec<RowValue>) {
        self.old_rows.insert(qualified_name.to_string(), row);
    }

    pub fn old_row(&self, qualified_name: &str) -> Option<&Vec<RowValue>> {
        self.old_rows.get(qualified_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_model::{ColumnDef, TableRef, TableSchema};

    #[test]
    fn activate_caches_template_per_table() {
        let schema = TableSchema::new(
            TableRef::new("t"),
            vec![ColumnDef::numeric("id")],
            vec!["id".into()],
        );
        let template = TableTemplate::new(schema.clone()).unwrap();
        let mut ctx = LoadContext::new(1, "server");
        ctx.activate(schema.header(), template);

        assert!(ctx.active_template().is_some());
        ctx.deactivate();
        assert!(ctx.active_template().is_none());
        assert!(ctx.cached_template("t").is_some());
    }

    #[test]
    fn binary_encoding_parses_stream_tokens() {
        assert_eq!("none".parse::<BinaryEncoding>().unwrap(), BinaryEncoding::None);
        assert_eq!("BASE64".parse::<BinaryEncoding>().unwrap(), BinaryEncoding::Base64);
        assert!("zip".parse::<BinaryEncoding>().is_err());
    }
}
