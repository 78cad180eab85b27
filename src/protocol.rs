//! Batch stream protocol.
//!
//! A batch travels as CSV records, one token per line:
//!
//! ```text
//! batch,42
//! node,server
//! channel,default
//! table,customer
//! keys,id
//! columns,id,name,city
//! insert,1,ann,oslo
//! update,1,anne,oslo,1
//! delete,1
//! commit,42
//! ```
//!
//! NULL is encoded as `\N` and a literal backslash is doubled; an empty
//! field stays an empty string, distinct from NULL. Update records carry
//! the new values followed by the key values identifying the target row.

use std::io::{Read, Write};

use anyhow::{bail, Context, Result};
use data_loader::BinaryEncoding;
use outgoing_batch::OutgoingBatch;
use sync_model::{ChangeEvent, EventKind, RowValue, SyncError, TableHeader, TableRef};

const NULL_TOKEN: &str = "\\N";

pub fn encode_value(value: &RowValue) -> String {
    match value {
        None => NULL_TOKEN.to_string(),
        Some(s) => s.replace('\\', "\\\\"),
    }
}

pub fn decode_value(field: &str) -> RowValue {
    if field == NULL_TOKEN {
        None
    } else {
        Some(field.replace("\\\\", "\\"))
    }
}

/// Serializes batches onto a byte stream.
pub struct StreamWriter<W: Write> {
    out: csv::Writer<W>,
    /// Header last announced on the stream; re-announced when it changes.
    current: Option<TableHeader>,
}

impl<W: Write> StreamWriter<W> {
    pub fn new(writer: W) -> Self {
        StreamWriter {
            out: csv::WriterBuilder::new()
                .has_headers(false)
                .flexible(true)
                .from_writer(writer),
            current: None,
        }
    }

    pub fn begin_batch(&mut self, batch: &OutgoingBatch, source_node_id: &str) -> Result<()> {
        self.out.write_record(["batch", &batch.batch_id.to_string()])?;
        self.out.write_record(["node", source_node_id])?;
        self.out.write_record(["channel", &batch.channel_id])?;
        self.current = None;
        Ok(())
    }

    pub fn binary(&mut self, encoding: BinaryEncoding) -> Result<()> {
        let token = match encoding {
            BinaryEncoding::None => "none",
            BinaryEncoding::Base64 => "base64",
            BinaryEncoding::Hex => "hex",
        };
        self.out.write_record(["binary", token])?;
        Ok(())
    }

    pub fn write_event(&mut self, event: &ChangeEvent) -> Result<()> {
        let header = event.header();
        if self.current.as_ref() != Some(&header) {
            self.write_header(&header)?;
            self.current = Some(header);
        }

        match event.kind {
            EventKind::Insert | EventKind::Reload => {
                let row = event
                    .row_data
                    .as_ref()
                    .ok_or_else(|| SyncError::Protocol("insert event without row data".into()))?;
                self.write_row("insert", row, &[])?;
            }
            EventKind::Update => {
                let row = event
                    .row_data
                    .as_ref()
                    .ok_or_else(|| SyncError::Protocol("update event without row data".into()))?;
                let keys = event
                    .key_values()
                    .ok_or_else(|| SyncError::Protocol("update event without key values".into()))?;
                self.write_row("update", row, &keys)?;
            }
            EventKind::Delete => {
                let keys = event
                    .key_values()
                    .ok_or_else(|| SyncError::Protocol("delete event without key values".into()))?;
                self.write_row("delete", &keys, &[])?;
            }
            EventKind::Sql | EventKind::Create => {
                let sql = event
                    .statement()
                    .ok_or_else(|| SyncError::Protocol("sql event without a statement".into()))?;
                self.out.write_record(["sql", sql])?;
            }
        }
        Ok(())
    }

    pub fn commit(&mut self, batch_id: i64) -> Result<()> {
        self.out.write_record(["commit", &batch_id.to_string()])?;
        self.out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> Result<W> {
        self.out
            .into_inner()
            .map_err(|e| anyhow::anyhow!("flushing stream writer: {e}"))
    }

    fn write_header(&mut self, header: &TableHeader) -> Result<()> {
        self.out
            .write_record(["table", &header.table.qualified_name()])?;
        let mut keys = vec!["keys".to_string()];
        keys.extend(header.key_columns.iter().cloned());
        self.out.write_record(&keys)?;
        let mut columns = vec!["columns".to_string()];
        columns.extend(header.columns.iter().cloned());
        self.out.write_record(&columns)?;
        Ok(())
    }

    fn write_row(&mut self, token: &str, values: &[RowValue], keys: &[RowValue]) -> Result<()> {
        let mut record = vec![token.to_string()];
        record.extend(values.iter().map(encode_value));
        record.extend(keys.iter().map(encode_value));
        self.out.write_record(&record)?;
        Ok(())
    }
}

/// One stream record the loader acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Binary(BinaryEncoding),
    Table(TableHeader),
    Event(ChangeEvent),
}

/// One batch's worth of stream content.
#[derive(Debug, Clone)]
pub struct BatchStream {
    pub batch_id: i64,
    pub source_node_id: String,
    pub channel_id: String,
    pub items: Vec<StreamItem>,
}

/// Parse a complete stream. Every `batch` must be closed by a `commit`
/// carrying the same id; rows arriving before their table header are
/// rejected.
pub fn read_stream<R: Read>(reader: R) -> Result<Vec<BatchStream>> {
    let mut csv = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);

    let mut batches = Vec::new();
    let mut open: Option<BatchStream> = None;
    let mut pending_table: Option<String> = None;
    let mut pending_keys: Option<Vec<String>> = None;
    let mut header: Option<TableHeader> = None;
    let mut line: i64 = 0;

    for record in csv.records() {
        let record = record.context("malformed stream record")?;
        line += 1;
        let token = record.get(0).unwrap_or_default().to_string();
        let rest: Vec<&str> = record.iter().skip(1).collect();

        match token.as_str() {
            "batch" => {
                if let Some(unfinished) = &open {
                    bail!(SyncError::Protocol(format!(
                        "batch {} started before batch {} committed",
                        first_field(&rest)?,
                        unfinished.batch_id
                    )));
                }
                open = Some(BatchStream {
                    batch_id: first_field(&rest)?.parse()?,
                    source_node_id: String::new(),
                    channel_id: String::new(),
                    items: Vec::new(),
                });
                header = None;
                pending_table = None;
                pending_keys = None;
            }
            "node" => open_mut(&mut open)?.source_node_id = first_field(&rest)?.to_string(),
            "channel" => open_mut(&mut open)?.channel_id = first_field(&rest)?.to_string(),
            "binary" => {
                let encoding: BinaryEncoding = first_field(&rest)?.parse()?;
                open_mut(&mut open)?.items.push(StreamItem::Binary(encoding));
            }
            "table" => {
                pending_table = Some(first_field(&rest)?.to_string());
                pending_keys = None;
                header = None;
            }
            "keys" => pending_keys = Some(rest.iter().map(|s| s.to_string()).collect()),
            "columns" => {
                let table = pending_table.clone().ok_or_else(|| {
                    SyncError::Protocol(format!("columns before table at line {line}"))
                })?;
                let keys = pending_keys.clone().ok_or_else(|| {
                    SyncError::Protocol(format!("columns before keys at line {line}"))
                })?;
                let parsed = TableHeader::new(
                    parse_table(&table),
                    rest.iter().map(|s| s.to_string()).collect(),
                    keys,
                );
                open_mut(&mut open)?
                    .items
                    .push(StreamItem::Table(parsed.clone()));
                header = Some(parsed);
            }
            "insert" | "update" | "delete" | "sql" => {
                let event = parse_row(
                    &token,
                    &rest,
                    header.as_ref(),
                    open.as_ref(),
                    line,
                )?;
                open_mut(&mut open)?.items.push(StreamItem::Event(event));
            }
            "commit" => {
                let batch = open.take().ok_or_else(|| {
                    SyncError::Protocol(format!("commit without a batch at line {line}"))
                })?;
                let id: i64 = first_field(&rest)?.parse()?;
                if id != batch.batch_id {
                    bail!(SyncError::Protocol(format!(
                        "commit {id} does not match batch {}",
                        batch.batch_id
                    )));
                }
                batches.push(batch);
            }
            other => bail!(SyncError::Protocol(format!(
                "unknown stream token {other:?} at line {line}"
            ))),
        }
    }

    if let Some(unfinished) = open {
        bail!(SyncError::Protocol(format!(
            "stream ended with batch {} uncommitted",
            unfinished.batch_id
        )));
    }
    Ok(batches)
}

fn parse_row(
    token: &str,
    fields: &[&str],
    header: Option<&TableHeader>,
    batch: Option<&BatchStream>,
    line: i64,
) -> Result<ChangeEvent> {
    let batch =
        batch.ok_or_else(|| SyncError::Protocol(format!("row outside a batch at line {line}")))?;

    if token == "sql" {
        let header = header.cloned().unwrap_or_else(|| {
            TableHeader::new(TableRef::new(""), Vec::new(), Vec::new())
        });
        let statement = fields
            .first()
            .ok_or_else(|| SyncError::Protocol(format!("empty sql record at line {line}")))?;
        return Ok(ChangeEvent::sql(
            line,
            &header,
            &batch.channel_id,
            &batch.source_node_id,
            *statement,
        ));
    }

    let header = header.ok_or_else(|| {
        SyncError::Protocol(format!("row before any table header at line {line}"))
    })?;
    let ncols = header.columns.len();
    let nkeys = header.key_columns.len();
    let values: Vec<RowValue> = fields.iter().map(|f| decode_value(f)).collect();

    match token {
        "insert" => {
            expect_arity(token, values.len(), ncols, line)?;
            Ok(ChangeEvent::insert(
                line,
                header,
                &batch.channel_id,
                &batch.source_node_id,
                values,
            ))
        }
        "update" => {
            expect_arity(token, values.len(), ncols + nkeys, line)?;
            let keys = values[ncols..].to_vec();
            Ok(ChangeEvent::update(
                line,
                header,
                &batch.channel_id,
                &batch.source_node_id,
                values[..ncols].to_vec(),
                None,
                keys,
            ))
        }
        "delete" => {
            expect_arity(token, values.len(), nkeys, line)?;
            Ok(ChangeEvent::delete(
                line,
                header,
                &batch.channel_id,
                &batch.source_node_id,
                values,
            ))
        }
        other => bail!(SyncError::Protocol(format!("unexpected row token {other}"))),
    }
}

fn expect_arity(token: &str, got: usize, want: usize, line: i64) -> Result<()> {
    if got != want {
        bail!(SyncError::Protocol(format!(
            "{token} record at line {line} has {got} fields, expected {want}"
        )));
    }
    Ok(())
}

fn parse_table(qualified: &str) -> TableRef {
    let parts: Vec<&str> = qualified.split('.').collect();
    match parts.as_slice() {
        [schema, name] => TableRef::with_schema(*schema, *name),
        [catalog, schema, name] => TableRef {
            catalog: Some(catalog.to_string()),
            schema: Some(schema.to_string()),
            name: name.to_string(),
        },
        _ => TableRef::new(qualified),
    }
}

fn first_field<'a>(fields: &[&'a str]) -> Result<&'a str> {
    fields
        .first()
        .copied()
        .ok_or_else(|| SyncError::Protocol("record missing its argument".into()).into())
}

fn open_mut(open: &mut Option<BatchStream>) -> Result<&mut BatchStream> {
    open.as_mut()
        .ok_or_else(|| SyncError::Protocol("record outside a batch".into()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use outgoing_batch::BatchType;

    fn header() -> TableHeader {
        TableHeader::new(
            TableRef::new("customer"),
            vec!["id".into(), "name".into()],
            vec!["id".into()],
        )
    }

    fn round_trip(events: Vec<ChangeEvent>) -> BatchStream {
        let batch = OutgoingBatch::new(42, "store-001", "default", BatchType::Events);
        let mut w = StreamWriter::new(Vec::new());
        w.begin_batch(&batch, "server").unwrap();
        for ev in &events {
            w.write_event(ev).unwrap();
        }
        w.commit(42).unwrap();
        let bytes = w.into_inner().unwrap();

        let mut parsed = read_stream(bytes.as_slice()).unwrap();
        assert_eq!(parsed.len(), 1);
        parsed.remove(0)
    }

    #[test]
    fn null_and_empty_survive_the_wire() {
        let ev = ChangeEvent::insert(
            1,
            &header(),
            "default",
            "server",
            vec![Some("1".into()), None],
        );
        let ev2 = ChangeEvent::insert(
            2,
            &header(),
            "default",
            "server",
            vec![Some("2".into()), Some("".into())],
        );
        let batch = round_trip(vec![ev, ev2]);

        let rows: Vec<&ChangeEvent> = batch
            .items
            .iter()
            .filter_map(|i| match i {
                StreamItem::Event(e) => Some(e),
                _ => None,
            })
            .collect();
        assert_eq!(rows[0].row_data, Some(vec![Some("1".into()), None]));
        assert_eq!(rows[1].row_data, Some(vec![Some("2".into()), Some("".into())]));
    }

    #[test]
    fn backslashes_are_escaped() {
        assert_eq!(encode_value(&Some("a\\b".into())), "a\\\\b");
        assert_eq!(decode_value("a\\\\b"), Some("a\\b".into()));
        assert_eq!(encode_value(&None), "\\N");
        assert_eq!(decode_value("\\N"), None);
        // A literal backslash-N value is distinguishable from NULL.
        assert_eq!(decode_value(&encode_value(&Some("\\N".into()))), Some("\\N".into()));
    }

    #[test]
    fn update_splits_values_and_keys() {
        let ev = ChangeEvent::update(
            1,
            &header(),
            "default",
            "server",
            vec![Some("1".into()), Some("anne".into())],
            None,
            vec![Some("1".into())],
        );
        let batch = round_trip(vec![ev]);
        let StreamItem::Event(parsed) = &batch.items[1] else {
            panic!("expected event after header");
        };
        assert_eq!(parsed.kind, EventKind::Update);
        assert_eq!(parsed.row_data, Some(vec![Some("1".into()), Some("anne".into())]));
        assert_eq!(parsed.pk_data, Some(vec![Some("1".into())]));
    }

    #[test]
    fn commit_id_mismatch_is_rejected() {
        let batch = OutgoingBatch::new(1, "store-001", "default", BatchType::Events);
        let mut w = StreamWriter::new(Vec::new());
        w.begin_batch(&batch, "server").unwrap();
        w.commit(2).unwrap();
        let bytes = w.into_inner().unwrap();
        assert!(read_stream(bytes.as_slice()).is_err());
    }

    #[test]
    fn uncommitted_batch_is_rejected() {
        let batch = OutgoingBatch::new(1, "store-001", "default", BatchType::Events);
        let mut w = StreamWriter::new(Vec::new());
        w.begin_batch(&batch, "server").unwrap();
        w.write_event(&ChangeEvent::insert(
            1,
            &header(),
            "default",
            "server",
            vec![Some("1".into()), None],
        ))
        .unwrap();
        let bytes = w.into_inner().unwrap();
        assert!(read_stream(bytes.as_slice()).is_err());
    }

    #[test]
    fn header_is_reannounced_only_on_change() {
        let other = TableHeader::new(
            TableRef::new("sale"),
            vec!["id".into()],
            vec!["id".into()],
        );
        let batch = round_trip(vec![
            ChangeEvent::insert(1, &header(), "default", "server", vec![Some("1".into()), None]),
            ChangeEvent::insert(2, &header(), "default", "server", vec![Some("2".into()), None]),
            ChangeEvent::insert(3, &other, "default", "server", vec![Some("9".into())]),
        ]);
        let tables = batch
            .items
            .iter()
            .filter(|i| matches!(i, StreamItem::Table(_)))
            .count();
        assert_eq!(tables, 2);
    }
}
