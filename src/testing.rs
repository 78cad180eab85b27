//! Shared fixtures for integration tests and examples.

use std::sync::Arc;
use std::time::Duration;

use data_loader::MemoryDialect;
use outgoing_batch::{BatchService, MemoryBatchStore};
use sync_model::{
    ChangeEvent, ChannelCache, ColumnDef, NodeChannel, RowValue, StaticChannelSource, TableHeader,
    TableRef, TableSchema,
};

pub fn customer_schema() -> TableSchema {
    TableSchema::new(
        TableRef::new("customer"),
        vec![
            ColumnDef::numeric("id").required(),
            ColumnDef::character("name").required(),
            ColumnDef::character("city"),
        ],
        vec!["id".into()],
    )
}

pub fn customer_header() -> TableHeader {
    customer_schema().header()
}

pub fn val(s: &str) -> RowValue {
    Some(s.to_string())
}

pub fn customer_insert(event_id: i64, channel: &str, id: &str, name: &str) -> ChangeEvent {
    ChangeEvent::insert(
        event_id,
        &customer_header(),
        channel,
        "server",
        vec![val(id), val(name), None],
    )
}

/// A batch service over the in-memory store with a fixed channel set.
pub fn service(channels: Vec<NodeChannel>) -> (BatchService, Arc<MemoryBatchStore>) {
    let store = Arc::new(MemoryBatchStore::new());
    let cache = Arc::new(ChannelCache::new(
        Arc::new(StaticChannelSource::new(channels)),
        Duration::from_secs(60),
    ));
    (BatchService::new(store.clone(), cache), store)
}

/// An in-memory target with the customer table created.
pub fn customer_target() -> Arc<MemoryDialect> {
    let dialect = Arc::new(MemoryDialect::new());
    dialect.create_table(customer_schema());
    dialect
}
