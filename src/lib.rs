//! row-sync library
//!
//! Glue around the engine crates: the batch stream protocol, the
//! extract/load/acknowledge pipeline, and the CLI option structs.
//!
//! # Engine Crates
//!
//! - `sync-model` - change events, channels, schemas, error taxonomy
//! - `outgoing-batch` - batch building and routing for target nodes
//! - `data-loader` - incoming batch replay with fallback semantics
//!
//! # CLI Usage
//!
//! ```bash
//! # Route captured events into outgoing batches and emit the stream
//! row-sync route \
//!   --events events.json \
//!   --channels channels.yaml \
//!   --node-id store-001 \
//!   --out batches.stream
//!
//! # Replay a batch stream against the in-memory target
//! row-sync load \
//!   --stream batches.stream \
//!   --schemas schemas.yaml \
//!   --policy policy.yaml
//! ```

use std::path::PathBuf;

use clap::Parser;

pub mod pipeline;
pub mod protocol;
pub mod testing;

#[derive(Parser, Clone)]
pub struct RouteOpts {
    /// JSON file holding the captured change events to ingest
    #[arg(long)]
    pub events: PathBuf,

    /// YAML file holding the channel definitions for the target node
    #[arg(long)]
    pub channels: PathBuf,

    /// Target node to route for
    #[arg(long, default_value = "store-001", env = "ROW_SYNC_NODE_ID")]
    pub node_id: String,

    /// Node identity stamped on the outgoing stream
    #[arg(long, default_value = "server", env = "ROW_SYNC_SOURCE_NODE_ID")]
    pub source_node_id: String,

    /// Channel snapshot time-to-live in seconds
    #[arg(long, default_value_t = 60)]
    pub channel_ttl_secs: u64,

    /// Stream output file (stdout when omitted)
    #[arg(long)]
    pub out: Option<PathBuf>,
}

#[derive(Parser, Clone)]
pub struct LoadOpts {
    /// Batch stream file to replay
    #[arg(long)]
    pub stream: PathBuf,

    /// YAML file holding the target table schemas
    #[arg(long)]
    pub schemas: PathBuf,

    /// YAML conflict policy file (defaults to fallback repair everywhere,
    /// abort on missing tables)
    #[arg(long)]
    pub policy: Option<PathBuf>,

    /// Target dialect flavor: oracle-like, mysql-like, postgres-like, ansi
    #[arg(long, default_value = "ansi")]
    pub flavor: String,
}
