//! Command-line interface for row-sync
//!
//! # Usage Examples
//!
//! ## Routing
//! ```bash
//! # Turn captured events into outgoing batches and write the stream
//! row-sync route \
//!   --events events.json \
//!   --channels channels.yaml \
//!   --node-id store-001 \
//!   --out batches.stream
//! ```
//!
//! ## Loading
//! ```bash
//! # Replay a stream against the in-memory target and print outcomes
//! row-sync load \
//!   --stream batches.stream \
//!   --schemas schemas.yaml \
//!   --policy policy.yaml \
//!   --flavor postgres-like
//! ```

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use data_loader::{
    ConflictPolicy, ConflictResolver, DataWriter, DialectFlavor, MemoryDialect,
};
use outgoing_batch::{BatchService, BatchStore, MemoryBatchStore};
use row_sync::pipeline::{extract_to_stream, load_stream};
use row_sync::protocol::read_stream;
use row_sync::{LoadOpts, RouteOpts};
use sync_model::{ChangeEvent, ChannelCache, NodeChannel, StaticChannelSource, TableSchema};
use tracing::info;

#[derive(Parser)]
#[command(name = "row-sync")]
#[command(about = "Row-level replication engine: batch routing and conflict-resolving load")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest captured events, build outgoing batches, emit the stream
    Route(RouteOpts),
    /// Replay a batch stream against the in-memory target
    Load(LoadOpts),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Route(opts) => route(opts).await,
        Commands::Load(opts) => load(opts).await,
    }
}

async fn route(opts: RouteOpts) -> Result<()> {
    let events: Vec<ChangeEvent> = serde_json::from_reader(BufReader::new(
        File::open(&opts.events).with_context(|| format!("opening {}", opts.events.display()))?,
    ))
    .context("parsing event file")?;
    let channels: Vec<NodeChannel> = serde_yaml::from_reader(BufReader::new(
        File::open(&opts.channels)
            .with_context(|| format!("opening {}", opts.channels.display()))?,
    ))
    .context("parsing channel file")?;

    info!(
        events = events.len(),
        channels = channels.len(),
        node_id = %opts.node_id,
        "routing"
    );

    let store = Arc::new(MemoryBatchStore::new());
    let cache = Arc::new(ChannelCache::new(
        Arc::new(StaticChannelSource::new(channels)),
        Duration::from_secs(opts.channel_ttl_secs),
    ));
    let service = BatchService::new(store.clone(), cache);
    store.insert_events(events).await?;

    let built = service.build_outgoing_batches(&opts.node_id).await?;
    info!(batches = built.len(), "built outgoing batches");

    let batches = match &opts.out {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("creating {}", path.display()))?;
            let (batches, _) =
                extract_to_stream(&service, &opts.node_id, &opts.source_node_id, file).await?;
            batches
        }
        None => {
            let (batches, _) = extract_to_stream(
                &service,
                &opts.node_id,
                &opts.source_node_id,
                std::io::stdout().lock(),
            )
            .await?;
            batches
        }
    };
    for batch in &batches {
        info!(
            batch_id = batch.batch_id,
            channel = %batch.channel_id,
            events = batch.event_count,
            bytes = batch.byte_count,
            "extracted"
        );
    }
    Ok(())
}

async fn load(opts: LoadOpts) -> Result<()> {
    let schemas: Vec<TableSchema> = serde_yaml::from_reader(BufReader::new(
        File::open(&opts.schemas)
            .with_context(|| format!("opening {}", opts.schemas.display()))?,
    ))
    .context("parsing schema file")?;
    let policy: ConflictPolicy = match &opts.policy {
        Some(path) => serde_yaml::from_reader(BufReader::new(
            File::open(path).with_context(|| format!("opening {}", path.display()))?,
        ))
        .context("parsing conflict policy")?,
        None => ConflictPolicy::default(),
    };
    let flavor: DialectFlavor = opts.flavor.parse()?;

    let dialect = Arc::new(MemoryDialect::with_flavor(flavor));
    for schema in schemas {
        dialect.create_table(schema);
    }

    let stream = File::open(&opts.stream)
        .with_context(|| format!("opening {}", opts.stream.display()))?;
    let batches = read_stream(BufReader::new(stream))?;
    info!(batches = batches.len(), "loading batch stream");

    let mut writer = DataWriter::new(dialect, ConflictResolver::new(policy));
    writer.open()?;
    let outcomes = load_stream(&batches, &mut writer).await?;
    writer.close()?;

    for outcome in &outcomes {
        println!(
            "{}",
            serde_json::json!({
                "batch_id": outcome.batch_id,
                "ok": outcome.ok,
                "failed_table": outcome.failed_position.as_ref().map(|f| f.table.clone()),
                "stats": outcome.stats,
            })
        );
    }
    Ok(())
}
