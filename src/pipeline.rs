//! Replication pipeline: extraction, loading, acknowledgment.
//!
//! `extract_to_stream` turns the routed backlog for one target node into a
//! batch stream and marks each batch sent. `load_stream` replays a parsed
//! stream through a [`DataWriter`], enforcing ascending per-channel batch
//! order: once a batch fails on a channel, later batches on that channel
//! are refused and stay in the resend pool. `acknowledge` feeds the load
//! outcomes back into batch status.

use std::collections::{HashMap, HashSet};
use std::io::Write;

use anyhow::Result;
use data_loader::{BatchOutcome, DataWriter};
use outgoing_batch::{BatchService, BatchStatus, OutgoingBatch};
use tracing::{info, warn};

use crate::protocol::{BatchStream, StreamItem, StreamWriter};

/// Build and serialize every outgoing batch for `node_id`, marking each as
/// sent. Returns the batches written, in channel-order then batch-id order.
pub async fn extract_to_stream<W: Write>(
    service: &BatchService,
    node_id: &str,
    source_node_id: &str,
    out: W,
) -> Result<(Vec<OutgoingBatch>, W)> {
    let batches = service.get_outgoing_batches(node_id).await?;
    let mut writer = StreamWriter::new(out);
    for batch in &batches {
        writer.begin_batch(batch, source_node_id)?;
        for event in service.batch_events(batch.batch_id).await? {
            writer.write_event(&event)?;
        }
        writer.commit(batch.batch_id)?;
        service.mark_outgoing_batch_sent(batch).await?;
    }
    info!(node_id, batches = batches.len(), "extracted outgoing batches");
    Ok((batches, writer.into_inner()?))
}

/// Replay parsed batches through the writer. A failed batch poisons its
/// channel for the rest of the stream; other channels keep loading.
pub async fn load_stream(
    batches: &[BatchStream],
    writer: &mut DataWriter,
) -> Result<Vec<BatchOutcome>> {
    let mut outcomes = Vec::new();
    let mut failed_channels: HashSet<String> = HashSet::new();
    let mut last_applied: HashMap<String, i64> = HashMap::new();

    for batch in batches {
        if failed_channels.contains(&batch.channel_id) {
            warn!(
                batch_id = batch.batch_id,
                channel = %batch.channel_id,
                "channel failed earlier in the stream, leaving batch for resend"
            );
            continue;
        }
        if let Some(&last) = last_applied.get(&batch.channel_id) {
            if batch.batch_id <= last {
                warn!(
                    batch_id = batch.batch_id,
                    last, "batch out of order on its channel, skipping"
                );
                continue;
            }
        }

        writer.start_batch(batch.batch_id, &batch.source_node_id).await?;
        let mut failed = false;
        for item in &batch.items {
            let applied = match item {
                StreamItem::Binary(encoding) => writer.set_binary_encoding(*encoding),
                StreamItem::Table(header) => writer.write_table(header).await,
                StreamItem::Event(event) => writer.write_data(event).await,
            };
            if let Err(e) = applied {
                warn!(batch_id = batch.batch_id, error = %e, "batch failed, rolling back");
                failed = true;
                break;
            }
        }

        let outcome = if failed {
            failed_channels.insert(batch.channel_id.clone());
            writer.abort_batch().await?
        } else {
            last_applied.insert(batch.channel_id.clone(), batch.batch_id);
            writer.finish_batch().await?
        };
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

/// Report load outcomes back to the batch service. Only `Ok` removes a
/// batch from the resend pool.
pub async fn acknowledge(service: &BatchService, outcomes: &[BatchOutcome]) -> Result<()> {
    for outcome in outcomes {
        let status = if outcome.ok {
            BatchStatus::Ok
        } else {
            BatchStatus::Error
        };
        service.set_batch_status(outcome.batch_id, status).await?;
        if let Some(failed) = &outcome.failed_position {
            warn!(
                batch_id = outcome.batch_id,
                table = %failed.table,
                line = failed.line,
                "batch failed during load"
            );
        }
    }
    Ok(())
}
