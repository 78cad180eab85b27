//! The batch builder: groups pending change events into outgoing batches.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use sync_model::{ChangeEvent, ChannelCache, NodeChannel};
use tracing::{debug, info, warn};

use crate::batch::{BatchStatus, BatchType, OutgoingBatch};
use crate::lock::NodeLocks;
use crate::store::BatchStore;

/// Smallest page fetched from the store while assembling batches. Keeps the
/// number of round trips down for tiny channel limits without ever pulling
/// the whole backlog.
const MIN_PAGE_SIZE: usize = 64;

/// Batch building and status transitions for outgoing replication work.
///
/// One service instance is shared per process; the per-node advisory lock
/// serializes `build_outgoing_batches` so concurrent builders cannot
/// double-assign events or allocate colliding batch ids. Different nodes
/// build in parallel.
pub struct BatchService {
    store: Arc<dyn BatchStore>,
    channels: Arc<ChannelCache>,
    locks: NodeLocks,
}

impl BatchService {
    pub fn new(store: Arc<dyn BatchStore>, channels: Arc<ChannelCache>) -> Self {
        BatchService {
            store,
            channels,
            locks: NodeLocks::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn BatchStore> {
        &self.store
    }

    /// Group every unassigned event for `node_id` into new batches, one
    /// channel at a time in processing order. Returns the batches created
    /// this cycle; an empty result means nothing was pending.
    ///
    /// Each batch is persisted atomically with its event assignments, so
    /// re-invoking after a crash neither duplicates batches nor loses
    /// events.
    pub async fn build_outgoing_batches(&self, node_id: &str) -> Result<Vec<OutgoingBatch>> {
        let _guard = self.locks.acquire(node_id).await;

        let mut channels = self.channels.node_channels(node_id).await?;
        channels.sort_by_key(|nc| nc.channel.processing_order);

        let mut created = Vec::new();
        for node_channel in &channels {
            if !node_channel.channel.enabled {
                debug!(node_id, channel = %node_channel.channel.channel_id, "channel disabled, skipping");
                continue;
            }
            if node_channel.suspended {
                warn!(node_id, channel = %node_channel.channel.channel_id, "channel is currently suspended");
                continue;
            }
            if node_channel.ignored {
                debug!(node_id, channel = %node_channel.channel.channel_id, "channel ignored for node, events stay pending");
                continue;
            }
            created.extend(self.build_for_channel(node_id, node_channel).await?);
        }
        Ok(created)
    }

    async fn build_for_channel(
        &self,
        node_id: &str,
        node_channel: &NodeChannel,
    ) -> Result<Vec<OutgoingBatch>> {
        let channel = &node_channel.channel;
        let max_rows = channel.max_batch_size.max(1);
        let mut feed = PendingFeed::new(
            self.store.as_ref(),
            node_id,
            &channel.channel_id,
            max_rows.max(MIN_PAGE_SIZE),
        );

        let mut built = Vec::new();
        loop {
            if channel.max_batch_to_send > 0 && built.len() >= channel.max_batch_to_send {
                debug!(
                    node_id,
                    channel = %channel.channel_id,
                    "reached max batches for this cycle"
                );
                break;
            }

            let mut members: Vec<ChangeEvent> = Vec::new();
            loop {
                let Some(next) = feed.peek().await? else { break };
                if members.len() >= max_rows {
                    // Never split a source transaction: keep consuming only
                    // while the next event continues the one in flight.
                    let trailing = members.last().and_then(|e| e.transaction_id.as_deref());
                    match (trailing, next.transaction_id.as_deref()) {
                        (Some(open), Some(next_txn)) if open == next_txn => {}
                        _ => break,
                    }
                }
                members.push(feed.pop().expect("peeked event vanished"));
            }
            if members.is_empty() {
                break;
            }

            let batch_id = self.store.next_batch_id(node_id).await?;
            let mut batch =
                OutgoingBatch::new(batch_id, node_id, &channel.channel_id, BatchType::Events);
            batch.event_count = members.len() as u64;
            batch.byte_count = members.iter().map(|e| e.approx_size()).sum();
            let event_ids: Vec<i64> = members.iter().map(|e| e.event_id).collect();
            self.store.create_batch(&batch, &event_ids).await?;
            info!(
                node_id,
                channel = %channel.channel_id,
                batch_id,
                rows = batch.event_count,
                "created outgoing batch"
            );
            built.push(batch);
        }
        Ok(built)
    }

    /// Batches still eligible for (re)send, ordered by channel processing
    /// order then batch id ascending. Reflects status transitions made
    /// earlier in the same session.
    pub async fn get_outgoing_batches(&self, node_id: &str) -> Result<Vec<OutgoingBatch>> {
        let mut batches = self.store.resendable_batches(node_id).await?;
        let channels = self.channels.node_channels(node_id).await?;
        let order_of = |channel_id: &str| {
            channels
                .iter()
                .find(|nc| nc.channel.channel_id == channel_id)
                .map(|nc| nc.channel.processing_order)
                .unwrap_or(i32::MAX)
        };
        batches.sort_by(|a, b| {
            order_of(&a.channel_id)
                .cmp(&order_of(&b.channel_id))
                .then(a.batch_id.cmp(&b.batch_id))
        });
        Ok(batches)
    }

    /// Events of one batch in capture-sequence order.
    pub async fn batch_events(&self, batch_id: i64) -> Result<Vec<ChangeEvent>> {
        self.store.batch_events(batch_id).await
    }

    /// Transition after handing the batch to the transport: Sent for a
    /// first send, Loading when an errored batch goes out again for replay.
    /// Either way the batch stays resend-eligible until an explicit Ok
    /// acknowledgment.
    pub async fn mark_outgoing_batch_sent(&self, batch: &OutgoingBatch) -> Result<()> {
        let current = self.store.batch(batch.batch_id).await?;
        let status = match current.map(|b| b.status) {
            Some(BatchStatus::Error) => BatchStatus::Loading,
            _ => BatchStatus::Sent,
        };
        self.set_batch_status(batch.batch_id, status).await
    }

    /// Acknowledgment or administrative transition. Forcing Ok removes the
    /// batch from future resend candidates permanently.
    pub async fn set_batch_status(&self, batch_id: i64, status: BatchStatus) -> Result<()> {
        info!(batch_id, status = status.as_str(), "batch status change");
        self.store.update_status(batch_id, status).await
    }

    /// Insert a full-reload batch directly, bypassing channel grouping. The
    /// caller supplies the snapshot events; the batch enters the ordinary
    /// status state machine.
    pub async fn insert_initial_load_batch(
        &self,
        node_id: &str,
        channel_id: &str,
        events: Vec<ChangeEvent>,
    ) -> Result<OutgoingBatch> {
        let _guard = self.locks.acquire(node_id).await;

        let event_ids: Vec<i64> = events.iter().map(|e| e.event_id).collect();
        let byte_count = events.iter().map(|e| e.approx_size()).sum();
        self.store.insert_events(events).await?;

        let batch_id = self.store.next_batch_id(node_id).await?;
        let mut batch = OutgoingBatch::new(batch_id, node_id, channel_id, BatchType::InitialLoad);
        batch.event_count = event_ids.len() as u64;
        batch.byte_count = byte_count;
        self.store.create_batch(&batch, &event_ids).await?;
        info!(node_id, channel_id, batch_id, rows = batch.event_count, "created initial load batch");
        Ok(batch)
    }
}

/// Cursor-paged view of one channel's pending events with single-event
/// lookahead, so the builder can see whether the next event continues the
/// transaction in flight without materializing the backlog.
struct PendingFeed<'a> {
    store: &'a dyn BatchStore,
    node_id: &'a str,
    channel_id: &'a str,
    cursor: i64,
    page_size: usize,
    buffer: VecDeque<ChangeEvent>,
    exhausted: bool,
}

impl<'a> PendingFeed<'a> {
    fn new(store: &'a dyn BatchStore, node_id: &'a str, channel_id: &'a str, page_size: usize) -> Self {
        PendingFeed {
            store,
            node_id,
            channel_id,
            cursor: 0,
            page_size,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    async fn fill(&mut self) -> Result<()> {
        if !self.buffer.is_empty() || self.exhausted {
            return Ok(());
        }
        let page = self
            .store
            .pending_events(self.node_id, self.channel_id, self.cursor, self.page_size)
            .await?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.cursor = last.event_id;
        }
        self.buffer.extend(page);
        Ok(())
    }

    async fn peek(&mut self) -> Result<Option<&ChangeEvent>> {
        self.fill().await?;
        Ok(self.buffer.front())
    }

    fn pop(&mut self) -> Option<ChangeEvent> {
        self.buffer.pop_front()
    }
}
