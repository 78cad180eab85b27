//! In-memory [`BatchStore`] used by tests and the offline CLI.
//!
//! Single-process stand-in for a database-backed store. One mutex guards
//! the whole state, which makes the two store atomicity guarantees
//! (sequence allocation, batch-plus-assignment persistence) trivial.

use std::collections::{BTreeMap, HashMap};

use anyhow::{bail, Result};
use async_trait::async_trait;
use sync_model::{ChangeEvent, SyncError};
use tokio::sync::Mutex;

use crate::batch::{BatchStatus, OutgoingBatch};
use crate::store::BatchStore;

#[derive(Default)]
struct Inner {
    batch_seq: i64,
    events: BTreeMap<i64, ChangeEvent>,
    /// (target node, event id) -> batch id. An event fans out to multiple
    /// target nodes; each target consumes it exactly once.
    assignments: HashMap<(String, i64), i64>,
    batches: BTreeMap<i64, OutgoingBatch>,
    members: HashMap<i64, Vec<i64>>,
    last_batch_per_node: HashMap<String, i64>,
}

#[derive(Default)]
pub struct MemoryBatchStore {
    inner: Mutex<Inner>,
}

impl MemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Batch id the given event was assigned to for a target node, if any.
    pub async fn assigned_batch(&self, node_id: &str, event_id: i64) -> Option<i64> {
        self.inner
            .lock()
            .await
            .assignments
            .get(&(node_id.to_string(), event_id))
            .copied()
    }

    pub async fn event_count(&self) -> usize {
        self.inner.lock().await.events.len()
    }
}

#[async_trait]
impl BatchStore for MemoryBatchStore {
    async fn next_batch_id(&self, _node_id: &str) -> Result<i64> {
        let mut inner = self.inner.lock().await;
        inner.batch_seq += 1;
        Ok(inner.batch_seq)
    }

    async fn insert_events(&self, events: Vec<ChangeEvent>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for event in events {
            if inner.events.contains_key(&event.event_id) {
                bail!(SyncError::Invariant(format!(
                    "event id {} already captured",
                    event.event_id
                )));
            }
            inner.events.insert(event.event_id, event);
        }
        Ok(())
    }

    async fn pending_events(
        &self,
        node_id: &str,
        channel_id: &str,
        after_event_id: i64,
        limit: usize,
    ) -> Result<Vec<ChangeEvent>> {
        let inner = self.inner.lock().await;
        let mut out = Vec::new();
        for (event_id, event) in inner.events.range(after_event_id + 1..) {
            if event.channel_id != channel_id {
                continue;
            }
            if inner
                .assignments
                .contains_key(&(node_id.to_string(), *event_id))
            {
                continue;
            }
            out.push(event.clone());
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    async fn create_batch(&self, batch: &OutgoingBatch, event_ids: &[i64]) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if inner.batches.contains_key(&batch.batch_id) {
            bail!(SyncError::Invariant(format!(
                "batch id {} already exists",
                batch.batch_id
            )));
        }
        if let Some(last) = inner.last_batch_per_node.get(&batch.node_id) {
            if batch.batch_id <= *last {
                bail!(SyncError::Invariant(format!(
                    "batch id {} is not monotonic for node {} (last {})",
                    batch.batch_id, batch.node_id, last
                )));
            }
        }
        for event_id in event_ids {
            if !inner.events.contains_key(event_id) {
                bail!(SyncError::Invariant(format!("unknown event id {event_id}")));
            }
            let key = (batch.node_id.clone(), *event_id);
            if let Some(other) = inner.assignments.get(&key) {
                bail!(SyncError::Invariant(format!(
                    "event {event_id} already assigned to batch {other} for node {}",
                    batch.node_id
                )));
            }
        }

        // All checks passed; mutate under the one lock so the batch appears
        // atomically with its assignments.
        for event_id in event_ids {
            let key = (batch.node_id.clone(), *event_id);
            inner.assignments.insert(key, batch.batch_id);
        }
        inner.members.insert(batch.batch_id, event_ids.to_vec());
        inner
            .last_batch_per_node
            .insert(batch.node_id.clone(), batch.batch_id);
        inner.batches.insert(batch.batch_id, batch.clone());
        Ok(())
    }

    async fn resendable_batches(&self, node_id: &str) -> Result<Vec<OutgoingBatch>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .batches
            .values()
            .filter(|b| b.node_id == node_id && b.status.is_resendable())
            .cloned()
            .collect())
    }

    async fn batch(&self, batch_id: i64) -> Result<Option<OutgoingBatch>> {
        Ok(self.inner.lock().await.batches.get(&batch_id).cloned())
    }

    async fn batch_events(&self, batch_id: i64) -> Result<Vec<ChangeEvent>> {
        let inner = self.inner.lock().await;
        let Some(member_ids) = inner.members.get(&batch_id) else {
            return Ok(Vec::new());
        };
        member_ids
            .iter()
            .map(|id| {
                inner
                    .events
                    .get(id)
                    .cloned()
                    .ok_or_else(|| SyncError::Invariant(format!("event {id} missing")).into())
            })
            .collect()
    }

    async fn update_status(&self, batch_id: i64, status: BatchStatus) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(batch) = inner.batches.get_mut(&batch_id) else {
            bail!("unknown batch id {batch_id}");
        };
        if matches!(status, BatchStatus::Sent | BatchStatus::Loading) {
            batch.sent_count += 1;
        }
        batch.status = status;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchType;
    use sync_model::{TableHeader, TableRef};

    fn event(id: i64, channel: &str) -> ChangeEvent {
        let header = TableHeader::new(TableRef::new("foo"), vec!["id".into()], vec!["id".into()]);
        ChangeEvent::insert(id, &header, channel, "server", vec![Some(id.to_string())])
    }

    #[tokio::test]
    async fn double_assignment_is_an_invariant_violation() {
        let store = MemoryBatchStore::new();
        store.insert_events(vec![event(1, "default")]).await.unwrap();

        let id = store.next_batch_id("client1").await.unwrap();
        let batch = OutgoingBatch::new(id, "client1", "default", BatchType::Events);
        store.create_batch(&batch, &[1]).await.unwrap();

        let id = store.next_batch_id("client1").await.unwrap();
        let second = OutgoingBatch::new(id, "client1", "default", BatchType::Events);
        let err = store.create_batch(&second, &[1]).await.unwrap_err();
        assert!(err.to_string().contains("already assigned"));
    }

    #[tokio::test]
    async fn non_monotonic_batch_id_is_rejected() {
        let store = MemoryBatchStore::new();
        let id = store.next_batch_id("client1").await.unwrap();
        let batch = OutgoingBatch::new(id, "client1", "default", BatchType::Events);
        store.create_batch(&batch, &[]).await.unwrap();

        let stale = OutgoingBatch::new(id - 1, "client1", "default", BatchType::Events);
        assert!(store.create_batch(&stale, &[]).await.is_err());
    }

    #[tokio::test]
    async fn fan_out_assigns_per_target_node() {
        let store = MemoryBatchStore::new();
        store.insert_events(vec![event(1, "default")]).await.unwrap();

        let id = store.next_batch_id("client1").await.unwrap();
        let batch = OutgoingBatch::new(id, "client1", "default", BatchType::Events);
        store.create_batch(&batch, &[1]).await.unwrap();

        // Still pending for a different target.
        let pending = store.pending_events("client2", "default", 0, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        let pending = store.pending_events("client1", "default", 0, 10).await.unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn pending_events_resume_from_cursor() {
        let store = MemoryBatchStore::new();
        store
            .insert_events((1..=5).map(|i| event(i, "default")).collect())
            .await
            .unwrap();
        let page = store.pending_events("c", "default", 2, 2).await.unwrap();
        let ids: Vec<i64> = page.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![3, 4]);
    }
}
