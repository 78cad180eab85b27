//! Channels: named lanes that partition and prioritize change events.
//!
//! Channel definitions live with the configuration collaborator; the engine
//! consumes them through [`ChannelSource`] and keeps a TTL-refreshed
//! snapshot in an explicitly owned [`ChannelCache`] that is passed by
//! reference to both the batch builder and the data loader.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

/// Batching/ordering policy for one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: String,
    /// Lower runs first when building and sending batches.
    #[serde(default)]
    pub processing_order: i32,
    /// Row-count bound for one batch. A batch may exceed this by at most one
    /// source transaction's worth of rows (transactions are never split).
    pub max_batch_size: usize,
    /// Batches to build per channel per routing cycle; 0 means unbounded.
    #[serde(default)]
    pub max_batch_to_send: usize,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Channel {
    pub fn new(channel_id: impl Into<String>, max_batch_size: usize) -> Self {
        Channel {
            channel_id: channel_id.into(),
            processing_order: 0,
            max_batch_size,
            max_batch_to_send: 0,
            enabled: true,
        }
    }

    pub fn processing_order(mut self, order: i32) -> Self {
        self.processing_order = order;
        self
    }

    pub fn max_batch_to_send(mut self, max: usize) -> Self {
        self.max_batch_to_send = max;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// A channel plus its per-node suspend/ignore flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeChannel {
    #[serde(flatten)]
    pub channel: Channel,
    /// Suspended channels keep their events pending until resumed.
    #[serde(default)]
    pub suspended: bool,
    /// Ignored channels are skipped for this node; events stay unassigned.
    #[serde(default)]
    pub ignored: bool,
}

impl NodeChannel {
    pub fn new(channel: Channel) -> Self {
        NodeChannel {
            channel,
            suspended: false,
            ignored: false,
        }
    }

    pub fn suspended(mut self) -> Self {
        self.suspended = true;
        self
    }

    pub fn ignored(mut self) -> Self {
        self.ignored = true;
        self
    }
}

/// Configuration boundary: fetch the current channel set for a node.
#[async_trait]
pub trait ChannelSource: Send + Sync {
    async fn node_channels(&self, node_id: &str) -> Result<Vec<NodeChannel>>;
}

/// Fixed channel definitions, served to every node. Backs tests and the
/// offline CLI; deployments wire a configuration-backed source instead.
pub struct StaticChannelSource {
    channels: Vec<NodeChannel>,
}

impl StaticChannelSource {
    pub fn new(channels: Vec<NodeChannel>) -> Self {
        StaticChannelSource { channels }
    }
}

#[async_trait]
impl ChannelSource for StaticChannelSource {
    async fn node_channels(&self, _node_id: &str) -> Result<Vec<NodeChannel>> {
        Ok(self.channels.clone())
    }
}

/// TTL-refreshed snapshot of node channels.
///
/// The cache is owned by whoever constructs the services and shared by
/// `Arc`; there is no ambient global. `invalidate` drops every snapshot so
/// the next read goes back to the source.
pub struct ChannelCache {
    source: Arc<dyn ChannelSource>,
    ttl: Duration,
    snapshots: Mutex<HashMap<String, (Instant, Vec<NodeChannel>)>>,
}

impl ChannelCache {
    pub fn new(source: Arc<dyn ChannelSource>, ttl: Duration) -> Self {
        ChannelCache {
            source,
            ttl,
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    pub async fn node_channels(&self, node_id: &str) -> Result<Vec<NodeChannel>> {
        let mut snapshots = self.snapshots.lock().await;
        if let Some((loaded, channels)) = snapshots.get(node_id) {
            if loaded.elapsed() < self.ttl {
                return Ok(channels.clone());
            }
        }
        debug!(node_id, "refreshing channel snapshot");
        let channels = self.source.node_channels(node_id).await?;
        snapshots.insert(node_id.to_string(), (Instant::now(), channels.clone()));
        Ok(channels)
    }

    pub async fn invalidate(&self) {
        self.snapshots.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChannelSource for CountingSource {
        async fn node_channels(&self, _node_id: &str) -> Result<Vec<NodeChannel>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![NodeChannel::new(Channel::new("default", 100))])
        }
    }

    #[tokio::test]
    async fn cache_serves_snapshot_within_ttl() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let cache = ChannelCache::new(source.clone(), Duration::from_secs(60));
        cache.node_channels("n1").await.unwrap();
        cache.node_channels("n1").await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_refresh() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let cache = ChannelCache::new(source.clone(), Duration::from_secs(60));
        cache.node_channels("n1").await.unwrap();
        cache.invalidate().await;
        cache.node_channels("n1").await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn nodes_are_cached_independently() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let cache = ChannelCache::new(source.clone(), Duration::from_secs(60));
        cache.node_channels("n1").await.unwrap();
        cache.node_channels("n2").await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }
}
