//! Per-node advisory locks for the batch builder.
//!
//! Batch building for one node must never run concurrently with itself:
//! two builders could double-assign events or allocate colliding batch ids.
//! The guard is owned, so the lock releases on every exit path including
//! panics. Cluster-wide exclusion for multi-process deployments belongs to
//! the store implementation; this registry serializes within the process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct NodeLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl NodeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the node's lock. Dropping the guard releases it.
    pub async fn acquire(&self, node_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().expect("node lock registry poisoned");
            locks
                .entry(node_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_node_is_mutually_exclusive() {
        let locks = Arc::new(NodeLocks::new());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("n1").await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_nodes_do_not_block_each_other() {
        let locks = NodeLocks::new();
        let _a = locks.acquire("n1").await;
        // Must not deadlock.
        let _b = locks.acquire("n2").await;
    }
}
