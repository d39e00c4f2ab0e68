//! Proxy control endpoint: per-node published snapshots.
//!
//! The synchronizer only talks to the endpoint through [`SnapshotStore`], so
//! tests can swap in a recording or failing implementation per case.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use crate::xds::snapshot::Snapshot;
use crate::Result;

/// Capacity of the published-version feed.
const UPDATE_CHANNEL_CAPACITY: usize = 128;

/// Published snapshot state keyed by node identity.
///
/// `set_snapshot` must be idempotent for identical `(node_id, snapshot)`.
#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    /// The snapshot currently published for `node_id`, if any.
    async fn get_snapshot(&self, node_id: &str) -> Result<Option<Snapshot>>;

    /// Replace the snapshot published for `node_id`.
    async fn set_snapshot(&self, node_id: &str, snapshot: Snapshot) -> Result<()>;
}

/// Broadcast payload announcing a newly published snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotUpdate {
    pub node_id: String,
    pub version: String,
}

/// In-process control endpoint, suitable for an xDS server to serve from.
#[derive(Debug)]
pub struct InMemorySnapshotStore {
    snapshots: DashMap<String, Arc<Snapshot>>,
    update_tx: broadcast::Sender<SnapshotUpdate>,
}

impl Default for InMemorySnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        let (update_tx, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self { snapshots: DashMap::new(), update_tx }
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<SnapshotUpdate> {
        self.update_tx.subscribe()
    }

    /// Shared handle to the published snapshot without cloning its resources.
    pub fn current(&self, node_id: &str) -> Option<Arc<Snapshot>> {
        self.snapshots.get(node_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.snapshots.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn clear(&self, node_id: &str) -> bool {
        self.snapshots.remove(node_id).is_some()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn get_snapshot(&self, node_id: &str) -> Result<Option<Snapshot>> {
        Ok(self.current(node_id).map(|snapshot| snapshot.as_ref().clone()))
    }

    async fn set_snapshot(&self, node_id: &str, snapshot: Snapshot) -> Result<()> {
        let unchanged = self
            .snapshots
            .get(node_id)
            .map(|existing| existing.as_ref() == &snapshot)
            .unwrap_or(false);
        if unchanged {
            debug!(node_id = %node_id, version = %snapshot.version(), "Snapshot unchanged, skipping publish");
            return Ok(());
        }

        let version = snapshot.version().to_string();
        self.snapshots.insert(node_id.to_string(), Arc::new(snapshot));
        debug!(node_id = %node_id, version = %version, "Published snapshot");

        // No subscribers is fine; the snapshot is still stored.
        let _ = self.update_tx.send(SnapshotUpdate { node_id: node_id.to_string(), version });
        Ok(())
    }
}
