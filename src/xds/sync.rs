//! Warm-then-commit snapshot synchronization.
//!
//! A pass reads the published snapshot and the cache once, validates, then
//! publishes an intermediate snapshot that only adds clusters before
//! publishing the target. The proxy therefore never sees a route that points
//! at a cluster it has not been told about.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, Instrument};

use crate::observability::metrics::{record_sync_pass, update_snapshot_resources};
use crate::xds::cache::Caches;
use crate::xds::snapshot::{ResourceKind, Snapshot};
use crate::xds::store::SnapshotStore;
use crate::{Error, Result};

/// Phases of one synchronization pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassState {
    Idle,
    BuildingNew,
    Warming,
    Committing,
    Failed,
}

impl fmt::Display for PassState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PassState::Idle => "idle",
            PassState::BuildingNew => "building_new",
            PassState::Warming => "warming",
            PassState::Committing => "committing",
            PassState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One lock per node identity.
#[derive(Debug, Default)]
pub struct NodeLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl NodeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other pass holds `node_id`.
    pub async fn acquire(&self, node_id: &str) -> NodePermit {
        let guard = self.lock_for(node_id).lock_owned().await;
        NodePermit { node_id: node_id.to_string(), _guard: guard }
    }

    /// Take the permit only if it is free right now.
    pub fn try_acquire(&self, node_id: &str) -> Option<NodePermit> {
        let guard = self.lock_for(node_id).try_lock_owned().ok()?;
        Some(NodePermit { node_id: node_id.to_string(), _guard: guard })
    }

    fn lock_for(&self, node_id: &str) -> Arc<Mutex<()>> {
        self.locks.entry(node_id.to_string()).or_default().value().clone()
    }
}

/// Exclusive right to publish for one node until dropped.
#[derive(Debug)]
pub struct NodePermit {
    node_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl NodePermit {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

/// Outcome of a successful pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub node_id: String,
    pub previous_version: Option<String>,
    pub warm_version: String,
    pub new_version: String,
    /// Clusters the warm snapshot introduced
    pub clusters_added: Vec<String>,
    /// Clusters kept through warm-up and evicted by the commit
    pub clusters_retained: Vec<String>,
    pub state: PassState,
}

struct PassFailure {
    phase: PassState,
    error: Error,
}

impl PassFailure {
    fn at(phase: PassState) -> impl FnOnce(Error) -> PassFailure {
        move |error| PassFailure { phase, error }
    }
}

/// Drives passes for any node against one cache and one control endpoint.
pub struct Synchronizer<S: SnapshotStore> {
    cache: Arc<Caches>,
    store: Arc<S>,
    publish_timeout: Duration,
}

impl<S: SnapshotStore> Synchronizer<S> {
    pub fn new(cache: Arc<Caches>, store: Arc<S>, publish_timeout: Duration) -> Self {
        Self { cache, store, publish_timeout }
    }

    pub fn cache(&self) -> &Arc<Caches> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Run one pass for the permit's node.
    ///
    /// Once warming has started the publish steps run on their own task,
    /// which keeps the permit: dropping this future does not stop the commit,
    /// and the next pass for the node waits for it. Errors are returned
    /// as-is; retrying is up to the caller.
    pub async fn run_pass(&self, permit: NodePermit) -> Result<PassReport> {
        let node_id = permit.node_id().to_string();
        let span = crate::xds_span!("sync_pass", node_id);
        let started = Instant::now();

        let outcome = self.execute(permit).instrument(span).await;
        let elapsed = started.elapsed().as_secs_f64();

        match outcome {
            Ok(report) => {
                record_sync_pass(&node_id, None, elapsed);
                Ok(report)
            }
            Err(failure) => {
                error!(
                    node_id = %node_id,
                    phase = %failure.phase,
                    state = %PassState::Failed,
                    error = %failure.error,
                    "Synchronization pass failed"
                );
                record_sync_pass(&node_id, Some(failure.phase.to_string().as_str()), elapsed);
                Err(failure.error)
            }
        }
    }

    async fn execute(&self, permit: NodePermit) -> std::result::Result<PassReport, PassFailure> {
        let node_id = permit.node_id().to_string();
        debug!(node_id = %node_id, phase = %PassState::BuildingNew, "Building target snapshot");

        let old = bounded(
            self.publish_timeout,
            "get_snapshot",
            self.store.get_snapshot(&node_id),
        )
        .await
        .map_err(PassFailure::at(PassState::BuildingNew))?;
        let previous_version = old.as_ref().map(|snapshot| snapshot.version().to_string());
        let old = old.unwrap_or_else(Snapshot::empty);

        let new = self
            .cache
            .to_graph()
            .map(Snapshot::from_graph)
            .map_err(PassFailure::at(PassState::BuildingNew))?;
        new.consistent().map_err(PassFailure::at(PassState::BuildingNew))?;

        debug!(node_id = %node_id, phase = %PassState::Warming, version = %new.version(), "Warming clusters");
        let warm = Snapshot::warm(&old, &new);
        warm.consistent().map_err(PassFailure::at(PassState::Warming))?;

        let old_clusters: HashSet<&str> = old.names(ResourceKind::Cluster).into_iter().collect();
        let new_clusters: HashSet<&str> = new.names(ResourceKind::Cluster).into_iter().collect();
        let clusters_added: Vec<String> = new
            .names(ResourceKind::Cluster)
            .into_iter()
            .filter(|name| !old_clusters.contains(name))
            .map(str::to_string)
            .collect();
        let clusters_retained: Vec<String> = old
            .names(ResourceKind::Cluster)
            .into_iter()
            .filter(|name| !new_clusters.contains(name))
            .map(str::to_string)
            .collect();

        let warm_version = warm.version().to_string();
        let new_version = new.version().to_string();
        let resource_counts: Vec<(ResourceKind, usize)> =
            ResourceKind::ALL.iter().map(|kind| (*kind, new.get(*kind).len())).collect();

        let store = Arc::clone(&self.store);
        let timeout = self.publish_timeout;
        let publish = tokio::spawn(
            async move {
                let node_id = permit.node_id();
                publish_snapshot(store.as_ref(), node_id, warm, timeout)
                    .await
                    .map_err(PassFailure::at(PassState::Warming))?;
                debug!(node_id = %node_id, phase = %PassState::Committing, "Committing target snapshot");
                publish_snapshot(store.as_ref(), node_id, new, timeout)
                    .await
                    .map_err(PassFailure::at(PassState::Committing))?;
                drop(permit);
                Ok(())
            }
            .in_current_span(),
        );

        publish
            .await
            .map_err(|join_error| PassFailure {
                phase: PassState::Committing,
                error: Error::internal(format!("publish task failed: {}", join_error)),
            })??;

        for (kind, count) in resource_counts {
            update_snapshot_resources(&node_id, &kind.to_string(), count);
        }
        info!(
            node_id = %node_id,
            previous_version = ?previous_version,
            version = %new_version,
            clusters_added = clusters_added.len(),
            clusters_retained = clusters_retained.len(),
            "Synchronization pass complete"
        );

        Ok(PassReport {
            node_id,
            previous_version,
            warm_version,
            new_version,
            clusters_added,
            clusters_retained,
            state: PassState::Idle,
        })
    }
}

async fn publish_snapshot<S: SnapshotStore + ?Sized>(
    store: &S,
    node_id: &str,
    snapshot: Snapshot,
    timeout: Duration,
) -> Result<()> {
    let version = snapshot.version().to_string();
    bounded(timeout, "set_snapshot", store.set_snapshot(node_id, snapshot)).await?;
    debug!(node_id = %node_id, version = %version, "Snapshot published");
    Ok(())
}

async fn bounded<T, F>(timeout: Duration, operation: &str, call: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(operation, timeout.as_millis() as u64)),
    }
}
