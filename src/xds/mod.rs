//! Envoy resource graph construction and snapshot synchronization
//!
//! - builders for listeners, routes, clusters, and HTTP filters
//! - the per-owner cache that merges them into one graph
//! - immutable snapshots and the control endpoint they are published to
//! - the warm-then-commit synchronizer

pub mod cache;
pub mod cluster;
pub mod filters;
pub mod listener;
pub mod route;
pub mod snapshot;
pub mod store;
pub mod sync;

pub use cache::{Caches, GraphSettings, OwnerKey, OwnerResources};
pub use listener::{
    build_listener, build_plain_listener, build_sni_listener, build_tls_listener, CertificatePair,
    SecretRef, SniMatch, TransportSecurity,
};
pub use route::{build_virtual_host, build_virtual_host_with_authz_context};
pub use snapshot::{Resource, ResourceGraph, ResourceKind, Snapshot};
pub use store::{InMemorySnapshotStore, SnapshotStore, SnapshotUpdate};
pub use sync::{NodeLocks, NodePermit, PassReport, PassState, Synchronizer};
