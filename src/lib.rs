//! # edgesync
//!
//! Turns declarative route sets (hosts, certificates, weighted backends,
//! authorization context) into an Envoy resource graph and publishes it to a
//! proxy node as versioned snapshots.
//!
//! ```text
//! RouteSet ─▶ Translator ─▶ Caches ─▶ Synchronizer ─▶ SnapshotStore ─▶ Envoy
//!                           (per owner)  (warm, commit)
//! ```
//!
//! A pass first publishes a warm snapshot that only adds the clusters the
//! target configuration needs, then the target itself, so routes never point
//! at a cluster the proxy does not know.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use edgesync::xds::{Caches, GraphSettings, InMemorySnapshotStore, NodeLocks, Synchronizer};
//!
//! # async fn run() -> edgesync::Result<()> {
//! let cache = Arc::new(Caches::new(GraphSettings::default()));
//! let store = Arc::new(InMemorySnapshotStore::new());
//! let synchronizer = Synchronizer::new(cache, store, Duration::from_secs(5));
//! let locks = NodeLocks::new();
//! let report = synchronizer.run_pass(locks.acquire("edge-gateway").await).await?;
//! println!("published {}", report.new_version);
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod desired;
pub mod errors;
pub mod observability;
pub mod xds;

pub use config::SyncConfig;
pub use errors::{Error, Result};

/// Application name
pub const APP_NAME: &str = "edgesync";

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
