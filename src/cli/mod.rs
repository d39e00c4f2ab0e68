//! # Command Line Interface
//!
//! `edgesync sync` translates route sets from a file, stores them, and runs a
//! synchronization pass against an in-process control endpoint.

pub mod output;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::desired::{load_route_sets, Translator};
use crate::observability::{init_observability, log_config_info};
use crate::xds::{Caches, GraphSettings, InMemorySnapshotStore, NodeLocks, SnapshotStore, Synchronizer};
use output::{print_summary, OutputFormat, RejectedRouteSet, SnapshotSummary};

#[derive(Parser)]
#[command(name = "edgesync")]
#[command(about = "Publish route sets to Envoy as warm-then-commit snapshots")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Translate route sets and run one synchronization pass
    Sync {
        /// Node identity to publish under (defaults to EDGESYNC_NODE_ID)
        #[arg(long)]
        node_id: Option<String>,

        /// YAML file with one or more route sets
        #[arg(long)]
        file: PathBuf,

        /// Output format: table, json, or yaml
        #[arg(short, long, default_value = "table")]
        output: String,
    },

    /// Parse and translate route sets without publishing
    Check {
        /// YAML file with one or more route sets
        #[arg(long)]
        file: PathBuf,
    },
}

/// Run CLI commands
pub async fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = SyncConfig::from_env()?;
    if cli.verbose {
        config.observability.log_level = "debug".to_string();
    }

    match cli.command {
        Commands::Sync { node_id, file, output } => {
            if let Some(node_id) = node_id {
                config.node_id = node_id;
            }
            let format = OutputFormat::parse(&output)?;
            run_sync(&config, &file, format).await
        }
        Commands::Check { file } => run_check(&config, &file),
    }
}

async fn run_sync(config: &SyncConfig, file: &Path, format: OutputFormat) -> anyhow::Result<()> {
    config.validate()?;
    init_observability(&config.observability)?;
    log_config_info(config);

    let settings = GraphSettings::from_config(config).context("Failed to load default certificate")?;
    let cache = Arc::new(Caches::new(settings));
    let rejected = store_route_sets(&cache, config, file)?;

    let store = Arc::new(InMemorySnapshotStore::new());
    let synchronizer = Synchronizer::new(Arc::clone(&cache), Arc::clone(&store), config.publish_timeout());
    let locks = NodeLocks::new();
    let report = synchronizer.run_pass(locks.acquire(&config.node_id).await).await?;

    let snapshot = store
        .get_snapshot(&report.node_id)
        .await?
        .context("Control endpoint holds no snapshot after a successful pass")?;
    print_summary(&SnapshotSummary::new(&report.node_id, &snapshot, rejected), format)
}

fn run_check(config: &SyncConfig, file: &Path) -> anyhow::Result<()> {
    let cache = Caches::new(GraphSettings {
        ports: config.ports,
        ext_authz: config.ext_authz.clone(),
        default_certificate: None,
    });
    let rejected = store_route_sets(&cache, config, file)?;
    let graph = cache.to_graph()?;

    for rejected in &rejected {
        println!("rejected {}: {}", rejected.owner, rejected.reason);
    }
    println!("{} route set(s) accepted, {} resource(s) in graph", cache.len()?, graph.len());
    if !rejected.is_empty() {
        anyhow::bail!("{} route set(s) rejected", rejected.len());
    }
    Ok(())
}

/// Translate every route set in `file` into the cache. A route set that
/// fails to translate or claims another owner's domain is skipped.
fn store_route_sets(
    cache: &Caches,
    config: &SyncConfig,
    file: &Path,
) -> anyhow::Result<Vec<RejectedRouteSet>> {
    let route_sets = load_route_sets(file)
        .with_context(|| format!("Failed to load route sets from {}", file.display()))?;
    let translator = Translator::new(config.ext_authz.is_some());

    let mut rejected = Vec::new();
    for route_set in &route_sets {
        let owner = route_set.owner_key();
        let outcome = translator
            .translate(route_set)
            .and_then(|(owner, resources)| cache.put(owner, resources));
        match outcome {
            Ok(()) => info!(owner = %owner, "Route set accepted"),
            Err(e) => {
                warn!(owner = %owner, error = %e, "Route set rejected");
                rejected.push(RejectedRouteSet { owner: owner.to_string(), reason: e.to_string() });
            }
        }
    }
    Ok(rejected)
}
