//! Output formatting for CLI commands
//!
//! Summaries can be printed as JSON, YAML, or a plain table.

use anyhow::{Context, Result};
use serde::Serialize;

use crate::xds::snapshot::{ResourceKind, Snapshot};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Yaml,
    Table,
}

impl OutputFormat {
    /// Parse output format from string
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "yaml" => Ok(OutputFormat::Yaml),
            "table" => Ok(OutputFormat::Table),
            _ => anyhow::bail!(
                "Unsupported output format: '{}'. Use 'json', 'yaml', or 'table'.",
                s
            ),
        }
    }
}

/// A route set that was not stored, and why
#[derive(Debug, Clone, Serialize)]
pub struct RejectedRouteSet {
    pub owner: String,
    pub reason: String,
}

/// What a node ended up with after a pass
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotSummary {
    pub node_id: String,
    pub version: String,
    pub clusters: Vec<String>,
    pub endpoints: Vec<String>,
    pub listeners: Vec<String>,
    pub routes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<RejectedRouteSet>,
}

impl SnapshotSummary {
    pub fn new(node_id: &str, snapshot: &Snapshot, rejected: Vec<RejectedRouteSet>) -> Self {
        let names = |kind| snapshot.names(kind).into_iter().map(str::to_string).collect();
        Self {
            node_id: node_id.to_string(),
            version: snapshot.version().to_string(),
            clusters: names(ResourceKind::Cluster),
            endpoints: names(ResourceKind::Endpoint),
            listeners: names(ResourceKind::Listener),
            routes: names(ResourceKind::Route),
            rejected,
        }
    }
}

/// Print a summary in the requested format
pub fn print_summary(summary: &SnapshotSummary, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(summary),
        OutputFormat::Yaml => print_yaml(summary),
        OutputFormat::Table => {
            print!("{}", render_table(summary));
            Ok(())
        }
    }
}

/// Print data as JSON
pub fn print_json<T: Serialize>(data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data).context("Failed to serialize to JSON")?;
    println!("{}", json);
    Ok(())
}

/// Print data as YAML
pub fn print_yaml<T: Serialize>(data: &T) -> Result<()> {
    let yaml = serde_yaml::to_string(data).context("Failed to serialize to YAML")?;
    println!("{}", yaml);
    Ok(())
}

fn render_table(summary: &SnapshotSummary) -> String {
    let mut out = format!("node     {}\nversion  {}\n\n", summary.node_id, summary.version);
    out.push_str(&format!("{:<10} {}\n", "KIND", "NAME"));
    let rows = [
        ("cluster", &summary.clusters),
        ("endpoint", &summary.endpoints),
        ("listener", &summary.listeners),
        ("route", &summary.routes),
    ];
    for (kind, names) in rows {
        for name in names {
            out.push_str(&format!("{:<10} {}\n", kind, name));
        }
    }
    if !summary.rejected.is_empty() {
        out.push_str("\nrejected route sets:\n");
        for rejected in &summary.rejected {
            out.push_str(&format!("  {}: {}\n", rejected.owner, rejected.reason));
        }
    }
    out
}
