//! # tracegraph CLI
//!
//! ## Available Commands
//!
//! - `serve` - Start the HTTP server
//! - `ingest` - Upsert an extraction bundle and sync the graph store
//! - `sync` - Re-sync a tenant's graph store from the authoritative records
//! - `parity` - Compare per-type counts between the two stores
//! - `stats` - Store totals
//! - `snapshot` - Take and save a Merkle snapshot
//! - `drift` - Diff against a saved baseline and apply the drift gate
//! - `closure` - Run the two-run closure check on a bundle
//! - `traverse` - Bounded BFS from an entity
//! - `ledger` - Print a tenant's ledger
//! - `baseline` - Merkle baseline of a directory tree
//!
//! Commands that report a failed verification (`parity`, `drift`,
//! `closure`) exit with status 1.

mod commands;

use crate::config::AppConfig;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracegraph_core::CoreError;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// tracegraph - codebase knowledge graph sync and verification
#[derive(Parser, Debug)]
#[command(name = "tracegraph")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to ./tracegraph.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Which store a snapshot is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SnapshotSource {
    Authoritative,
    Graph,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start HTTP server
    Serve {
        /// Host to bind to (overrides [server] host)
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to bind to (overrides [server] port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Upsert an extraction bundle, then sync the graph store
    Ingest {
        #[arg(short, long)]
        tenant: String,

        /// Extraction bundle (JSON)
        #[arg(short, long)]
        bundle: PathBuf,
    },

    /// Merge entities and replace relationships in the graph store
    Sync {
        #[arg(short, long)]
        tenant: String,
    },

    /// Compare per-type counts between the two stores
    Parity {
        #[arg(short, long)]
        tenant: String,
    },

    /// Show store totals
    Stats {
        #[arg(short, long)]
        tenant: String,
    },

    /// Take a Merkle snapshot and save it
    Snapshot {
        #[arg(short, long)]
        tenant: String,

        #[arg(short, long, value_enum, default_value = "authoritative")]
        source: SnapshotSource,
    },

    /// Diff a baseline snapshot against the current state and apply the drift gate
    Drift {
        #[arg(short, long)]
        tenant: String,

        /// Baseline snapshot id (defaults to the latest saved snapshot)
        #[arg(long)]
        baseline: Option<String>,

        /// Current snapshot id (defaults to a fresh snapshot of the records)
        #[arg(long)]
        current: Option<String>,
    },

    /// Ingest a bundle twice and prove both runs give identical digests
    Closure {
        #[arg(short, long)]
        tenant: String,

        #[arg(short, long)]
        bundle: PathBuf,

        /// Revision the source tree is attested to be at
        #[arg(short, long)]
        revision: String,
    },

    /// Bounded breadth-first traversal
    Traverse {
        #[arg(short, long)]
        tenant: String,

        /// Start entity instance id
        #[arg(short, long)]
        start: String,

        #[arg(short, long, default_value = "3")]
        depth: usize,

        /// Minimum relationship confidence in [0, 1]
        #[arg(long)]
        min_confidence: Option<f64>,

        /// Comma-separated provenance categories
        #[arg(long)]
        provenance: Option<String>,
    },

    /// Print a tenant's ledger
    Ledger {
        #[arg(short, long)]
        tenant: String,

        /// Only the last N entries
        #[arg(short = 'n', long)]
        tail: Option<usize>,
    },

    /// Merkle baseline of a directory tree
    Baseline {
        /// Directory to hash
        path: PathBuf,
    },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

pub async fn execute(cli: Cli) -> Result<(), CoreError> {
    let config = AppConfig::load(cli.config.as_deref())?;
    let json = cli.json;

    match cli.command {
        Commands::Serve { host, port } => cmd_serve(config, host, port).await,
        Commands::Ingest { tenant, bundle } => cmd_ingest(&config, json, &tenant, &bundle),
        Commands::Sync { tenant } => cmd_sync(&config, json, &tenant),
        Commands::Parity { tenant } => cmd_parity(&config, json, &tenant),
        Commands::Stats { tenant } => cmd_stats(&config, json, &tenant),
        Commands::Snapshot { tenant, source } => cmd_snapshot(&config, json, &tenant, source),
        Commands::Drift {
            tenant,
            baseline,
            current,
        } => cmd_drift(
            &config,
            json,
            &tenant,
            baseline.as_deref(),
            current.as_deref(),
        ),
        Commands::Closure {
            tenant,
            bundle,
            revision,
        } => cmd_closure(&config, json, &tenant, &bundle, &revision),
        Commands::Traverse {
            tenant,
            start,
            depth,
            min_confidence,
            provenance,
        } => cmd_traverse(
            &config,
            json,
            &tenant,
            &start,
            depth,
            min_confidence,
            provenance.as_deref(),
        ),
        Commands::Ledger { tenant, tail } => cmd_ledger(&config, json, &tenant, tail),
        Commands::Baseline { path } => cmd_baseline(json, &path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_traverse() {
        let cli = Cli::try_parse_from([
            "tracegraph",
            "--json",
            "traverse",
            "-t",
            "acme",
            "-s",
            "STORY-1",
            "-d",
            "2",
            "--provenance",
            "explicit,structural",
        ])
        .expect("parse");
        assert!(cli.json);
        let Commands::Traverse {
            tenant,
            depth,
            provenance,
            ..
        } = cli.command
        else {
            unreachable!("parsed as traverse");
        };
        assert_eq!(tenant, "acme");
        assert_eq!(depth, 2);
        assert_eq!(provenance.as_deref(), Some("explicit,structural"));
    }

    #[test]
    fn snapshot_source_defaults_to_authoritative() {
        let cli = Cli::try_parse_from(["tracegraph", "snapshot", "-t", "acme"]).expect("parse");
        assert!(matches!(
            cli.command,
            Commands::Snapshot {
                source: SnapshotSource::Authoritative,
                ..
            }
        ));
    }

    #[test]
    fn closure_requires_revision() {
        assert!(
            Cli::try_parse_from(["tracegraph", "closure", "-t", "acme", "-b", "bundle.json"])
                .is_err()
        );
    }
}
