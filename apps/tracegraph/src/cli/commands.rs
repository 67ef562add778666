//! # CLI Command Implementations

use super::SnapshotSource;
use crate::api::{self, AppState};
use crate::config::AppConfig;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracegraph_core::{
    Allowlist, BundlePipeline, CancellationToken, ClosureChecker, Confidence, CoreError,
    EdgeFilter, EpochContext, GraphSync, IngestionPipeline, JsonlSignalSink, LeafSource, Ledger,
    RecordStore, RedbGraph, Snapshot, SnapshotStore, TenantId, TraversalRequest, UpsertEngine,
    diff, evaluate_gate, file_tree_baseline, provenance::parse_categories, traverse,
};

// =============================================================================
// STORES
// =============================================================================

/// Everything a command needs, opened from configuration.
pub struct Stores {
    pub records: Arc<RecordStore>,
    pub graph: Arc<RedbGraph>,
    pub upsert: UpsertEngine,
    pub sync: Arc<GraphSync>,
}

impl Stores {
    /// Open both stores and the ledger. Pending ledger entries are flushed.
    pub fn open(config: &AppConfig) -> Result<Self, CoreError> {
        let storage = &config.storage;
        let records = Arc::new(RecordStore::open(&storage.records_path)?);
        let graph = Arc::new(RedbGraph::open(&storage.graph_path)?);
        let ledger = Arc::new(Ledger::new(&storage.ledger_root));
        let upsert = UpsertEngine::new(Arc::clone(&records), ledger, config.upsert)?;
        let sync = Arc::new(GraphSync::new(Arc::clone(&records), Arc::clone(&graph)));
        Ok(Self {
            records,
            graph,
            upsert,
            sync,
        })
    }

    fn leaf_source(&self, source: SnapshotSource) -> &dyn LeafSource {
        match source {
            SnapshotSource::Authoritative => self.records.as_ref(),
            SnapshotSource::Graph => self.graph.as_ref(),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CoreError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// =============================================================================
// SERVE
// =============================================================================

pub async fn cmd_serve(
    mut config: AppConfig,
    host: Option<String>,
    port: Option<u16>,
) -> Result<(), CoreError> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    let stores = Stores::open(&config)?;

    println!("tracegraph v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Configuration:");
    println!("  Listen:   {}:{}", config.server.host, config.server.port);
    println!("  Records:  {}", config.storage.records_path.display());
    println!("  Graph:    {}", config.storage.graph_path.display());
    println!("  Ledger:   {}", config.storage.ledger_root.display());
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let state = AppState::new(
        stores.records,
        stores.sync,
        Duration::from_secs(config.server.traversal_timeout_secs),
    );
    api::run_server(state, &config.server).await
}

// =============================================================================
// INGEST / SYNC
// =============================================================================

pub fn cmd_ingest(
    config: &AppConfig,
    json: bool,
    tenant: &str,
    bundle: &Path,
) -> Result<(), CoreError> {
    let tenant = TenantId::parse(tenant)?;
    let stores = Stores::open(config)?;

    // Plain ingestion attests nothing; the bundle's own revision is used.
    let reader = BundlePipeline::new(tenant.clone(), bundle, "", &stores.upsert, &stores.sync);
    let revision = reader.recorded_revision()?;
    let pipeline = BundlePipeline::new(tenant, bundle, revision.as_str(), &stores.upsert, &stores.sync);
    let summary = pipeline.run(&EpochContext::new(revision.as_str()))?;

    if json {
        return print_json(&summary);
    }
    println!("Ingested {} (epoch {})", bundle.display(), summary.epoch_id);
    println!(
        "  Entities:      {} created, {} updated, {} unchanged, {} failed",
        summary.entities.created,
        summary.entities.updated,
        summary.entities.unchanged,
        summary.entities.failed
    );
    println!(
        "  Relationships: {} created, {} updated, {} unchanged, {} failed",
        summary.relationships.created,
        summary.relationships.updated,
        summary.relationships.unchanged,
        summary.relationships.failed
    );
    println!(
        "  Graph:         {} nodes merged, {} edges synced, {} skipped",
        summary.merge.merged, summary.sync.synced, summary.sync.skipped
    );
    Ok(())
}

pub fn cmd_sync(config: &AppConfig, json: bool, tenant: &str) -> Result<(), CoreError> {
    let tenant = TenantId::parse(tenant)?;
    let stores = Stores::open(config)?;
    let (merge, sync) = stores.sync.sync_tenant(&tenant)?;

    if json {
        return print_json(&serde_json::json!({ "merge": merge, "sync": sync }));
    }
    println!("Merged:  {}", merge.merged);
    println!("Deleted: {}", sync.deleted);
    println!("Synced:  {}", sync.synced);
    println!("Skipped: {}", sync.skipped);
    for skipped in &sync.skipped_relationships {
        println!(
            "  {} (missing endpoint {})",
            skipped.instance_id, skipped.missing_endpoint
        );
    }
    Ok(())
}

// =============================================================================
// PARITY / STATS
// =============================================================================

pub fn cmd_parity(config: &AppConfig, json: bool, tenant: &str) -> Result<(), CoreError> {
    let tenant = TenantId::parse(tenant)?;
    let stores = Stores::open(config)?;
    let report = stores.sync.verify_parity(&tenant)?;

    if json {
        print_json(&report)?;
    } else {
        println!(
            "Parity for {}: {}",
            tenant,
            if report.consistent { "consistent" } else { "MISMATCH" }
        );
        for (label, mismatches) in [
            ("relationship", &report.relationship_mismatches),
            ("entity", &report.entity_mismatches),
        ] {
            for m in mismatches {
                println!(
                    "  {} {}: authoritative={} graph={}",
                    label, m.type_code, m.count_authoritative, m.count_graph
                );
            }
        }
    }

    if !report.consistent {
        return Err(CoreError::Consistency(format!(
            "stores disagree for tenant '{}'",
            tenant
        )));
    }
    Ok(())
}

pub fn cmd_stats(config: &AppConfig, json: bool, tenant: &str) -> Result<(), CoreError> {
    let tenant = TenantId::parse(tenant)?;
    let stores = Stores::open(config)?;
    let stats = stores.sync.statistics(&tenant);

    if json {
        return print_json(&stats);
    }
    for (label, counts) in [("Authoritative", &stats.authoritative), ("Graph", &stats.graph)] {
        match &counts.error {
            Some(error) => println!("{:<14} error: {}", label, error),
            None => println!(
                "{:<14} {} entities, {} relationships",
                label,
                counts.entities.unwrap_or_default(),
                counts.relationships.unwrap_or_default()
            ),
        }
    }
    Ok(())
}

// =============================================================================
// SNAPSHOT / DRIFT
// =============================================================================

pub fn cmd_snapshot(
    config: &AppConfig,
    json: bool,
    tenant: &str,
    source: SnapshotSource,
) -> Result<(), CoreError> {
    let tenant = TenantId::parse(tenant)?;
    let stores = Stores::open(config)?;
    let snapshot = Snapshot::take(stores.leaf_source(source), &tenant, &CancellationToken::new())?;
    let path = SnapshotStore::new(&config.storage.snapshot_root).save(&snapshot)?;

    if json {
        return print_json(&serde_json::json!({
            "snapshot_id": snapshot.snapshot_id,
            "path": path,
            "merkle_root": snapshot.merkle_root,
            "entity_root": snapshot.entity_root,
            "relationship_structural_root": snapshot.relationship_structural_root,
            "relationship_effective_root": snapshot.relationship_effective_root,
        }));
    }
    println!("Snapshot {}", snapshot.snapshot_id);
    println!("  Saved to:      {}", path.display());
    println!("  Entities:      {}", snapshot.entity_digests.len());
    println!("  Relationships: {}", snapshot.relationship_digests.len());
    println!("  Merkle root:   {}", snapshot.merkle_root);
    Ok(())
}

pub fn cmd_drift(
    config: &AppConfig,
    json: bool,
    tenant: &str,
    baseline: Option<&str>,
    current: Option<&str>,
) -> Result<(), CoreError> {
    let tenant = TenantId::parse(tenant)?;
    let allowlist = Allowlist::new(&config.drift.allow)?;
    let snapshots = SnapshotStore::new(&config.storage.snapshot_root);

    let baseline = match baseline {
        Some(id) => snapshots.load(&tenant, id)?,
        None => snapshots.latest(&tenant)?.ok_or_else(|| {
            CoreError::NotFound(format!(
                "no saved snapshot for tenant '{}'; run `tracegraph snapshot` first",
                tenant
            ))
        })?,
    };
    let current = match current {
        Some(id) => snapshots.load(&tenant, id)?,
        None => {
            let stores = Stores::open(config)?;
            let fresh =
                Snapshot::take(stores.records.as_ref(), &tenant, &CancellationToken::new())?;
            snapshots.save(&fresh)?;
            fresh
        }
    };

    let drift = diff(&baseline, &current)?;
    let sink = JsonlSignalSink::new(&config.storage.ledger_root);
    let gate = evaluate_gate(&drift, &allowlist, &sink);

    if json {
        print_json(&gate)?;
    } else {
        println!(
            "Drift {} -> {}: {} added, {} deleted, {} mutated",
            drift.baseline_snapshot, drift.current_snapshot, gate.added, gate.deleted, gate.mutated
        );
        println!("  Expected:   {}", gate.expected.len());
        println!("  Unexpected: {}", gate.unexpected.len());
        for item in &gate.unexpected {
            println!(
                "    {:?} {:?} {} ({})",
                item.change, item.record, item.instance_id, item.type_code
            );
        }
        if gate.signals_failed > 0 {
            println!("  Signals failed: {}", gate.signals_failed);
        }
        println!("Gate: {}", if gate.passed { "PASS" } else { "FAIL" });
    }

    if !gate.passed {
        return Err(CoreError::Consistency(format!(
            "drift gate failed with {} unexpected change(s)",
            gate.unexpected.len()
        )));
    }
    Ok(())
}

// =============================================================================
// CLOSURE
// =============================================================================

pub fn cmd_closure(
    config: &AppConfig,
    json: bool,
    tenant: &str,
    bundle: &Path,
    revision: &str,
) -> Result<(), CoreError> {
    let tenant = TenantId::parse(tenant)?;
    let stores = Stores::open(config)?;
    let pipeline = BundlePipeline::new(tenant.clone(), bundle, revision, &stores.upsert, &stores.sync);
    let checker = ClosureChecker::new(&config.storage.evidence_root, stores.upsert.clone());
    let report = checker.run(&pipeline, stores.graph.as_ref(), &CancellationToken::new())?;

    if json {
        print_json(&report)?;
    } else {
        println!("Closure check {} for {}", report.check_id, tenant);
        for step in &report.trail {
            println!("  {:?}", step.state);
        }
        if let Some(comparison) = &report.comparison {
            for (label, equal) in [
                ("entity root", comparison.entity_root.equal),
                (
                    "relationship structural root",
                    comparison.relationship_structural_root.equal,
                ),
                (
                    "relationship effective root",
                    comparison.relationship_effective_root.equal,
                ),
                ("entity count", comparison.entity_count.equal),
                ("relationship count", comparison.relationship_count.equal),
            ] {
                println!("  {:<30} {}", label, if equal { "equal" } else { "DIFFERS" });
            }
        }
        if let Some(reason) = &report.failure {
            println!("  Failure: {}", reason);
        }
        println!(
            "  Evidence: {}",
            checker.evidence_path(&tenant, &report.check_id).display()
        );
        println!("Verdict: {:?}", report.verdict);
    }

    if !report.passed() {
        return Err(CoreError::Consistency(format!(
            "closure check {} failed: {}",
            report.check_id,
            report.failure.as_deref().unwrap_or("runs differ")
        )));
    }
    Ok(())
}

// =============================================================================
// TRAVERSE
// =============================================================================

pub fn cmd_traverse(
    config: &AppConfig,
    json: bool,
    tenant: &str,
    start: &str,
    depth: usize,
    min_confidence: Option<f64>,
    provenance: Option<&str>,
) -> Result<(), CoreError> {
    let categories: Option<Vec<&str>> = provenance.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    });
    let request = TraversalRequest {
        tenant_id: TenantId::parse(tenant)?,
        start_id: start.to_string(),
        max_depth: depth,
        filter: EdgeFilter {
            min_confidence: min_confidence.map(Confidence::from_f64).transpose()?,
            provenance: categories.as_deref().map(parse_categories).transpose()?,
        },
    };
    let stores = Stores::open(config)?;
    let cancel =
        CancellationToken::with_timeout(Duration::from_secs(config.server.traversal_timeout_secs));
    let result = traverse(stores.records.as_ref(), &request, &cancel)?;

    if json {
        return print_json(&result);
    }
    println!("Nodes ({}):", result.nodes.len());
    for node in &result.nodes {
        println!(
            "  [{}] {} {} \"{}\"",
            node.depth, node.type_code, node.instance_id, node.name
        );
    }
    println!("Edges ({}):", result.edges.len());
    for edge in &result.edges {
        println!(
            "  {} -[{} {}]-> {}",
            edge.from_instance_id,
            edge.type_code,
            edge.confidence.thousandths(),
            edge.to_instance_id
        );
    }
    Ok(())
}

// =============================================================================
// LEDGER / BASELINE
// =============================================================================

pub fn cmd_ledger(
    config: &AppConfig,
    json: bool,
    tenant: &str,
    tail: Option<usize>,
) -> Result<(), CoreError> {
    let tenant = TenantId::parse(tenant)?;
    let stores = Stores::open(config)?;
    let entries = stores.upsert.ledger_entries(&tenant)?;
    let skip = tail.map_or(0, |n| entries.len().saturating_sub(n));

    for entry in entries.iter().skip(skip) {
        if json {
            println!("{}", serde_json::to_string(entry)?);
        } else {
            println!(
                "{} {:<9} {:<12} {} {}",
                entry.timestamp.to_rfc3339(),
                entry.operation,
                format!("{:?}", entry.kind),
                entry.instance_id,
                entry.detail.as_deref().unwrap_or("")
            );
        }
    }
    Ok(())
}

pub fn cmd_baseline(json: bool, path: &Path) -> Result<(), CoreError> {
    let baseline = file_tree_baseline(path, &CancellationToken::new())?;
    if json {
        return print_json(&baseline);
    }
    println!("Baseline of {}", baseline.root_path);
    println!("  Files:       {}", baseline.file_count);
    println!("  Merkle root: {}", baseline.merkle_root);
    Ok(())
}
