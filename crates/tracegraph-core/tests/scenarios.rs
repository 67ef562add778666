//! # End-to-End Scenarios
//!
//! Whole-engine behaviour through the public API: upsert, sync,
//! snapshots, drift, closure and traversal working on real on-disk stores.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::sync::Arc;
use tempfile::TempDir;
use tracegraph_core::{
    AllowRule, Allowlist, Attributes, BundlePipeline, CancellationToken, ClosureChecker,
    ClosureState, Confidence, EdgeFilter, EpochContext, Evidence, ExtractedEntity,
    ExtractedRelationship, GraphSync, JsonlSignalSink, Ledger, Operation, RecordStore, RedbGraph,
    Snapshot, TenantId, TraversalRequest, UpsertEngine, UpsertOptions, diff, evaluate_gate,
    traverse,
};

// =============================================================================
// FIXTURES
// =============================================================================

struct Harness {
    dir: TempDir,
    records: Arc<RecordStore>,
    graph: Arc<RedbGraph>,
    upsert: UpsertEngine,
    sync: GraphSync,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let records =
            Arc::new(RecordStore::open(dir.path().join("records.sqlite3")).expect("records"));
        let graph = Arc::new(RedbGraph::open(dir.path().join("graph.redb")).expect("graph"));
        let ledger = Arc::new(Ledger::new(dir.path().join("ledger")));
        let upsert = UpsertEngine::new(Arc::clone(&records), ledger, UpsertOptions::default())
            .expect("engine");
        let sync = GraphSync::new(Arc::clone(&records), Arc::clone(&graph));
        Self {
            dir,
            records,
            graph,
            upsert,
            sync,
        }
    }
}

fn tenant(name: &str) -> TenantId {
    TenantId::parse(name).expect("tenant")
}

fn entity(id: &str, attributes: Attributes) -> ExtractedEntity {
    ExtractedEntity {
        type_code: "STORY".into(),
        instance_id: id.into(),
        name: id.into(),
        attributes,
        evidence: Evidence::new("docs/stories.md", 1, 4),
    }
}

fn relationship(type_code: &str, from: &str, to: &str, milli: u16) -> ExtractedRelationship {
    ExtractedRelationship {
        type_code: type_code.into(),
        from_instance_id: from.into(),
        to_instance_id: to.into(),
        name: String::new(),
        confidence: Confidence::from_thousandths(milli).expect("confidence"),
        evidence: Evidence::new("docs/stories.md", 2, 2),
    }
}

fn title(value: &str) -> Attributes {
    let mut attrs = Attributes::new();
    attrs.insert("title".into(), serde_json::json!(value));
    attrs
}

// =============================================================================
// UPSERT
// =============================================================================

#[test]
fn story_lifecycle_create_noop_update() {
    let h = Harness::new();
    let t = tenant("acme");
    let epoch = EpochContext::new("rev-1");

    let created = h
        .upsert
        .upsert_entity(&t, &entity("STORY-1.1", title("A")), &epoch)
        .expect("create");
    assert_eq!(created.operation, Operation::Create);
    let s1 = created.record.surrogate_id;

    let unchanged = h
        .upsert
        .upsert_entity(&t, &entity("STORY-1.1", title("A")), &epoch)
        .expect("noop");
    assert_eq!(unchanged.operation, Operation::NoOp);
    assert_eq!(unchanged.record.surrogate_id, s1);

    let updated = h
        .upsert
        .upsert_entity(&t, &entity("STORY-1.1", title("B")), &epoch)
        .expect("update");
    assert_eq!(updated.operation, Operation::Update);
    assert_eq!(updated.record.surrogate_id, s1);
    assert_ne!(updated.record.content_hash, created.record.content_hash);

    // CREATE and UPDATE are ledgered; the NO-OP is not.
    let ledger = h.upsert.ledger_entries(&t).expect("ledger");
    let ops: Vec<Operation> = ledger.iter().map(|e| e.operation).collect();
    assert_eq!(ops, vec![Operation::Create, Operation::Update]);
}

#[test]
fn same_instance_id_is_independent_per_tenant() {
    let h = Harness::new();
    let epoch = EpochContext::new("rev-1");
    let a = h
        .upsert
        .upsert_entity(&tenant("acme"), &entity("S", title("A")), &epoch)
        .expect("acme");
    let b = h
        .upsert
        .upsert_entity(&tenant("globex"), &entity("S", title("A")), &epoch)
        .expect("globex");
    assert_eq!(a.operation, Operation::Create);
    assert_eq!(b.operation, Operation::Create);
    assert_ne!(a.record.surrogate_id, b.record.surrogate_id);
}

// =============================================================================
// SYNC
// =============================================================================

#[test]
fn sync_skips_edges_with_missing_endpoints() {
    let h = Harness::new();
    let t = tenant("acme");
    let epoch = EpochContext::new("rev-1");
    for id in ["A", "B", "C"] {
        h.upsert
            .upsert_entity(&t, &entity(id, Attributes::new()), &epoch)
            .expect("entity");
    }
    for (from, to) in [("A", "B"), ("B", "C")] {
        h.upsert
            .upsert_relationship(&t, &relationship("R04", from, to, 1000), &epoch)
            .expect("relationship");
    }

    // Graph store only knows A and B.
    let known: Vec<_> = h
        .records
        .all_entities(&t)
        .expect("entities")
        .into_iter()
        .filter(|e| e.instance_id != "C")
        .collect();
    h.sync.merge_entity_set(&t, &known).expect("merge");

    let report = h.sync.replace_relationships(&t).expect("replace");
    assert_eq!(report.synced, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.skipped_relationships[0].instance_id, "R04:B->C");
    assert_eq!(report.skipped_relationships[0].missing_endpoint, "C");

    let parity = h.sync.verify_parity(&t).expect("parity");
    assert!(!parity.consistent);
}

#[test]
fn replace_by_scope_leaves_other_tenants_alone() {
    let h = Harness::new();
    let epoch = EpochContext::new("rev-1");
    for name in ["acme", "globex"] {
        let t = tenant(name);
        for id in ["A", "B"] {
            h.upsert
                .upsert_entity(&t, &entity(id, Attributes::new()), &epoch)
                .expect("entity");
        }
        h.upsert
            .upsert_relationship(&t, &relationship("R04", "A", "B", 800), &epoch)
            .expect("relationship");
        h.sync.sync_tenant(&t).expect("sync");
    }

    // Empty replacement for acme wipes only acme's edges.
    let report = h
        .sync
        .replace_relationship_set(&tenant("acme"), &[])
        .expect("replace");
    assert_eq!(report.deleted, 1);
    assert!(h.graph.edges(&tenant("acme")).expect("edges").is_empty());
    assert_eq!(h.graph.edges(&tenant("globex")).expect("edges").len(), 1);
    assert!(h.sync.verify_parity(&tenant("globex")).expect("parity").consistent);
}

// =============================================================================
// SNAPSHOTS AND DRIFT
// =============================================================================

#[test]
fn drift_is_detected_and_gated() {
    let h = Harness::new();
    let t = tenant("acme");
    let cancel = CancellationToken::new();
    let epoch = EpochContext::new("rev-1");
    for id in ["A", "B"] {
        h.upsert
            .upsert_entity(&t, &entity(id, title(id)), &epoch)
            .expect("entity");
    }
    h.upsert
        .upsert_relationship(&t, &relationship("R04", "A", "B", 900), &epoch)
        .expect("relationship");
    h.sync.sync_tenant(&t).expect("sync");

    let authoritative = Snapshot::take(h.records.as_ref(), &t, &cancel).expect("snapshot");
    let graph = Snapshot::take(h.graph.as_ref(), &t, &cancel).expect("snapshot");
    assert_eq!(authoritative.merkle_root, graph.merkle_root);

    // Confidence change is effective drift, not structural.
    let epoch = EpochContext::new("rev-2");
    h.upsert
        .upsert_relationship(&t, &relationship("R04", "A", "B", 400), &epoch)
        .expect("relationship");
    h.upsert
        .upsert_entity(&t, &entity("B", title("changed")), &epoch)
        .expect("entity");
    let after = Snapshot::take(h.records.as_ref(), &t, &cancel).expect("snapshot");
    assert_eq!(
        authoritative.relationship_structural_root,
        after.relationship_structural_root
    );
    assert_ne!(
        authoritative.relationship_effective_root,
        after.relationship_effective_root
    );

    let drift = diff(&authoritative, &after).expect("diff");
    assert_eq!(drift.items.len(), 2);

    let allow = Allowlist::new(&[AllowRule {
        type_code: Some("R04".into()),
        ..AllowRule::default()
    }])
    .expect("allowlist");
    let sink = JsonlSignalSink::new(h.dir.path().join("signals"));
    let gate = evaluate_gate(&drift, &allow, &sink);
    assert!(!gate.passed);
    assert_eq!(gate.expected.len(), 1);
    assert_eq!(gate.unexpected.len(), 1);
    assert_eq!(gate.signals_emitted, 1);

    let signals = std::fs::read_to_string(sink.path_for(&t)).expect("signals");
    assert_eq!(signals.lines().count(), 1);
}

// =============================================================================
// TRAVERSAL
// =============================================================================

#[test]
fn traversal_honours_min_confidence() {
    let h = Harness::new();
    let t = tenant("acme");
    let epoch = EpochContext::new("rev-1");
    for id in ["A", "B", "C"] {
        h.upsert
            .upsert_entity(&t, &entity(id, Attributes::new()), &epoch)
            .expect("entity");
    }
    h.upsert
        .upsert_relationship(&t, &relationship("R02", "A", "B", 900), &epoch)
        .expect("relationship");
    h.upsert
        .upsert_relationship(&t, &relationship("R02", "A", "C", 200), &epoch)
        .expect("relationship");

    let request = TraversalRequest {
        tenant_id: t,
        start_id: "A".into(),
        max_depth: 1,
        filter: EdgeFilter {
            min_confidence: Some(Confidence::from_thousandths(500).expect("confidence")),
            provenance: None,
        },
    };
    let result =
        traverse(h.records.as_ref(), &request, &CancellationToken::new()).expect("traverse");
    let mut ids: Vec<&str> = result.nodes.iter().map(|n| n.instance_id.as_str()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["A", "B"]);
}

// =============================================================================
// CLOSURE
// =============================================================================

fn closure_run(h: &Harness, bundle: &str) -> tracegraph_core::ClosureReport {
    let bundle_path = h.dir.path().join("bundle.json");
    std::fs::write(&bundle_path, bundle).expect("bundle");
    let t = tenant("acme");
    let pipeline = BundlePipeline::new(t, &bundle_path, "rev-1", &h.upsert, &h.sync);
    ClosureChecker::new(h.dir.path().join("evidence"), h.upsert.clone())
        .run(&pipeline, h.graph.as_ref(), &CancellationToken::new())
        .expect("closure")
}

#[test]
fn closure_passes_on_a_clean_bundle() {
    let h = Harness::new();
    let report = closure_run(
        &h,
        r#"{"revision": "rev-1",
            "entities": [
              {"type_code": "STORY", "instance_id": "A", "name": "A",
               "source_file": "docs/a.md", "line_start": 1, "line_end": 1},
              {"type_code": "STORY", "instance_id": "B", "name": "B",
               "source_file": "docs/b.md", "line_start": 1, "line_end": 1}],
            "relationships": [
              {"type_code": "R04", "from_instance_id": "A", "to_instance_id": "B",
               "confidence": 0.5, "source_file": "docs/a.md", "line_start": 1, "line_end": 1}]}"#,
    );
    assert_eq!(report.verdict, ClosureState::Pass);

    let entries = h.upsert.ledger_entries(&tenant("acme")).expect("ledger");
    let last = entries.last().expect("decision");
    assert_eq!(last.operation, Operation::Decision);
    assert_eq!(last.detail.as_deref(), Some("PASS"));
}

#[test]
fn closure_fails_when_every_item_is_rejected() {
    let h = Harness::new();
    // Both runs reject the edge the same way and leave the same empty graph.
    let report = closure_run(
        &h,
        r#"{"revision": "rev-1",
            "relationships": [
              {"type_code": "R04", "from_instance_id": "A", "to_instance_id": "B",
               "confidence": 0.5, "source_file": "docs/a.md", "line_start": 1, "line_end": 1}]}"#,
    );
    assert_eq!(report.verdict, ClosureState::Fail);
    assert_eq!(report.runs[0].relationships.failed, 1);
    assert!(report.comparison.is_none());

    let entries = h.upsert.ledger_entries(&tenant("acme")).expect("ledger");
    assert_eq!(entries.len(), 1);
    assert!(entries[0].detail.as_deref().is_some_and(|d| d.starts_with("FAIL")));
}
