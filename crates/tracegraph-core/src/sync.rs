//! # Graph Sync Engine
//!
//! Propagates authoritative records into the derived graph store.
//!
//! - Entity merge: idempotent node upsert keyed by `(tenant, instance_id)`.
//! - Relationship replace-by-scope: drop every edge of the tenant, then
//!   insert one edge per authoritative relationship whose endpoints exist
//!   as nodes. Anything else is counted as skipped.
//! - Parity: compare per-type counts across the two stores.
//!
//! Replace-by-scope is read-repair: a relationship skipped because its
//! endpoint node lags behind is picked up by the next sync after the
//! merge catches up. Parity and drift detection backstop the gap.

use crate::storage::{GraphEdge, GraphNode, RecordStore, RedbGraph, SkippedEdge};
use crate::types::{CoreError, Entity, Relationship, TenantId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Result of an entity merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub merged: usize,
}

/// Result of a relationship replace-by-scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub deleted: usize,
    pub synced: usize,
    pub skipped: usize,
    pub skipped_relationships: Vec<SkippedEdge>,
}

/// A per-type count that differs between the two stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountMismatch {
    pub type_code: String,
    pub count_authoritative: u64,
    pub count_graph: u64,
}

/// Outcome of a parity check. Read-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParityReport {
    pub tenant_id: TenantId,
    pub consistent: bool,
    pub relationship_mismatches: Vec<CountMismatch>,
    pub entity_mismatches: Vec<CountMismatch>,
}

/// Totals for one store; a failing store reports its error instead.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoreCounts {
    pub entities: Option<u64>,
    pub relationships: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Statistics for both stores of a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStatistics {
    pub tenant_id: TenantId,
    pub authoritative: StoreCounts,
    pub graph: StoreCounts,
}

/// Sync engine between the record store and the graph store.
#[derive(Debug)]
pub struct GraphSync {
    records: Arc<RecordStore>,
    graph: Arc<RedbGraph>,
    tenant_locks: Mutex<BTreeMap<TenantId, Arc<Mutex<()>>>>,
}

impl GraphSync {
    #[must_use]
    pub fn new(records: Arc<RecordStore>, graph: Arc<RedbGraph>) -> Self {
        Self {
            records,
            graph,
            tenant_locks: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn graph(&self) -> &Arc<RedbGraph> {
        &self.graph
    }

    fn tenant_lock(&self, tenant: &TenantId) -> Result<Arc<Mutex<()>>, CoreError> {
        let mut locks = self
            .tenant_locks
            .lock()
            .map_err(|_| CoreError::Storage("tenant lock table poisoned".into()))?;
        Ok(Arc::clone(locks.entry(tenant.clone()).or_default()))
    }

    // =========================================================================
    // ENTITY MERGE
    // =========================================================================

    /// Merge every authoritative entity of `tenant` into the graph store.
    pub fn merge_entities(&self, tenant: &TenantId) -> Result<MergeReport, CoreError> {
        let entities = self.records.all_entities(tenant)?;
        self.merge_entity_set(tenant, &entities)
    }

    /// Merge an explicit entity set.
    pub fn merge_entity_set(
        &self,
        tenant: &TenantId,
        entities: &[Entity],
    ) -> Result<MergeReport, CoreError> {
        let lock = self.tenant_lock(tenant)?;
        let _guard = lock
            .lock()
            .map_err(|_| CoreError::Storage("tenant lock poisoned".into()))?;

        let synced_at = Utc::now();
        let nodes: Vec<GraphNode> = entities
            .iter()
            .map(|e| GraphNode {
                tenant_id: e.tenant_id.clone(),
                instance_id: e.instance_id.clone(),
                type_code: e.type_code.clone(),
                name: e.name.clone(),
                content_hash: e.content_hash.clone(),
                synced_at,
            })
            .collect();
        let merged = self.graph.merge_nodes(tenant, &nodes)?;
        info!(tenant = %tenant, merged, "entities merged into graph store");
        Ok(MergeReport { merged })
    }

    // =========================================================================
    // RELATIONSHIP REPLACE-BY-SCOPE
    // =========================================================================

    /// Replace the tenant's graph edges with its authoritative relationships.
    pub fn replace_relationships(&self, tenant: &TenantId) -> Result<SyncReport, CoreError> {
        let relationships = self.records.all_relationships(tenant)?;
        self.replace_relationship_set(tenant, &relationships)
    }

    /// Replace the tenant's graph edges with an explicit relationship set.
    pub fn replace_relationship_set(
        &self,
        tenant: &TenantId,
        relationships: &[Relationship],
    ) -> Result<SyncReport, CoreError> {
        let lock = self.tenant_lock(tenant)?;
        let _guard = lock
            .lock()
            .map_err(|_| CoreError::Storage("tenant lock poisoned".into()))?;

        let edges: Vec<GraphEdge> = relationships
            .iter()
            .map(|r| {
                GraphEdge::new(
                    r.tenant_id.clone(),
                    r.type_code.clone(),
                    r.instance_id.clone(),
                    r.from_instance_id.clone(),
                    r.to_instance_id.clone(),
                    r.confidence,
                )
            })
            .collect();
        let outcome = self.graph.replace_edges(tenant, &edges)?;

        for skipped in &outcome.skipped {
            warn!(
                tenant = %tenant,
                instance_id = %skipped.instance_id,
                missing = %skipped.missing_endpoint,
                "relationship skipped: endpoint not in graph store"
            );
        }
        info!(
            tenant = %tenant,
            deleted = outcome.deleted,
            synced = outcome.inserted,
            skipped = outcome.skipped.len(),
            "relationships replaced by scope"
        );
        Ok(SyncReport {
            deleted: outcome.deleted,
            synced: outcome.inserted,
            skipped: outcome.skipped.len(),
            skipped_relationships: outcome.skipped,
        })
    }

    /// Merge then replace, the usual full sync of a tenant.
    pub fn sync_tenant(&self, tenant: &TenantId) -> Result<(MergeReport, SyncReport), CoreError> {
        let merge = self.merge_entities(tenant)?;
        let replace = self.replace_relationships(tenant)?;
        Ok((merge, replace))
    }

    // =========================================================================
    // VERIFICATION
    // =========================================================================

    /// Compare per-type counts in both stores. Never writes.
    pub fn verify_parity(&self, tenant: &TenantId) -> Result<ParityReport, CoreError> {
        let relationship_mismatches = mismatches(
            &self.records.relationship_counts_by_type(tenant)?,
            &self.graph.edge_counts_by_type(tenant)?,
        );
        let entity_mismatches = mismatches(
            &self.records.entity_counts_by_type(tenant)?,
            &self.graph.node_counts_by_type(tenant)?,
        );
        let consistent = relationship_mismatches.is_empty() && entity_mismatches.is_empty();
        if !consistent {
            warn!(
                tenant = %tenant,
                relationship_types = relationship_mismatches.len(),
                entity_types = entity_mismatches.len(),
                "parity mismatch"
            );
        }
        Ok(ParityReport {
            tenant_id: tenant.clone(),
            consistent,
            relationship_mismatches,
            entity_mismatches,
        })
    }

    /// Totals for both stores; one store failing does not hide the other.
    #[must_use]
    pub fn statistics(&self, tenant: &TenantId) -> StoreStatistics {
        let authoritative = match (
            self.records.entity_counts_by_type(tenant),
            self.records.relationship_counts_by_type(tenant),
        ) {
            (Ok(e), Ok(r)) => StoreCounts {
                entities: Some(e.values().sum()),
                relationships: Some(r.values().sum()),
                error: None,
            },
            (Err(e), _) | (_, Err(e)) => StoreCounts {
                error: Some(e.to_string()),
                ..StoreCounts::default()
            },
        };
        let graph = match (
            self.graph.node_counts_by_type(tenant),
            self.graph.edge_counts_by_type(tenant),
        ) {
            (Ok(n), Ok(e)) => StoreCounts {
                entities: Some(n.values().sum()),
                relationships: Some(e.values().sum()),
                error: None,
            },
            (Err(e), _) | (_, Err(e)) => StoreCounts {
                error: Some(e.to_string()),
                ..StoreCounts::default()
            },
        };
        StoreStatistics {
            tenant_id: tenant.clone(),
            authoritative,
            graph,
        }
    }
}

fn mismatches(
    authoritative: &BTreeMap<String, u64>,
    graph: &BTreeMap<String, u64>,
) -> Vec<CountMismatch> {
    let types: BTreeSet<&String> = authoritative.keys().chain(graph.keys()).collect();
    types
        .into_iter()
        .filter_map(|t| {
            let a = authoritative.get(t).copied().unwrap_or(0);
            let g = graph.get(t).copied().unwrap_or(0);
            (a != g).then(|| CountMismatch {
                type_code: t.clone(),
                count_authoritative: a,
                count_graph: g,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        Attributes, Confidence, EpochContext, Evidence, ExtractedEntity, ExtractedRelationship,
    };

    struct Fixture {
        _dir: tempfile::TempDir,
        records: Arc<RecordStore>,
        sync: GraphSync,
        tenant: TenantId,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let records = Arc::new(RecordStore::open_in_memory().expect("records"));
        let graph = Arc::new(RedbGraph::open(dir.path().join("graph.redb")).expect("graph"));
        Fixture {
            sync: GraphSync::new(Arc::clone(&records), graph),
            records,
            _dir: dir,
            tenant: TenantId::parse("acme").expect("tenant"),
        }
    }

    fn seed(fx: &Fixture, ids: &[&str], edges: &[(&str, &str)]) {
        let epoch = EpochContext::with_epoch_id("e", "r");
        for id in ids {
            let e = ExtractedEntity {
                type_code: "STORY".into(),
                instance_id: (*id).into(),
                name: (*id).into(),
                attributes: Attributes::new(),
                evidence: Evidence::new("doc.md", 1, 1),
            };
            fx.records.upsert_entity(&fx.tenant, &e, &epoch).expect("entity");
        }
        for (from, to) in edges {
            let r = ExtractedRelationship {
                type_code: "R04".into(),
                from_instance_id: (*from).into(),
                to_instance_id: (*to).into(),
                name: String::new(),
                confidence: Confidence::CERTAIN,
                evidence: Evidence::new("doc.md", 1, 1),
            };
            fx.records.upsert_relationship(&fx.tenant, &r, &epoch).expect("rel");
        }
    }

    #[test]
    fn full_sync_reaches_parity() {
        let fx = fixture();
        seed(&fx, &["A", "B", "C"], &[("A", "B"), ("B", "C")]);

        let (merge, replace) = fx.sync.sync_tenant(&fx.tenant).expect("sync");
        assert_eq!(merge.merged, 3);
        assert_eq!(replace.synced, 2);
        assert_eq!(replace.skipped, 0);

        let parity = fx.sync.verify_parity(&fx.tenant).expect("parity");
        assert!(parity.consistent);
    }

    #[test]
    fn lagging_node_is_skipped_and_breaks_parity() {
        let fx = fixture();
        seed(&fx, &["A", "B", "C"], &[("A", "B"), ("B", "C")]);
        let partial: Vec<Entity> = fx
            .records
            .all_entities(&fx.tenant)
            .expect("entities")
            .into_iter()
            .filter(|e| e.instance_id != "C")
            .collect();
        fx.sync.merge_entity_set(&fx.tenant, &partial).expect("merge");

        let report = fx.sync.replace_relationships(&fx.tenant).expect("replace");
        assert_eq!((report.synced, report.skipped), (1, 1));
        assert_eq!(report.skipped_relationships[0].missing_endpoint, "C");

        let parity = fx.sync.verify_parity(&fx.tenant).expect("parity");
        assert!(!parity.consistent);
        assert_eq!(
            parity.relationship_mismatches,
            vec![CountMismatch {
                type_code: "R04".into(),
                count_authoritative: 2,
                count_graph: 1,
            }]
        );
    }

    #[test]
    fn resync_is_stable() {
        let fx = fixture();
        seed(&fx, &["A", "B"], &[("A", "B")]);
        fx.sync.sync_tenant(&fx.tenant).expect("first");
        let (_, second) = fx.sync.sync_tenant(&fx.tenant).expect("second");
        assert_eq!(second.deleted, 1);
        assert_eq!(second.synced, 1);
    }

    #[test]
    fn statistics_report_both_stores() {
        let fx = fixture();
        seed(&fx, &["A", "B"], &[("A", "B")]);
        fx.sync.merge_entities(&fx.tenant).expect("merge");

        let stats = fx.sync.statistics(&fx.tenant);
        assert_eq!(stats.authoritative.entities, Some(2));
        assert_eq!(stats.authoritative.relationships, Some(1));
        assert_eq!(stats.graph.entities, Some(2));
        assert_eq!(stats.graph.relationships, Some(0));
        assert!(stats.graph.error.is_none());
    }
}
