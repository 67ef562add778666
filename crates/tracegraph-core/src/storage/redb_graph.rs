//! # redb-backed Graph Storage
//!
//! The derived, traversal-oriented copy of the authoritative records.
//!
//! Nodes and edges are keyed by `(tenant_id, instance_id)`, encoded as
//! `"{tenant}\0{instance_id}"`. Tenant ids never contain `\0`, so one
//! tenant's keys form a contiguous range and a whole tenant can be scanned
//! or replaced without touching any other tenant.
//!
//! Nothing here is a source of truth: the store can always be rebuilt from
//! the record store by a merge followed by a replace-by-scope.

use crate::primitives::RELATIONSHIP_EDGE_LABEL;
use crate::types::{Confidence, CoreError, TenantId};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Table for nodes: "{tenant}\0{instance_id}" -> postcard GraphNode
const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Table for edges: "{tenant}\0{relationship instance_id}" -> postcard GraphEdge
const EDGES: TableDefinition<&str, &[u8]> = TableDefinition::new("edges");

fn scoped_key(tenant: &TenantId, instance_id: &str) -> String {
    format!("{}\u{0}{}", tenant, instance_id)
}

fn tenant_bounds(tenant: &TenantId) -> (String, String) {
    (format!("{}\u{0}", tenant), format!("{}\u{1}", tenant))
}

/// A graph node mirrored from an authoritative entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    pub tenant_id: TenantId,
    pub instance_id: String,
    pub type_code: String,
    pub name: String,
    pub content_hash: String,
    pub synced_at: DateTime<Utc>,
}

/// A `RELATIONSHIP` edge mirrored from an authoritative relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub label: String,
    pub relationship_type: String,
    pub tenant_id: TenantId,
    pub instance_id: String,
    pub from_instance_id: String,
    pub to_instance_id: String,
    pub confidence: Confidence,
}

impl GraphEdge {
    #[must_use]
    pub fn new(
        tenant_id: TenantId,
        relationship_type: impl Into<String>,
        instance_id: impl Into<String>,
        from_instance_id: impl Into<String>,
        to_instance_id: impl Into<String>,
        confidence: Confidence,
    ) -> Self {
        Self {
            label: RELATIONSHIP_EDGE_LABEL.to_string(),
            relationship_type: relationship_type.into(),
            tenant_id,
            instance_id: instance_id.into(),
            from_instance_id: from_instance_id.into(),
            to_instance_id: to_instance_id.into(),
            confidence,
        }
    }
}

/// An edge left out of a replace because an endpoint node is absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedEdge {
    pub instance_id: String,
    pub missing_endpoint: String,
}

/// Result of [`RedbGraph::replace_edges`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReplaceOutcome {
    pub deleted: usize,
    pub inserted: usize,
    pub skipped: Vec<SkippedEdge>,
}

/// A disk-backed, tenant-partitioned graph store using redb.
pub struct RedbGraph {
    db: Database,
}

impl std::fmt::Debug for RedbGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbGraph").finish_non_exhaustive()
    }
}

impl RedbGraph {
    /// Open or create a graph database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db =
            Database::create(path.as_ref()).map_err(|e| CoreError::Storage(e.to_string()))?;

        // Initialize tables if they don't exist
        {
            let write_txn = db
                .begin_write()
                .map_err(|e| CoreError::Storage(e.to_string()))?;
            let _ = write_txn
                .open_table(NODES)
                .map_err(|e| CoreError::Storage(e.to_string()))?;
            let _ = write_txn
                .open_table(EDGES)
                .map_err(|e| CoreError::Storage(e.to_string()))?;
            write_txn
                .commit()
                .map_err(|e| CoreError::Storage(e.to_string()))?;
        }

        Ok(Self { db })
    }

    // =========================================================================
    // MUTATION
    // =========================================================================

    /// Upsert nodes for one tenant in a single write transaction.
    ///
    /// Merging the same node set twice leaves the store unchanged apart
    /// from `synced_at`.
    pub fn merge_nodes(&self, tenant: &TenantId, nodes: &[GraphNode]) -> Result<usize, CoreError> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        {
            let mut table = write_txn
                .open_table(NODES)
                .map_err(|e| CoreError::Storage(e.to_string()))?;
            for node in nodes {
                if node.tenant_id != *tenant {
                    return Err(CoreError::Validation(format!(
                        "node '{}' belongs to tenant '{}', not '{}'",
                        node.instance_id, node.tenant_id, tenant
                    )));
                }
                let bytes = postcard::to_allocvec(node)
                    .map_err(|e| CoreError::Serialization(e.to_string()))?;
                table
                    .insert(scoped_key(tenant, &node.instance_id).as_str(), bytes.as_slice())
                    .map_err(|e| CoreError::Storage(e.to_string()))?;
            }
        }
        write_txn
            .commit()
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(nodes.len())
    }

    /// Replace every edge of `tenant` with `edges`, in one write transaction.
    ///
    /// Candidates whose endpoints are not both present as nodes are left
    /// out and reported. Other tenants' edges are never read or written.
    pub fn replace_edges(
        &self,
        tenant: &TenantId,
        edges: &[GraphEdge],
    ) -> Result<ReplaceOutcome, CoreError> {
        let (lo, hi) = tenant_bounds(tenant);
        let mut outcome = ReplaceOutcome::default();

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        {
            let nodes_table = write_txn
                .open_table(NODES)
                .map_err(|e| CoreError::Storage(e.to_string()))?;
            let mut edges_table = write_txn
                .open_table(EDGES)
                .map_err(|e| CoreError::Storage(e.to_string()))?;

            // Pass 1: delete everything tagged with the tenant.
            let mut stale = Vec::new();
            for entry in edges_table
                .range(lo.as_str()..hi.as_str())
                .map_err(|e| CoreError::Storage(e.to_string()))?
            {
                let (key, _) = entry.map_err(|e| CoreError::Storage(e.to_string()))?;
                stale.push(key.value().to_string());
            }
            for key in &stale {
                edges_table
                    .remove(key.as_str())
                    .map_err(|e| CoreError::Storage(e.to_string()))?;
            }
            outcome.deleted = stale.len();

            // Pass 2: insert edges whose endpoints both exist.
            for edge in edges {
                if edge.tenant_id != *tenant {
                    return Err(CoreError::Validation(format!(
                        "edge '{}' belongs to tenant '{}', not '{}'",
                        edge.instance_id, edge.tenant_id, tenant
                    )));
                }
                let mut missing = None;
                for endpoint in [&edge.from_instance_id, &edge.to_instance_id] {
                    let present = nodes_table
                        .get(scoped_key(tenant, endpoint).as_str())
                        .map_err(|e| CoreError::Storage(e.to_string()))?
                        .is_some();
                    if !present {
                        missing = Some(endpoint.clone());
                        break;
                    }
                }
                if let Some(missing_endpoint) = missing {
                    outcome.skipped.push(SkippedEdge {
                        instance_id: edge.instance_id.clone(),
                        missing_endpoint,
                    });
                    continue;
                }
                let bytes = postcard::to_allocvec(edge)
                    .map_err(|e| CoreError::Serialization(e.to_string()))?;
                edges_table
                    .insert(scoped_key(tenant, &edge.instance_id).as_str(), bytes.as_slice())
                    .map_err(|e| CoreError::Storage(e.to_string()))?;
                outcome.inserted += 1;
            }
        }
        write_txn
            .commit()
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(outcome)
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Look up one node.
    pub fn node(&self, tenant: &TenantId, instance_id: &str) -> Result<Option<GraphNode>, CoreError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        let table = read_txn
            .open_table(NODES)
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        table
            .get(scoped_key(tenant, instance_id).as_str())
            .map_err(|e| CoreError::Storage(e.to_string()))?
            .map(|v| {
                postcard::from_bytes(v.value()).map_err(|e| CoreError::Serialization(e.to_string()))
            })
            .transpose()
    }

    /// All nodes of a tenant, ordered by instance id.
    pub fn nodes(&self, tenant: &TenantId) -> Result<Vec<GraphNode>, CoreError> {
        self.scan(NODES, tenant)
    }

    /// All edges of a tenant, ordered by relationship instance id.
    pub fn edges(&self, tenant: &TenantId) -> Result<Vec<GraphEdge>, CoreError> {
        self.scan(EDGES, tenant)
    }

    fn scan<T: for<'de> Deserialize<'de>>(
        &self,
        definition: TableDefinition<'static, &'static str, &'static [u8]>,
        tenant: &TenantId,
    ) -> Result<Vec<T>, CoreError> {
        let (lo, hi) = tenant_bounds(tenant);
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        let table = read_txn
            .open_table(definition)
            .map_err(|e| CoreError::Storage(e.to_string()))?;

        let mut items = Vec::new();
        for entry in table
            .range(lo.as_str()..hi.as_str())
            .map_err(|e| CoreError::Storage(e.to_string()))?
        {
            let (_, value) = entry.map_err(|e| CoreError::Storage(e.to_string()))?;
            items.push(
                postcard::from_bytes(value.value())
                    .map_err(|e| CoreError::Serialization(e.to_string()))?,
            );
        }
        Ok(items)
    }

    /// Node counts grouped by entity type.
    pub fn node_counts_by_type(&self, tenant: &TenantId) -> Result<BTreeMap<String, u64>, CoreError> {
        let mut counts = BTreeMap::new();
        for node in self.nodes(tenant)? {
            *counts.entry(node.type_code).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Edge counts grouped by relationship type.
    pub fn edge_counts_by_type(&self, tenant: &TenantId) -> Result<BTreeMap<String, u64>, CoreError> {
        let mut counts = BTreeMap::new();
        for edge in self.edges(tenant)? {
            *counts.entry(edge.relationship_type).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Instance ids of every node of a tenant.
    pub fn node_ids(&self, tenant: &TenantId) -> Result<BTreeSet<String>, CoreError> {
        Ok(self.nodes(tenant)?.into_iter().map(|n| n.instance_id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tenant(name: &str) -> TenantId {
        TenantId::parse(name).expect("tenant")
    }

    fn node(t: &TenantId, id: &str) -> GraphNode {
        GraphNode {
            tenant_id: t.clone(),
            instance_id: id.into(),
            type_code: "STORY".into(),
            name: id.into(),
            content_hash: format!("hash-{}", id),
            synced_at: Utc::now(),
        }
    }

    fn edge(t: &TenantId, from: &str, to: &str) -> GraphEdge {
        GraphEdge::new(
            t.clone(),
            "R02",
            format!("R02:{}->{}", from, to),
            from,
            to,
            Confidence::CERTAIN,
        )
    }

    #[test]
    fn merge_is_idempotent() {
        let temp = tempdir().expect("temp dir");
        let graph = RedbGraph::open(temp.path().join("graph.redb")).expect("open db");
        let t = tenant("acme");
        let nodes = vec![node(&t, "A"), node(&t, "B")];

        graph.merge_nodes(&t, &nodes).expect("merge");
        graph.merge_nodes(&t, &nodes).expect("merge again");
        assert_eq!(graph.nodes(&t).expect("nodes").len(), 2);
        assert_eq!(
            graph.node(&t, "A").expect("lookup").map(|n| n.content_hash),
            Some("hash-A".to_string())
        );
    }

    #[test]
    fn replace_skips_missing_endpoints() {
        let temp = tempdir().expect("temp dir");
        let graph = RedbGraph::open(temp.path().join("graph.redb")).expect("open db");
        let t = tenant("acme");
        graph
            .merge_nodes(&t, &[node(&t, "A"), node(&t, "B")])
            .expect("merge");

        let outcome = graph
            .replace_edges(&t, &[edge(&t, "A", "B"), edge(&t, "B", "C")])
            .expect("replace");
        assert_eq!(outcome.inserted, 1);
        assert_eq!(
            outcome.skipped,
            vec![SkippedEdge {
                instance_id: "R02:B->C".into(),
                missing_endpoint: "C".into(),
            }]
        );
        assert_eq!(graph.edges(&t).expect("edges")[0].label, "RELATIONSHIP");
    }

    #[test]
    fn replace_deletes_previous_scope_only() {
        let temp = tempdir().expect("temp dir");
        let graph = RedbGraph::open(temp.path().join("graph.redb")).expect("open db");
        let a = tenant("alpha");
        let b = tenant("beta");
        for t in [&a, &b] {
            graph
                .merge_nodes(t, &[node(t, "A"), node(t, "B")])
                .expect("merge");
            graph.replace_edges(t, &[edge(t, "A", "B")]).expect("replace");
        }

        let outcome = graph.replace_edges(&a, &[]).expect("clear alpha");
        assert_eq!(outcome.deleted, 1);
        assert!(graph.edges(&a).expect("edges").is_empty());
        assert_eq!(graph.edges(&b).expect("edges").len(), 1);
    }

    #[test]
    fn tenant_prefixes_do_not_overlap() {
        let temp = tempdir().expect("temp dir");
        let graph = RedbGraph::open(temp.path().join("graph.redb")).expect("open db");
        let short = tenant("ab");
        let long = tenant("abc");
        graph.merge_nodes(&short, &[node(&short, "X")]).expect("merge");
        graph.merge_nodes(&long, &[node(&long, "Y")]).expect("merge");

        assert_eq!(graph.node_ids(&short).expect("ids").len(), 1);
        assert_eq!(graph.node_ids(&long).expect("ids").len(), 1);
    }

    #[test]
    fn rejects_foreign_tenant_records() {
        let temp = tempdir().expect("temp dir");
        let graph = RedbGraph::open(temp.path().join("graph.redb")).expect("open db");
        let a = tenant("alpha");
        let b = tenant("beta");
        assert!(graph.merge_nodes(&a, &[node(&b, "A")]).is_err());
    }

    #[test]
    fn persists_across_reopen() {
        let temp = tempdir().expect("temp dir");
        let db_path = temp.path().join("graph.redb");
        let t = tenant("acme");

        {
            let graph = RedbGraph::open(&db_path).expect("open db");
            graph
                .merge_nodes(&t, &[node(&t, "A"), node(&t, "B")])
                .expect("merge");
            graph.replace_edges(&t, &[edge(&t, "A", "B")]).expect("replace");
        }

        let graph = RedbGraph::open(&db_path).expect("reopen db");
        assert_eq!(graph.node_counts_by_type(&t).expect("counts").get("STORY"), Some(&2));
        assert_eq!(graph.edge_counts_by_type(&t).expect("counts").get("R02"), Some(&1));
    }
}
