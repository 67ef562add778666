//! # Merkle Snapshots
//!
//! Immutable whole-graph digests of one tenant, taken from either store.
//!
//! A snapshot keeps every per-record digest (so two snapshots can be
//! diffed record by record) and four roots:
//! - `entity_root` over `H(instance_id ∥ "\n" ∥ content_hash)` leaves
//! - `relationship_structural_root`, confidence excluded
//! - `relationship_effective_root`, confidence included
//! - `merkle_root = H(entity_root ∥ structural_root ∥ effective_root)`

use crate::cancel::CancellationToken;
use crate::hashing::{digest_hex, effective_leaf, entity_leaf, structural_leaf};
use crate::merkle::{MerkleLeaf, merkle_root};
use crate::storage::{RecordStore, RedbGraph};
use crate::types::{Confidence, CoreError, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Which store a snapshot was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotOrigin {
    Authoritative,
    Graph,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDigest {
    pub instance_id: String,
    pub type_code: String,
    pub content_hash: String,
}

impl EntityDigest {
    #[must_use]
    pub fn leaf(&self) -> String {
        entity_leaf(&self.instance_id, &self.content_hash)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipDigest {
    pub instance_id: String,
    pub type_code: String,
    pub from_instance_id: String,
    pub to_instance_id: String,
    pub confidence: Confidence,
    pub structural_hash: String,
    pub effective_hash: String,
}

impl RelationshipDigest {
    #[must_use]
    pub fn new(
        instance_id: impl Into<String>,
        type_code: impl Into<String>,
        from_instance_id: impl Into<String>,
        to_instance_id: impl Into<String>,
        confidence: Confidence,
    ) -> Self {
        let type_code = type_code.into();
        let from_instance_id = from_instance_id.into();
        let to_instance_id = to_instance_id.into();
        Self {
            instance_id: instance_id.into(),
            structural_hash: structural_leaf(&type_code, &from_instance_id, &to_instance_id),
            effective_hash: effective_leaf(
                &type_code,
                &from_instance_id,
                &to_instance_id,
                confidence,
            ),
            type_code,
            from_instance_id,
            to_instance_id,
            confidence,
        }
    }
}

/// Anything a snapshot can be taken from.
pub trait LeafSource {
    fn origin(&self) -> SnapshotOrigin;

    fn entity_digests(&self, tenant: &TenantId) -> Result<Vec<EntityDigest>, CoreError>;

    fn relationship_digests(&self, tenant: &TenantId)
    -> Result<Vec<RelationshipDigest>, CoreError>;
}

impl LeafSource for RecordStore {
    fn origin(&self) -> SnapshotOrigin {
        SnapshotOrigin::Authoritative
    }

    fn entity_digests(&self, tenant: &TenantId) -> Result<Vec<EntityDigest>, CoreError> {
        Ok(self
            .all_entities(tenant)?
            .into_iter()
            .map(|e| EntityDigest {
                instance_id: e.instance_id,
                type_code: e.type_code,
                content_hash: e.content_hash,
            })
            .collect())
    }

    fn relationship_digests(
        &self,
        tenant: &TenantId,
    ) -> Result<Vec<RelationshipDigest>, CoreError> {
        Ok(self
            .all_relationships(tenant)?
            .into_iter()
            .map(|r| {
                RelationshipDigest::new(
                    r.instance_id,
                    r.type_code,
                    r.from_instance_id,
                    r.to_instance_id,
                    r.confidence,
                )
            })
            .collect())
    }
}

impl LeafSource for RedbGraph {
    fn origin(&self) -> SnapshotOrigin {
        SnapshotOrigin::Graph
    }

    fn entity_digests(&self, tenant: &TenantId) -> Result<Vec<EntityDigest>, CoreError> {
        Ok(self
            .nodes(tenant)?
            .into_iter()
            .map(|n| EntityDigest {
                instance_id: n.instance_id,
                type_code: n.type_code,
                content_hash: n.content_hash,
            })
            .collect())
    }

    fn relationship_digests(
        &self,
        tenant: &TenantId,
    ) -> Result<Vec<RelationshipDigest>, CoreError> {
        Ok(self
            .edges(tenant)?
            .into_iter()
            .map(|e| {
                RelationshipDigest::new(
                    e.instance_id,
                    e.relationship_type,
                    e.from_instance_id,
                    e.to_instance_id,
                    e.confidence,
                )
            })
            .collect())
    }
}

/// Immutable digest of one tenant's graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub tenant_id: TenantId,
    pub origin: SnapshotOrigin,
    pub taken_at: DateTime<Utc>,
    pub entity_root: String,
    pub relationship_structural_root: String,
    pub relationship_effective_root: String,
    pub merkle_root: String,
    pub entity_digests: Vec<EntityDigest>,
    pub relationship_digests: Vec<RelationshipDigest>,
}

impl Snapshot {
    /// Take a snapshot of `tenant` from `source`.
    pub fn take(
        source: &dyn LeafSource,
        tenant: &TenantId,
        cancel: &CancellationToken,
    ) -> Result<Self, CoreError> {
        cancel.check()?;
        let entities = source.entity_digests(tenant)?;
        cancel.check()?;
        let relationships = source.relationship_digests(tenant)?;
        cancel.check()?;
        let snapshot = Self::from_digests(tenant, source.origin(), entities, relationships);
        info!(
            tenant = %tenant,
            snapshot = %snapshot.snapshot_id,
            origin = ?snapshot.origin,
            entities = snapshot.entity_digests.len(),
            relationships = snapshot.relationship_digests.len(),
            root = %snapshot.merkle_root,
            "snapshot taken"
        );
        Ok(snapshot)
    }

    /// Build a snapshot from precomputed digests.
    #[must_use]
    pub fn from_digests(
        tenant: &TenantId,
        origin: SnapshotOrigin,
        mut entity_digests: Vec<EntityDigest>,
        mut relationship_digests: Vec<RelationshipDigest>,
    ) -> Self {
        entity_digests.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        relationship_digests.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        let entity_leaves: Vec<MerkleLeaf> = entity_digests
            .iter()
            .map(|d| MerkleLeaf::new(d.instance_id.clone(), d.leaf()))
            .collect();
        let structural: Vec<MerkleLeaf> = relationship_digests
            .iter()
            .map(|d| MerkleLeaf::new(d.instance_id.clone(), d.structural_hash.clone()))
            .collect();
        let effective: Vec<MerkleLeaf> = relationship_digests
            .iter()
            .map(|d| MerkleLeaf::new(d.instance_id.clone(), d.effective_hash.clone()))
            .collect();

        let entity_root = merkle_root(&entity_leaves);
        let relationship_structural_root = merkle_root(&structural);
        let relationship_effective_root = merkle_root(&effective);
        let merkle_root = digest_hex(
            format!(
                "{}{}{}",
                entity_root, relationship_structural_root, relationship_effective_root
            )
            .as_bytes(),
        );

        let taken_at = Utc::now();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            snapshot_id: format!(
                "{}-{}",
                taken_at.format("%Y%m%dT%H%M%S%3fZ"),
                suffix.get(..8).unwrap_or(&suffix)
            ),
            tenant_id: tenant.clone(),
            origin,
            taken_at,
            entity_root,
            relationship_structural_root,
            relationship_effective_root,
            merkle_root,
            entity_digests,
            relationship_digests,
        }
    }
}

// =============================================================================
// PERSISTENCE
// =============================================================================

fn validate_snapshot_id(id: &str) -> Result<(), CoreError> {
    if id.is_empty()
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(CoreError::Validation(format!("invalid snapshot id '{}'", id)));
    }
    Ok(())
}

/// Write-once snapshot files under `<root>/<tenant_id>/<snapshot_id>.json`.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn tenant_dir(&self, tenant: &TenantId) -> PathBuf {
        self.root.join(tenant.as_str())
    }

    /// Persist a snapshot. Fails if a snapshot with the same id exists.
    pub fn save(&self, snapshot: &Snapshot) -> Result<PathBuf, CoreError> {
        validate_snapshot_id(&snapshot.snapshot_id)?;
        let dir = self.tenant_dir(&snapshot.tenant_id);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.json", snapshot.snapshot_id));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| CoreError::Io(format!("{}: {}", path.display(), e)))?;
        file.write_all(serde_json::to_string_pretty(snapshot)?.as_bytes())?;
        file.sync_data()?;
        Ok(path)
    }

    pub fn load(&self, tenant: &TenantId, snapshot_id: &str) -> Result<Snapshot, CoreError> {
        validate_snapshot_id(snapshot_id)?;
        let path = self.tenant_dir(tenant).join(format!("{}.json", snapshot_id));
        if !path.exists() {
            return Err(CoreError::NotFound(format!("snapshot '{}'", snapshot_id)));
        }
        load_file(&path)
    }

    /// Snapshot ids of a tenant, oldest first.
    pub fn list(&self, tenant: &TenantId) -> Result<Vec<String>, CoreError> {
        let dir = self.tenant_dir(tenant);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem() {
                    ids.push(stem.to_string_lossy().into_owned());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Most recent snapshot of a tenant, if any.
    pub fn latest(&self, tenant: &TenantId) -> Result<Option<Snapshot>, CoreError> {
        match self.list(tenant)?.last() {
            Some(id) => self.load(tenant, id).map(Some),
            None => Ok(None),
        }
    }
}

/// Read a snapshot from an arbitrary path.
pub fn load_file(path: &Path) -> Result<Snapshot, CoreError> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::empty_root;
    use crate::sync::GraphSync;
    use crate::types::{Attributes, EpochContext, Evidence, ExtractedEntity, ExtractedRelationship};
    use std::sync::Arc;

    fn tenant() -> TenantId {
        TenantId::parse("acme").expect("tenant")
    }

    fn seeded_records() -> RecordStore {
        let store = RecordStore::open_in_memory().expect("records");
        let epoch = EpochContext::with_epoch_id("e", "r");
        for id in ["A", "B"] {
            let e = ExtractedEntity {
                type_code: "STORY".into(),
                instance_id: id.into(),
                name: id.into(),
                attributes: Attributes::new(),
                evidence: Evidence::new("doc.md", 1, 1),
            };
            store.upsert_entity(&tenant(), &e, &epoch).expect("entity");
        }
        let r = ExtractedRelationship {
            type_code: "R02".into(),
            from_instance_id: "A".into(),
            to_instance_id: "B".into(),
            name: String::new(),
            confidence: Confidence::from_thousandths(800).expect("confidence"),
            evidence: Evidence::new("doc.md", 1, 1),
        };
        store.upsert_relationship(&tenant(), &r, &epoch).expect("rel");
        store
    }

    #[test]
    fn empty_tenant_has_empty_roots() {
        let store = RecordStore::open_in_memory().expect("records");
        let snap = Snapshot::take(&store, &tenant(), &CancellationToken::new()).expect("snap");
        assert_eq!(snap.entity_root, empty_root());
        assert_eq!(snap.relationship_effective_root, empty_root());
        assert_eq!(snap.origin, SnapshotOrigin::Authoritative);
    }

    #[test]
    fn synced_graph_matches_authoritative_roots() {
        let dir = tempfile::tempdir().expect("tempdir");
        let records = Arc::new(seeded_records());
        let graph = Arc::new(RedbGraph::open(dir.path().join("g.redb")).expect("graph"));
        GraphSync::new(Arc::clone(&records), Arc::clone(&graph))
            .sync_tenant(&tenant())
            .expect("sync");

        let cancel = CancellationToken::new();
        let a = Snapshot::take(records.as_ref(), &tenant(), &cancel).expect("a");
        let g = Snapshot::take(graph.as_ref(), &tenant(), &cancel).expect("g");
        assert_eq!(a.merkle_root, g.merkle_root);
        assert_eq!(g.origin, SnapshotOrigin::Graph);
    }

    #[test]
    fn cancelled_snapshot_fails() {
        let store = seeded_records();
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            Snapshot::take(&store, &tenant(), &token),
            Err(CoreError::Cancelled)
        ));
    }

    #[test]
    fn store_is_write_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let snapshots = SnapshotStore::new(dir.path());
        let snap = Snapshot::take(&seeded_records(), &tenant(), &CancellationToken::new())
            .expect("snap");

        snapshots.save(&snap).expect("save");
        assert!(snapshots.save(&snap).is_err());

        let loaded = snapshots.load(&tenant(), &snap.snapshot_id).expect("load");
        assert_eq!(loaded, snap);
        assert_eq!(snapshots.list(&tenant()).expect("list"), vec![snap.snapshot_id.clone()]);
        assert_eq!(snapshots.latest(&tenant()).expect("latest"), Some(snap));
    }

    #[test]
    fn load_rejects_path_like_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let snapshots = SnapshotStore::new(dir.path());
        assert!(matches!(
            snapshots.load(&tenant(), "../secret"),
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            snapshots.load(&tenant(), "missing"),
            Err(CoreError::NotFound(_))
        ));
    }
}
