//! # Traversal Service
//!
//! Bounded breadth-first search from a start entity.
//!
//! - `max_depth` must lie in `MIN_TRAVERSAL_DEPTH..=MAX_TRAVERSAL_DEPTH`;
//!   anything else is rejected, never clamped.
//! - Edges are filtered (confidence, provenance) before their far end is
//!   enqueued, so a filtered edge never widens the result.
//! - The visited set is keyed by surrogate id and adjacency is undirected.
//! - BFS order guarantees every node is reported at its shortest distance.

use crate::cancel::CancellationToken;
use crate::primitives::{MAX_TRAVERSAL_DEPTH, MIN_TRAVERSAL_DEPTH};
use crate::provenance::{ProvenanceCategory, admits, category_of};
use crate::storage::RecordStore;
use crate::types::{Confidence, CoreError, Entity, Relationship, SurrogateId, TenantId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use tracing::debug;

/// Read access the traversal needs.
pub trait AdjacencySource {
    fn entity_by_instance(
        &self,
        tenant: &TenantId,
        instance_id: &str,
    ) -> Result<Option<Entity>, CoreError>;

    fn entity_by_surrogate(
        &self,
        tenant: &TenantId,
        id: SurrogateId,
    ) -> Result<Option<Entity>, CoreError>;

    /// Relationships with `id` at either end.
    fn adjacent(&self, tenant: &TenantId, id: SurrogateId) -> Result<Vec<Relationship>, CoreError>;
}

impl AdjacencySource for RecordStore {
    fn entity_by_instance(
        &self,
        tenant: &TenantId,
        instance_id: &str,
    ) -> Result<Option<Entity>, CoreError> {
        RecordStore::entity_by_instance(self, tenant, instance_id)
    }

    fn entity_by_surrogate(
        &self,
        tenant: &TenantId,
        id: SurrogateId,
    ) -> Result<Option<Entity>, CoreError> {
        RecordStore::entity_by_surrogate(self, tenant, id)
    }

    fn adjacent(&self, tenant: &TenantId, id: SurrogateId) -> Result<Vec<Relationship>, CoreError> {
        self.relationships_touching(tenant, id)
    }
}

/// Edge filters shared by traversal and single-hop adjacency.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeFilter {
    pub min_confidence: Option<Confidence>,
    pub provenance: Option<Vec<ProvenanceCategory>>,
}

impl EdgeFilter {
    #[must_use]
    pub fn admits(&self, relationship: &Relationship) -> bool {
        self.min_confidence
            .is_none_or(|min| relationship.confidence >= min)
            && admits(self.provenance.as_deref(), &relationship.type_code)
    }
}

/// A traversal request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraversalRequest {
    pub tenant_id: TenantId,
    pub start_id: String,
    pub max_depth: usize,
    pub filter: EdgeFilter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraversalNode {
    pub surrogate_id: SurrogateId,
    pub instance_id: String,
    pub type_code: String,
    pub name: String,
    pub depth: usize,
}

impl TraversalNode {
    fn at(entity: &Entity, depth: usize) -> Self {
        Self {
            surrogate_id: entity.surrogate_id,
            instance_id: entity.instance_id.clone(),
            type_code: entity.type_code.clone(),
            name: entity.name.clone(),
            depth,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraversalEdge {
    pub surrogate_id: SurrogateId,
    pub instance_id: String,
    pub type_code: String,
    pub from_instance_id: String,
    pub to_instance_id: String,
    pub confidence: Confidence,
    pub provenance: Option<ProvenanceCategory>,
}

impl From<&Relationship> for TraversalEdge {
    fn from(r: &Relationship) -> Self {
        Self {
            surrogate_id: r.surrogate_id,
            instance_id: r.instance_id.clone(),
            type_code: r.type_code.clone(),
            from_instance_id: r.from_instance_id.clone(),
            to_instance_id: r.to_instance_id.clone(),
            confidence: r.confidence,
            provenance: category_of(&r.type_code),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraversalResult {
    pub nodes: Vec<TraversalNode>,
    pub edges: Vec<TraversalEdge>,
}

/// Single-hop adjacency of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighborhood {
    pub entity: TraversalNode,
    pub edges: Vec<TraversalEdge>,
}

/// Reject depths outside the accepted window.
pub fn validate_depth(max_depth: usize) -> Result<(), CoreError> {
    if !(MIN_TRAVERSAL_DEPTH..=MAX_TRAVERSAL_DEPTH).contains(&max_depth) {
        return Err(CoreError::Validation(format!(
            "max_depth must be between {} and {}, got {}",
            MIN_TRAVERSAL_DEPTH, MAX_TRAVERSAL_DEPTH, max_depth
        )));
    }
    Ok(())
}

fn resolve_start(
    source: &dyn AdjacencySource,
    tenant: &TenantId,
    start_id: &str,
) -> Result<Entity, CoreError> {
    source
        .entity_by_instance(tenant, start_id)?
        .ok_or_else(|| CoreError::NotFound(format!("entity '{}'", start_id)))
}

/// Breadth-first search bounded by `request.max_depth`.
pub fn traverse(
    source: &dyn AdjacencySource,
    request: &TraversalRequest,
    cancel: &CancellationToken,
) -> Result<TraversalResult, CoreError> {
    validate_depth(request.max_depth)?;
    let tenant = &request.tenant_id;
    let start = resolve_start(source, tenant, &request.start_id)?;

    let mut visited: BTreeSet<SurrogateId> = BTreeSet::new();
    let mut seen_edges: BTreeSet<SurrogateId> = BTreeSet::new();
    let mut queue: VecDeque<(SurrogateId, usize)> = VecDeque::new();
    let mut nodes = vec![TraversalNode::at(&start, 0)];
    let mut edges = Vec::new();

    visited.insert(start.surrogate_id);
    queue.push_back((start.surrogate_id, 0));

    while let Some((current, depth)) = queue.pop_front() {
        cancel.check()?;
        if depth >= request.max_depth {
            continue;
        }
        for relationship in source.adjacent(tenant, current)? {
            if !request.filter.admits(&relationship) {
                continue;
            }
            if seen_edges.insert(relationship.surrogate_id) {
                edges.push(TraversalEdge::from(&relationship));
            }
            let other = if relationship.from_surrogate_id == current {
                relationship.to_surrogate_id
            } else {
                relationship.from_surrogate_id
            };
            if !visited.insert(other) {
                continue;
            }
            if let Some(entity) = source.entity_by_surrogate(tenant, other)? {
                nodes.push(TraversalNode::at(&entity, depth + 1));
                queue.push_back((other, depth + 1));
            }
        }
    }

    debug!(
        tenant = %tenant,
        start = %request.start_id,
        max_depth = request.max_depth,
        nodes = nodes.len(),
        edges = edges.len(),
        "traversal complete"
    );
    Ok(TraversalResult { nodes, edges })
}

/// Filtered relationships touching one entity.
pub fn neighbors(
    source: &dyn AdjacencySource,
    tenant: &TenantId,
    instance_id: &str,
    filter: &EdgeFilter,
) -> Result<Neighborhood, CoreError> {
    let entity = resolve_start(source, tenant, instance_id)?;
    let edges = source
        .adjacent(tenant, entity.surrogate_id)?
        .iter()
        .filter(|r| filter.admits(r))
        .map(TraversalEdge::from)
        .collect();
    Ok(Neighborhood {
        entity: TraversalNode::at(&entity, 0),
        edges,
    })
}
