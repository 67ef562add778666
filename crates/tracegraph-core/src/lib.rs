//! # tracegraph-core
//!
//! The synchronization and consistency engine for a codebase knowledge graph.
//!
//! Facts extracted from a repository (entities such as stories, files and
//! functions, and typed relationships between them) flow through three stages:
//!
//! 1. **Upsert** into the authoritative SQLite record store, exactly once per
//!    content hash, with every mutation appended to a per-tenant ledger.
//! 2. **Sync** into the derived redb graph store: nodes are merged, edges are
//!    replaced wholesale for the tenant.
//! 3. **Verify** with parity counts, Merkle snapshots, drift gating and the
//!    closure check (two identical runs must produce identical digests).
//!
//! ## Architectural Constraints
//!
//! - Synchronous: no async runtime, no network dependencies
//! - Every record and every query is scoped to one tenant
//! - Digests are deterministic: BTreeMap ordering, integer confidence, BLAKE3
//! - The graph store is derived and can always be rebuilt from the records

// =============================================================================
// MODULES
// =============================================================================

pub mod cancel;
pub mod closure;
pub mod drift;
pub mod hashing;
pub mod ledger;
pub mod merkle;
pub mod pipeline;
pub mod primitives;
pub mod provenance;
pub mod snapshot;
pub mod storage;
pub mod sync;
pub mod traversal;
pub mod types;
pub mod upsert;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    Attributes, Confidence, CoreError, Entity, EpochContext, ErrorKind, Evidence,
    ExtractedEntity, ExtractedRelationship, Operation, Page, Relationship, SurrogateId, TenantId,
    UpsertOutcome,
};

// =============================================================================
// RE-EXPORTS: Stores and Engines
// =============================================================================

pub use cancel::CancellationToken;
pub use ledger::{Ledger, LedgerEntry, LedgerKind};
pub use provenance::ProvenanceCategory;
pub use storage::{GraphEdge, GraphNode, RecordStore, RedbGraph, ReplaceOutcome, SkippedEdge};
pub use sync::{GraphSync, MergeReport, ParityReport, StoreStatistics, SyncReport};
pub use traversal::{
    AdjacencySource, EdgeFilter, Neighborhood, TraversalEdge, TraversalNode, TraversalRequest,
    TraversalResult, neighbors, traverse,
};
pub use upsert::{BatchSummary, UpsertEngine, UpsertOptions};

// =============================================================================
// RE-EXPORTS: Verification
// =============================================================================

pub use closure::{ClosureChecker, ClosureReport, ClosureState};
pub use drift::{
    AllowRule, Allowlist, DriftDiff, DriftItem, DriftSignal, GateReport, JsonlSignalSink,
    Severity, SignalSink, diff, evaluate_gate,
};
pub use merkle::{FileTreeBaseline, MerkleLeaf, file_tree_baseline, merkle_root};
pub use pipeline::{BundlePipeline, ExtractionBundle, IngestionPipeline, RunSummary};
pub use snapshot::{LeafSource, Snapshot, SnapshotOrigin, SnapshotStore};
