//! # Storage
//!
//! - `records`: SQLite, authoritative. Owns identity and content hashes.
//! - `redb_graph`: redb, derived. Rebuildable from `records` at any time.

pub mod records;
pub mod redb_graph;

pub use records::{OutboxRow, RecordStore};
pub use redb_graph::{GraphEdge, GraphNode, RedbGraph, ReplaceOutcome, SkippedEdge};
