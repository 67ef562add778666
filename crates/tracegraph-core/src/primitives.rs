//! # Engine Primitives
//!
//! Hardcoded runtime constants for the tracegraph engine.
//!
//! These values are compiled into the binary and are immutable at runtime.
//! Anything that bounds work done on behalf of a caller lives here so the
//! HTTP layer, the CLI and the engine agree on the same limits.

/// Smallest accepted traversal depth.
pub const MIN_TRAVERSAL_DEPTH: usize = 1;

/// Largest accepted traversal depth.
///
/// Depth is a hard safety constraint: requests outside
/// `MIN_TRAVERSAL_DEPTH..=MAX_TRAVERSAL_DEPTH` are rejected, never clamped.
pub const MAX_TRAVERSAL_DEPTH: usize = 10;

/// Maximum page size for the enumeration endpoints.
pub const MAX_PAGE_LIMIT: usize = 1000;

/// Page size used when the caller does not pass one.
pub const DEFAULT_PAGE_LIMIT: usize = 100;

/// Maximum length of a tenant identifier.
///
/// Tenant ids name ledger directories, so they are also restricted to
/// `[A-Za-z0-9_-]`.
pub const MAX_TENANT_ID_LENGTH: usize = 64;

/// Maximum length for instance ids and type codes.
pub const MAX_KEY_LENGTH: usize = 512;

/// Confidence is stored in thousandths; this is the value of `1.0`.
pub const CONFIDENCE_SCALE: u16 = 1000;

/// Separates the type code from the endpoints in a relationship key.
///
/// Type codes may not contain it.
pub const RELATIONSHIP_TYPE_SEPARATOR: char = ':';

/// Separates the two endpoints in a relationship key.
///
/// Entity instance ids may not contain it, which keeps
/// `{type}:{from}->{to}` unambiguous.
pub const RELATIONSHIP_ENDPOINT_SEPARATOR: &str = "->";

/// Label carried by every edge in the graph store.
pub const RELATIONSHIP_EDGE_LABEL: &str = "RELATIONSHIP";

/// File name of the per-tenant ledger under `<ledger-root>/<tenant_id>/`.
pub const LEDGER_FILE_NAME: &str = "ledger.jsonl";

/// File name of the per-tenant drift signal stream.
pub const DRIFT_SIGNAL_FILE_NAME: &str = "drift_signals.jsonl";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_bounds_are_one_to_ten() {
        assert_eq!(MIN_TRAVERSAL_DEPTH, 1);
        assert_eq!(MAX_TRAVERSAL_DEPTH, 10);
    }

    #[test]
    fn page_default_within_limit() {
        assert!(DEFAULT_PAGE_LIMIT <= MAX_PAGE_LIMIT);
    }
}
