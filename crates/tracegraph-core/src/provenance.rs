//! # Provenance Categories
//!
//! Static mapping from relationship type codes to how the relationship was
//! established. Traversal uses it to filter edges by trust level.

use crate::types::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

/// How a relationship came to be known, from most to least trustworthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvenanceCategory {
    /// Stated directly in a source artifact.
    Explicit,
    /// Follows from code or document structure.
    Structural,
    /// Derived statistically from history.
    Inferred,
    /// Proposed by a heuristic, unconfirmed.
    Hypothesized,
    /// Low-confidence guess.
    Speculative,
}

impl ProvenanceCategory {
    pub const ALL: [Self; 5] = [
        Self::Explicit,
        Self::Structural,
        Self::Inferred,
        Self::Hypothesized,
        Self::Speculative,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Structural => "structural",
            Self::Inferred => "inferred",
            Self::Hypothesized => "hypothesized",
            Self::Speculative => "speculative",
        }
    }
}

impl fmt::Display for ProvenanceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProvenanceCategory {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| CoreError::Validation(format!("unknown provenance category '{}'", s)))
    }
}

static CATEGORY_BY_TYPE: LazyLock<BTreeMap<&'static str, ProvenanceCategory>> =
    LazyLock::new(|| {
        use ProvenanceCategory::{Explicit, Hypothesized, Inferred, Speculative, Structural};
        BTreeMap::from([
            ("R01", Structural),   // CONTAINS
            ("R02", Explicit),     // IMPLEMENTS
            ("R03", Explicit),     // TESTS
            ("R04", Structural),   // DEPENDS_ON
            ("R05", Structural),   // CALLS
            ("R06", Explicit),     // REFERENCES
            ("R07", Explicit),     // MODIFIES
            ("R08", Explicit),     // AUTHORED_BY
            ("R09", Inferred),     // CO_CHANGED
            ("R10", Hypothesized), // SIMILAR_TO
            ("R11", Speculative),  // MAY_IMPLEMENT
        ])
    });

/// Category of a relationship type code, if mapped.
#[must_use]
pub fn category_of(type_code: &str) -> Option<ProvenanceCategory> {
    CATEGORY_BY_TYPE.get(type_code).copied()
}

/// Parse a caller-supplied list of category names.
pub fn parse_categories<S: AsRef<str>>(
    names: &[S],
) -> Result<Vec<ProvenanceCategory>, CoreError> {
    names.iter().map(|n| n.as_ref().parse()).collect()
}

/// Whether an edge of `type_code` passes the optional category filter.
///
/// With no filter every edge passes. With a filter, unmapped type codes
/// never pass.
#[must_use]
pub fn admits(filter: Option<&[ProvenanceCategory]>, type_code: &str) -> bool {
    match filter {
        None => true,
        Some(allowed) => category_of(type_code).is_some_and(|c| allowed.contains(&c)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_are_mapped() {
        assert_eq!(category_of("R02"), Some(ProvenanceCategory::Explicit));
        assert_eq!(category_of("R09"), Some(ProvenanceCategory::Inferred));
        assert_eq!(category_of("ZZZ"), None);
    }

    #[test]
    fn unknown_category_is_validation_error() {
        let err = parse_categories(&["explicit", "bogus"]).expect_err("bogus");
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn filter_excludes_unmapped_codes() {
        let explicit = [ProvenanceCategory::Explicit];
        assert!(admits(None, "UNMAPPED"));
        assert!(!admits(Some(&explicit), "UNMAPPED"));
        assert!(admits(Some(&explicit), "R02"));
        assert!(!admits(Some(&explicit), "R01"));
    }
}
