//! # Core Type Definitions
//!
//! This module contains the shared vocabulary of the engine:
//! - Identifiers (`TenantId`, `SurrogateId`)
//! - Extracted input records (`ExtractedEntity`, `ExtractedRelationship`)
//! - Persisted records (`Entity`, `Relationship`)
//! - Ledger/upsert vocabulary (`Operation`, `UpsertOutcome`, `EpochContext`)
//! - Error types (`CoreError`, `ErrorKind`)
//!
//! ## Determinism Guarantees
//!
//! - Attribute maps are `BTreeMap` so iteration order is stable
//! - Confidence is an integer number of thousandths, never a float at rest
//! - Every id type implements `Ord` for use in `BTreeMap`/`BTreeSet`

use crate::hashing::relationship_instance_id;
use crate::primitives::{
    CONFIDENCE_SCALE, MAX_KEY_LENGTH, MAX_TENANT_ID_LENGTH, RELATIONSHIP_ENDPOINT_SEPARATOR,
    RELATIONSHIP_TYPE_SEPARATOR,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Schema-less entity attributes.
///
/// Canonicalized before hashing (see [`crate::hashing::canonical_json`]).
pub type Attributes = BTreeMap<String, serde_json::Value>;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Tenant (project) scope. All identity uniqueness is scoped to one tenant.
///
/// Validated on construction: 1..=64 characters of `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Parse and validate a tenant id.
    pub fn parse(raw: impl Into<String>) -> Result<Self, CoreError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(CoreError::Validation("tenant_id must not be empty".into()));
        }
        if raw.len() > MAX_TENANT_ID_LENGTH {
            return Err(CoreError::Validation(format!(
                "tenant_id exceeds {} characters",
                MAX_TENANT_ID_LENGTH
            )));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(CoreError::Validation(format!(
                "tenant_id '{}' contains characters outside [A-Za-z0-9_-]",
                raw
            )));
        }
        Ok(Self(raw))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

/// Opaque store identity, assigned once at first creation and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SurrogateId(pub i64);

impl fmt::Display for SurrogateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// CONFIDENCE
// =============================================================================

/// Relationship confidence in `[0, 1]`, held as integer thousandths.
///
/// Serialized as a JSON float so callers see the natural `0.0..=1.0` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Confidence(u16);

impl Confidence {
    /// Full confidence (`1.0`).
    pub const CERTAIN: Self = Self(CONFIDENCE_SCALE);

    /// Build from thousandths (`0..=1000`).
    pub fn from_thousandths(value: u16) -> Result<Self, CoreError> {
        if value > CONFIDENCE_SCALE {
            return Err(CoreError::Validation(format!(
                "confidence {} exceeds {} thousandths",
                value, CONFIDENCE_SCALE
            )));
        }
        Ok(Self(value))
    }

    /// Build from a float in `[0, 1]`, rounding to the nearest thousandth.
    ///
    /// Inputs that round to the same thousandth are indistinguishable:
    /// `0.8996` and `0.8998` both become `900`.
    #[allow(clippy::float_arithmetic)]
    pub fn from_f64(value: f64) -> Result<Self, CoreError> {
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(CoreError::Validation(format!(
                "confidence {} is outside [0, 1]",
                value
            )));
        }
        Ok(Self((value * f64::from(CONFIDENCE_SCALE)).round() as u16))
    }

    #[must_use]
    pub const fn thousandths(self) -> u16 {
        self.0
    }

    #[allow(clippy::float_arithmetic)]
    #[must_use]
    pub fn as_f64(self) -> f64 {
        f64::from(self.0) / f64::from(CONFIDENCE_SCALE)
    }
}

impl TryFrom<f64> for Confidence {
    type Error = CoreError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::from_f64(value)
    }
}

impl From<Confidence> for f64 {
    fn from(value: Confidence) -> Self {
        value.as_f64()
    }
}

// =============================================================================
// EVIDENCE
// =============================================================================

/// Where an extracted fact was observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub source_file: String,
    pub line_start: u32,
    pub line_end: u32,
}

impl Evidence {
    #[must_use]
    pub fn new(source_file: impl Into<String>, line_start: u32, line_end: u32) -> Self {
        Self {
            source_file: source_file.into(),
            line_start,
            line_end,
        }
    }

    /// Reject malformed evidence before anything is persisted.
    pub fn validate(&self, instance_id: &str) -> Result<(), CoreError> {
        let reason = if self.source_file.trim().is_empty() {
            "source_file is empty"
        } else if self.line_start < 1 {
            "line_start must be >= 1"
        } else if self.line_end < self.line_start {
            "line_end is before line_start"
        } else {
            return Ok(());
        };
        Err(CoreError::Evidence {
            instance_id: instance_id.to_string(),
            reason: reason.to_string(),
        })
    }
}

fn validate_key(field: &str, value: &str) -> Result<(), CoreError> {
    if value.trim().is_empty() {
        return Err(CoreError::Validation(format!("{} must not be empty", field)));
    }
    if value.len() > MAX_KEY_LENGTH {
        return Err(CoreError::Validation(format!(
            "{} exceeds {} bytes",
            field, MAX_KEY_LENGTH
        )));
    }
    Ok(())
}

fn validate_type_code(value: &str) -> Result<(), CoreError> {
    validate_key("type_code", value)?;
    if value.contains(RELATIONSHIP_TYPE_SEPARATOR) {
        return Err(CoreError::Validation(format!(
            "type_code '{}' must not contain '{}'",
            value, RELATIONSHIP_TYPE_SEPARATOR
        )));
    }
    Ok(())
}

fn validate_instance_id(field: &str, value: &str) -> Result<(), CoreError> {
    validate_key(field, value)?;
    if value.contains(RELATIONSHIP_ENDPOINT_SEPARATOR) {
        return Err(CoreError::Validation(format!(
            "{} '{}' must not contain '{}'",
            field, value, RELATIONSHIP_ENDPOINT_SEPARATOR
        )));
    }
    Ok(())
}

// =============================================================================
// EXTRACTED INPUT
// =============================================================================

/// An entity as produced by an extraction collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub type_code: String,
    pub instance_id: String,
    pub name: String,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(flatten)]
    pub evidence: Evidence,
}

impl ExtractedEntity {
    /// Validate keys and evidence.
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_type_code(&self.type_code)?;
        validate_instance_id("instance_id", &self.instance_id)?;
        self.evidence.validate(&self.instance_id)
    }
}

/// A relationship as produced by an extraction collaborator.
///
/// Endpoints are addressed by instance id; surrogate ids are resolved by the
/// record store inside the upsert transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRelationship {
    pub type_code: String,
    pub from_instance_id: String,
    pub to_instance_id: String,
    #[serde(default)]
    pub name: String,
    pub confidence: Confidence,
    #[serde(flatten)]
    pub evidence: Evidence,
}

impl ExtractedRelationship {
    /// Deterministic business key, stable across re-extraction.
    #[must_use]
    pub fn instance_id(&self) -> String {
        relationship_instance_id(&self.type_code, &self.from_instance_id, &self.to_instance_id)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        validate_type_code(&self.type_code)?;
        validate_instance_id("from_instance_id", &self.from_instance_id)?;
        validate_instance_id("to_instance_id", &self.to_instance_id)?;
        self.evidence.validate(&self.instance_id())
    }
}

// =============================================================================
// PERSISTED RECORDS
// =============================================================================

/// A live entity in the authoritative store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub surrogate_id: SurrogateId,
    pub tenant_id: TenantId,
    pub type_code: String,
    pub instance_id: String,
    pub name: String,
    pub attributes: Attributes,
    pub content_hash: String,
    #[serde(flatten)]
    pub evidence: Evidence,
    pub extracted_at: DateTime<Utc>,
}

/// A live relationship in the authoritative store.
///
/// Endpoint instance ids are joined in on read so callers never need a
/// second lookup to name an edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub surrogate_id: SurrogateId,
    pub tenant_id: TenantId,
    pub type_code: String,
    pub instance_id: String,
    pub name: String,
    pub from_surrogate_id: SurrogateId,
    pub to_surrogate_id: SurrogateId,
    pub from_instance_id: String,
    pub to_instance_id: String,
    pub confidence: Confidence,
    pub content_hash: String,
    #[serde(flatten)]
    pub evidence: Evidence,
    pub extracted_at: DateTime<Utc>,
}

// =============================================================================
// UPSERT VOCABULARY
// =============================================================================

/// What happened to a record (or what a ledger entry records).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "CREATE")]
    Create,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "NO-OP")]
    NoOp,
    #[serde(rename = "DECISION")]
    Decision,
}

impl Operation {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::NoOp => "NO-OP",
            Self::Decision => "DECISION",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a single upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome<T> {
    pub record: T,
    pub operation: Operation,
}

/// Correlation context for one ingestion run.
///
/// Passed explicitly into every upsert and ledger call; there is no
/// process-wide "current epoch".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochContext {
    pub epoch_id: String,
    pub repo_revision: String,
}

impl EpochContext {
    /// Start a new epoch with a fresh id.
    #[must_use]
    pub fn new(repo_revision: impl Into<String>) -> Self {
        Self {
            epoch_id: format!("epoch-{}", uuid::Uuid::new_v4().simple()),
            repo_revision: repo_revision.into(),
        }
    }

    #[must_use]
    pub fn with_epoch_id(epoch_id: impl Into<String>, repo_revision: impl Into<String>) -> Self {
        Self {
            epoch_id: epoch_id.into(),
            repo_revision: repo_revision.into(),
        }
    }
}

/// One page of an enumeration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub limit: usize,
    pub offset: usize,
    pub has_more: bool,
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Coarse error taxonomy used by callers to decide how to surface a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad caller input. Never retried.
    Validation,
    /// Malformed provenance on an extracted fact.
    Evidence,
    /// Relationship endpoint absent from the target store.
    EndpointMissing,
    /// Parity mismatch, unexpected drift, failed closure comparison.
    Consistency,
    /// Store or filesystem failure.
    Infrastructure,
}

/// Errors produced by the engine.
///
/// - No silent failures
/// - Use `Result<T, CoreError>` for fallible operations
/// - Nothing in the engine panics on bad input
#[derive(Debug, Error)]
pub enum CoreError {
    /// Caller input is invalid (tenant id, depth, category, page size...).
    #[error("validation error: {0}")]
    Validation(String),

    /// Provenance fields on an extracted fact are malformed.
    #[error("evidence error on '{instance_id}': {reason}")]
    Evidence { instance_id: String, reason: String },

    /// A relationship endpoint does not resolve in the target store.
    #[error("relationship '{relationship}' references missing entity '{endpoint}'")]
    EndpointMissing {
        relationship: String,
        endpoint: String,
    },

    /// A verification gate failed.
    #[error("consistency violation: {0}")]
    Consistency(String),

    /// The requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation was cancelled or ran past its deadline.
    #[error("operation cancelled")]
    Cancelled,

    /// A store (SQLite or redb) failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(String),

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Map onto the coarse taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::NotFound(_) => ErrorKind::Validation,
            Self::Evidence { .. } => ErrorKind::Evidence,
            Self::EndpointMissing { .. } => ErrorKind::EndpointMissing,
            Self::Consistency(_) => ErrorKind::Consistency,
            Self::Cancelled | Self::Storage(_) | Self::Io(_) | Self::Serialization(_) => {
                ErrorKind::Infrastructure
            }
        }
    }

    /// Short machine-readable code for API responses.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Evidence { .. } => "evidence_error",
            Self::EndpointMissing { .. } => "endpoint_missing",
            Self::Consistency(_) => "consistency_violation",
            Self::NotFound(_) => "not_found",
            Self::Cancelled => "cancelled",
            Self::Storage(_) => "storage_error",
            Self::Io(_) => "io_error",
            Self::Serialization(_) => "serialization_error",
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Storage(format!("sqlite: {}", value))
    }
}

impl From<std::io::Error> for CoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_id_accepts_slugs() {
        assert!(TenantId::parse("proj-01_a").is_ok());
    }

    #[test]
    fn tenant_id_rejects_path_characters() {
        for bad in ["", "../etc", "a/b", "a b", &"x".repeat(65)] {
            let err = TenantId::parse(bad).expect_err("must reject");
            assert_eq!(err.kind(), ErrorKind::Validation, "input {:?}", bad);
        }
    }

    #[test]
    fn confidence_rounds_to_thousandths() {
        assert_eq!(Confidence::from_f64(0.9).expect("valid").thousandths(), 900);
        assert_eq!(Confidence::from_f64(0.2345).expect("valid").thousandths(), 235);
        assert_eq!(Confidence::from_f64(1.0).expect("valid"), Confidence::CERTAIN);
    }

    #[test]
    fn confidence_rejects_out_of_range() {
        assert!(Confidence::from_f64(1.01).is_err());
        assert!(Confidence::from_f64(-0.1).is_err());
        assert!(Confidence::from_f64(f64::NAN).is_err());
        assert!(Confidence::from_thousandths(1001).is_err());
    }

    #[test]
    fn confidence_serializes_as_float() {
        let c = Confidence::from_thousandths(250).expect("valid");
        assert_eq!(serde_json::to_string(&c).expect("json"), "0.25");
        let back: Confidence = serde_json::from_str("0.25").expect("json");
        assert_eq!(back, c);
        assert!(serde_json::from_str::<Confidence>("2.0").is_err());
    }

    #[test]
    fn evidence_validation() {
        assert!(Evidence::new("a.md", 1, 1).validate("X").is_ok());

        let empty = Evidence::new("  ", 1, 2).validate("X").expect_err("empty file");
        assert_eq!(empty.kind(), ErrorKind::Evidence);

        let zero = Evidence::new("a.md", 0, 2).validate("X").expect_err("zero line");
        assert!(zero.to_string().contains("line_start"));

        let inverted = Evidence::new("a.md", 5, 2).validate("X").expect_err("inverted");
        assert!(inverted.to_string().contains("line_end"));
    }

    #[test]
    fn operation_wire_names() {
        assert_eq!(
            serde_json::to_string(&Operation::NoOp).expect("json"),
            "\"NO-OP\""
        );
        assert_eq!(Operation::Decision.to_string(), "DECISION");
    }

    #[test]
    fn extracted_entity_flattens_evidence() {
        let json = serde_json::json!({
            "type_code": "STORY",
            "instance_id": "STORY-1.1",
            "name": "Login",
            "attributes": {"title": "A"},
            "source_file": "docs/brd.md",
            "line_start": 3,
            "line_end": 9
        });
        let entity: ExtractedEntity = serde_json::from_value(json).expect("parse");
        assert_eq!(entity.evidence.line_end, 9);
        assert!(entity.validate().is_ok());
    }

    #[test]
    fn relationship_instance_id_is_derived() {
        let rel = ExtractedRelationship {
            type_code: "R02".into(),
            from_instance_id: "A".into(),
            to_instance_id: "B".into(),
            name: String::new(),
            confidence: Confidence::CERTAIN,
            evidence: Evidence::new("x.rs", 1, 1),
        };
        assert_eq!(rel.instance_id(), "R02:A->B");
    }

    #[test]
    fn key_separators_are_rejected_in_ids() {
        let entity = |type_code: &str, id: &str| ExtractedEntity {
            type_code: type_code.into(),
            instance_id: id.into(),
            name: id.into(),
            attributes: Attributes::new(),
            evidence: Evidence::new("a.md", 1, 1),
        };
        assert!(entity("FILE", "src/a-b.rs").validate().is_ok());
        assert!(matches!(
            entity("FILE", "A->B").validate(),
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            entity("R:02", "A").validate(),
            Err(CoreError::Validation(_))
        ));

        // (A->B, C) and (A, B->C) would otherwise share the key R02:A->B->C.
        let rel = |from: &str, to: &str| ExtractedRelationship {
            type_code: "R02".into(),
            from_instance_id: from.into(),
            to_instance_id: to.into(),
            name: String::new(),
            confidence: Confidence::CERTAIN,
            evidence: Evidence::new("x.rs", 1, 1),
        };
        assert!(rel("A->B", "C").validate().is_err());
        assert!(rel("A", "B->C").validate().is_err());
        assert!(rel("A-", ">C").validate().is_ok());
    }
}
