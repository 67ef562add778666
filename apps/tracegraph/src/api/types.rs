//! # API Request/Response Types
//!
//! JSON structures for the HTTP API and the mapping from engine errors to
//! status codes.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracegraph_core::{
    Confidence, CoreError, EdgeFilter, ErrorKind, TenantId, TraversalRequest,
    primitives::DEFAULT_PAGE_LIMIT, provenance::parse_categories,
};

// =============================================================================
// HEALTH RESPONSE
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// =============================================================================
// QUERY PARAMETERS
// =============================================================================

/// `?tenant_id=`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantQuery {
    pub tenant_id: String,
}

/// `?tenant_id=&type=&limit=&offset=`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListQuery {
    pub tenant_id: String,
    #[serde(rename = "type", default)]
    pub type_code: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

impl ListQuery {
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE_LIMIT)
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset.unwrap_or(0)
    }
}

/// `?tenant_id=&min_confidence=&provenance=explicit,structural`
///
/// `min_confidence` is inclusive and is rounded to the nearest thousandth
/// before comparison, as stored confidences are; `0.8998` therefore admits
/// an edge recorded at `0.8996`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborQuery {
    pub tenant_id: String,
    #[serde(default)]
    pub min_confidence: Option<f64>,
    #[serde(default)]
    pub provenance: Option<String>,
}

impl NeighborQuery {
    pub fn filter(&self) -> Result<EdgeFilter, CoreError> {
        let categories: Option<Vec<&str>> = self.provenance.as_deref().map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect()
        });
        edge_filter(self.min_confidence, categories.as_deref())
    }
}

// =============================================================================
// TRAVERSE REQUEST
// =============================================================================

/// Body of `POST /traverse`.
///
/// `max_depth` is signed so that negative values reach validation and get
/// the same 400 as any other out-of-range depth. `min_confidence` is
/// rounded to thousandths like the `GET /relationships/{entity_id}` filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraverseRequest {
    pub tenant_id: String,
    pub start_id: String,
    pub max_depth: i64,
    #[serde(default)]
    pub min_confidence: Option<f64>,
    #[serde(default)]
    pub provenance: Option<Vec<String>>,
}

impl TraverseRequest {
    pub fn to_request(&self) -> Result<TraversalRequest, CoreError> {
        let max_depth = usize::try_from(self.max_depth).map_err(|_| {
            CoreError::Validation(format!("max_depth must be positive, got {}", self.max_depth))
        })?;
        tracegraph_core::traversal::validate_depth(max_depth)?;
        Ok(TraversalRequest {
            tenant_id: TenantId::parse(self.tenant_id.as_str())?,
            start_id: self.start_id.clone(),
            max_depth,
            filter: edge_filter(self.min_confidence, self.provenance.as_deref())?,
        })
    }
}

fn edge_filter<S: AsRef<str>>(
    min_confidence: Option<f64>,
    provenance: Option<&[S]>,
) -> Result<EdgeFilter, CoreError> {
    Ok(EdgeFilter {
        min_confidence: min_confidence.map(Confidence::from_f64).transpose()?,
        provenance: provenance.map(parse_categories).transpose()?,
    })
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

/// `{"error": {"code": "...", "message": "..."}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

/// An error on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    /// Malformed request that never reached the engine.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "validation_error",
            message: message.into(),
        }
    }
}

/// Map an engine error to its status code.
#[must_use]
pub fn status_for(err: &CoreError) -> StatusCode {
    match (err, err.kind()) {
        (CoreError::NotFound(_), _) => StatusCode::NOT_FOUND,
        (CoreError::Cancelled, _) => StatusCode::SERVICE_UNAVAILABLE,
        (_, ErrorKind::Validation | ErrorKind::Evidence) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            tracing::error!(code = err.code(), error = %err, "request failed");
        }
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracegraph_core::ProvenanceCategory;

    fn traverse_body(depth: i64) -> TraverseRequest {
        TraverseRequest {
            tenant_id: "acme".into(),
            start_id: "A".into(),
            max_depth: depth,
            min_confidence: Some(0.5),
            provenance: Some(vec!["explicit".into()]),
        }
    }

    #[test]
    fn traverse_body_converts() {
        let request = traverse_body(3).to_request().expect("valid");
        assert_eq!(request.max_depth, 3);
        assert_eq!(
            request.filter.min_confidence.map(Confidence::thousandths),
            Some(500)
        );
        assert_eq!(
            request.filter.provenance,
            Some(vec![ProvenanceCategory::Explicit])
        );
    }

    #[test]
    fn out_of_range_depths_are_validation_errors() {
        for depth in [-1, 0, 11] {
            let err = traverse_body(depth).to_request().expect_err("depth");
            assert_eq!(status_for(&err), StatusCode::BAD_REQUEST);
        }
    }

    #[test]
    fn neighbor_query_splits_categories() {
        let query = NeighborQuery {
            tenant_id: "acme".into(),
            min_confidence: None,
            provenance: Some("explicit, inferred".into()),
        };
        let filter = query.filter().expect("filter");
        assert_eq!(
            filter.provenance,
            Some(vec![ProvenanceCategory::Explicit, ProvenanceCategory::Inferred])
        );
    }

    #[test]
    fn min_confidence_is_rounded_to_thousandths() {
        let query = NeighborQuery {
            tenant_id: "acme".into(),
            min_confidence: Some(0.8998),
            provenance: None,
        };
        let filter = query.filter().expect("filter");
        assert_eq!(filter.min_confidence.map(Confidence::thousandths), Some(900));
    }

    #[test]
    fn unknown_category_is_rejected() {
        let query = NeighborQuery {
            tenant_id: "acme".into(),
            min_confidence: None,
            provenance: Some("certain".into()),
        };
        assert!(matches!(query.filter(), Err(CoreError::Validation(_))));
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            status_for(&CoreError::NotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&CoreError::Cancelled),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&CoreError::Storage("disk".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_for(&CoreError::Validation("bad".into())),
            StatusCode::BAD_REQUEST
        );
    }
}
