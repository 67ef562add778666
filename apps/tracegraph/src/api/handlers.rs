//! # API Endpoint Handlers
//!
//! The engine is synchronous, so every handler hops onto the blocking pool
//! before touching a store.

use super::{
    AppState,
    types::{
        ApiError, HealthResponse, ListQuery, NeighborQuery, TenantQuery, TraverseRequest,
    },
};
use axum::{
    Json,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
};
use tracegraph_core::{
    CancellationToken, CoreError, Entity, Neighborhood, Page, ParityReport, Relationship,
    StoreStatistics, TenantId, TraversalResult, neighbors, traverse,
};

/// Run a store call on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, CoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::from(CoreError::Storage(format!("worker task failed: {}", e))))?
        .map_err(ApiError::from)
}

fn rejected(rejection: impl std::fmt::Display) -> ApiError {
    ApiError::bad_request(rejection.to_string())
}

// =============================================================================
// HEALTH
// =============================================================================

pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::default())
}

// =============================================================================
// ENUMERATION
// =============================================================================

/// `GET /entities?tenant_id=&type=&limit=&offset=`
pub async fn list_entities_handler(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Page<Entity>>, ApiError> {
    let Query(query) = query.map_err(rejected)?;
    let tenant = TenantId::parse(query.tenant_id.as_str())?;
    let records = state.records.clone();
    let page = blocking(move || {
        records.list_entities(
            &tenant,
            query.type_code.as_deref(),
            query.limit(),
            query.offset(),
        )
    })
    .await?;
    Ok(Json(page))
}

/// `GET /relationships?tenant_id=&type=&limit=&offset=`
pub async fn list_relationships_handler(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Page<Relationship>>, ApiError> {
    let Query(query) = query.map_err(rejected)?;
    let tenant = TenantId::parse(query.tenant_id.as_str())?;
    let records = state.records.clone();
    let page = blocking(move || {
        records.list_relationships(
            &tenant,
            query.type_code.as_deref(),
            query.limit(),
            query.offset(),
        )
    })
    .await?;
    Ok(Json(page))
}

// =============================================================================
// ADJACENCY AND TRAVERSAL
// =============================================================================

/// `GET /relationships/{entity_id}?tenant_id=&min_confidence=&provenance=`
pub async fn entity_relationships_handler(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
    query: Result<Query<NeighborQuery>, QueryRejection>,
) -> Result<Json<Neighborhood>, ApiError> {
    let Query(query) = query.map_err(rejected)?;
    let tenant = TenantId::parse(query.tenant_id.as_str())?;
    let filter = query.filter()?;
    let records = state.records.clone();
    let found = blocking(move || neighbors(records.as_ref(), &tenant, &entity_id, &filter)).await?;
    Ok(Json(found))
}

/// `POST /traverse`
pub async fn traverse_handler(
    State(state): State<AppState>,
    body: Result<Json<TraverseRequest>, JsonRejection>,
) -> Result<Json<TraversalResult>, ApiError> {
    let Json(body) = body.map_err(rejected)?;
    let request = body.to_request()?;
    let records = state.records.clone();
    let cancel = CancellationToken::with_timeout(state.traversal_timeout);
    let result = blocking(move || traverse(records.as_ref(), &request, &cancel)).await?;
    Ok(Json(result))
}

// =============================================================================
// CONSISTENCY
// =============================================================================

/// `GET /parity?tenant_id=`
pub async fn parity_handler(
    State(state): State<AppState>,
    query: Result<Query<TenantQuery>, QueryRejection>,
) -> Result<Json<ParityReport>, ApiError> {
    let Query(query) = query.map_err(rejected)?;
    let tenant = TenantId::parse(query.tenant_id.as_str())?;
    let sync = state.sync.clone();
    let report = blocking(move || sync.verify_parity(&tenant)).await?;
    Ok(Json(report))
}

/// `GET /stats?tenant_id=`
pub async fn stats_handler(
    State(state): State<AppState>,
    query: Result<Query<TenantQuery>, QueryRejection>,
) -> Result<Json<StoreStatistics>, ApiError> {
    let Query(query) = query.map_err(rejected)?;
    let tenant = TenantId::parse(query.tenant_id.as_str())?;
    let sync = state.sync.clone();
    let stats = blocking(move || Ok(sync.statistics(&tenant))).await?;
    Ok(Json(stats))
}
