//! # tracegraph HTTP API
//!
//! Read-side HTTP surface over the record store and the sync engine.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check (never authenticated)
//! - `GET /entities` - Page through a tenant's entities
//! - `GET /relationships` - Page through a tenant's relationships
//! - `GET /relationships/{entity_id}` - Filtered single-hop adjacency
//! - `POST /traverse` - Bounded BFS from a start entity
//! - `GET /parity` - Per-type count parity between the two stores
//! - `GET /stats` - Store totals
//!
//! Errors are `{"error": {"code", "message"}}`; validation failures are 400.

mod auth;
mod handlers;
mod middleware;
mod types;

pub use auth::ApiKey;
pub use handlers::{
    entity_relationships_handler, health_handler, list_entities_handler,
    list_relationships_handler, parity_handler, stats_handler, traverse_handler,
};
pub use middleware::create_rate_limiter;
pub use types::{
    ErrorBody, ErrorDetail, HealthResponse, ListQuery, NeighborQuery, TenantQuery,
    TraverseRequest, status_for,
};

use crate::config::ServerConfig;
use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware as axum_middleware,
    routing::{get, post},
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracegraph_core::{CoreError, GraphSync, RecordStore};

// =============================================================================
// SERVER STATE
// =============================================================================

#[derive(Clone)]
pub struct AppState {
    pub records: Arc<RecordStore>,
    pub sync: Arc<GraphSync>,
    pub traversal_timeout: Duration,
}

impl AppState {
    #[must_use]
    pub fn new(records: Arc<RecordStore>, sync: Arc<GraphSync>, traversal_timeout: Duration) -> Self {
        Self {
            records,
            sync,
            traversal_timeout,
        }
    }
}

// =============================================================================
// CORS CONFIGURATION
// =============================================================================

/// `*` allows everything, a comma list allows those origins, nothing
/// configured allows localhost only.
fn build_cors_layer(origins: Option<&str>) -> CorsLayer {
    match origins.map(str::trim) {
        Some("*") => {
            tracing::warn!("CORS: allowing ALL origins; do not run this way in production");
            CorsLayer::permissive()
        }
        Some(list) => {
            let allowed: Vec<HeaderValue> = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .filter_map(|origin| match origin.parse::<HeaderValue>() {
                    Ok(hv) => Some(hv),
                    Err(e) => {
                        tracing::warn!(origin, error = %e, "CORS: invalid origin ignored");
                        None
                    }
                })
                .collect();
            if allowed.is_empty() {
                tracing::warn!("CORS: no valid origins configured, falling back to localhost");
                return localhost_cors();
            }
            restricted_cors(allowed)
        }
        None => localhost_cors(),
    }
}

fn localhost_cors() -> CorsLayer {
    let origins = [
        "http://localhost:3000",
        "http://localhost:8080",
        "http://127.0.0.1:3000",
        "http://127.0.0.1:8080",
    ]
    .into_iter()
    .filter_map(|o| o.parse::<HeaderValue>().ok())
    .collect();
    restricted_cors(origins)
}

fn restricted_cors(origins: Vec<HeaderValue>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

// =============================================================================
// ROUTER CREATION
// =============================================================================

/// Build the router.
///
/// Layers, outermost first: tracing, CORS, body limit, rate limiting,
/// authentication.
pub fn create_router(state: AppState, server: &ServerConfig) -> Router {
    let mut router = Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/entities", get(handlers::list_entities_handler))
        .route("/relationships", get(handlers::list_relationships_handler))
        .route(
            "/relationships/{entity_id}",
            get(handlers::entity_relationships_handler),
        )
        .route("/traverse", post(handlers::traverse_handler))
        .route("/parity", get(handlers::parity_handler))
        .route("/stats", get(handlers::stats_handler));

    match server.api_key.as_deref() {
        Some(key) => {
            tracing::info!("API key authentication enabled");
            router = router.layer(axum_middleware::from_fn_with_state(
                ApiKey::new(key),
                auth::api_key_auth_middleware,
            ));
        }
        None => tracing::warn!(
            "API key authentication DISABLED; set TRACEGRAPH_API_KEY to require a bearer key"
        ),
    }

    match create_rate_limiter(server.rate_limit) {
        Some(limiter) => {
            tracing::info!(rps = server.rate_limit, "rate limiting enabled");
            router = router.layer(axum_middleware::from_fn_with_state(
                limiter,
                middleware::rate_limit_middleware,
            ));
        }
        None => tracing::info!("rate limiting disabled"),
    }

    router
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(build_cors_layer(server.cors_origins.as_deref()))
                .layer(axum::extract::DefaultBodyLimit::max(2 * 1024 * 1024)),
        )
        .with_state(state)
}

// =============================================================================
// SERVER STARTUP
// =============================================================================

pub async fn run_server(state: AppState, server: &ServerConfig) -> Result<(), CoreError> {
    let addr = format!("{}:{}", server.host, server.port);
    let router = create_router(state, server);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| CoreError::Io(format!("bind {} failed: {}", addr, e)))?;
    tracing::info!(%addr, "tracegraph HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
            }
        })
        .await
        .map_err(|e| CoreError::Io(format!("server error: {}", e)))
}

