//! REST and WebSocket API using Axum
//!
//! - `/api/*` JSON endpoints for heartbeats, snapshots and self-reports
//! - Root-level `/heartbeat` and `/health` for older agents
//! - `/ws` live event stream
//!
//! Unmatched paths answer 200 with a small JSON banner; the dashboard is
//! served elsewhere.

pub mod envelope;
pub mod handlers;
mod routes;
pub mod ws;

pub use handlers::MonitorState;

use axum::http::{header, Method};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Environment variable with a comma-separated list of allowed origins.
pub const CORS_ORIGINS_ENV: &str = "PULSEWATCH_CORS_ORIGINS";

/// Largest accepted request body. Error logs travel in heartbeats.
const MAX_BODY_BYTES: usize = 1024 * 1024;

async fn banner() -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "message": "Pulsewatch API - dashboard not available",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/api/services", "/api/remediations", "/api/health", "/ws"],
    }))
    .into_response()
}

/// Build a CORS layer that is restrictive by default (same-origin only).
///
/// Set `PULSEWATCH_CORS_ORIGINS` to allow a dashboard served from another
/// origin (e.g. `http://localhost:5173`).
fn build_cors_layer() -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    match std::env::var(CORS_ORIGINS_ENV) {
        Ok(origins) => {
            let allowed: Vec<_> = origins
                .split(',')
                .filter_map(|o| o.trim().parse().ok())
                .collect();
            tracing::info!(origins = %origins, "CORS: allowing configured origins");
            base.allow_origin(allowed)
        }
        Err(_) => base,
    }
}

/// Create the complete application router.
pub fn create_app(state: MonitorState) -> Router {
    Router::new()
        .nest("/api", routes::api_routes(state.clone()))
        .merge(routes::root_routes(state))
        .fallback(banner)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer())
}
