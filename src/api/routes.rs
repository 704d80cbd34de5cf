//! API route definitions
//!
//! - /api/heartbeat, /api/remediation/report - inbound signals
//! - /api/services, /api/remediations - snapshots
//! - /api/health - liveness
//! - /heartbeat, /health, /ws - root-level routes for agents and dashboards

use axum::{routing::{get, post}, Router};

use super::handlers::{self, MonitorState};
use super::ws;

/// Routes nested under `/api`
pub fn api_routes(state: MonitorState) -> Router {
    Router::new()
        .route("/heartbeat", post(handlers::post_heartbeat))
        .route("/services", get(handlers::list_services))
        .route("/services/:name", get(handlers::get_service))
        .route("/remediations", get(handlers::list_remediations))
        .route("/remediations/:id", get(handlers::get_remediation))
        .route("/remediation/report", post(handlers::post_report))
        .route("/health", get(handlers::health_check))
        .with_state(state)
}

/// Root-level routes
pub fn root_routes(state: MonitorState) -> Router {
    Router::new()
        .route("/heartbeat", post(handlers::post_heartbeat))
        .route("/health", get(handlers::health_check))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}
