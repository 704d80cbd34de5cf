//! API route handlers
//!
//! - Heartbeat ingestion and sandbox self-reports (POST)
//! - Service and remediation snapshots (GET)
//! - Liveness probe

mod heartbeat;
mod remediations;
mod services;

pub use heartbeat::*;
pub use remediations::*;
pub use services::*;

use axum::response::Response;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use super::envelope::ApiErrorResponse;
use crate::monitor::Monitor;
use crate::registry::MonitorError;

/// Shared state for API handlers
#[derive(Debug, Clone)]
pub struct MonitorState {
    pub monitor: Arc<Monitor>,
}

impl MonitorState {
    pub fn new(monitor: Arc<Monitor>) -> Self {
        Self { monitor }
    }
}

/// Acknowledgement body for accepted POSTs
#[derive(Debug, Serialize)]
pub struct StatusMessage {
    pub status: &'static str,
    pub message: &'static str,
}

impl StatusMessage {
    pub(crate) const fn ok(message: &'static str) -> Json<Self> {
        Json(Self {
            status: "ok",
            message,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// GET /api/health, GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

fn monitor_error(e: &MonitorError) -> Response {
    match e {
        MonitorError::Validation(msg) => ApiErrorResponse::bad_request(msg.clone()),
        MonitorError::NotFound(_) => ApiErrorResponse::not_found(e.to_string()),
    }
}
