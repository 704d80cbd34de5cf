//! Service snapshot endpoints

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::types::ServiceRecord;

use super::{monitor_error, MonitorState};

/// GET /api/services - every known service, sorted by name
pub async fn list_services(State(state): State<MonitorState>) -> Json<Vec<ServiceRecord>> {
    Json(state.monitor.registry().get_all())
}

/// GET /api/services/:name
pub async fn get_service(
    State(state): State<MonitorState>,
    Path(name): Path<String>,
) -> Response {
    match state.monitor.registry().get_service(&name) {
        Ok(record) => Json(record).into_response(),
        Err(e) => monitor_error(&e),
    }
}
