//! Remediation ledger endpoints

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use crate::api::envelope::ApiErrorResponse;
use crate::types::RemediationRecord;

use super::MonitorState;

#[derive(Debug, Default, Deserialize)]
pub struct RemediationQuery {
    /// Restrict to one service
    pub service: Option<String>,
}

/// GET /api/remediations[?service=name] - newest first
pub async fn list_remediations(
    State(state): State<MonitorState>,
    Query(query): Query<RemediationQuery>,
) -> Json<Vec<RemediationRecord>> {
    let ledger = state.monitor.ledger();
    let records = match query.service.as_deref().filter(|s| !s.is_empty()) {
        Some(service) => ledger.get_by_service(service),
        None => ledger.get_all(),
    };
    Json(records)
}

/// GET /api/remediations/:id
pub async fn get_remediation(
    State(state): State<MonitorState>,
    Path(id): Path<String>,
) -> Response {
    match state.monitor.ledger().get(&id) {
        Ok(record) => Json(record).into_response(),
        Err(e) => ApiErrorResponse::not_found(e.to_string()),
    }
}
