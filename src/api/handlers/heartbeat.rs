//! Inbound POSTs: service heartbeats and sandbox self-reports

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{debug, warn};

use crate::api::envelope::ApiErrorResponse;
use crate::types::{AgentReport, HeartbeatRequest};

use super::{monitor_error, MonitorState, StatusMessage};

/// POST /api/heartbeat, POST /heartbeat
pub async fn post_heartbeat(
    State(state): State<MonitorState>,
    payload: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(body) => body,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "Rejected malformed heartbeat");
            return ApiErrorResponse::bad_request(format!(
                "Invalid request body: {}",
                rejection.body_text()
            ));
        }
    };

    match state.monitor.ingest_heartbeat(&req) {
        Ok(ack) => {
            debug!(
                service = %ack.service.name,
                status = %ack.service.status,
                remediation = ack.remediation.is_some(),
                "Heartbeat recorded"
            );
            StatusMessage::ok("Heartbeat recorded").into_response()
        }
        Err(e) => monitor_error(&e),
    }
}

/// POST /api/remediation/report
///
/// Reports for unknown ids are logged and still acknowledged.
pub async fn post_report(
    State(state): State<MonitorState>,
    payload: Result<Json<AgentReport>, JsonRejection>,
) -> Response {
    let Json(report) = match payload {
        Ok(body) => body,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "Rejected malformed agent report");
            return ApiErrorResponse::bad_request(format!(
                "Invalid request body: {}",
                rejection.body_text()
            ));
        }
    };

    state.monitor.ingest_report(report);
    StatusMessage::ok("Report received").into_response()
}
