//! Human-readable log lines for structured heartbeat events

use serde_json::{Map, Value};

use crate::types::LogData;

/// Message for a healthy heartbeat without a structured event.
pub const HEALTHY_MESSAGE: &str = "Service reported healthy";

/// Message for an error heartbeat that carried neither text nor an event.
pub const ERROR_FALLBACK_MESSAGE: &str = "Service reported an error";

/// Message appended when the sweeper marks a service down.
pub const DOWN_MESSAGE: &str = "Service marked as DOWN - heartbeat timeout";

/// Build the log line for a structured event.
///
/// Known event types get their own template; anything else renders as
/// `Event: <type>`.
pub fn describe_event(data: &LogData) -> String {
    let details = &data.details;
    match data.event_type.as_str() {
        "text_message" => match str_field(details, "user") {
            Some(user) => match details.get("message_length").and_then(Value::as_f64) {
                #[allow(clippy::cast_possible_truncation)]
                Some(len) => format!("Text message from @{user} ({} chars)", len as i64),
                None => format!("Text message from @{user}"),
            },
            None => "Text message received".to_string(),
        },
        "file_upload" => {
            let user = str_field(details, "user").unwrap_or_default();
            let filename = str_field(details, "filename").unwrap_or_default();
            if user.is_empty() || filename.is_empty() {
                "File upload received".to_string()
            } else {
                format!(
                    "File upload from @{user}: {filename} ({:.2} MB)",
                    size_mb(details)
                )
            }
        }
        "file_upload_failed" => match str_field(details, "user").filter(|u| !u.is_empty()) {
            Some(user) => format!(
                "File upload FAILED from @{user}: {} ({:.2} MB) - {}",
                str_field(details, "filename").unwrap_or_default(),
                size_mb(details),
                str_field(details, "reason").unwrap_or_default(),
            ),
            None => "File upload failed".to_string(),
        },
        other => format!("Event: {other}"),
    }
}

fn str_field<'a>(details: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    details.get(key).and_then(Value::as_str)
}

fn size_mb(details: &Map<String, Value>) -> f64 {
    details
        .get("filesize_mb")
        .and_then(Value::as_f64)
        .unwrap_or_default()
}
