//! Service health types: ServiceStatus, LogEntry, ServiceRecord, HeartbeatRequest

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;

use super::push_bounded;
use crate::config::defaults::{REMEDIATION_LOG_CAPACITY, SERVICE_LOG_CAPACITY};

// ============================================================================
// Status
// ============================================================================

/// Live status of a monitored service
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    #[default]
    Healthy,
    Error,
    /// No heartbeat within the staleness threshold
    Down,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::Healthy => write!(f, "healthy"),
            ServiceStatus::Error => write!(f, "error"),
            ServiceStatus::Down => write!(f, "down"),
        }
    }
}

// ============================================================================
// Structured Log
// ============================================================================

/// Origin of a structured log entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Heartbeat,
    Error,
    Remediation,
    Status,
}

/// One entry of a service's bounded structured log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: LogKind,
    pub message: String,
    /// Structured event type (e.g. `text_message`, `file_upload`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
}

impl LogEntry {
    pub fn new(timestamp: DateTime<Utc>, kind: LogKind, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            kind,
            message: message.into(),
            event_type: None,
            details: None,
        }
    }

    /// Attach the structured event a heartbeat carried.
    pub fn with_event(mut self, data: Option<&LogData>) -> Self {
        if let Some(data) = data {
            if !data.event_type.is_empty() {
                self.event_type = Some(data.event_type.clone());
            }
            if !data.details.is_empty() {
                self.details = Some(data.details.clone());
            }
        }
        self
    }
}

// ============================================================================
// Heartbeat Input
// ============================================================================

/// Structured event attached to a heartbeat
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LogData {
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub details: Map<String, Value>,
}

/// Normalized heartbeat as delivered by the routing layer
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub github_repo: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub error_log: String,
    #[serde(default)]
    pub log_data: Option<LogData>,
}

impl HeartbeatRequest {
    /// Only the literal `"healthy"` counts as a successful check.
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }

    /// An error heartbeat that carries enough context to attempt a fix.
    pub fn wants_remediation(&self) -> bool {
        self.status == "error" && !self.error_log.is_empty() && !self.github_repo.is_empty()
    }
}

// ============================================================================
// Service Record
// ============================================================================

/// Live record of one monitored service, keyed by name.
///
/// Invariant: `uptime_percent == success_checks / total_checks * 100` after
/// every counter mutation, and `success_checks <= total_checks`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceRecord {
    pub name: String,
    pub github_repo: String,
    pub status: ServiceStatus,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    pub uptime_percent: f64,
    pub total_checks: u64,
    pub success_checks: u64,
    #[serde(default, skip_serializing_if = "VecDeque::is_empty")]
    pub remediation_log: VecDeque<String>,
    #[serde(default, skip_serializing_if = "VecDeque::is_empty")]
    pub logs: VecDeque<LogEntry>,
}

impl ServiceRecord {
    /// Zeroed record for a service seen for the first time.
    pub fn new(name: &str, github_repo: &str, now: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            github_repo: github_repo.to_string(),
            status: ServiceStatus::Healthy,
            last_heartbeat: now,
            last_error: String::new(),
            uptime_percent: 0.0,
            total_checks: 0,
            success_checks: 0,
            remediation_log: VecDeque::new(),
            logs: VecDeque::new(),
        }
    }

    /// Recompute the derived uptime from the counters.
    pub fn recompute_uptime(&mut self) {
        self.uptime_percent = if self.total_checks > 0 {
            #[allow(clippy::cast_precision_loss)]
            let ratio = self.success_checks as f64 / self.total_checks as f64;
            ratio * 100.0
        } else {
            0.0
        };
    }

    pub fn push_log(&mut self, entry: LogEntry) {
        push_bounded(&mut self.logs, entry, SERVICE_LOG_CAPACITY);
    }

    pub fn push_remediation_log(&mut self, line: String) {
        push_bounded(&mut self.remediation_log, line, REMEDIATION_LOG_CAPACITY);
    }

    /// Whether the heartbeat is older than `threshold` at `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        now.signed_duration_since(self.last_heartbeat) > threshold
    }
}
