//! Remediation lifecycle types: RemediationStatus, RemediationRecord, AgentReport

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of one remediation attempt.
///
/// `Success`, `Failed` and `TimedOut` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RemediationStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    TimedOut,
}

impl RemediationStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::TimedOut)
    }
}

impl std::fmt::Display for RemediationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemediationStatus::Pending => write!(f, "pending"),
            RemediationStatus::Running => write!(f, "running"),
            RemediationStatus::Success => write!(f, "success"),
            RemediationStatus::Failed => write!(f, "failed"),
            RemediationStatus::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Self-report POSTed back by the sandboxed job
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentReport {
    pub remediation_id: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_changed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,
    #[serde(default)]
    pub pushed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
    /// Overwritten with the receive time on ingestion
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// One remediation attempt as held by the ledger.
///
/// `end_time`, `duration` and `exit_code` are populated together, exactly
/// once, at the transition into a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemediationRecord {
    pub id: String,
    pub service_name: String,
    pub github_repo: String,
    pub error_log: String,
    pub status: RemediationStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sandbox_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sandbox_name: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_report: Option<AgentReport>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}

impl RemediationRecord {
    pub fn new(id: &str, service_name: &str, github_repo: &str, error_log: &str) -> Self {
        Self {
            id: id.to_string(),
            service_name: service_name.to_string(),
            github_repo: github_repo.to_string(),
            error_log: error_log.to_string(),
            status: RemediationStatus::Pending,
            sandbox_id: String::new(),
            sandbox_name: String::new(),
            start_time: Utc::now(),
            end_time: None,
            duration: None,
            exit_code: None,
            agent_report: None,
            error_message: String::new(),
        }
    }

    /// Move into a terminal status, stamping end time, duration and exit code together.
    pub(crate) fn finish(
        &mut self,
        status: RemediationStatus,
        exit_code: i64,
        error_message: String,
        now: DateTime<Utc>,
    ) {
        self.status = status;
        self.end_time = Some(now);
        self.duration = Some(format_duration(now.signed_duration_since(self.start_time)));
        self.exit_code = Some(exit_code);
        self.error_message = error_message;
    }
}

/// Render an elapsed time rounded to whole seconds, e.g. `42s`, `3m5s`, `1h0m2s`.
pub fn format_duration(elapsed: chrono::Duration) -> String {
    let millis = elapsed.num_milliseconds().max(0);
    let secs = (millis + 500) / 1000;
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::zero()), "0s");
        assert_eq!(format_duration(Duration::milliseconds(41_600)), "42s");
        assert_eq!(format_duration(Duration::seconds(185)), "3m5s");
        assert_eq!(format_duration(Duration::seconds(3602)), "1h0m2s");
        assert_eq!(format_duration(Duration::seconds(-4)), "0s");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!RemediationStatus::Pending.is_terminal());
        assert!(!RemediationStatus::Running.is_terminal());
        assert!(RemediationStatus::Success.is_terminal());
        assert!(RemediationStatus::Failed.is_terminal());
        assert!(RemediationStatus::TimedOut.is_terminal());
        assert_eq!(
            serde_json::to_string(&RemediationStatus::TimedOut).unwrap(),
            "\"timed_out\""
        );
    }

    #[test]
    fn test_finish_sets_terminal_fields_together() {
        let mut record = RemediationRecord::new("abcd1234", "svc", "repo", "boom");
        let end = record.start_time + Duration::seconds(7);
        record.finish(RemediationStatus::Failed, 137, "oom".to_string(), end);
        assert_eq!(record.status, RemediationStatus::Failed);
        assert_eq!(record.exit_code, Some(137));
        assert_eq!(record.end_time, Some(end));
        assert_eq!(record.duration.as_deref(), Some("7s"));
    }

    #[test]
    fn test_agent_report_minimal_body() {
        let report: AgentReport = serde_json::from_str(
            r#"{"remediation_id":"abcd1234","success":true,"summary":"fixed","pushed":true}"#,
        )
        .unwrap();
        assert!(report.success);
        assert!(report.files_changed.is_empty());
        assert!(report.commit_hash.is_none());
    }
}
