//! Remediation Flow Tests
//!
//! Drives the `Monitor` end to end with an in-memory sandbox backend:
//! heartbeat or sweep triggers an attempt, the attempt reaches a terminal
//! status, and the service's remediation log and the event stream agree.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pulsewatch::config::PulseConfig;
use pulsewatch::monitor::HEARTBEAT_TIMEOUT_ERROR;
use pulsewatch::remediation::Credentials;
use pulsewatch::sandbox::{
    LogFrame, LogStream, OutputChannel, SandboxBackend, SandboxError, SandboxHandle, SandboxSpec,
};
use pulsewatch::{HeartbeatRequest, Monitor, RemediationStatus, Subscription};

/// Backend whose sandboxes print one line and exit with a fixed code,
/// or never exit at all.
struct FakeEngine {
    exit_code: Option<i64>,
    specs: Mutex<Vec<SandboxSpec>>,
    stopped: Mutex<Vec<String>>,
}

impl FakeEngine {
    fn exiting(code: i64) -> Arc<Self> {
        Arc::new(Self {
            exit_code: Some(code),
            specs: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
        })
    }

    fn hanging() -> Arc<Self> {
        Arc::new(Self {
            exit_code: None,
            specs: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl SandboxBackend for FakeEngine {
    fn name(&self) -> &str {
        "fake"
    }

    async fn pull_image(&self, _image: &str) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, SandboxError> {
        let mut specs = self.specs.lock().unwrap();
        specs.push(spec.clone());
        Ok(SandboxHandle {
            id: format!("ctr-{}", specs.len()),
            name: spec.name.clone(),
        })
    }

    async fn start(&self, _id: &str) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn stream_logs(&self, _id: &str) -> Result<LogStream, SandboxError> {
        let frames: Vec<Result<LogFrame, SandboxError>> = vec![Ok(LogFrame {
            channel: OutputChannel::Stdout,
            payload: Bytes::from_static(b"=== CLONING ===\n"),
        })];
        Ok(Box::pin(futures::stream::iter(frames)))
    }

    async fn wait(&self, _id: &str) -> Result<i64, SandboxError> {
        match self.exit_code {
            Some(code) => Ok(code),
            None => futures::future::pending().await,
        }
    }

    async fn stop(&self, id: &str, _grace: Duration) -> Result<(), SandboxError> {
        self.stopped.lock().unwrap().push(id.to_string());
        Ok(())
    }
}

fn monitor_with(engine: &Arc<FakeEngine>, config: &PulseConfig) -> Monitor {
    let backend: Arc<dyn SandboxBackend> = engine.clone();
    Monitor::new(
        config,
        Some(backend),
        Credentials::new("ghp_flowtesttoken", "agent-key"),
    )
}

fn error_heartbeat(name: &str) -> HeartbeatRequest {
    HeartbeatRequest {
        service_name: name.to_string(),
        github_repo: "https://example/x/y".to_string(),
        status: "error".to_string(),
        error_log: "panic: nil map".to_string(),
        log_data: None,
    }
}

fn drain(sub: &mut Subscription) -> Vec<Value> {
    let mut out = Vec::new();
    while let Some(msg) = sub.try_recv() {
        out.push(serde_json::from_str(&msg).unwrap());
    }
    out
}

#[tokio::test]
async fn test_error_heartbeat_runs_successful_attempt() {
    let engine = FakeEngine::exiting(0);
    let monitor = monitor_with(&engine, &PulseConfig::default());
    let mut sub = monitor.subscribe().unwrap();

    let ack = monitor.ingest_heartbeat(&error_heartbeat("api")).unwrap();
    ack.remediation.unwrap().await.unwrap();

    let attempts = monitor.ledger().get_by_service("api");
    assert_eq!(attempts.len(), 1);
    let attempt = &attempts[0];
    assert_eq!(attempt.status, RemediationStatus::Success);
    assert_eq!(attempt.exit_code, Some(0));
    assert_eq!(attempt.sandbox_id, "ctr-1");
    assert!(attempt.end_time.is_some());
    assert!(attempt.duration.is_some());

    let spec = engine.specs.lock().unwrap()[0].clone();
    assert!(spec.env.iter().any(|(k, v)| k == "ERROR_LOG" && v == "panic: nil map"));
    assert!(spec.command.iter().all(|arg| !arg.contains("ghp_flowtesttoken")));

    let service = monitor.registry().get_service("api").unwrap();
    assert_eq!(service.remediation_log.len(), 2);
    assert!(service.remediation_log[0].ends_with("Remediation triggered: panic: nil map"));
    assert!(service.remediation_log[1].ends_with("Remediation completed successfully"));

    let events = drain(&mut sub);
    assert_eq!(events[0]["type"], "init");
    let statuses: Vec<&str> = events
        .iter()
        .filter(|e| e["type"] == "remediation_update")
        .filter_map(|e| e["data"]["status"].as_str())
        .collect();
    assert_eq!(statuses.first(), Some(&"pending"));
    assert!(statuses.contains(&"running"));
    assert_eq!(statuses.last(), Some(&"success"));

    // A late self-report enriches the record without changing its status.
    let report = pulsewatch::AgentReport {
        remediation_id: attempt.id.clone(),
        success: true,
        summary: "Applied and pushed fix".to_string(),
        pushed: true,
        ..Default::default()
    };
    let updated = monitor.ingest_report(report).unwrap();
    assert_eq!(updated.status, RemediationStatus::Success);
    assert!(updated.agent_report.unwrap().pushed);
}

#[tokio::test]
async fn test_nonzero_exit_marks_attempt_failed() {
    let engine = FakeEngine::exiting(137);
    let monitor = monitor_with(&engine, &PulseConfig::default());

    let ack = monitor.ingest_heartbeat(&error_heartbeat("worker")).unwrap();
    ack.remediation.unwrap().await.unwrap();

    let attempt = &monitor.ledger().get_by_service("worker")[0];
    assert_eq!(attempt.status, RemediationStatus::Failed);
    assert_eq!(attempt.exit_code, Some(137));

    let service = monitor.registry().get_service("worker").unwrap();
    assert!(service.remediation_log[1].ends_with("Remediation failed: sandbox exited with code 137"));
}

#[tokio::test]
async fn test_sweep_remediates_silent_service_once() {
    let engine = FakeEngine::exiting(0);
    let monitor = monitor_with(&engine, &PulseConfig::default());

    let heartbeat = HeartbeatRequest {
        status: "healthy".to_string(),
        error_log: String::new(),
        ..error_heartbeat("cron")
    };
    monitor
        .registry()
        .record_heartbeat_at(&heartbeat, Utc::now() - chrono::Duration::seconds(120))
        .unwrap();

    let report = monitor.run_sweep();
    assert_eq!(report.outcome.newly_down.len(), 1);
    assert_eq!(report.remediations.len(), 1);
    for handle in report.remediations {
        handle.await.unwrap();
    }

    let attempts = monitor.ledger().get_by_service("cron");
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].error_log, HEARTBEAT_TIMEOUT_ERROR);

    let again = monitor.run_sweep();
    assert!(again.outcome.is_empty());
    assert!(again.remediations.is_empty());
    assert_eq!(monitor.ledger().len(), 1);

    let service = monitor.registry().get_service("cron").unwrap();
    assert!((service.uptime_percent - 50.0).abs() < f64::EPSILON);
}

#[tokio::test(start_paused = true)]
async fn test_hung_sandbox_times_out_and_is_stopped() {
    let engine = FakeEngine::hanging();
    let mut config = PulseConfig::default();
    config.remediation.deadline_secs = 60;
    let monitor = monitor_with(&engine, &config);

    let ack = monitor.ingest_heartbeat(&error_heartbeat("stuck")).unwrap();
    ack.remediation.unwrap().await.unwrap();

    let attempt = &monitor.ledger().get_by_service("stuck")[0];
    assert_eq!(attempt.status, RemediationStatus::TimedOut);
    assert_eq!(attempt.exit_code, Some(-1));
    assert_eq!(*engine.stopped.lock().unwrap(), vec!["ctr-1".to_string()]);

    let service = monitor.registry().get_service("stuck").unwrap();
    assert!(service.remediation_log[1].ends_with("Remediation timed out"));
}
