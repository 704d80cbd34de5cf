//! Monitor - wires ingestion, sweeping, remediation and fan-out together
//!
//! ```text
//! heartbeat ──► HealthRegistry ──► EventBus (service_update)
//!                    │
//!          error + repo │          sweep tick ──► newly down
//!                    ▼                                │
//!           RemediationOrchestrator ◄─────────────────┘
//!                    │
//!                    └──► RemediationLedger ──► EventBus (remediation_update)
//! ```
//!
//! All aggregates are built once here and shared by handle. Remediation
//! attempts run as detached tasks; their failures end in the ledger and
//! the service's remediation log, never in the caller.

use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::background::TimeoutSweeper;
use crate::config::PulseConfig;
use crate::events::{EventBus, EventKind, Subscription};
use crate::registry::{HealthRegistry, MonitorError, SweepOutcome};
use crate::remediation::{
    Credentials, RemediationError, RemediationLedger, RemediationOrchestrator,
};
use crate::sandbox::SandboxBackend;
use crate::types::{AgentReport, HeartbeatRequest, RemediationRecord, ServiceRecord};

/// Error text used when a service goes silent.
pub const HEARTBEAT_TIMEOUT_ERROR: &str = "Service heartbeat timeout - no response received";

/// Result of ingesting one heartbeat
#[derive(Debug)]
pub struct HeartbeatAck {
    /// Snapshot after the heartbeat was applied
    pub service: ServiceRecord,
    /// Handle of the remediation attempt this heartbeat started, if any
    pub remediation: Option<JoinHandle<()>>,
}

/// Result of one sweep tick
#[derive(Debug, Default)]
pub struct SweepReport {
    pub outcome: SweepOutcome,
    pub remediations: Vec<JoinHandle<()>>,
}

/// Owns every shared aggregate of a running monitor
#[derive(Debug)]
pub struct Monitor {
    registry: Arc<HealthRegistry>,
    ledger: Arc<RemediationLedger>,
    events: Arc<EventBus>,
    orchestrator: Arc<RemediationOrchestrator>,
    sweeper: TimeoutSweeper,
}

impl Monitor {
    pub fn new(
        config: &PulseConfig,
        backend: Option<Arc<dyn SandboxBackend>>,
        credentials: Credentials,
    ) -> Self {
        let registry = Arc::new(HealthRegistry::new());
        let ledger = Arc::new(RemediationLedger::new());
        let events = Arc::new(EventBus::new(config.events.subscriber_buffer));
        let orchestrator = Arc::new(RemediationOrchestrator::new(
            Arc::clone(&ledger),
            backend,
            credentials,
            config.remediation.clone(),
            Arc::clone(&events),
        ));
        let sweeper = TimeoutSweeper::new(
            Arc::clone(&registry),
            config.monitor.heartbeat_timeout(),
            config.monitor.sweep_interval(),
        );
        Self {
            registry,
            ledger,
            events,
            orchestrator,
            sweeper,
        }
    }

    pub fn registry(&self) -> &Arc<HealthRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<RemediationLedger> {
        &self.ledger
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Register a subscriber; its first message is the `init` snapshot.
    pub fn subscribe(&self) -> Result<Subscription, serde_json::Error> {
        let registry = Arc::clone(&self.registry);
        self.events.subscribe(move || registry.get_all())
    }

    /// Apply a heartbeat, broadcast the new state, and start a remediation
    /// when the service reports an error with enough context to fix it.
    pub fn ingest_heartbeat(&self, req: &HeartbeatRequest) -> Result<HeartbeatAck, MonitorError> {
        let service = self.registry.record_heartbeat(req)?;
        self.events.broadcast(EventKind::ServiceUpdate, &service);

        let remediation = if req.wants_remediation() {
            warn!(
                service = %req.service_name,
                repo = %req.github_repo,
                "Error heartbeat received, triggering remediation"
            );
            Some(self.spawn_remediation(&req.service_name, &req.github_repo, &req.error_log))
        } else {
            None
        };

        Ok(HeartbeatAck {
            service,
            remediation,
        })
    }

    /// One staleness sweep: broadcast what changed and remediate what went down.
    pub fn run_sweep(&self) -> SweepReport {
        let outcome = self.sweeper.sweep();
        let remediations = self.handle_sweep(&outcome);
        SweepReport {
            outcome,
            remediations,
        }
    }

    fn handle_sweep(&self, outcome: &SweepOutcome) -> Vec<JoinHandle<()>> {
        // One snapshot per tick, however many services changed.
        if !outcome.changed.is_empty() {
            self.events.broadcast(EventKind::Services, &self.registry.get_all());
        }
        outcome
            .newly_down
            .iter()
            .filter_map(|record| self.trigger_remediation(&record.name, HEARTBEAT_TIMEOUT_ERROR))
            .collect()
    }

    /// Sweep on the configured interval until `cancel` fires.
    pub async fn run_sweeper(&self, cancel: CancellationToken) {
        self.sweeper
            .run(cancel, |outcome| {
                self.handle_sweep(&outcome);
            })
            .await;
    }

    /// Spawn a remediation attempt for `service` against the repository
    /// its record last reported.
    ///
    /// Returns `None` when the service is unknown or has no repository.
    pub fn trigger_remediation(&self, service: &str, error: &str) -> Option<JoinHandle<()>> {
        match self.registry.get_service(service) {
            Ok(record) if !record.github_repo.trim().is_empty() => {
                Some(self.spawn_remediation(service, &record.github_repo, error))
            }
            Ok(_) => {
                warn!(service, "No repository configured, skipping remediation");
                None
            }
            Err(e) => {
                warn!(service, error = %e, "Cannot remediate unknown service");
                None
            }
        }
    }

    fn spawn_remediation(&self, service: &str, repo: &str, error: &str) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let events = Arc::clone(&self.events);
        let orchestrator = Arc::clone(&self.orchestrator);
        let service = service.to_string();
        let repo = repo.to_string();
        let error = error.to_string();

        tokio::spawn(async move {
            append_remediation_log(
                &registry,
                &events,
                &service,
                &format!("Remediation triggered: {error}"),
            );

            let line = match orchestrator.run(&service, &repo, &error).await {
                Ok(outcome) => {
                    info!(
                        service = %service,
                        remediation_id = %outcome.id,
                        "Remediation completed successfully"
                    );
                    "Remediation completed successfully".to_string()
                }
                Err(RemediationError::TimedOut { id }) => {
                    warn!(service = %service, remediation_id = %id, "Remediation timed out");
                    "Remediation timed out".to_string()
                }
                Err(e) => {
                    warn!(
                        service = %service,
                        remediation_id = %e.id(),
                        error = %e,
                        "Remediation failed"
                    );
                    format!("Remediation failed: {e}")
                }
            };
            append_remediation_log(&registry, &events, &service, &line);
        })
    }

    /// Attach a self-report from a sandbox to its ledger record.
    ///
    /// Returns the updated record, or `None` when the id is unknown.
    pub fn ingest_report(&self, mut report: AgentReport) -> Option<RemediationRecord> {
        report.timestamp = Utc::now();
        let id = report.remediation_id.clone();
        info!(
            remediation_id = %id,
            success = report.success,
            pushed = report.pushed,
            files_changed = report.files_changed.len(),
            "Agent report received"
        );

        if !self.ledger.add_agent_report(&id, report) {
            warn!(remediation_id = %id, "Agent report for unknown remediation, dropping");
            return None;
        }
        let record = self.ledger.get(&id).ok()?;
        self.events.broadcast(EventKind::RemediationUpdate, &record);
        Some(record)
    }
}

fn append_remediation_log(
    registry: &HealthRegistry,
    events: &EventBus,
    service: &str,
    message: &str,
) {
    let line = format!("{} - {message}", Utc::now().to_rfc3339());
    if let Some(record) = registry.add_remediation_log(service, &line) {
        events.broadcast(EventKind::ServiceUpdate, &record);
    }
}
